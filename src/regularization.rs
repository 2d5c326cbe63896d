//! Weight penalties added to the loss and to the weight gradients.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

/// A penalty over weight rows. Biases are never regularized.
pub trait Regularizer: fmt::Debug + Send + Sync {
    fn row_penalty(&self, weights: &[f64]) -> f64;

    /// Adds the penalty gradient of one row into `gradient` (same length as `weights`).
    fn add_row_gradient(&self, weights: &[f64], gradient: &mut [f64]);

    /// Penalty over a whole weight set, skipping absent rows.
    fn value(&self, rows: &[Option<&[f64]>]) -> f64 {
        rows.iter().flatten().map(|w| self.row_penalty(w)).sum()
    }
}

/// Regularizer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegularizerConfig {
    L1 { lambda: f64 },
    L2 { lambda: f64 },
    Composite { parts: Vec<RegularizerConfig> },
}

impl RegularizerConfig {
    pub fn build(&self) -> Result<Box<dyn Regularizer>> {
        Ok(match self {
            RegularizerConfig::L1 { lambda } => Box::new(L1::new(*lambda)?),
            RegularizerConfig::L2 { lambda } => Box::new(L2::new(*lambda)?),
            RegularizerConfig::Composite { parts } => Box::new(Composite::new(
                parts.iter().map(RegularizerConfig::build).collect::<Result<Vec<_>>>()?,
            )),
        })
    }
}

fn coefficient(name: &str, lambda: f64) -> Result<f64> {
    if lambda.is_finite() && lambda >= 0.0 {
        Ok(lambda)
    } else {
        Err(NetError::construction(format!(
            "{name} coefficient must be finite and non-negative, got {lambda}"
        )))
    }
}

/// `λ Σ |w|`
#[derive(Debug, Clone)]
pub struct L1 {
    lambda: f64,
}

impl L1 {
    pub fn new(lambda: f64) -> Result<Self> {
        Ok(Self {
            lambda: coefficient("L1", lambda)?,
        })
    }
}

impl Regularizer for L1 {
    fn row_penalty(&self, weights: &[f64]) -> f64 {
        self.lambda * weights.iter().map(|w| w.abs()).sum::<f64>()
    }

    fn add_row_gradient(&self, weights: &[f64], gradient: &mut [f64]) {
        for (g, &w) in gradient.iter_mut().zip(weights) {
            if w != 0.0 {
                *g += self.lambda * w.signum();
            }
        }
    }
}

/// `λ Σ w² / 2`
#[derive(Debug, Clone)]
pub struct L2 {
    lambda: f64,
}

impl L2 {
    pub fn new(lambda: f64) -> Result<Self> {
        Ok(Self {
            lambda: coefficient("L2", lambda)?,
        })
    }
}

impl Regularizer for L2 {
    fn row_penalty(&self, weights: &[f64]) -> f64 {
        self.lambda * weights.iter().map(|w| w * w).sum::<f64>() / 2.0
    }

    fn add_row_gradient(&self, weights: &[f64], gradient: &mut [f64]) {
        for (g, &w) in gradient.iter_mut().zip(weights) {
            *g += self.lambda * w;
        }
    }
}

/// Sum of several regularizers.
#[derive(Debug)]
pub struct Composite {
    parts: Vec<Box<dyn Regularizer>>,
}

impl Composite {
    pub fn new(parts: Vec<Box<dyn Regularizer>>) -> Self {
        Self { parts }
    }
}

impl Regularizer for Composite {
    fn row_penalty(&self, weights: &[f64]) -> f64 {
        self.parts.iter().map(|p| p.row_penalty(weights)).sum()
    }

    fn add_row_gradient(&self, weights: &[f64], gradient: &mut [f64]) {
        for part in &self.parts {
            part.add_row_gradient(weights, gradient);
        }
    }
}
