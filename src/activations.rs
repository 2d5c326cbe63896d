use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

/// Scalar nonlinearity applied to a node's net input.
pub trait Activation: fmt::Debug + Send + Sync {
    fn apply(&self, x: f64) -> f64;

    /// Derivative with respect to the pre-activation input.
    fn derivative(&self, x: f64) -> f64;

    /// Derivative cached by a node after its forward pass.
    ///
    /// Activations whose slope is naturally written in terms of their own
    /// output (logistic, tanh, ReLU) override this and ignore `net`.
    fn cached_derivative(&self, net: f64, _value: f64) -> Result<f64> {
        Ok(self.derivative(net))
    }

    /// Persistable identifier, `None` for ad-hoc activations.
    fn kind(&self) -> Option<ActivationKind> {
        None
    }
}

fn positive(name: &str, param: &str, value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(NetError::construction(format!(
            "{name} {param} must be positive and finite, got {value}"
        )))
    }
}

/// Identity; the usual choice for regression outputs.
#[derive(Debug, Clone, Default)]
pub struct Linear;

impl Activation for Linear {
    fn apply(&self, x: f64) -> f64 {
        x
    }
    fn derivative(&self, _x: f64) -> f64 {
        1.0
    }
    fn kind(&self) -> Option<ActivationKind> {
        Some(ActivationKind::Linear)
    }
}

/// Logistic function, output in (0, 1).
#[derive(Debug, Clone, Default)]
pub struct Sigmoid;

impl Activation for Sigmoid {
    fn apply(&self, x: f64) -> f64 {
        1.0 / (1.0 + (-x).exp())
    }
    fn derivative(&self, x: f64) -> f64 {
        let s = self.apply(x);
        s * (1.0 - s)
    }
    fn cached_derivative(&self, _net: f64, value: f64) -> Result<f64> {
        Ok(value * (1.0 - value))
    }
    fn kind(&self) -> Option<ActivationKind> {
        Some(ActivationKind::Sigmoid)
    }
}

/// Hyperbolic tangent, output in (-1, 1).
#[derive(Debug, Clone, Default)]
pub struct Tanh;

impl Activation for Tanh {
    fn apply(&self, x: f64) -> f64 {
        x.tanh()
    }
    fn derivative(&self, x: f64) -> f64 {
        let t = self.apply(x);
        1.0 - t * t
    }
    fn cached_derivative(&self, _net: f64, value: f64) -> Result<f64> {
        Ok(1.0 - value * value)
    }
    fn kind(&self) -> Option<ActivationKind> {
        Some(ActivationKind::Tanh)
    }
}

/// Rectifier. The slope at exactly zero is taken as 0.
#[derive(Debug, Clone, Default)]
pub struct ReLU;

impl Activation for ReLU {
    fn apply(&self, x: f64) -> f64 {
        x.max(0.0)
    }
    fn derivative(&self, x: f64) -> f64 {
        (x > 0.0) as u8 as f64
    }
    fn cached_derivative(&self, _net: f64, value: f64) -> Result<f64> {
        if value < 0.0 || value.is_nan() {
            return Err(NetError::range("relu derivative", &[value]));
        }
        Ok((value > 0.0) as u8 as f64)
    }
    fn kind(&self) -> Option<ActivationKind> {
        Some(ActivationKind::ReLU)
    }
}

/// Rectifier with slope `alpha` below zero.
#[derive(Debug, Clone)]
pub struct LeakyReLU {
    alpha: f64,
}

impl LeakyReLU {
    pub fn new(alpha: f64) -> Result<Self> {
        Ok(Self {
            alpha: positive("LeakyReLU", "leak", alpha)?,
        })
    }
}

impl Default for LeakyReLU {
    fn default() -> Self {
        Self { alpha: 0.01 }
    }
}

impl Activation for LeakyReLU {
    fn apply(&self, x: f64) -> f64 {
        if x > 0.0 { x } else { self.alpha * x }
    }
    fn derivative(&self, x: f64) -> f64 {
        if x > 0.0 { 1.0 } else { self.alpha }
    }
    fn kind(&self) -> Option<ActivationKind> {
        Some(ActivationKind::LeakyReLU { alpha: self.alpha })
    }
}

/// Exponential linear unit; saturates at `-alpha`.
#[derive(Debug, Clone)]
pub struct ELU {
    alpha: f64,
}

impl ELU {
    pub fn new(alpha: f64) -> Result<Self> {
        Ok(Self {
            alpha: positive("ELU", "alpha", alpha)?,
        })
    }
}

impl Default for ELU {
    fn default() -> Self {
        Self { alpha: 1.0 }
    }
}

impl Activation for ELU {
    fn apply(&self, x: f64) -> f64 {
        if x > 0.0 { x } else { self.alpha * (x.exp() - 1.0) }
    }
    fn derivative(&self, x: f64) -> f64 {
        if x > 0.0 { 1.0 } else { self.apply(x) + self.alpha }
    }
    fn kind(&self) -> Option<ActivationKind> {
        Some(ActivationKind::ELU { alpha: self.alpha })
    }
}

/// `x · σ(beta · x)`; SiLU when `beta` is 1.
#[derive(Debug, Clone)]
pub struct Swish {
    beta: f64,
}

impl Swish {
    pub fn new(beta: f64) -> Result<Self> {
        Ok(Self {
            beta: positive("Swish", "beta", beta)?,
        })
    }
}

impl Default for Swish {
    fn default() -> Self {
        Self { beta: 1.0 }
    }
}

impl Activation for Swish {
    fn apply(&self, x: f64) -> f64 {
        x * Sigmoid.apply(self.beta * x)
    }
    fn derivative(&self, x: f64) -> f64 {
        let s = Sigmoid.apply(self.beta * x);
        let ds = s * (1.0 - s) * self.beta;
        s + x * ds
    }
    fn kind(&self) -> Option<ActivationKind> {
        Some(ActivationKind::Swish { beta: self.beta })
    }
}

/// Two-slope linear function: `negative * x` below zero, `positive * x` otherwise.
#[derive(Debug, Clone)]
pub struct PiecewiseLinear {
    negative: f64,
    positive: f64,
}

impl PiecewiseLinear {
    pub fn new(negative: f64, positive: f64) -> Result<Self> {
        if !negative.is_finite() || !positive.is_finite() {
            return Err(NetError::construction(format!(
                "piecewise slopes must be finite, got {negative} and {positive}"
            )));
        }
        Ok(Self { negative, positive })
    }
}

impl Activation for PiecewiseLinear {
    fn apply(&self, x: f64) -> f64 {
        if x < 0.0 { self.negative * x } else { self.positive * x }
    }
    fn derivative(&self, x: f64) -> f64 {
        if x < 0.0 { self.negative } else { self.positive }
    }
    fn kind(&self) -> Option<ActivationKind> {
        Some(ActivationKind::PiecewiseLinear {
            negative: self.negative,
            positive: self.positive,
        })
    }
}

/// Serializable activation kinds for configuration and persistence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivationKind {
    Linear,
    Sigmoid,
    Tanh,
    #[serde(rename = "relu")]
    ReLU,
    #[serde(rename = "leaky_relu")]
    LeakyReLU { alpha: f64 },
    #[serde(rename = "elu")]
    ELU { alpha: f64 },
    Swish { beta: f64 },
    PiecewiseLinear { negative: f64, positive: f64 },
}

impl ActivationKind {
    pub fn to_arc(&self) -> Result<Arc<dyn Activation>> {
        Ok(match *self {
            ActivationKind::Linear => Arc::new(Linear),
            ActivationKind::Sigmoid => Arc::new(Sigmoid),
            ActivationKind::Tanh => Arc::new(Tanh),
            ActivationKind::ReLU => Arc::new(ReLU),
            ActivationKind::LeakyReLU { alpha } => Arc::new(LeakyReLU::new(alpha)?),
            ActivationKind::ELU { alpha } => Arc::new(ELU::new(alpha)?),
            ActivationKind::Swish { beta } => Arc::new(Swish::new(beta)?),
            ActivationKind::PiecewiseLinear { negative, positive } => {
                Arc::new(PiecewiseLinear::new(negative, positive)?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_slope(act: &dyn Activation, x: f64) -> f64 {
        let h = 1e-6;
        (act.apply(x + h) - act.apply(x - h)) / (2.0 * h)
    }

    #[test]
    fn analytic_derivatives_match_finite_differences() {
        let acts: Vec<Arc<dyn Activation>> = vec![
            Arc::new(Linear),
            Arc::new(Sigmoid),
            Arc::new(Tanh),
            Arc::new(LeakyReLU::default()),
            Arc::new(ELU::default()),
            Arc::new(Swish::default()),
            Arc::new(PiecewiseLinear::new(2.0, 3.0).unwrap()),
        ];
        for act in &acts {
            for &x in &[-2.3, -0.4, 0.7, 1.9] {
                let expected = numeric_slope(act.as_ref(), x);
                let cached = act.cached_derivative(x, act.apply(x)).unwrap();
                assert!((act.derivative(x) - expected).abs() < 1e-6, "{act:?} at {x}");
                assert!((cached - expected).abs() < 1e-6, "{act:?} cached at {x}");
            }
        }
    }

    #[test]
    fn relu_rejects_negative_cached_value() {
        assert_eq!(ReLU.cached_derivative(0.0, 0.0).unwrap(), 0.0);
        assert_eq!(ReLU.cached_derivative(2.0, 2.0).unwrap(), 1.0);
        let err = ReLU.cached_derivative(-1.0, -1.0).unwrap_err();
        assert!(matches!(err, NetError::NumericalRange { .. }));
    }

    #[test]
    fn invalid_hyperparameters_fail_at_construction() {
        assert!(LeakyReLU::new(0.0).is_err());
        assert!(ELU::new(-1.0).is_err());
        assert!(Swish::new(f64::NAN).is_err());
        assert!(ActivationKind::LeakyReLU { alpha: -0.1 }.to_arc().is_err());
    }

    #[test]
    fn kinds_round_trip_through_instances() {
        let kinds = [
            ActivationKind::ReLU,
            ActivationKind::ELU { alpha: 0.5 },
            ActivationKind::PiecewiseLinear { negative: 2.0, positive: 3.0 },
        ];
        for kind in kinds {
            assert_eq!(kind.to_arc().unwrap().kind(), Some(kind.clone()));
        }
    }
}
