//! Factory for named activations and losses, with memoized parametrized variants.
use std::collections::HashMap;
use std::sync::Arc;

use crate::activations::{Activation, ActivationKind};
use crate::error::Result;
use crate::loss::{CrossEntropy, Euclidean, Loss, LossKind, Lp, SoftmaxCrossEntropy};

/// Owned cache of shared activation and loss instances.
///
/// Each network assembly or trainer setup passes a registry explicitly; nothing is global.
#[derive(Debug, Default)]
pub struct Registry {
    activations: Vec<(ActivationKind, Arc<dyn Activation>)>,
    lp: HashMap<u64, Arc<Lp>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared instance for `kind`, created on first use.
    pub fn activation(&mut self, kind: &ActivationKind) -> Result<Arc<dyn Activation>> {
        if let Some((_, act)) = self.activations.iter().find(|(k, _)| k == kind) {
            return Ok(Arc::clone(act));
        }
        let act = kind.to_arc()?;
        self.activations.push((kind.clone(), Arc::clone(&act)));
        Ok(act)
    }

    /// `Lp(p)` keyed by the exact bit pattern of `p`.
    pub fn lp(&mut self, p: f64) -> Result<Arc<Lp>> {
        if let Some(loss) = self.lp.get(&p.to_bits()) {
            return Ok(Arc::clone(loss));
        }
        let loss = Arc::new(Lp::new(p)?);
        self.lp.insert(p.to_bits(), Arc::clone(&loss));
        Ok(loss)
    }

    pub fn loss(&mut self, kind: LossKind) -> Result<Arc<dyn Loss>> {
        Ok(match kind {
            LossKind::Euclidean => Arc::new(Euclidean),
            LossKind::Lp { p } => self.lp(p)?,
            LossKind::CrossEntropy => Arc::new(CrossEntropy),
            LossKind::SoftmaxCrossEntropy => Arc::new(SoftmaxCrossEntropy),
        })
    }
}
