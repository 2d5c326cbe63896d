//! Finite-difference verification of backpropagated gradients.
use crate::error::{check_len, Result};
use crate::loss::Loss;
use crate::network::Network;
use crate::trace::Trace;
use crate::trainer::{backward, Gradients};

/// Analytic and central-difference gradients in flat parameter order.
#[derive(Debug, Clone)]
pub struct GradientReport {
    pub analytic: Vec<f64>,
    pub numeric: Vec<f64>,
    pub max_relative_error: f64,
}

impl GradientReport {
    pub fn passes(&self, tolerance: f64) -> bool {
        self.max_relative_error <= tolerance
    }

    /// Index of the parameter with the largest disagreement.
    pub fn worst_index(&self) -> Option<usize> {
        (0..self.analytic.len()).max_by(|&a, &b| {
            relative_error(self.analytic[a], self.numeric[a])
                .total_cmp(&relative_error(self.analytic[b], self.numeric[b]))
        })
    }
}

fn relative_error(analytic: f64, numeric: f64) -> f64 {
    (analytic - numeric).abs() / analytic.abs().max(numeric.abs()).max(1e-4)
}

/// Compares backpropagation against `(L(p + h) - L(p - h)) / 2h` for every parameter.
///
/// The network is evaluated as-is, so a network in training mode is checked
/// under its current dropout mask. `network` itself is never modified.
pub fn check(
    network: &Network,
    loss: &dyn Loss,
    input: &[f64],
    expected: &[f64],
    step: f64,
) -> Result<GradientReport> {
    check_len("expected output", network.output_dimension(), expected.len())?;
    let mut trace = Trace::new();
    let mut gradients = Gradients::for_network(network);
    network.forward(input, &mut trace)?;
    backward(network, loss, &mut trace, expected, &mut gradients)?;
    let analytic = gradients.flat();

    let mut perturbed = network.clone();
    let mut numeric = Vec::with_capacity(analytic.len());
    for i in 0..perturbed.param_count() {
        let original = perturbed.param(i)?;
        perturbed.set_param(i, original + step, false)?;
        let plus = loss.value(&perturbed.calculate(input)?, expected)?;
        perturbed.set_param(i, original - step, false)?;
        let minus = loss.value(&perturbed.calculate(input)?, expected)?;
        perturbed.set_param(i, original, false)?;
        numeric.push((plus - minus) / (2.0 * step));
    }

    let max_relative_error = analytic
        .iter()
        .zip(&numeric)
        .map(|(&a, &n)| relative_error(a, n))
        .fold(0.0, f64::max);
    Ok(GradientReport {
        analytic,
        numeric,
        max_relative_error,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::activations::Tanh;
    use crate::layers::Layer;
    use crate::loss::Euclidean;
    use crate::node::DenseNode;

    #[test]
    fn small_dense_network_agrees() {
        let hidden = Layer::standard(
            2,
            vec![
                DenseNode::new(vec![0.3, -0.2], 0.1).unwrap().into(),
                DenseNode::new(vec![-0.5, 0.4], -0.2).unwrap().into(),
            ],
        )
        .unwrap();
        let output = Layer::standard(2, vec![DenseNode::new(vec![0.7, -0.6], 0.05).unwrap().into()]).unwrap();
        let mut net = Network::new(2)
            .unwrap()
            .with_default_activation(Arc::new(Tanh))
            .layer(hidden)
            .unwrap()
            .layer(output)
            .unwrap();
        net.build().unwrap();

        let report = check(&net, &Euclidean, &[0.5, -1.0], &[0.25], 1e-5).unwrap();
        assert_eq!(report.analytic.len(), 9);
        assert!(report.passes(1e-5), "{report:?}");
        assert!(report.worst_index().is_some());
    }

    #[test]
    fn relative_error_has_a_floor() {
        assert_eq!(relative_error(0.0, 0.0), 0.0);
        assert!((relative_error(1e-9, 0.0) - 1e-5).abs() < 1e-12);
    }
}
