//! Losses comparing a network output with its target vector.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{check_len, NetError, Result};

/// A loss and its analytic derivative with respect to one output component.
pub trait Loss: fmt::Debug + Send + Sync {
    fn value(&self, actual: &[f64], expected: &[f64]) -> Result<f64>;
    fn derivative(&self, index: usize, actual: &[f64], expected: &[f64]) -> Result<f64>;
    fn kind(&self) -> LossKind;
}

/// Serializable loss identifiers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossKind {
    Euclidean,
    Lp { p: f64 },
    CrossEntropy,
    SoftmaxCrossEntropy,
}

fn check_pair(actual: &[f64], expected: &[f64]) -> Result<()> {
    check_len("loss target", actual.len(), expected.len())
}

fn check_index(index: usize, actual: &[f64], expected: &[f64]) -> Result<()> {
    check_pair(actual, expected)?;
    if index >= actual.len() {
        return Err(NetError::Shape {
            context: "loss derivative index",
            expected: actual.len(),
            actual: index,
        });
    }
    Ok(())
}

fn finite(operation: &'static str, value: f64, inputs: &[f64]) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(NetError::range(operation, inputs))
    }
}

/// Sum of squared error halved.
#[derive(Debug, Clone, Default)]
pub struct Euclidean;

impl Loss for Euclidean {
    fn value(&self, actual: &[f64], expected: &[f64]) -> Result<f64> {
        check_pair(actual, expected)?;
        Ok(actual
            .iter()
            .zip(expected)
            .map(|(&a, &e)| (a - e).powi(2))
            .sum::<f64>()
            / 2.0)
    }

    fn derivative(&self, index: usize, actual: &[f64], expected: &[f64]) -> Result<f64> {
        check_index(index, actual, expected)?;
        Ok(actual[index] - expected[index])
    }

    fn kind(&self) -> LossKind {
        LossKind::Euclidean
    }
}

/// `Σ |a - e|^p / p` for an exponent `p >= 1`.
#[derive(Debug, Clone)]
pub struct Lp {
    p: f64,
}

impl Lp {
    pub fn new(p: f64) -> Result<Self> {
        if !p.is_finite() || p < 1.0 {
            return Err(NetError::construction(format!(
                "Lp exponent must be finite and >= 1, got {p}"
            )));
        }
        Ok(Self { p })
    }

    pub fn exponent(&self) -> f64 {
        self.p
    }
}

impl Loss for Lp {
    fn value(&self, actual: &[f64], expected: &[f64]) -> Result<f64> {
        check_pair(actual, expected)?;
        let sum: f64 = actual
            .iter()
            .zip(expected)
            .map(|(&a, &e)| (a - e).abs().powf(self.p))
            .sum();
        finite("lp loss", sum / self.p, actual)
    }

    fn derivative(&self, index: usize, actual: &[f64], expected: &[f64]) -> Result<f64> {
        check_index(index, actual, expected)?;
        let d = actual[index] - expected[index];
        if d == 0.0 {
            return Ok(0.0);
        }
        let slope = d.abs().powf(self.p - 1.0) * d.signum();
        finite("lp derivative", slope, &[actual[index], expected[index]])
    }

    fn kind(&self) -> LossKind {
        LossKind::Lp { p: self.p }
    }
}

/// `-Σ e ln a`; assumes `actual` holds probabilities.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropy;

impl Loss for CrossEntropy {
    fn value(&self, actual: &[f64], expected: &[f64]) -> Result<f64> {
        check_pair(actual, expected)?;
        let mut loss = 0.0;
        for (&a, &e) in actual.iter().zip(expected) {
            if e == 0.0 {
                continue;
            }
            if a <= 0.0 {
                return Err(NetError::range("cross entropy", &[a, e]));
            }
            loss -= e * a.ln();
        }
        finite("cross entropy", loss, actual)
    }

    fn derivative(&self, index: usize, actual: &[f64], expected: &[f64]) -> Result<f64> {
        check_index(index, actual, expected)?;
        let (a, e) = (actual[index], expected[index]);
        if e == 0.0 {
            return Ok(0.0);
        }
        if a <= 0.0 {
            return Err(NetError::range("cross entropy derivative", &[a, e]));
        }
        Ok(-e / a)
    }

    fn kind(&self) -> LossKind {
        LossKind::CrossEntropy
    }
}

/// Cross-entropy between `actual / Σactual` and `expected / Σexpected`.
///
/// The derivative keeps the raw-sum form `-q_j / a_j + 1 / Σa`, so the
/// upstream activation is expected to keep every component positive.
#[derive(Debug, Clone, Default)]
pub struct SoftmaxCrossEntropy;

impl SoftmaxCrossEntropy {
    fn sums(actual: &[f64], expected: &[f64]) -> Result<(f64, f64)> {
        let actual_sum: f64 = actual.iter().sum();
        let expected_sum: f64 = expected.iter().sum();
        if actual_sum <= 0.0 || expected_sum <= 0.0 || !actual_sum.is_finite() || !expected_sum.is_finite() {
            return Err(NetError::range("softmax cross entropy sums", &[actual_sum, expected_sum]));
        }
        if let Some(&e) = expected.iter().find(|&&e| e < 0.0) {
            return Err(NetError::range("softmax cross entropy expected", &[e]));
        }
        Ok((actual_sum, expected_sum))
    }
}

impl Loss for SoftmaxCrossEntropy {
    fn value(&self, actual: &[f64], expected: &[f64]) -> Result<f64> {
        check_pair(actual, expected)?;
        let (actual_sum, expected_sum) = Self::sums(actual, expected)?;
        let mut loss = 0.0;
        for (&a, &e) in actual.iter().zip(expected) {
            if e == 0.0 {
                continue;
            }
            let p = a / actual_sum;
            if p <= 0.0 {
                return Err(NetError::range("softmax cross entropy", &[a, e]));
            }
            loss -= (e / expected_sum) * p.ln();
        }
        finite("softmax cross entropy", loss, actual)
    }

    fn derivative(&self, index: usize, actual: &[f64], expected: &[f64]) -> Result<f64> {
        check_index(index, actual, expected)?;
        let (actual_sum, expected_sum) = Self::sums(actual, expected)?;
        let (a, e) = (actual[index], expected[index]);
        let q = e / expected_sum;
        if q == 0.0 {
            return Ok(1.0 / actual_sum);
        }
        if a <= 0.0 {
            return Err(NetError::range("softmax cross entropy derivative", &[a, e]));
        }
        finite(
            "softmax cross entropy derivative",
            -q / a + 1.0 / actual_sum,
            &[a, e, actual_sum, expected_sum],
        )
    }

    fn kind(&self) -> LossKind {
        LossKind::SoftmaxCrossEntropy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(loss: &dyn Loss, index: usize, actual: &[f64], expected: &[f64]) -> f64 {
        let h = 1e-6;
        let mut plus = actual.to_vec();
        let mut minus = actual.to_vec();
        plus[index] += h;
        minus[index] -= h;
        (loss.value(&plus, expected).unwrap() - loss.value(&minus, expected).unwrap()) / (2.0 * h)
    }

    #[test]
    fn derivatives_agree_with_values() {
        let actual = [0.2, 0.5, 0.3];
        let expected = [0.1, 0.7, 0.2];
        let losses: Vec<Box<dyn Loss>> = vec![
            Box::new(Euclidean),
            Box::new(Lp::new(3.0).unwrap()),
            Box::new(Lp::new(1.5).unwrap()),
            Box::new(CrossEntropy),
            Box::new(SoftmaxCrossEntropy),
        ];
        for loss in &losses {
            for i in 0..actual.len() {
                let analytic = loss.derivative(i, &actual, &expected).unwrap();
                let approx = numeric(loss.as_ref(), i, &actual, &expected);
                assert!((analytic - approx).abs() < 1e-6, "{loss:?} index {i}: {analytic} vs {approx}");
            }
        }
    }

    #[test]
    fn euclidean_is_half_squared_error() {
        let v = Euclidean.value(&[1.0, 3.0], &[0.0, 1.0]).unwrap();
        assert_eq!(v, 2.5);
        assert_eq!(Lp::new(2.0).unwrap().value(&[1.0, 3.0], &[0.0, 1.0]).unwrap(), 2.5);
    }

    #[test]
    fn mismatched_lengths_are_shape_errors() {
        let err = Euclidean.value(&[1.0], &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, NetError::Shape { .. }));
        assert!(Euclidean.derivative(3, &[1.0], &[1.0]).is_err());
    }

    #[test]
    fn log_of_non_positive_is_a_range_error() {
        let err = CrossEntropy.value(&[0.0, 1.0], &[1.0, 0.0]).unwrap_err();
        assert!(matches!(err, NetError::NumericalRange { .. }));
        assert!(SoftmaxCrossEntropy.value(&[-0.5, 1.0], &[1.0, 0.0]).is_err());
        assert!(SoftmaxCrossEntropy.derivative(0, &[0.0, 0.0], &[1.0, 0.0]).is_err());
    }

    #[test]
    fn lp_rejects_exponent_below_one() {
        assert!(Lp::new(0.5).is_err());
        assert!(Lp::new(f64::INFINITY).is_err());
    }
}
