//! Stateful update rules mapping a gradient to a parameter delta.
//!
//! Every optimizer keeps per-parameter state indexed by the network's flat
//! parameter index. The trainer subtracts the returned delta from the parameter.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

pub trait Optimizer: fmt::Debug + Send {
    /// Allocates zeroed state for `parameter_count` parameters.
    fn initialize(&mut self, parameter_count: usize);

    /// Delta for parameter `slot` given its gradient and the active learning rate.
    fn delta(&mut self, slot: usize, gradient: f64, rate: f64) -> Result<f64>;

    /// Clears accumulated state, keeping the parameter count.
    fn reset(&mut self);
}

/// Optimizer configuration options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Sgd,
    Momentum { momentum: f64 },
    Nesterov { momentum: f64 },
    Adagrad { epsilon: f64 },
    Adadelta { rho: f64, epsilon: f64 },
    #[serde(rename = "rmsprop")]
    RmsProp { rho: f64, epsilon: f64 },
    Adam { beta1: f64, beta2: f64, epsilon: f64 },
    Adamax { beta1: f64, beta2: f64, epsilon: f64 },
}

impl OptimizerConfig {
    pub fn adam() -> Self {
        OptimizerConfig::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    pub fn build(&self) -> Result<Box<dyn Optimizer>> {
        Ok(match *self {
            OptimizerConfig::Sgd => Box::new(Sgd),
            OptimizerConfig::Momentum { momentum } => Box::new(Momentum::new(momentum)?),
            OptimizerConfig::Nesterov { momentum } => Box::new(Nesterov::new(momentum)?),
            OptimizerConfig::Adagrad { epsilon } => Box::new(Adagrad::new(epsilon)?),
            OptimizerConfig::Adadelta { rho, epsilon } => Box::new(Adadelta::new(rho, epsilon)?),
            OptimizerConfig::RmsProp { rho, epsilon } => Box::new(RmsProp::new(rho, epsilon)?),
            OptimizerConfig::Adam { beta1, beta2, epsilon } => Box::new(Adam::new(beta1, beta2, epsilon)?),
            OptimizerConfig::Adamax { beta1, beta2, epsilon } => {
                Box::new(Adamax::new(beta1, beta2, epsilon)?)
            }
        })
    }
}

fn unit_interval(name: &str, value: f64) -> Result<f64> {
    if (0.0..1.0).contains(&value) {
        Ok(value)
    } else {
        Err(NetError::construction(format!("{name} must be in [0, 1), got {value}")))
    }
}

fn smoothing(value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(NetError::construction(format!(
            "smoothing epsilon must be positive, got {value}"
        )))
    }
}

fn checked(delta: f64, gradient: f64) -> Result<f64> {
    if delta.is_finite() {
        Ok(delta)
    } else {
        Err(NetError::range("optimizer delta", &[gradient, delta]))
    }
}

fn state<T>(buf: &mut [T], slot: usize) -> Result<&mut T> {
    let count = buf.len();
    buf.get_mut(slot)
        .ok_or(NetError::ParameterIndex { index: slot, count })
}

/// Plain gradient descent: `rate · g`.
#[derive(Debug, Clone, Default)]
pub struct Sgd;

impl Optimizer for Sgd {
    fn initialize(&mut self, _parameter_count: usize) {}

    fn delta(&mut self, _slot: usize, gradient: f64, rate: f64) -> Result<f64> {
        checked(rate * gradient, gradient)
    }

    fn reset(&mut self) {}
}

/// Classical momentum: `v = μv + rate · g`.
#[derive(Debug, Clone)]
pub struct Momentum {
    momentum: f64,
    velocity: Vec<f64>,
}

impl Momentum {
    pub fn new(momentum: f64) -> Result<Self> {
        Ok(Self {
            momentum: unit_interval("momentum", momentum)?,
            velocity: Vec::new(),
        })
    }
}

impl Optimizer for Momentum {
    fn initialize(&mut self, parameter_count: usize) {
        self.velocity = vec![0.0; parameter_count];
    }

    fn delta(&mut self, slot: usize, gradient: f64, rate: f64) -> Result<f64> {
        let v = state(&mut self.velocity, slot)?;
        *v = self.momentum * *v + rate * gradient;
        checked(*v, gradient)
    }

    fn reset(&mut self) {
        self.velocity.fill(0.0);
    }
}

/// Nesterov accelerated gradient in its look-ahead-free form.
#[derive(Debug, Clone)]
pub struct Nesterov {
    momentum: f64,
    velocity: Vec<f64>,
}

impl Nesterov {
    pub fn new(momentum: f64) -> Result<Self> {
        Ok(Self {
            momentum: unit_interval("momentum", momentum)?,
            velocity: Vec::new(),
        })
    }
}

impl Optimizer for Nesterov {
    fn initialize(&mut self, parameter_count: usize) {
        self.velocity = vec![0.0; parameter_count];
    }

    fn delta(&mut self, slot: usize, gradient: f64, rate: f64) -> Result<f64> {
        let mu = self.momentum;
        let v = state(&mut self.velocity, slot)?;
        let previous = *v;
        *v = mu * previous + rate * gradient;
        checked(-mu * previous + (1.0 + mu) * *v, gradient)
    }

    fn reset(&mut self) {
        self.velocity.fill(0.0);
    }
}

/// Adagrad: accumulated squared gradients scale the step down.
#[derive(Debug, Clone)]
pub struct Adagrad {
    epsilon: f64,
    squares: Vec<f64>,
}

impl Adagrad {
    pub fn new(epsilon: f64) -> Result<Self> {
        Ok(Self {
            epsilon: smoothing(epsilon)?,
            squares: Vec::new(),
        })
    }
}

impl Optimizer for Adagrad {
    fn initialize(&mut self, parameter_count: usize) {
        self.squares = vec![0.0; parameter_count];
    }

    fn delta(&mut self, slot: usize, gradient: f64, rate: f64) -> Result<f64> {
        let g2 = state(&mut self.squares, slot)?;
        *g2 += gradient * gradient;
        checked(rate * gradient / (g2.sqrt() + self.epsilon), gradient)
    }

    fn reset(&mut self) {
        self.squares.fill(0.0);
    }
}

/// Adadelta: ratio of running update and gradient magnitudes.
#[derive(Debug, Clone)]
pub struct Adadelta {
    rho: f64,
    epsilon: f64,
    // (E[g²], E[Δ²])
    averages: Vec<(f64, f64)>,
}

impl Adadelta {
    pub fn new(rho: f64, epsilon: f64) -> Result<Self> {
        Ok(Self {
            rho: unit_interval("rho", rho)?,
            epsilon: smoothing(epsilon)?,
            averages: Vec::new(),
        })
    }
}

impl Optimizer for Adadelta {
    fn initialize(&mut self, parameter_count: usize) {
        self.averages = vec![(0.0, 0.0); parameter_count];
    }

    fn delta(&mut self, slot: usize, gradient: f64, rate: f64) -> Result<f64> {
        let (rho, eps) = (self.rho, self.epsilon);
        let (g2, d2) = state(&mut self.averages, slot)?;
        *g2 = rho * *g2 + (1.0 - rho) * gradient * gradient;
        let step = ((*d2 + eps).sqrt() / (*g2 + eps).sqrt()) * gradient;
        *d2 = rho * *d2 + (1.0 - rho) * step * step;
        checked(rate * step, gradient)
    }

    fn reset(&mut self) {
        self.averages.fill((0.0, 0.0));
    }
}

/// RMSProp: step normalised by a running RMS of the gradient.
#[derive(Debug, Clone)]
pub struct RmsProp {
    rho: f64,
    epsilon: f64,
    mean_square: Vec<f64>,
}

impl RmsProp {
    pub fn new(rho: f64, epsilon: f64) -> Result<Self> {
        Ok(Self {
            rho: unit_interval("rho", rho)?,
            epsilon: smoothing(epsilon)?,
            mean_square: Vec::new(),
        })
    }
}

impl Optimizer for RmsProp {
    fn initialize(&mut self, parameter_count: usize) {
        self.mean_square = vec![0.0; parameter_count];
    }

    fn delta(&mut self, slot: usize, gradient: f64, rate: f64) -> Result<f64> {
        let rho = self.rho;
        let ms = state(&mut self.mean_square, slot)?;
        *ms = rho * *ms + (1.0 - rho) * gradient * gradient;
        checked(rate * gradient / (ms.sqrt() + self.epsilon), gradient)
    }

    fn reset(&mut self) {
        self.mean_square.fill(0.0);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Moments {
    first: f64,
    second: f64,
    steps: i32,
}

fn betas(beta1: f64, beta2: f64, epsilon: f64) -> Result<(f64, f64, f64)> {
    Ok((
        unit_interval("beta1", beta1)?,
        unit_interval("beta2", beta2)?,
        smoothing(epsilon)?,
    ))
}

/// Adam with bias-corrected moment estimates.
#[derive(Debug, Clone)]
pub struct Adam {
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    moments: Vec<Moments>,
}

impl Adam {
    pub fn new(beta1: f64, beta2: f64, epsilon: f64) -> Result<Self> {
        let (beta1, beta2, epsilon) = betas(beta1, beta2, epsilon)?;
        Ok(Self {
            beta1,
            beta2,
            epsilon,
            moments: Vec::new(),
        })
    }
}

impl Optimizer for Adam {
    fn initialize(&mut self, parameter_count: usize) {
        self.moments = vec![Moments::default(); parameter_count];
    }

    fn delta(&mut self, slot: usize, gradient: f64, rate: f64) -> Result<f64> {
        let (b1, b2) = (self.beta1, self.beta2);
        let m = state(&mut self.moments, slot)?;
        m.steps = m.steps.saturating_add(1);
        m.first = b1 * m.first + (1.0 - b1) * gradient;
        m.second = b2 * m.second + (1.0 - b2) * gradient * gradient;
        let m_hat = m.first / (1.0 - b1.powi(m.steps));
        let v_hat = m.second / (1.0 - b2.powi(m.steps));
        checked(rate * m_hat / (v_hat.sqrt() + self.epsilon), gradient)
    }

    fn reset(&mut self) {
        self.moments.fill(Moments::default());
    }
}

/// Adamax: Adam with an infinity-norm second moment.
#[derive(Debug, Clone)]
pub struct Adamax {
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    moments: Vec<Moments>,
}

impl Adamax {
    pub fn new(beta1: f64, beta2: f64, epsilon: f64) -> Result<Self> {
        let (beta1, beta2, epsilon) = betas(beta1, beta2, epsilon)?;
        Ok(Self {
            beta1,
            beta2,
            epsilon,
            moments: Vec::new(),
        })
    }
}

impl Optimizer for Adamax {
    fn initialize(&mut self, parameter_count: usize) {
        self.moments = vec![Moments::default(); parameter_count];
    }

    fn delta(&mut self, slot: usize, gradient: f64, rate: f64) -> Result<f64> {
        let (b1, b2) = (self.beta1, self.beta2);
        let m = state(&mut self.moments, slot)?;
        m.steps = m.steps.saturating_add(1);
        m.first = b1 * m.first + (1.0 - b1) * gradient;
        m.second = (b2 * m.second).max(gradient.abs());
        let corrected = rate / (1.0 - b1.powi(m.steps));
        checked(corrected * m.first / (m.second + self.epsilon), gradient)
    }

    fn reset(&mut self) {
        self.moments.fill(Moments::default());
    }
}
