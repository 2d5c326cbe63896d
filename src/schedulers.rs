//! Learning-rate schedules indexed by epoch.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

pub trait Scheduler: fmt::Debug + Send {
    /// Learning rate for `epoch` (zero-based).
    fn rate(&mut self, epoch: usize) -> f64;
}

/// Learning rate scheduler configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerConfig {
    Constant { rate: f64 },
    TimeDecay { initial: f64, decay: f64 },
    DropBased { initial: f64, factor: f64, step: usize },
}

impl SchedulerConfig {
    pub fn build(&self) -> Result<Box<dyn Scheduler>> {
        Ok(match *self {
            SchedulerConfig::Constant { rate } => Box::new(Constant::new(rate)?),
            SchedulerConfig::TimeDecay { initial, decay } => Box::new(TimeDecay::new(initial, decay)?),
            SchedulerConfig::DropBased { initial, factor, step } => {
                Box::new(DropBased::new(initial, factor, step)?)
            }
        })
    }
}

fn positive_rate(rate: f64) -> Result<f64> {
    if rate.is_finite() && rate > 0.0 {
        Ok(rate)
    } else {
        Err(NetError::construction(format!("learning rate must be positive, got {rate}")))
    }
}

#[derive(Debug, Clone)]
pub struct Constant {
    rate: f64,
}

impl Constant {
    pub fn new(rate: f64) -> Result<Self> {
        Ok(Self {
            rate: positive_rate(rate)?,
        })
    }
}

impl Scheduler for Constant {
    fn rate(&mut self, _epoch: usize) -> f64 {
        self.rate
    }
}

/// `initial / (1 + decay · epoch)`
#[derive(Debug, Clone)]
pub struct TimeDecay {
    initial: f64,
    decay: f64,
}

impl TimeDecay {
    pub fn new(initial: f64, decay: f64) -> Result<Self> {
        if !decay.is_finite() || decay <= 0.0 {
            return Err(NetError::construction(format!("decay must be positive, got {decay}")));
        }
        Ok(Self {
            initial: positive_rate(initial)?,
            decay,
        })
    }
}

impl Scheduler for TimeDecay {
    fn rate(&mut self, epoch: usize) -> f64 {
        self.initial / (1.0 + self.decay * epoch as f64)
    }
}

/// Multiplies the current rate by `factor` once for every multiple of `step` passed.
#[derive(Debug, Clone)]
pub struct DropBased {
    current: f64,
    factor: f64,
    step: usize,
    last_drop: usize,
}

impl DropBased {
    pub fn new(initial: f64, factor: f64, step: usize) -> Result<Self> {
        if !(factor > 0.0 && factor <= 1.0) {
            return Err(NetError::construction(format!("drop factor must be in (0, 1], got {factor}")));
        }
        if step == 0 {
            return Err(NetError::construction("drop step must be positive"));
        }
        Ok(Self {
            current: positive_rate(initial)?,
            factor,
            step,
            last_drop: 0,
        })
    }
}

impl Scheduler for DropBased {
    fn rate(&mut self, epoch: usize) -> f64 {
        let missed = (epoch / self.step).saturating_sub(self.last_drop / self.step);
        if missed > 0 {
            self.current *= self.factor.powi(missed.min(i32::MAX as usize) as i32);
            self.last_drop = epoch;
        }
        self.current
    }
}
