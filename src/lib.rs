//! A from-scratch layered neural network engine with a backpropagation trainer.
//!
//! - Dense and convolution nodes, max/average pooling, per-layer dropout
//! - Activation fallback from node to layer to network default
//! - Trainer with pluggable loss, regularizer, optimizer and learning-rate schedule
//! - Tagged line-oriented model format, optionally gzip-compressed on disk
//! - Finite-difference gradient checking and classification metrics

pub mod activations;
pub mod config;
pub mod error;
pub mod gradient_check;
pub mod layers;
pub mod loss;
pub mod metrics;
pub mod network;
pub mod node;
pub mod optimizers;
pub mod registry;
pub mod regularization;
pub mod schedulers;
pub mod serialization;
pub mod trace;
pub mod trainer;

pub use activations::{Activation, ActivationKind, Linear, PiecewiseLinear, ReLU, Sigmoid, Tanh};
pub use config::{LayerConfig, NetworkConfig, TrainerConfig};
pub use error::{NetError, Result};
pub use gradient_check::GradientReport;
pub use layers::{Dropout, Layer, LayerKind, Pooling, PoolingMode};
pub use loss::{Euclidean, Loss, LossKind};
pub use metrics::{accuracy, confusion_matrix};
pub use network::Network;
pub use node::{ComputationNode, ConvGeometry, ConvNode, DenseNode, Node};
pub use optimizers::{Optimizer, OptimizerConfig};
pub use registry::Registry;
pub use regularization::{Regularizer, RegularizerConfig};
pub use schedulers::{Scheduler, SchedulerConfig};
pub use trace::Trace;
pub use trainer::{Gradients, Trainer};
