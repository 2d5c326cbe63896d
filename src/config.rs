//! Serde configuration for assembling networks and trainers.
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::activations::ActivationKind;
use crate::error::Result;
use crate::layers::{Dropout, Layer, Pooling, PoolingMode};
use crate::loss::LossKind;
use crate::network::Network;
use crate::node::ConvGeometry;
use crate::optimizers::OptimizerConfig;
use crate::regularization::RegularizerConfig;
use crate::registry::Registry;
use crate::schedulers::SchedulerConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DropoutConfig {
    pub rate: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerConfig {
    Dense {
        nodes: usize,
        #[serde(default)]
        activation: Option<ActivationKind>,
        #[serde(default)]
        dropout: Option<DropoutConfig>,
    },
    Convolution {
        channels: usize,
        height: usize,
        width: usize,
        filters: usize,
        kernel: usize,
        #[serde(default = "one")]
        stride: usize,
        #[serde(default)]
        activation: Option<ActivationKind>,
        #[serde(default)]
        dropout: Option<DropoutConfig>,
    },
    Pooling {
        channels: usize,
        height: usize,
        width: usize,
        size: usize,
        #[serde(default = "one")]
        stride: usize,
        mode: PoolingMode,
    },
}

fn one() -> usize {
    1
}

/// Network architecture plus the seed for weight initialisation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    pub input_dimension: usize,
    #[serde(default)]
    pub default_activation: Option<ActivationKind>,
    #[serde(default)]
    pub seed: u64,
    pub layers: Vec<LayerConfig>,
}

impl NetworkConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Assembles and builds the network described by this config.
    pub fn build_network(&self, registry: &mut Registry) -> Result<Network> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut network = Network::new(self.input_dimension)?;
        if let Some(kind) = &self.default_activation {
            network = network.with_default_activation(registry.activation(kind)?);
        }
        for layer_config in &self.layers {
            let (layer, activation, dropout) = match *layer_config {
                LayerConfig::Dense {
                    nodes,
                    ref activation,
                    dropout,
                } => (
                    Layer::dense(&mut rng, network.output_dimension(), nodes)?,
                    activation,
                    dropout,
                ),
                LayerConfig::Convolution {
                    channels,
                    height,
                    width,
                    filters,
                    kernel,
                    stride,
                    ref activation,
                    dropout,
                } => {
                    let geometry = ConvGeometry {
                        channels,
                        height,
                        width,
                        kernel_height: kernel,
                        kernel_width: kernel,
                        stride,
                    };
                    (Layer::convolution(&mut rng, geometry, filters)?, activation, dropout)
                }
                LayerConfig::Pooling {
                    channels,
                    height,
                    width,
                    size,
                    stride,
                    mode,
                } => {
                    let pooling = Pooling {
                        channels,
                        height,
                        width,
                        size,
                        stride,
                        mode,
                    };
                    (Layer::pooling(pooling)?, &None, None)
                }
            };
            let mut layer = match activation {
                Some(kind) => layer.with_activation(registry.activation(kind)?),
                None => layer,
            };
            if let Some(d) = dropout {
                layer = layer.with_dropout(Dropout::new(d.rate, d.seed)?)?;
            }
            network.add_layer(layer)?;
        }
        network.build()?;
        Ok(network)
    }
}

/// Loss, regularization, optimizer and learning-rate schedule of a trainer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainerConfig {
    pub loss: LossKind,
    #[serde(default)]
    pub regularizer: Option<RegularizerConfig>,
    pub optimizer: OptimizerConfig,
    pub scheduler: SchedulerConfig,
}

impl TrainerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            loss: LossKind::Euclidean,
            regularizer: None,
            optimizer: OptimizerConfig::Sgd,
            scheduler: SchedulerConfig::Constant { rate: 0.1 },
        }
    }
}
