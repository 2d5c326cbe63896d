//! Layered feed-forward network with a flattened parameter view.
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use crate::activations::Activation;
use crate::error::{check_len, NetError, Result};
use crate::layers::{Layer, LayerKind};
use crate::node::ComputationNode;
use crate::trace::Trace;

/// Network
#[derive(Debug, Clone)]
pub struct Network {
    /// Number of input features.
    input_dimension: usize,
    /// Ordered list of layers from input to output.
    layers: Vec<Layer>,
    /// Activation used by layers that do not declare one.
    default_activation: Option<Arc<dyn Activation>>,
    built: bool,
    training: bool,
}

impl Network {
    pub fn new(input_dimension: usize) -> Result<Self> {
        if input_dimension == 0 {
            return Err(NetError::construction("network input dimension must be positive"));
        }
        Ok(Self {
            input_dimension,
            layers: Vec::new(),
            default_activation: None,
            built: false,
            training: false,
        })
    }

    pub fn with_default_activation(mut self, activation: Arc<dyn Activation>) -> Self {
        self.default_activation = Some(activation);
        self
    }

    /// Appends a layer whose input must match the current output dimension.
    pub fn add_layer(&mut self, mut layer: Layer) -> Result<()> {
        if self.built {
            return Err(NetError::Sequencing("cannot add layers to a built network".into()));
        }
        let expected = self.output_dimension();
        if layer.input_dimension() != expected {
            return Err(NetError::construction(format!(
                "layer {} takes {} inputs but the previous stage produces {expected}",
                self.layers.len(),
                layer.input_dimension()
            )));
        }
        layer.set_training(self.training);
        self.layers.push(layer);
        Ok(())
    }

    /// Builder-style [`Network::add_layer`].
    pub fn layer(mut self, layer: Layer) -> Result<Self> {
        self.add_layer(layer)?;
        Ok(self)
    }

    /// Wires activation fallbacks and freezes the structure.
    pub fn build(&mut self) -> Result<()> {
        if self.built {
            return Err(NetError::Sequencing("network is already built".into()));
        }
        if self.layers.is_empty() {
            return Err(NetError::construction("network has no layers"));
        }
        for layer in &mut self.layers {
            layer.wire(self.default_activation.as_ref())?;
        }
        if self.layers.last().and_then(Layer::dropout).is_some() {
            warn!("dropout configured on the output layer");
        }
        let training = self.training;
        self.set_training(training);
        self.built = true;
        debug!("built {} with {} parameters", self, self.param_count());
        Ok(())
    }

    /// Reassembles an already-trained structure without the build step.
    pub(crate) fn from_built_parts(
        input_dimension: usize,
        default_activation: Option<Arc<dyn Activation>>,
        layers: Vec<Layer>,
    ) -> Result<Self> {
        let mut network = Self::new(input_dimension)?;
        network.default_activation = default_activation;
        for layer in layers {
            network.add_layer(layer)?;
        }
        for layer in &mut network.layers {
            layer.wire(network.default_activation.as_ref())?;
        }
        network.built = true;
        Ok(network)
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Enables or disables dropout on every layer at once.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }

    pub(crate) fn advance_dropout_round(&mut self) {
        for layer in &mut self.layers {
            layer.advance_round();
        }
    }

    pub fn input_dimension(&self) -> usize {
        self.input_dimension
    }

    pub fn output_dimension(&self) -> usize {
        self.layers
            .last()
            .map_or(self.input_dimension, Layer::output_dimension)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn default_activation(&self) -> Option<&Arc<dyn Activation>> {
        self.default_activation.as_ref()
    }

    fn ensure_built(&self) -> Result<()> {
        if !self.built {
            return Err(NetError::Sequencing("network must be built before use".into()));
        }
        Ok(())
    }

    /// Forward pass from input to output.
    pub fn calculate(&self, input: &[f64]) -> Result<Vec<f64>> {
        let mut trace = Trace::new();
        self.forward(input, &mut trace)?;
        Ok(trace.layers.pop().map(|l| l.value).unwrap_or_default())
    }

    /// Forward pass that keeps every layer's scratch state in `trace`.
    pub fn forward(&self, input: &[f64], trace: &mut Trace) -> Result<()> {
        self.ensure_built()?;
        check_len("network input", self.input_dimension, input.len())?;
        trace.input.clear();
        trace.input.extend_from_slice(input);
        trace.layers.resize_with(self.layers.len(), Default::default);
        for (i, layer) in self.layers.iter().enumerate() {
            let (before, rest) = trace.layers.split_at_mut(i);
            let layer_input = before.last().map_or(&trace.input[..], |l| &l.value[..]);
            layer.forward(layer_input, &mut rest[0])?;
        }
        Ok(())
    }

    /// Total number of trainable parameters.
    pub fn param_count(&self) -> usize {
        self.layers
            .iter()
            .flat_map(Layer::nodes)
            .map(ComputationNode::param_count)
            .sum()
    }

    /// Maps a flat index to (layer, node, parameter).
    fn locate(&self, index: usize) -> Result<(usize, usize, usize)> {
        let mut remaining = index;
        for (l, layer) in self.layers.iter().enumerate() {
            for (n, node) in layer.nodes().iter().enumerate() {
                let count = node.param_count();
                if remaining < count {
                    return Ok((l, n, remaining));
                }
                remaining -= count;
            }
        }
        Err(NetError::ParameterIndex {
            index,
            count: self.param_count(),
        })
    }

    /// Reads a parameter by its flat index (layers, then nodes, then weights and bias).
    pub fn param(&self, index: usize) -> Result<f64> {
        let (l, n, p) = self.locate(index)?;
        self.layers[l].nodes()[n].param(p)
    }

    pub fn set_param(&mut self, index: usize, value: f64, is_delta: bool) -> Result<()> {
        let (l, n, p) = self.locate(index)?;
        self.layers[l].nodes_mut()[n].set_param(p, value, is_delta)
    }

    /// All parameters in flat index order.
    pub fn params(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.param_count());
        for node in self.layers.iter().flat_map(Layer::nodes) {
            out.extend_from_slice(node.weights());
            out.push(node.bias());
        }
        out
    }

    pub fn set_params(&mut self, values: &[f64]) -> Result<()> {
        check_len("parameter vector", self.param_count(), values.len())?;
        let mut it = values.iter().copied();
        for layer in &mut self.layers {
            for node in layer.nodes_mut() {
                for (w, v) in node.weights_mut().iter_mut().zip(&mut it) {
                    *w = v;
                }
                if let Some(b) = it.next() {
                    *node.bias_mut() = b;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sizes = vec![self.input_dimension];
        let mut kinds = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            sizes.push(layer.output_dimension());
            kinds.push(match layer.kind() {
                LayerKind::Standard(_) => "standard",
                LayerKind::Pooling(_) => "pooling",
            });
        }
        write!(f, "Network: {:?} {:?}", sizes, kinds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activations::{Linear, Tanh};
    use crate::node::DenseNode;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn small_network() -> Network {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut net = Network::new(3)
            .unwrap()
            .with_default_activation(Arc::new(Tanh))
            .layer(Layer::dense(&mut rng, 3, 4).unwrap())
            .unwrap()
            .layer(Layer::dense(&mut rng, 4, 2).unwrap())
            .unwrap();
        net.build().unwrap();
        net
    }

    #[test]
    fn calculate_requires_build() {
        let layer = Layer::standard(1, vec![DenseNode::new(vec![1.0], 0.0).unwrap().into()]).unwrap();
        let mut net = Network::new(1).unwrap().layer(layer.with_activation(Arc::new(Linear))).unwrap();
        assert!(matches!(net.calculate(&[1.0]), Err(NetError::Sequencing(_))));
        net.build().unwrap();
        assert_eq!(net.calculate(&[2.0]).unwrap(), vec![2.0]);
        assert!(matches!(net.build(), Err(NetError::Sequencing(_))));
    }

    #[test]
    fn layer_dimensions_must_chain() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut net = Network::new(3).unwrap();
        net.add_layer(Layer::dense(&mut rng, 3, 5).unwrap()).unwrap();
        let err = net.add_layer(Layer::dense(&mut rng, 4, 1).unwrap()).unwrap_err();
        assert!(matches!(err, NetError::Construction(_)));
    }

    #[test]
    fn wrong_input_length_is_a_shape_error() {
        let net = small_network();
        for len in [0, 2, 4] {
            let err = net.calculate(&vec![0.5; len]).unwrap_err();
            assert!(matches!(err, NetError::Shape { expected: 3, .. }), "len {len}");
        }
    }

    #[test]
    fn flat_parameter_view_walks_layers_nodes_weights_then_bias() {
        let mut net = small_network();
        assert_eq!(net.param_count(), 4 * 4 + 2 * 5);
        let params = net.params();
        let first_bias = net.layers()[0].nodes()[0].bias();
        assert_eq!(params[3], first_bias);
        assert_eq!(net.param(3).unwrap(), first_bias);
        let second_layer_first_weight = net.layers()[1].nodes()[0].weights()[0];
        assert_eq!(net.param(16).unwrap(), second_layer_first_weight);
        net.set_param(25, 1.5, false).unwrap();
        assert_eq!(net.layers()[1].nodes()[1].bias(), 1.5);
        assert!(net.param(26).is_err());

        let shifted: Vec<f64> = params.iter().map(|p| p + 1.0).collect();
        net.set_params(&shifted).unwrap();
        assert_eq!(net.params(), shifted);
    }

    #[test]
    fn calculate_is_deterministic() {
        let net = small_network();
        let a = net.calculate(&[0.1, -0.2, 0.3]).unwrap();
        let b = net.calculate(&[0.1, -0.2, 0.3]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }
}
