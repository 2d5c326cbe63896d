//! Layers: ordered node collections sharing one input, and parameter-free pooling.
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::activations::Activation;
use crate::error::{check_len, NetError, Result};
use crate::node::{ComputationNode, ConvGeometry, ConvNode, DenseNode, Node};
use crate::trace::LayerTrace;

/// Inverted dropout applied per node while training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dropout {
    rate: f64,
    seed: u64,
}

impl Dropout {
    pub fn new(rate: f64, seed: u64) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(NetError::construction(format!(
                "dropout rate must be in [0, 1), got {rate}"
            )));
        }
        Ok(Self { rate, seed })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Scale applied to retained outputs so inference needs no correction.
    pub fn scale(&self) -> f64 {
        1.0 / (1.0 - self.rate)
    }

    /// Retain mask for a round; the same round always yields the same mask.
    pub fn mask(&self, round: u64, nodes: usize) -> Vec<bool> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ round.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        (0..nodes).map(|_| rng.gen::<f64>() >= self.rate).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingMode {
    Max,
    Average,
}

/// Square-window pooling over each channel of a channel-major input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pooling {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub size: usize,
    pub stride: usize,
    pub mode: PoolingMode,
}

impl Pooling {
    fn geometry(&self) -> ConvGeometry {
        ConvGeometry {
            channels: self.channels,
            height: self.height,
            width: self.width,
            kernel_height: self.size,
            kernel_width: self.size,
            stride: self.stride,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.geometry().validate()
    }

    pub fn input_len(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn output_len(&self) -> usize {
        let g = self.geometry();
        self.channels * g.output_height() * g.output_width()
    }

    /// Calls `f(output_index, input_index)` for every element of every window.
    fn for_each_window(&self, mut f: impl FnMut(usize, usize)) {
        let g = self.geometry();
        let (oh, ow) = (g.output_height(), g.output_width());
        for c in 0..self.channels {
            for oy in 0..oh {
                for ox in 0..ow {
                    let out = (c * oh + oy) * ow + ox;
                    for ky in 0..self.size {
                        for kx in 0..self.size {
                            let y = oy * self.stride + ky;
                            let x = ox * self.stride + kx;
                            f(out, (c * self.height + y) * self.width + x);
                        }
                    }
                }
            }
        }
    }

    fn forward(&self, input: &[f64], trace: &mut LayerTrace) {
        match self.mode {
            PoolingMode::Max => {
                trace.value.fill(f64::NEG_INFINITY);
                trace.routes.resize(trace.value.len(), 0);
                self.for_each_window(|out, i| {
                    if input[i] > trace.value[out] {
                        trace.value[out] = input[i];
                        trace.routes[out] = i;
                    }
                });
            }
            PoolingMode::Average => {
                let area = (self.size * self.size) as f64;
                self.for_each_window(|out, i| trace.value[out] += input[i] / area);
            }
        }
        trace.net.copy_from_slice(&trace.value);
        trace.derivative.fill(1.0);
    }

    fn backpropagate(&self, trace: &LayerTrace, upstream: &mut [f64]) {
        match self.mode {
            PoolingMode::Max => {
                for (&route, &error) in trace.routes.iter().zip(&trace.error) {
                    upstream[route] += error;
                }
            }
            PoolingMode::Average => {
                let area = (self.size * self.size) as f64;
                self.for_each_window(|out, i| upstream[i] += trace.error[out] / area);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum LayerKind {
    Standard(Vec<Node>),
    Pooling(Pooling),
}

/// An ordered set of nodes evaluated against one shared input.
#[derive(Debug, Clone)]
pub struct Layer {
    kind: LayerKind,
    input_dimension: usize,
    activation: Option<Arc<dyn Activation>>,
    dropout: Option<Dropout>,
    training: bool,
    round: u64,
}

impl Layer {
    /// Layer over explicit nodes; insertion order is output order.
    pub fn standard(input_dimension: usize, nodes: Vec<Node>) -> Result<Self> {
        if input_dimension == 0 || nodes.is_empty() {
            return Err(NetError::construction(format!(
                "layer needs a positive input dimension and at least one node (got {input_dimension}, {} nodes)",
                nodes.len()
            )));
        }
        for (i, node) in nodes.iter().enumerate() {
            if node.input_dimension() != input_dimension {
                return Err(NetError::construction(format!(
                    "node {i} takes {} inputs, layer takes {input_dimension}",
                    node.input_dimension()
                )));
            }
        }
        Ok(Self::with_kind(LayerKind::Standard(nodes), input_dimension))
    }

    /// Fully-connected layer with He-uniform weights.
    pub fn dense<R: Rng>(rng: &mut R, input_dimension: usize, node_count: usize) -> Result<Self> {
        let nodes = (0..node_count)
            .map(|_| DenseNode::random(rng, input_dimension).map(Node::from))
            .collect::<Result<Vec<_>>>()?;
        Self::standard(input_dimension, nodes)
    }

    /// Convolution layer with one randomly initialised filter per feature map.
    pub fn convolution<R: Rng>(rng: &mut R, geometry: ConvGeometry, filters: usize) -> Result<Self> {
        let nodes = (0..filters)
            .map(|_| ConvNode::random(rng, geometry).map(Node::from))
            .collect::<Result<Vec<_>>>()?;
        Self::standard(geometry.input_len(), nodes)
    }

    pub fn pooling(pooling: Pooling) -> Result<Self> {
        pooling.validate()?;
        Ok(Self::with_kind(LayerKind::Pooling(pooling), pooling.input_len()))
    }

    fn with_kind(kind: LayerKind, input_dimension: usize) -> Self {
        Self {
            kind,
            input_dimension,
            activation: None,
            dropout: None,
            training: false,
            round: 0,
        }
    }

    pub fn with_activation(mut self, activation: Arc<dyn Activation>) -> Self {
        self.activation = Some(activation);
        self
    }

    pub fn with_dropout(mut self, dropout: Dropout) -> Result<Self> {
        if let LayerKind::Pooling(_) = self.kind {
            return Err(NetError::construction("pooling layers do not support dropout"));
        }
        self.dropout = Some(dropout);
        Ok(self)
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    pub fn input_dimension(&self) -> usize {
        self.input_dimension
    }

    pub fn output_dimension(&self) -> usize {
        match &self.kind {
            LayerKind::Standard(nodes) => nodes.iter().map(|n| n.output_len()).sum(),
            LayerKind::Pooling(p) => p.output_len(),
        }
    }

    /// Trainable nodes; empty for pooling layers.
    pub fn nodes(&self) -> &[Node] {
        match &self.kind {
            LayerKind::Standard(nodes) => nodes,
            LayerKind::Pooling(_) => &[],
        }
    }

    pub fn nodes_mut(&mut self) -> &mut [Node] {
        match &mut self.kind {
            LayerKind::Standard(nodes) => nodes,
            LayerKind::Pooling(_) => &mut [],
        }
    }

    pub fn activation(&self) -> Option<&Arc<dyn Activation>> {
        self.activation.as_ref()
    }

    pub fn dropout(&self) -> Option<&Dropout> {
        self.dropout.as_ref()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub(crate) fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Moves to the next dropout mask.
    pub(crate) fn advance_round(&mut self) {
        self.round = self.round.wrapping_add(1);
    }

    /// Fills missing activations from `default` and checks every node can resolve one.
    pub(crate) fn wire(&mut self, default: Option<&Arc<dyn Activation>>) -> Result<()> {
        if self.activation.is_none() {
            self.activation = default.cloned();
        }
        if self.activation.is_none() && self.nodes().iter().any(|n| n.activation().is_none()) {
            return Err(NetError::construction(
                "a node has no activation and neither its layer nor the network provides one",
            ));
        }
        Ok(())
    }

    /// Retain decision per node for the current round; all `true` outside training.
    pub fn retained_mask(&self) -> Vec<bool> {
        let nodes = self.nodes().len();
        match self.dropout {
            Some(d) if self.training && d.rate() > 0.0 => d.mask(self.round, nodes),
            _ => vec![true; nodes],
        }
    }

    /// Evaluates the layer, concatenating node outputs in node order.
    pub fn calculate(&self, input: &[f64]) -> Result<Vec<f64>> {
        let mut trace = LayerTrace::default();
        self.forward(input, &mut trace)?;
        Ok(trace.value)
    }

    pub(crate) fn forward(&self, input: &[f64], trace: &mut LayerTrace) -> Result<()> {
        check_len("layer input", self.input_dimension, input.len())?;
        trace.reset(self.output_dimension(), self.nodes().len());
        let nodes = match &self.kind {
            LayerKind::Standard(nodes) => nodes,
            LayerKind::Pooling(p) => {
                p.forward(input, trace);
                return Ok(());
            }
        };
        let mask = self.retained_mask();
        let scale = match self.dropout {
            Some(d) if self.training => d.scale(),
            _ => 1.0,
        };
        let mut offset = 0;
        for (node, &keep) in nodes.iter().zip(&mask) {
            let out = node.calculate(input, self.activation.as_deref())?;
            let end = offset + out.net.len();
            trace.net[offset..end].copy_from_slice(&out.net);
            if keep {
                for (i, (v, d)) in out.value.iter().zip(&out.derivative).enumerate() {
                    trace.value[offset + i] = v * scale;
                    trace.derivative[offset + i] = d * scale;
                }
            }
            offset = end;
        }
        trace.retained = mask;
        Ok(())
    }

    /// Adds `dL/dinput` for this layer's errors into `upstream`.
    pub(crate) fn backpropagate(&self, trace: &LayerTrace, upstream: &mut [f64]) {
        match &self.kind {
            LayerKind::Pooling(p) => p.backpropagate(trace, upstream),
            LayerKind::Standard(nodes) => {
                let mut offset = 0;
                for (node, &keep) in nodes.iter().zip(&trace.retained) {
                    let end = offset + node.output_len();
                    if keep {
                        node.backpropagate(&trace.error[offset..end], upstream);
                    }
                    offset = end;
                }
            }
        }
    }

    /// Adds parameter gradients, one row per node laid out as (weights…, bias).
    pub(crate) fn accumulate_gradients(&self, input: &[f64], trace: &LayerTrace, rows: &mut [Vec<f64>]) {
        let mut offset = 0;
        for ((node, row), &keep) in self.nodes().iter().zip(rows).zip(&trace.retained) {
            let end = offset + node.output_len();
            if keep {
                node.accumulate_gradient(input, &trace.error[offset..end], row);
            }
            offset = end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activations::{Linear, Sigmoid};

    fn linear_layer() -> Layer {
        let nodes = vec![
            DenseNode::new(vec![1.0, 2.0], 0.0).unwrap().into(),
            DenseNode::new(vec![-1.0, 0.5], 1.0).unwrap().into(),
            DenseNode::new(vec![0.0, 1.0], -1.0).unwrap().into(),
        ];
        Layer::standard(2, nodes).unwrap().with_activation(Arc::new(Linear))
    }

    #[test]
    fn outputs_follow_node_order() {
        let out = linear_layer().calculate(&[1.0, 2.0]).unwrap();
        assert_eq!(out, vec![5.0, 1.0, 1.0]);
    }

    #[test]
    fn nodes_must_share_the_layer_input_dimension() {
        let nodes = vec![
            DenseNode::new(vec![1.0, 2.0], 0.0).unwrap().into(),
            DenseNode::new(vec![1.0], 0.0).unwrap().into(),
        ];
        assert!(matches!(Layer::standard(2, nodes), Err(NetError::Construction(_))));
    }

    #[test]
    fn dropout_zeroes_and_rescales_in_training_only() {
        let mut layer = linear_layer()
            .with_dropout(Dropout::new(0.5, 7).unwrap())
            .unwrap();
        let plain = layer.calculate(&[1.0, 2.0]).unwrap();
        layer.set_training(true);
        let mask = layer.retained_mask();
        let dropped = layer.calculate(&[1.0, 2.0]).unwrap();
        for i in 0..3 {
            let expected = if mask[i] { plain[i] * 2.0 } else { 0.0 };
            assert_eq!(dropped[i], expected);
        }
        assert_eq!(layer.calculate(&[1.0, 2.0]).unwrap(), dropped);
    }

    #[test]
    fn dropout_mask_is_reproducible_per_round() {
        let d = Dropout::new(0.3, 42).unwrap();
        assert_eq!(d.mask(3, 64), d.mask(3, 64));
        assert_ne!(d.mask(3, 64), d.mask(4, 64));
        let kept = d.mask(0, 10_000).iter().filter(|&&k| k).count();
        assert!((6_500..7_500).contains(&kept));
    }

    #[test]
    fn invalid_dropout_rates_are_rejected() {
        assert!(Dropout::new(1.0, 0).is_err());
        assert!(Dropout::new(-0.1, 0).is_err());
    }

    #[test]
    fn max_pooling_picks_window_maxima() {
        let pooling = Pooling {
            channels: 1,
            height: 2,
            width: 4,
            size: 2,
            stride: 2,
            mode: PoolingMode::Max,
        };
        let layer = Layer::pooling(pooling).unwrap();
        let out = layer.calculate(&[1.0, 5.0, 2.0, 0.0, 3.0, -1.0, 4.0, 8.0]).unwrap();
        assert_eq!(out, vec![5.0, 8.0]);
        assert!(layer.with_dropout(Dropout::new(0.1, 0).unwrap()).is_err());
    }

    #[test]
    fn missing_activation_is_reported_at_wiring() {
        let nodes = vec![DenseNode::new(vec![1.0], 0.0).unwrap().into()];
        let mut layer = Layer::standard(1, nodes).unwrap();
        assert!(layer.wire(None).is_err());
        let sigmoid: Arc<dyn Activation> = Arc::new(Sigmoid);
        layer.wire(Some(&sigmoid)).unwrap();
        assert_eq!(layer.calculate(&[0.0]).unwrap(), vec![0.5]);
    }
}
