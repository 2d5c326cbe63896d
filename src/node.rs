//! Trainable computation nodes: dense neurons and convolution filters.
use std::sync::Arc;

use rand::Rng;

use crate::activations::Activation;
use crate::error::{check_len, NetError, Result};

/// Forward results of one node, one entry per output element.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    /// Pre-activation sums.
    pub net: Vec<f64>,
    /// Activated outputs.
    pub value: Vec<f64>,
    /// Activation slope at each output.
    pub derivative: Vec<f64>,
}

/// Shared interface of every trainable node.
///
/// Parameters are indexed weights first, bias last.
pub trait ComputationNode {
    fn input_dimension(&self) -> usize;
    fn output_len(&self) -> usize;
    fn weights(&self) -> &[f64];
    fn weights_mut(&mut self) -> &mut [f64];
    fn bias(&self) -> f64;
    fn bias_mut(&mut self) -> &mut f64;
    fn activation(&self) -> Option<&Arc<dyn Activation>>;

    /// Writes the pre-activation sums for `input` into `net`.
    fn net_into(&self, input: &[f64], net: &mut [f64]);

    /// Adds `dL/dparam` for one forward pass; `errors` holds `dL/dnet` per output.
    fn accumulate_gradient(&self, input: &[f64], errors: &[f64], gradient: &mut [f64]);

    /// Adds this node's share of `dL/dinput` to `upstream`.
    fn backpropagate(&self, errors: &[f64], upstream: &mut [f64]);

    fn param_count(&self) -> usize {
        self.weights().len() + 1
    }

    fn param(&self, index: usize) -> Result<f64> {
        let weights = self.weights();
        match index {
            i if i < weights.len() => Ok(weights[i]),
            i if i == weights.len() => Ok(self.bias()),
            _ => Err(NetError::ParameterIndex {
                index,
                count: self.param_count(),
            }),
        }
    }

    /// Overwrites a parameter, or adds to it when `is_delta` is set.
    fn set_param(&mut self, index: usize, value: f64, is_delta: bool) -> Result<()> {
        let count = self.param_count();
        let slot = if index + 1 < count {
            &mut self.weights_mut()[index]
        } else if index + 1 == count {
            self.bias_mut()
        } else {
            return Err(NetError::ParameterIndex { index, count });
        };
        if is_delta {
            *slot += value;
        } else {
            *slot = value;
        }
        Ok(())
    }

    /// Forward pass of a single node.
    ///
    /// `fallback` is the owning layer's activation, used when the node has none.
    fn calculate(&self, input: &[f64], fallback: Option<&dyn Activation>) -> Result<NodeOutput> {
        check_len("node input", self.input_dimension(), input.len())?;
        let activation = match self.activation() {
            Some(own) => &**own,
            None => fallback.ok_or_else(|| {
                NetError::Sequencing("node has no activation and no layer fallback".into())
            })?,
        };
        let len = self.output_len();
        let mut net = vec![0.0; len];
        self.net_into(input, &mut net);
        let mut value = Vec::with_capacity(len);
        let mut derivative = Vec::with_capacity(len);
        for &n in &net {
            let v = activation.apply(n);
            derivative.push(activation.cached_derivative(n, v)?);
            value.push(v);
        }
        Ok(NodeOutput { net, value, derivative })
    }
}

/// He uniform: U(-sqrt(6/fan_in), sqrt(6/fan_in))
pub(crate) fn he_uniform<R: Rng>(rng: &mut R, fan_in: usize, count: usize) -> Vec<f64> {
    let limit = (6.0f64 / fan_in.max(1) as f64).sqrt();
    (0..count).map(|_| rng.gen_range(-limit..limit)).collect()
}

/// A fully-connected neuron: `net = bias + Σ w_i x_i`.
#[derive(Debug, Clone)]
pub struct DenseNode {
    weights: Vec<f64>,
    bias: f64,
    activation: Option<Arc<dyn Activation>>,
}

impl DenseNode {
    pub fn new(weights: Vec<f64>, bias: f64) -> Result<Self> {
        if weights.is_empty() {
            return Err(NetError::construction("dense node needs at least one weight"));
        }
        Ok(Self {
            weights,
            bias,
            activation: None,
        })
    }

    /// Randomly initialised neuron with a small positive bias.
    pub fn random<R: Rng>(rng: &mut R, input_dimension: usize) -> Result<Self> {
        Self::new(he_uniform(rng, input_dimension, input_dimension), 0.01)
    }

    pub fn with_activation(mut self, activation: Arc<dyn Activation>) -> Self {
        self.activation = Some(activation);
        self
    }
}

impl ComputationNode for DenseNode {
    fn input_dimension(&self) -> usize {
        self.weights.len()
    }
    fn output_len(&self) -> usize {
        1
    }
    fn weights(&self) -> &[f64] {
        &self.weights
    }
    fn weights_mut(&mut self) -> &mut [f64] {
        &mut self.weights
    }
    fn bias(&self) -> f64 {
        self.bias
    }
    fn bias_mut(&mut self) -> &mut f64 {
        &mut self.bias
    }
    fn activation(&self) -> Option<&Arc<dyn Activation>> {
        self.activation.as_ref()
    }

    fn net_into(&self, input: &[f64], net: &mut [f64]) {
        net[0] = self.bias + self.weights.iter().zip(input).map(|(&w, &x)| w * x).sum::<f64>();
    }

    fn accumulate_gradient(&self, input: &[f64], errors: &[f64], gradient: &mut [f64]) {
        let error = errors[0];
        for (g, &x) in gradient.iter_mut().zip(input) {
            *g += error * x;
        }
        gradient[self.weights.len()] += error;
    }

    fn backpropagate(&self, errors: &[f64], upstream: &mut [f64]) {
        let error = errors[0];
        if error == 0.0 {
            return;
        }
        for (u, &w) in upstream.iter_mut().zip(&self.weights) {
            *u += error * w;
        }
    }
}

/// Shape of a valid (unpadded) strided 2-D convolution over a channel-major input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub kernel_height: usize,
    pub kernel_width: usize,
    pub stride: usize,
}

impl ConvGeometry {
    pub fn validate(&self) -> Result<()> {
        let dims = [
            self.channels,
            self.height,
            self.width,
            self.kernel_height,
            self.kernel_width,
            self.stride,
        ];
        if dims.contains(&0) {
            return Err(NetError::construction(format!("convolution geometry has a zero dimension: {self:?}")));
        }
        if self.kernel_height > self.height || self.kernel_width > self.width {
            return Err(NetError::construction(format!("kernel larger than input: {self:?}")));
        }
        if (self.height - self.kernel_height) % self.stride != 0 || (self.width - self.kernel_width) % self.stride != 0 {
            return Err(NetError::construction(format!("stride does not tile the input: {self:?}")));
        }
        Ok(())
    }

    pub fn input_len(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn kernel_len(&self) -> usize {
        self.channels * self.kernel_height * self.kernel_width
    }

    pub fn output_height(&self) -> usize {
        (self.height - self.kernel_height) / self.stride + 1
    }

    pub fn output_width(&self) -> usize {
        (self.width - self.kernel_width) / self.stride + 1
    }

    fn output_len(&self) -> usize {
        self.output_height() * self.output_width()
    }

    /// Calls `f(output_index, kernel_index, input_index)` for every tap of the convolution.
    fn for_each_tap(&self, mut f: impl FnMut(usize, usize, usize)) {
        let (ow, plane) = (self.output_width(), self.height * self.width);
        for oy in 0..self.output_height() {
            for ox in 0..ow {
                let out = oy * ow + ox;
                let mut k = 0;
                for c in 0..self.channels {
                    for ky in 0..self.kernel_height {
                        let row = c * plane + (oy * self.stride + ky) * self.width + ox * self.stride;
                        for kx in 0..self.kernel_width {
                            f(out, k, row + kx);
                            k += 1;
                        }
                    }
                }
            }
        }
    }
}

/// A convolution filter producing one feature map.
#[derive(Debug, Clone)]
pub struct ConvNode {
    geometry: ConvGeometry,
    kernel: Vec<f64>,
    bias: f64,
    activation: Option<Arc<dyn Activation>>,
}

impl ConvNode {
    pub fn new(geometry: ConvGeometry, kernel: Vec<f64>, bias: f64) -> Result<Self> {
        geometry.validate()?;
        if kernel.len() != geometry.kernel_len() {
            return Err(NetError::construction(format!(
                "kernel has {} weights, geometry needs {}",
                kernel.len(),
                geometry.kernel_len()
            )));
        }
        Ok(Self {
            geometry,
            kernel,
            bias,
            activation: None,
        })
    }

    pub fn random<R: Rng>(rng: &mut R, geometry: ConvGeometry) -> Result<Self> {
        geometry.validate()?;
        let fan_in = geometry.kernel_len();
        Self::new(geometry, he_uniform(rng, fan_in, fan_in), 0.01)
    }

    pub fn with_activation(mut self, activation: Arc<dyn Activation>) -> Self {
        self.activation = Some(activation);
        self
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }
}

impl ComputationNode for ConvNode {
    fn input_dimension(&self) -> usize {
        self.geometry.input_len()
    }
    fn output_len(&self) -> usize {
        self.geometry.output_len()
    }
    fn weights(&self) -> &[f64] {
        &self.kernel
    }
    fn weights_mut(&mut self) -> &mut [f64] {
        &mut self.kernel
    }
    fn bias(&self) -> f64 {
        self.bias
    }
    fn bias_mut(&mut self) -> &mut f64 {
        &mut self.bias
    }
    fn activation(&self) -> Option<&Arc<dyn Activation>> {
        self.activation.as_ref()
    }

    fn net_into(&self, input: &[f64], net: &mut [f64]) {
        net.fill(self.bias);
        self.geometry
            .for_each_tap(|out, k, i| net[out] += self.kernel[k] * input[i]);
    }

    fn accumulate_gradient(&self, input: &[f64], errors: &[f64], gradient: &mut [f64]) {
        self.geometry
            .for_each_tap(|out, k, i| gradient[k] += errors[out] * input[i]);
        gradient[self.kernel.len()] += errors.iter().sum::<f64>();
    }

    fn backpropagate(&self, errors: &[f64], upstream: &mut [f64]) {
        self.geometry
            .for_each_tap(|out, k, i| upstream[i] += errors[out] * self.kernel[k]);
    }
}

/// Closed set of node variants held by a standard layer.
#[derive(Debug, Clone)]
pub enum Node {
    Dense(DenseNode),
    Convolution(ConvNode),
}

impl Node {
    pub(crate) fn set_activation(&mut self, activation: Option<Arc<dyn Activation>>) {
        match self {
            Node::Dense(n) => n.activation = activation,
            Node::Convolution(n) => n.activation = activation,
        }
    }
}

impl From<DenseNode> for Node {
    fn from(node: DenseNode) -> Self {
        Node::Dense(node)
    }
}

impl From<ConvNode> for Node {
    fn from(node: ConvNode) -> Self {
        Node::Convolution(node)
    }
}

macro_rules! dispatch {
    ($self:ident, $n:ident => $body:expr) => {
        match $self {
            Node::Dense($n) => $body,
            Node::Convolution($n) => $body,
        }
    };
}

impl ComputationNode for Node {
    fn input_dimension(&self) -> usize {
        dispatch!(self, n => n.input_dimension())
    }
    fn output_len(&self) -> usize {
        dispatch!(self, n => n.output_len())
    }
    fn weights(&self) -> &[f64] {
        dispatch!(self, n => n.weights())
    }
    fn weights_mut(&mut self) -> &mut [f64] {
        dispatch!(self, n => n.weights_mut())
    }
    fn bias(&self) -> f64 {
        dispatch!(self, n => n.bias())
    }
    fn bias_mut(&mut self) -> &mut f64 {
        dispatch!(self, n => n.bias_mut())
    }
    fn activation(&self) -> Option<&Arc<dyn Activation>> {
        dispatch!(self, n => n.activation())
    }
    fn net_into(&self, input: &[f64], net: &mut [f64]) {
        dispatch!(self, n => n.net_into(input, net))
    }
    fn accumulate_gradient(&self, input: &[f64], errors: &[f64], gradient: &mut [f64]) {
        dispatch!(self, n => n.accumulate_gradient(input, errors, gradient))
    }
    fn backpropagate(&self, errors: &[f64], upstream: &mut [f64]) {
        dispatch!(self, n => n.backpropagate(errors, upstream))
    }
}
