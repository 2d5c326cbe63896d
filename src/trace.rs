//! Per-pass scratch state, addressed by (layer, output) index pairs.

/// Forward and backward scratch of one layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerTrace {
    /// Pre-activation sums, one per output element.
    pub net: Vec<f64>,
    /// Outputs after activation and dropout.
    pub value: Vec<f64>,
    /// Cached `dvalue/dnet`, zero for dropped nodes.
    pub derivative: Vec<f64>,
    /// Backward signal `dL/dnet`.
    pub error: Vec<f64>,
    /// Retain decision per node for this pass.
    pub retained: Vec<bool>,
    /// Input index selected by each max-pooling window.
    pub(crate) routes: Vec<usize>,
}

impl LayerTrace {
    pub(crate) fn reset(&mut self, outputs: usize, nodes: usize) {
        for buf in [&mut self.net, &mut self.value, &mut self.derivative, &mut self.error] {
            buf.clear();
            buf.resize(outputs, 0.0);
        }
        self.retained.clear();
        self.retained.resize(nodes, true);
        self.routes.clear();
    }
}

/// Scratch arena for one forward/backward pass over a whole network.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    pub input: Vec<f64>,
    pub layers: Vec<LayerTrace>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output of the last layer (the network input if there are no layers).
    pub fn output(&self) -> &[f64] {
        self.layers.last().map_or(&self.input, |l| &l.value)
    }

    /// The vector that was fed into layer `index`, if that layer was traced.
    pub fn layer_input(&self, index: usize) -> Option<&[f64]> {
        if index >= self.layers.len() {
            return None;
        }
        match index.checked_sub(1) {
            None => Some(&self.input),
            Some(previous) => self.layers.get(previous).map(|l| l.value.as_slice()),
        }
    }

    pub fn clear_errors(&mut self) {
        for layer in &mut self.layers {
            layer.error.fill(0.0);
        }
    }
}
