//! Backpropagation trainer: forward pass, backward error propagation,
//! gradient accumulation and optimizer-driven parameter updates.
use std::sync::Arc;

use log::{debug, info, trace};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::TrainerConfig;
use crate::error::{check_len, NetError, Result};
use crate::layers::LayerKind;
use crate::loss::Loss;
use crate::network::Network;
use crate::node::ComputationNode;
use crate::optimizers::Optimizer;
use crate::regularization::Regularizer;
use crate::registry::Registry;
use crate::schedulers::Scheduler;
use crate::trace::Trace;

/// Gradients for all layers in order: one row per node, one column per (weight…, bias).
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    layers: Vec<Vec<Vec<f64>>>,
}

impl Gradients {
    /// Zeroed container mirroring `network`'s parameter layout.
    pub fn for_network(network: &Network) -> Self {
        let layers = network
            .layers()
            .iter()
            .map(|layer| {
                layer
                    .nodes()
                    .iter()
                    .map(|node| vec![0.0; node.param_count()])
                    .collect()
            })
            .collect();
        Self { layers }
    }

    pub fn layer(&self, layer: usize) -> Option<&[Vec<f64>]> {
        self.layers.get(layer).map(Vec::as_slice)
    }

    pub fn node(&self, layer: usize, node: usize) -> Option<&[f64]> {
        self.layers.get(layer)?.get(node).map(Vec::as_slice)
    }

    /// Whether the layout matches `network`'s layers, nodes and parameter counts.
    pub fn fits(&self, network: &Network) -> bool {
        self.layers.len() == network.layers().len()
            && network.layers().iter().zip(&self.layers).all(|(layer, rows)| {
                rows.len() == layer.nodes().len()
                    && layer.nodes().iter().zip(rows).all(|(node, row)| row.len() == node.param_count())
            })
    }

    /// Gradients in the network's flat parameter order.
    pub fn flat(&self) -> Vec<f64> {
        self.layers.iter().flatten().flatten().copied().collect()
    }

    pub fn zero(&mut self) {
        for row in self.layers.iter_mut().flatten() {
            row.fill(0.0);
        }
    }
}

fn trace_fits(network: &Network, trace: &Trace) -> bool {
    trace.input.len() == network.input_dimension()
        && trace.layers.len() == network.layers().len()
        && network.layers().iter().zip(&trace.layers).all(|(layer, lt)| {
            let outputs = layer.output_dimension();
            [&lt.net, &lt.value, &lt.derivative, &lt.error]
                .iter()
                .all(|buf| buf.len() == outputs)
                && lt.retained.len() == layer.nodes().len()
        })
}

/// Backward pass over a trace produced by `network.forward`.
///
/// Fills every layer's error buffer and adds this sample's parameter
/// gradients to `gradients`. Returns the loss of the traced output.
pub fn backward(
    network: &Network,
    loss: &dyn Loss,
    trace: &mut Trace,
    expected: &[f64],
    gradients: &mut Gradients,
) -> Result<f64> {
    let layers = network.layers();
    let Some(last) = layers.len().checked_sub(1) else {
        return Err(NetError::Sequencing("network has no layers".into()));
    };
    check_len("expected output", layers[last].output_dimension(), expected.len())?;
    if !trace_fits(network, trace) {
        return Err(NetError::Sequencing("backward requires a trace from forward".into()));
    }
    if !gradients.fits(network) {
        return Err(NetError::Sequencing("gradient buffers were not made for this network".into()));
    }

    let actual = trace.layers[last].value.clone();
    let value = loss.value(&actual, expected)?;
    let output = &mut trace.layers[last];
    for j in 0..actual.len() {
        output.error[j] = loss.derivative(j, &actual, expected)? * output.derivative[j];
    }

    for l in (0..=last).rev() {
        let (before, rest) = trace.layers.split_at_mut(l);
        let current = &rest[0];
        let input = before.last().map_or(&trace.input[..], |p| &p.value[..]);
        layers[l].accumulate_gradients(input, current, &mut gradients.layers[l]);

        if let Some(previous) = before.last_mut() {
            let mut upstream = vec![0.0; previous.value.len()];
            layers[l].backpropagate(current, &mut upstream);
            for ((e, u), d) in previous.error.iter_mut().zip(&upstream).zip(&previous.derivative) {
                *e = u * d;
            }
        }
    }
    Ok(value)
}

/// Owns a built network and everything needed to train it.
#[derive(Debug)]
pub struct Trainer {
    network: Network,
    loss: Arc<dyn Loss>,
    regularizer: Option<Box<dyn Regularizer>>,
    optimizer: Box<dyn Optimizer>,
    scheduler: Box<dyn Scheduler>,
    gradients: Gradients,
    trace: Trace,
    epoch: usize,
    next_epoch: usize,
    rate: f64,
    iterations: u64,
}

impl Trainer {
    /// Takes ownership of a built network and switches it into training mode.
    pub fn new(
        mut network: Network,
        loss: Arc<dyn Loss>,
        regularizer: Option<Box<dyn Regularizer>>,
        mut optimizer: Box<dyn Optimizer>,
        mut scheduler: Box<dyn Scheduler>,
    ) -> Result<Self> {
        if !network.is_built() {
            return Err(NetError::Sequencing("network must be built before training".into()));
        }
        network.set_training(true);
        optimizer.initialize(network.param_count());
        let gradients = Gradients::for_network(&network);
        let rate = scheduler.rate(0);
        Ok(Self {
            network,
            loss,
            regularizer,
            optimizer,
            scheduler,
            gradients,
            trace: Trace::new(),
            epoch: 0,
            next_epoch: 0,
            rate,
            iterations: 0,
        })
    }

    pub fn from_config(network: Network, config: &TrainerConfig, registry: &mut Registry) -> Result<Self> {
        let regularizer = config.regularizer.as_ref().map(|r| r.build()).transpose()?;
        Self::new(
            network,
            registry.loss(config.loss)?,
            regularizer,
            config.optimizer.build()?,
            config.scheduler.build()?,
        )
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }

    /// Releases the network in inference mode.
    pub fn into_network(mut self) -> Network {
        self.network.set_training(false);
        self.network
    }

    pub fn gradients(&self) -> &Gradients {
        &self.gradients
    }

    /// Scratch state of the most recent forward/backward pass.
    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn learning_rate(&self) -> f64 {
        self.rate
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Selects the learning rate the scheduler assigns to `epoch`.
    pub fn begin_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.next_epoch = epoch + 1;
        self.rate = self.scheduler.rate(epoch);
        debug!("epoch {epoch}: learning rate {}", self.rate);
    }

    /// Forward and backward pass for one sample, adding to the gradient buffers.
    ///
    /// On error the gradient buffers are left partially updated; call
    /// [`Trainer::reset_gradients`] before continuing.
    pub fn accumulate(&mut self, input: &[f64], expected: &[f64]) -> Result<f64> {
        check_len("expected output", self.network.output_dimension(), expected.len())?;
        self.network.forward(input, &mut self.trace)?;
        let loss = backward(
            &self.network,
            self.loss.as_ref(),
            &mut self.trace,
            expected,
            &mut self.gradients,
        )?;
        trace!("iteration {}: loss {loss}", self.iterations);
        Ok(loss)
    }

    /// Applies regularization and optimizer updates, then clears gradients.
    ///
    /// Nodes dropped in the current dropout round keep their parameters.
    pub fn flush(&mut self) -> Result<()> {
        let rate = self.rate;
        let mut slot = 0;
        for (l, layer) in self.network.layers_mut().iter_mut().enumerate() {
            let mask = layer.retained_mask();
            for (n, node) in layer.nodes_mut().iter_mut().enumerate() {
                let count = node.param_count();
                if mask[n] {
                    let gradient = &mut self.gradients.layers[l][n];
                    if let Some(regularizer) = &self.regularizer {
                        let weights = node.weights();
                        regularizer.add_row_gradient(weights, &mut gradient[..weights.len()]);
                    }
                    for (p, &g) in gradient.iter().enumerate() {
                        let delta = self.optimizer.delta(slot + p, g, rate)?;
                        node.set_param(p, -delta, true)?;
                    }
                }
                slot += count;
            }
        }
        self.reset_gradients();
        self.network.advance_dropout_round();
        self.iterations += 1;
        Ok(())
    }

    /// One full training step: [`Trainer::accumulate`] then [`Trainer::flush`].
    pub fn run_iteration(&mut self, input: &[f64], expected: &[f64]) -> Result<f64> {
        let loss = self.accumulate(input, expected)?;
        self.flush()?;
        Ok(loss)
    }

    /// Zeroes gradient and error buffers.
    pub fn reset_gradients(&mut self) {
        self.gradients.zero();
        self.trace.clear_errors();
    }

    /// Loss plus regularization penalty for one sample, without touching gradients.
    pub fn objective(&self, input: &[f64], expected: &[f64]) -> Result<f64> {
        let actual = self.network.calculate(input)?;
        let mut total = self.loss.value(&actual, expected)?;
        if let Some(regularizer) = &self.regularizer {
            let rows: Vec<Option<&[f64]>> = self
                .network
                .layers()
                .iter()
                .flat_map(|layer| match layer.kind() {
                    LayerKind::Standard(nodes) => nodes.iter().map(|n| Some(n.weights())).collect(),
                    LayerKind::Pooling(_) => vec![None],
                })
                .collect();
            total += regularizer.value(&rows);
        }
        Ok(total)
    }

    /// Runs `epochs` epochs over a shuffled dataset, flushing every `batch_size` samples.
    ///
    /// Gradients are summed within a batch. Returns the mean loss per epoch.
    pub fn fit(
        &mut self,
        dataset: &[(Vec<f64>, Vec<f64>)],
        epochs: usize,
        batch_size: usize,
        shuffle_seed: u64,
    ) -> Result<Vec<f64>> {
        if dataset.is_empty() {
            return Err(NetError::construction("dataset is empty"));
        }
        if batch_size == 0 {
            return Err(NetError::construction("batch size must be positive"));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(shuffle_seed);
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        let mut losses = Vec::with_capacity(epochs);
        for _ in 0..epochs {
            let epoch = self.next_epoch;
            self.begin_epoch(epoch);
            indices.shuffle(&mut rng);
            let mut total_loss = 0.0;
            for batch in indices.chunks(batch_size) {
                for &idx in batch {
                    let (input, target) = &dataset[idx];
                    total_loss += self.accumulate(input, target)?;
                }
                self.flush()?;
            }
            let avg_loss = total_loss / dataset.len() as f64;
            losses.push(avg_loss);
            info!("Epoch {}: Loss = {:.6}", epoch + 1, avg_loss);
        }
        Ok(losses)
    }
}
