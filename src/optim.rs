//! Gradient aggregation and the descent step.
//!
//! A minibatch runs as:
//! 1. `zero(accumulator)`
//! 2. `accumulate(accumulator, example)` once per example, each a dedicated add kernel
//! 3. `update(accumulator, rate)` with `rate = learning_rate / batch_size`
//!
//! Each operation has a `schedule_*` form that only appends kernels to a graph, and
//! a blocking form on [`Network`] that runs them immediately.

use crate::error::{Error, Result};
use crate::graph::{JobGraph, JobHandle};
use crate::kernel::Kernel;
use crate::layer::Gradients;
use crate::network::Network;

impl Network {
    /// Appends kernels setting every `dcdz` and `dcdw` entry of `grads` to zero.
    pub fn schedule_zero(&self, graph: &mut JobGraph, grads: &Gradients) -> Result<JobHandle> {
        let mut handles = Vec::with_capacity(2 * grads.len());
        for g in grads.iter() {
            handles.push(graph.schedule(self.arena(), Kernel::Zero { buffer: g.dcdz() })?);
            handles.push(graph.schedule(self.arena(), Kernel::Zero { buffer: g.dcdw() })?);
        }
        Ok(graph.combine(&handles))
    }

    /// Appends `accumulator += example`, layer by layer.
    pub fn schedule_accumulate(
        &self,
        graph: &mut JobGraph,
        accumulator: &Gradients,
        example: &Gradients,
    ) -> Result<JobHandle> {
        pair_shapes(accumulator, example)?;
        let mut handles = Vec::with_capacity(2 * accumulator.len());
        for (acc, ex) in accumulator.iter().zip(example.iter()) {
            handles.push(graph.schedule(
                self.arena(),
                Kernel::Accumulate {
                    src: ex.dcdz(),
                    dst: acc.dcdz(),
                },
            )?);
            handles.push(graph.schedule(
                self.arena(),
                Kernel::Accumulate {
                    src: ex.dcdw(),
                    dst: acc.dcdw(),
                },
            )?);
        }
        Ok(graph.combine(&handles))
    }

    /// Appends `biases -= dcdz * rate` and `weights -= dcdw * rate` for every layer.
    pub fn schedule_update(
        &self,
        graph: &mut JobGraph,
        grads: &Gradients,
        rate: f32,
    ) -> Result<JobHandle> {
        if grads.len() != self.num_layers() {
            return Err(Error::ShapeMismatch {
                what: "gradient layers",
                expected: self.num_layers(),
                actual: grads.len(),
            });
        }
        let mut handles = Vec::with_capacity(2 * grads.len());
        for (layer, g) in self.layers().iter().zip(grads.iter()) {
            handles.push(graph.schedule(
                self.arena(),
                Kernel::Descend {
                    params: layer.biases(),
                    grads: g.dcdz(),
                    rate,
                },
            )?);
            handles.push(graph.schedule(
                self.arena(),
                Kernel::Descend {
                    params: layer.weights(),
                    grads: g.dcdw(),
                    rate,
                },
            )?);
        }
        Ok(graph.combine(&handles))
    }

    pub fn zero(&mut self, grads: &Gradients) -> Result<()> {
        self.run_graph(|net, graph| net.schedule_zero(graph, grads).map(drop))
    }

    pub fn accumulate(&mut self, accumulator: &Gradients, example: &Gradients) -> Result<()> {
        self.run_graph(|net, graph| {
            net.schedule_accumulate(graph, accumulator, example).map(drop)
        })
    }

    /// `param -= grad * rate`, elementwise and exact.
    pub fn update(&mut self, grads: &Gradients, rate: f32) -> Result<()> {
        self.run_graph(|net, graph| net.schedule_update(graph, grads, rate).map(drop))
    }
}

fn pair_shapes(a: &Gradients, b: &Gradients) -> Result<()> {
    if a.len() != b.len() {
        return Err(Error::ShapeMismatch {
            what: "gradient layers",
            expected: a.len(),
            actual: b.len(),
        });
    }
    for (x, y) in a.iter().zip(b.iter()) {
        if (x.neurons(), x.inputs()) != (y.neurons(), y.inputs()) {
            return Err(Error::ShapeMismatch {
                what: "gradient layer",
                expected: x.neurons() * x.inputs(),
                actual: y.neurons() * y.inputs(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
/// Minibatch gradient descent with a fixed base learning rate.
pub struct Sgd {
    lr: f32,
}

impl Sgd {
    /// Returns an error if `lr` is not finite or `lr <= 0`.
    pub fn new(lr: f32) -> Result<Self> {
        if !(lr.is_finite() && lr > 0.0) {
            return Err(Error::InvalidConfig(
                "learning rate must be finite and > 0".to_owned(),
            ));
        }
        Ok(Self { lr })
    }

    #[inline]
    pub fn lr(&self) -> f32 {
        self.lr
    }

    /// Per-example rate applied to a summed minibatch gradient.
    #[inline]
    pub fn rate_for_batch(&self, batch_size: usize) -> f32 {
        self.lr / batch_size.max(1) as f32
    }

    /// Applies one update from a gradient summed over `batch_size` examples.
    pub fn step(
        &self,
        net: &mut Network,
        accumulator: &Gradients,
        batch_size: usize,
    ) -> Result<()> {
        net.update(accumulator, self.rate_for_batch(batch_size))
    }
}
