//! Fully-connected network built on the arena and the task graph.
//!
//! A [`Network`] owns its parameters and one primary [`Lane`] (the staging buffers
//! and per-layer outputs used by [`Network::forward`]). Extra lanes can be
//! allocated so several examples run through the graph concurrently; they share
//! the parameters and own everything they write.
//!
//! Forward pass, per layer `l`:
//! 1. `Copy` biases into `outputs[l]` (or `SampleBias` for stochastic layers)
//! 2. `DotAccumulate`: `outputs[l] += W[l] * outputs[l-1]`
//! 3. `Activate` `outputs[l]` in place
//!
//! Backward pass, from the last layer down:
//! - `OutputDelta` (last layer) or `BackpropDelta` (hidden layers) into `dcdz[l]`
//! - `WeightGradient`: `dcdw[l] = dcdz[l] (x) outputs[l-1]`
//!
//! Everything is expressed as kernels on a [`JobGraph`]; the graph orders them from
//! their buffer reads and writes.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::arena::{Arena, BufferId, BufferRef};
use crate::config::NetworkConfig;
use crate::error::{Error, Result, check_len};
use crate::graph::{JobGraph, JobHandle, Scheduler};
use crate::kernel::Kernel;
use crate::layer::{Gradients, Layer, LayerKind};
use crate::math::{self, Cost};
use crate::train::Trainer;

/// Buffers for one example in flight: staged input and target, per-layer outputs,
/// and noise for stochastic layers.
#[derive(Debug, Clone)]
pub struct Lane {
    input: BufferId,
    target: BufferId,
    outputs: Vec<BufferId>,
    noise: Vec<Option<BufferId>>,
}

impl Lane {
    #[inline]
    pub fn input(&self) -> BufferId {
        self.input
    }

    #[inline]
    pub fn target(&self) -> BufferId {
        self.target
    }

    #[inline]
    pub fn outputs(&self) -> &[BufferId] {
        &self.outputs
    }

    /// Final-layer output buffer.
    #[inline]
    pub fn output(&self) -> BufferId {
        self.outputs[self.outputs.len() - 1]
    }

    /// Noise buffer of layer `l`, present only for stochastic layers.
    #[inline]
    pub fn noise(&self, l: usize) -> Option<BufferId> {
        self.noise.get(l).copied().flatten()
    }

    fn buffers(&self) -> impl Iterator<Item = BufferId> + '_ {
        [self.input, self.target]
            .into_iter()
            .chain(self.outputs.iter().copied())
            .chain(self.noise.iter().flatten().copied())
    }
}

#[derive(Debug)]
pub struct Network {
    config: NetworkConfig,
    arena: Arena,
    layers: Vec<Layer>,
    primary: Lane,
    graph: JobGraph,
    scheduler: Scheduler,
    noise_rng: StdRng,
    trainer: Option<Trainer>,
}

impl Network {
    /// Random initialisation: biases `~ N(0, 1)`, weights `~ N(0, 1) / sqrt(inputs)`.
    ///
    /// The stochastic-bias generator is seeded from `rng` as well, so one seed
    /// reproduces the whole network.
    pub fn new<R: Rng + ?Sized>(config: NetworkConfig, rng: &mut R) -> Result<Self> {
        let mut params = Vec::with_capacity(config.num_layers());
        for (neurons, inputs) in config.layer_shapes() {
            let scale = 1.0 / (inputs as f32).sqrt();
            let biases: Vec<f32> = (0..neurons)
                .map(|_| math::gaussian(rng, 0.0, 1.0))
                .collect();
            let weights: Vec<f32> = (0..neurons * inputs)
                .map(|_| math::gaussian(rng, 0.0, scale))
                .collect();
            params.push((biases, weights));
        }
        let noise_seed = rng.r#gen::<u64>();
        Self::assemble(config, params, noise_seed)
    }

    pub fn with_seed(config: NetworkConfig, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::new(config, &mut rng)
    }

    /// Builds a network from explicit `(biases, weights)` per non-input layer.
    pub fn from_parameters(
        config: NetworkConfig,
        params: Vec<(Vec<f32>, Vec<f32>)>,
    ) -> Result<Self> {
        for (l, (biases, weights)) in params.iter().enumerate() {
            if biases.iter().chain(weights).any(|v| !v.is_finite()) {
                return Err(Error::InvalidConfig(format!(
                    "layer {l} parameters must be finite"
                )));
            }
        }
        Self::assemble(config, params, 0)
    }

    fn assemble(
        config: NetworkConfig,
        params: Vec<(Vec<f32>, Vec<f32>)>,
        noise_seed: u64,
    ) -> Result<Self> {
        check_len("layer parameters", config.num_layers(), params.len())?;

        let mut arena = Arena::new();
        let mut layers = Vec::with_capacity(params.len());
        for (((neurons, inputs), spec), (biases, weights)) in config
            .layer_shapes()
            .zip(config.specs())
            .zip(params)
        {
            check_len("layer biases", neurons, biases.len())?;
            check_len("layer weights", neurons * inputs, weights.len())?;
            layers.push(Layer::alloc(&mut arena, inputs, *spec, biases, weights));
        }

        let primary = Lane {
            input: arena.alloc(config.input_dim()),
            target: arena.alloc(config.output_dim()),
            outputs: layers.iter().map(Layer::outputs).collect(),
            noise: alloc_noise(&mut arena, &layers),
        };

        Ok(Self {
            config,
            arena,
            layers,
            primary,
            graph: JobGraph::new(),
            scheduler: Scheduler::new(None)?,
            noise_rng: StdRng::seed_from_u64(noise_seed),
            trainer: None,
        })
    }

    #[inline]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    #[inline]
    pub fn input_dim(&self) -> usize {
        self.config.input_dim()
    }

    #[inline]
    pub fn output_dim(&self) -> usize {
        self.config.output_dim()
    }

    #[inline]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    #[inline]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    #[inline]
    pub fn layer(&self, idx: usize) -> Option<&Layer> {
        self.layers.get(idx)
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(Layer::parameter_count).sum()
    }

    /// The arena holding every buffer of this network, its lanes and its gradients.
    #[inline]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Panics if `l >= num_layers()`.
    pub fn biases(&self, l: usize) -> BufferRef<'_> {
        self.arena.read(self.layers[l].biases())
    }

    /// Panics if `l >= num_layers()`.
    pub fn weights(&self, l: usize) -> BufferRef<'_> {
        self.arena.read(self.layers[l].weights())
    }

    /// Outputs of layer `l` from the most recent [`Network::forward`].
    ///
    /// Panics if `l >= num_layers()`.
    pub fn outputs(&self, l: usize) -> BufferRef<'_> {
        self.arena.read(self.primary.outputs[l])
    }

    /// Output of the most recent [`Network::forward`].
    pub fn output(&self) -> BufferRef<'_> {
        self.arena.read(self.primary.output())
    }

    pub fn set_parameters(&mut self, l: usize, biases: &[f32], weights: &[f32]) -> Result<()> {
        let layer = self.layers.get(l).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "layer {l} out of range for {} layers",
                self.layers.len()
            ))
        })?;
        check_len("layer biases", layer.neurons(), biases.len())?;
        check_len("layer weights", layer.neurons() * layer.inputs(), weights.len())?;
        self.arena.write(layer.biases()).copy_from_slice(biases);
        self.arena.write(layer.weights()).copy_from_slice(weights);
        Ok(())
    }

    /// Worker threads used to run task graphs.
    #[inline]
    pub fn threads(&self) -> usize {
        self.scheduler.threads()
    }

    /// Replaces the worker pool unless it already has `threads` workers.
    pub fn set_threads(&mut self, threads: usize) -> Result<()> {
        if threads != self.scheduler.threads() {
            self.scheduler = Scheduler::new(Some(threads))?;
        }
        Ok(())
    }

    /// Reseeds the generator that draws stochastic-bias noise.
    pub fn reseed_noise(&mut self, seed: u64) {
        self.noise_rng = StdRng::seed_from_u64(seed);
    }

    /// Allocates a gradient set shaped like this network.
    pub fn gradients(&mut self) -> Gradients {
        Gradients::alloc(&mut self.arena, &self.layers)
    }

    /// Allocates an extra lane.
    pub fn lane(&mut self) -> Lane {
        Lane {
            input: self.arena.alloc(self.config.input_dim()),
            target: self.arena.alloc(self.config.output_dim()),
            outputs: self
                .layers
                .iter()
                .map(|l| self.arena.alloc(l.neurons()))
                .collect(),
            noise: alloc_noise(&mut self.arena, &self.layers),
        }
    }

    /// Fails unless every buffer of `lane` lives in this network's arena.
    pub fn check_lane(&self, lane: &Lane) -> Result<()> {
        check_len("lane outputs", self.layers.len(), lane.outputs.len())?;
        if lane.buffers().all(|id| self.arena.contains(id)) {
            Ok(())
        } else {
            Err(Error::InvalidConfig(
                "lane was allocated by another network".to_owned(),
            ))
        }
    }

    /// Copies `input` (and `target`, if given) into `lane`'s staging buffers.
    ///
    /// Must not be called while `lane` has unfinished jobs in a graph.
    pub fn stage(&self, lane: &Lane, input: &[f32], target: Option<&[f32]>) -> Result<()> {
        self.check_lane(lane)?;
        check_len("network input", self.input_dim(), input.len())?;
        if let Some(target) = target {
            check_len("network target", self.output_dim(), target.len())?;
            self.arena.write(lane.target).copy_from_slice(target);
        }
        self.arena.write(lane.input).copy_from_slice(input);
        Ok(())
    }

    /// Draws fresh noise for every stochastic layer of `lane`.
    ///
    /// Runs on the calling thread; kernels never touch the generator.
    pub fn sample_noise(&mut self, lane: &Lane) -> Result<()> {
        self.check_lane(lane)?;
        fill_noise(&self.arena, &self.layers, &mut self.noise_rng, lane);
        Ok(())
    }

    pub(crate) fn take_trainer(&mut self) -> Option<Trainer> {
        self.trainer.take()
    }

    pub(crate) fn keep_trainer(&mut self, trainer: Trainer) {
        self.trainer = Some(trainer);
    }

    /// Appends the forward pass for `lane` to `graph`.
    ///
    /// The returned handle completes when the final layer's output is ready. On
    /// error `graph` may hold part of the pass and should be cleared.
    pub fn schedule_forward(&self, graph: &mut JobGraph, lane: &Lane) -> Result<JobHandle> {
        let mut prev = lane.input;
        let mut last = None;
        for ((layer, &out), &noise) in self.layers.iter().zip(&lane.outputs).zip(&lane.noise) {
            let init = match (layer.kind(), noise) {
                (LayerKind::Stochastic { stddev }, Some(noise)) => Kernel::SampleBias {
                    mean: layer.biases(),
                    noise,
                    stddev,
                    dst: out,
                },
                _ => Kernel::Copy {
                    src: layer.biases(),
                    dst: out,
                },
            };
            graph.schedule(&self.arena, init)?;
            graph.schedule(
                &self.arena,
                Kernel::DotAccumulate {
                    input: prev,
                    weights: layer.weights(),
                    output: out,
                },
            )?;
            last = Some(graph.schedule(
                &self.arena,
                Kernel::Activate {
                    buffer: out,
                    activation: layer.activation(),
                },
            )?);
            prev = out;
        }
        last.ok_or_else(|| Error::InvalidConfig("network has no layers".to_owned()))
    }

    /// Appends the backward pass for `lane` to `graph`, writing into `grads`.
    ///
    /// Reads the lane's outputs, so it must follow the forward pass of the same
    /// input (in the same graph or an earlier one).
    pub fn schedule_backward(
        &self,
        graph: &mut JobGraph,
        lane: &Lane,
        grads: &Gradients,
    ) -> Result<JobHandle> {
        self.check_gradients(grads)?;

        let last = self.layers.len() - 1;
        let mut handles = Vec::with_capacity(2 * self.layers.len());
        for l in (0..=last).rev() {
            let layer = &self.layers[l];
            let g = grads.layer(l);
            let delta = if l == last {
                Kernel::OutputDelta {
                    outputs: lane.outputs[l],
                    target: lane.target,
                    activation: layer.activation(),
                    delta: g.dcdz(),
                }
            } else {
                Kernel::BackpropDelta {
                    next_delta: grads.layer(l + 1).dcdz(),
                    next_weights: self.layers[l + 1].weights(),
                    outputs: lane.outputs[l],
                    activation: layer.activation(),
                    delta: g.dcdz(),
                }
            };
            handles.push(graph.schedule(&self.arena, delta)?);

            let input = if l == 0 {
                lane.input
            } else {
                lane.outputs[l - 1]
            };
            handles.push(graph.schedule(
                &self.arena,
                Kernel::WeightGradient {
                    delta: g.dcdz(),
                    input,
                    gradient: g.dcdw(),
                },
            )?);
        }
        Ok(graph.combine(&handles))
    }

    /// Runs `handle` and whatever it depends on, blocking until done.
    pub fn wait(&self, graph: &mut JobGraph, handle: JobHandle) {
        self.scheduler.wait(graph, &self.arena, handle);
    }

    /// Runs every pending job in `graph` and resets it.
    pub fn complete(&self, graph: &mut JobGraph) {
        self.scheduler.complete(graph, &self.arena);
    }

    /// Builds a graph with `build`, then runs it to completion. Nothing runs if
    /// `build` fails.
    pub(crate) fn run_graph<F>(&mut self, build: F) -> Result<()>
    where
        F: FnOnce(&Self, &mut JobGraph) -> Result<()>,
    {
        let mut graph = std::mem::take(&mut self.graph);
        let built = build(self, &mut graph);
        match built {
            Ok(()) => self.scheduler.complete(&mut graph, &self.arena),
            Err(_) => graph.clear(),
        }
        self.graph = graph;
        built
    }

    /// Forward pass for one example; returns the final-layer output.
    pub fn forward(&mut self, input: &[f32]) -> Result<BufferRef<'_>> {
        self.stage(&self.primary, input, None)?;
        fill_noise(&self.arena, &self.layers, &mut self.noise_rng, &self.primary);
        self.run_graph(|net, graph| net.schedule_forward(graph, &net.primary).map(drop))?;
        Ok(self.arena.read(self.primary.output()))
    }

    /// Backward pass into `grads` for the example last passed to [`Network::forward`].
    ///
    /// `input` must be that same example.
    pub fn backward(&mut self, input: &[f32], target: &[f32], grads: &Gradients) -> Result<()> {
        self.stage(&self.primary, input, Some(target))?;
        self.run_graph(|net, graph| {
            net.schedule_backward(graph, &net.primary, grads).map(drop)
        })
    }

    /// Forward then backward for one example, as a single task graph.
    pub fn gradient(&mut self, input: &[f32], target: &[f32], grads: &Gradients) -> Result<()> {
        self.stage(&self.primary, input, Some(target))?;
        fill_noise(&self.arena, &self.layers, &mut self.noise_rng, &self.primary);
        self.run_graph(|net, graph| {
            net.schedule_forward(graph, &net.primary)?;
            net.schedule_backward(graph, &net.primary, grads).map(drop)
        })
    }

    /// Index of the largest output for `input`.
    pub fn predict(&mut self, input: &[f32]) -> Result<usize> {
        let out = self.forward(input)?;
        Ok(math::arg_max(&out).unwrap_or(0))
    }

    /// Reported loss of the most recent forward output against `target`.
    pub fn cost(&self, target: &[f32], cost: Cost) -> Result<f32> {
        cost.eval(&self.output(), target)
    }

    pub(crate) fn lane_cost(&self, lane: &Lane, cost: Cost) -> Result<f32> {
        cost.eval(
            &self.arena.read(lane.output()),
            &self.arena.read(lane.target),
        )
    }

    fn check_gradients(&self, grads: &Gradients) -> Result<()> {
        check_len("gradient layers", self.layers.len(), grads.len())?;
        for (layer, g) in self.layers.iter().zip(grads.iter()) {
            check_len("gradient neurons", layer.neurons(), g.neurons())?;
            check_len("gradient inputs", layer.inputs(), g.inputs())?;
        }
        Ok(())
    }
}

fn alloc_noise(arena: &mut Arena, layers: &[Layer]) -> Vec<Option<BufferId>> {
    layers
        .iter()
        .map(|l| l.kind().is_stochastic().then(|| arena.alloc(l.neurons())))
        .collect()
}

fn fill_noise(arena: &Arena, layers: &[Layer], rng: &mut StdRng, lane: &Lane) {
    for (layer, noise) in layers.iter().zip(&lane.noise) {
        if let (LayerKind::Stochastic { .. }, Some(noise)) = (layer.kind(), noise) {
            for v in arena.write(*noise).iter_mut() {
                *v = math::gaussian(rng, 0.0, 1.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;

    use crate::activation::Activation;
    use crate::layer::LayerSpec;

    fn tiny() -> Network {
        let cfg = NetworkConfig::new(&[2, 3, 1]).unwrap();
        Network::with_seed(cfg, 0).unwrap()
    }

    #[test]
    fn forward_output_has_last_layer_width() {
        let mut net = tiny();
        let out = net.forward(&[0.2, -0.4]).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0] > 0.0 && out[0] < 1.0);
    }

    #[test]
    fn forward_rejects_wrong_input_len() {
        let mut net = tiny();
        let err = net.forward(&[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch {
                expected: 2,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn forward_matches_manual_computation() {
        let cfg = NetworkConfig::with_specs(
            &[2, 2],
            vec![LayerSpec {
                activation: Activation::Relu,
                ..LayerSpec::default()
            }],
        )
        .unwrap();
        let mut net =
            Network::from_parameters(cfg, vec![(vec![0.5, -3.0], vec![1.0, 2.0, 0.5, 0.5])])
                .unwrap();

        let out = net.forward(&[1.0, 1.0]).unwrap();
        assert_eq!(&*out, &[3.5, 0.0]);
    }

    #[test]
    fn extra_lanes_share_parameters() {
        let mut net = tiny();
        let lane = net.lane();
        let expected = net.forward(&[0.3, 0.7]).unwrap().to_vec();

        net.stage(&lane, &[0.3, 0.7], None).unwrap();
        let mut graph = JobGraph::new();
        let done = net.schedule_forward(&mut graph, &lane).unwrap();
        net.wait(&mut graph, done);

        assert_eq!(&*net.arena().read(lane.output()), expected.as_slice());
    }

    #[test]
    fn lanes_are_bound_to_their_network() {
        let mut net = tiny();
        let mut other = tiny();
        let foreign = other.lane();
        let before = net.arena().total_len();

        assert!(net.stage(&foreign, &[0.1, 0.2], None).is_err());
        assert!(net.sample_noise(&foreign).is_err());
        let mut graph = JobGraph::new();
        assert!(net.schedule_forward(&mut graph, &foreign).is_err());
        graph.clear();

        let grads = other.gradients();
        assert!(net.zero(&grads).is_err());
        assert!(net.gradient(&[0.1, 0.2], &[1.0], &grads).is_err());
        assert_eq!(net.arena().total_len(), before);
    }

    #[test]
    fn zero_stddev_stochastic_layer_is_deterministic() {
        let cfg = NetworkConfig::with_specs(
            &[2, 2],
            vec![LayerSpec {
                kind: LayerKind::Stochastic { stddev: 0.0 },
                ..LayerSpec::default()
            }],
        )
        .unwrap();
        let params = vec![(vec![0.1, -0.1], vec![0.2, 0.3, -0.4, 0.5])];
        let mut stochastic = Network::from_parameters(cfg, params.clone()).unwrap();
        let mut plain =
            Network::from_parameters(NetworkConfig::new(&[2, 2]).unwrap(), params).unwrap();

        let a = stochastic.forward(&[1.0, -1.0]).unwrap().to_vec();
        let b = plain.forward(&[1.0, -1.0]).unwrap().to_vec();
        assert_eq!(a, b);
    }

    #[test]
    fn stochastic_bias_varies_between_calls() {
        let cfg = NetworkConfig::with_specs(
            &[1, 4],
            vec![LayerSpec {
                activation: Activation::Relu,
                kind: LayerKind::Stochastic { stddev: 1.0 },
            }],
        )
        .unwrap();
        let mut net =
            Network::from_parameters(cfg, vec![(vec![10.0; 4], vec![0.0; 4])]).unwrap();
        let first = net.forward(&[0.0]).unwrap().to_vec();
        let second = net.forward(&[0.0]).unwrap().to_vec();
        assert_ne!(first, second);

        // Means are untouched.
        assert_eq!(&*net.biases(0), &[10.0; 4]);
    }

    #[test]
    fn set_parameters_checks_shapes() {
        let mut net = tiny();
        assert!(net.set_parameters(0, &[0.0; 3], &[0.0; 6]).is_ok());
        assert!(net.set_parameters(0, &[0.0; 2], &[0.0; 6]).is_err());
        assert!(net.set_parameters(5, &[0.0; 3], &[0.0; 6]).is_err());
        assert_eq!(net.parameter_count(), 3 * 2 + 3 + 3 + 1);
    }

    #[test]
    fn gradient_equals_forward_then_backward() {
        let mut net = tiny();
        let split = net.gradients();
        let fused = net.gradients();
        let (x, t) = ([0.4, -0.1], [1.0]);

        net.forward(&x).unwrap();
        net.backward(&x, &t, &split).unwrap();
        net.gradient(&x, &t, &fused).unwrap();

        for (a, b) in split.iter().zip(fused.iter()) {
            assert_eq!(&*net.arena().read(a.dcdz()), &*net.arena().read(b.dcdz()));
            assert_eq!(&*net.arena().read(a.dcdw()), &*net.arena().read(b.dcdw()));
        }
    }

    #[test]
    fn cost_uses_latest_output() {
        let cfg = NetworkConfig::new(&[1, 1]).unwrap();
        let mut net = Network::from_parameters(cfg, vec![(vec![0.0], vec![0.0])]).unwrap();
        net.forward(&[3.0]).unwrap();
        assert_relative_eq!(net.cost(&[1.0], Cost::L2Norm).unwrap(), 0.5);
        assert_relative_eq!(net.cost(&[1.0], Cost::SumSquares).unwrap(), 0.25);
    }
}
