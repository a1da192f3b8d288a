//! Minibatch training driver.
//!
//! A [`Trainer`] owns a few [`Lane`]s, one per-example gradient set per lane, the
//! minibatch accumulator and a task graph. A batch is processed in rounds of up to
//! `lanes` examples: every example in a round runs forward, backward and its add into
//! the accumulator as one graph, so independent examples overlap on the worker pool
//! while the adds into the shared accumulator stay ordered. After the last round a
//! single update is applied.
//!
//! All buffers are allocated when the trainer is built; training never grows the
//! arena. [`Network::fit`] keeps its trainer on the network, so repeated fits reuse
//! the same lanes and gradients.

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::config::TrainConfig;
use crate::data::{Dataset, Shuffler};
use crate::error::{Error, Result, check_len};
use crate::graph::JobGraph;
use crate::layer::Gradients;
use crate::math::Cost;
use crate::network::{Lane, Network};
use crate::optim::Sgd;

#[derive(Debug)]
struct Slot {
    lane: Lane,
    grads: Gradients,
}

#[derive(Debug)]
pub struct Trainer {
    slots: Vec<Slot>,
    /// Slots in use; the rest stay allocated for a later `set_lanes`.
    active: usize,
    accumulator: Gradients,
    graph: JobGraph,
}

impl Trainer {
    /// Allocates `lanes` lanes plus the accumulator in `net`'s arena.
    pub fn new(net: &mut Network, lanes: usize) -> Result<Self> {
        let mut trainer = Self {
            slots: Vec::with_capacity(lanes),
            active: 0,
            accumulator: net.gradients(),
            graph: JobGraph::new(),
        };
        trainer.set_lanes(net, lanes)?;
        Ok(trainer)
    }

    /// Runs up to `lanes` examples per round from now on.
    ///
    /// Allocates only when the trainer has never had that many lanes.
    pub fn set_lanes(&mut self, net: &mut Network, lanes: usize) -> Result<()> {
        if lanes == 0 {
            return Err(Error::InvalidConfig("lanes must be > 0".to_owned()));
        }
        while self.slots.len() < lanes {
            self.slots.push(Slot {
                lane: net.lane(),
                grads: net.gradients(),
            });
        }
        self.active = lanes;
        Ok(())
    }

    #[inline]
    pub fn lanes(&self) -> usize {
        self.active
    }

    /// Summed gradient of the most recent batch.
    #[inline]
    pub fn accumulator(&self) -> &Gradients {
        &self.accumulator
    }

    /// Trains on one minibatch given as flat row-major buffers:
    /// `inputs` is `(batch, input_dim)` and `targets` is `(batch, output_dim)`.
    ///
    /// Applies `param -= summed_grad * rate` once and returns the summed reported cost.
    pub fn train_batch(
        &mut self,
        net: &mut Network,
        inputs: &[f32],
        targets: &[f32],
        rate: f32,
        cost: Cost,
    ) -> Result<f32> {
        let (n_in, n_out) = (net.input_dim(), net.output_dim());
        if !inputs.len().is_multiple_of(n_in) {
            return Err(Error::InvalidData(format!(
                "inputs length {} is not divisible by input_dim {n_in}",
                inputs.len()
            )));
        }
        let count = inputs.len() / n_in;
        check_len("batch targets", count * n_out, targets.len())?;

        self.run_batch(net, count, rate, cost, |net, lane, i| {
            net.stage(
                lane,
                &inputs[i * n_in..(i + 1) * n_in],
                Some(&targets[i * n_out..(i + 1) * n_out]),
            )
        })
    }

    /// Trains on the examples `indices` of `data`, with one-hot targets.
    pub fn train_indices(
        &mut self,
        net: &mut Network,
        data: &Dataset,
        indices: &[usize],
        rate: f32,
        cost: Cost,
    ) -> Result<f32> {
        check_dataset(net, data)?;
        if let Some(&bad) = indices.iter().find(|&&i| i >= data.len()) {
            return Err(Error::InvalidData(format!(
                "example {bad} out of range for {} examples",
                data.len()
            )));
        }

        self.run_batch(net, indices.len(), rate, cost, |net, lane, i| {
            let idx = indices[i];
            data.copy_image_into(idx, &mut net.arena().write(lane.input()))?;
            data.target_into(idx, &mut net.arena().write(lane.target()))
        })
    }

    fn run_batch<F>(
        &mut self,
        net: &mut Network,
        count: usize,
        rate: f32,
        cost: Cost,
        mut stage: F,
    ) -> Result<f32>
    where
        F: FnMut(&Network, &Lane, usize) -> Result<()>,
    {
        if count == 0 {
            return Err(Error::InvalidData("batch must not be empty".to_owned()));
        }
        if !rate.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "update rate must be finite, got {rate}"
            )));
        }
        for slot in &self.slots[..self.active] {
            net.check_lane(&slot.lane)?;
        }
        let result = self.rounds(net, count, rate, cost, &mut stage);
        if result.is_err() {
            self.graph.clear();
        }
        result
    }

    fn rounds<F>(
        &mut self,
        net: &mut Network,
        count: usize,
        rate: f32,
        cost: Cost,
        stage: &mut F,
    ) -> Result<f32>
    where
        F: FnMut(&Network, &Lane, usize) -> Result<()>,
    {
        net.schedule_zero(&mut self.graph, &self.accumulator)?;

        let slots = &self.slots[..self.active];
        let mut total = 0.0_f32;
        let mut start = 0;
        while start < count {
            let end = (start + slots.len()).min(count);
            for (slot, i) in slots.iter().zip(start..end) {
                stage(&*net, &slot.lane, i)?;
                net.sample_noise(&slot.lane)?;
                net.schedule_forward(&mut self.graph, &slot.lane)?;
                net.schedule_backward(&mut self.graph, &slot.lane, &slot.grads)?;
                net.schedule_accumulate(&mut self.graph, &self.accumulator, &slot.grads)?;
            }
            net.complete(&mut self.graph);

            for slot in &slots[..end - start] {
                total += net.lane_cost(&slot.lane, cost)?;
            }
            start = end;
        }

        net.schedule_update(&mut self.graph, &self.accumulator, rate)?;
        net.complete(&mut self.graph);
        debug!(examples = count, rate, "minibatch applied");
        Ok(total)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    /// Reported cost averaged over the epoch's examples.
    pub mean_cost: f32,
    /// Test-set accuracy, when a test set was given.
    pub accuracy: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub epochs: Vec<EpochReport>,
}

impl FitReport {
    pub fn final_cost(&self) -> Option<f32> {
        self.epochs.last().map(|e| e.mean_cost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    pub correct: usize,
    pub total: usize,
    /// `correct / total`.
    pub accuracy: f32,
}

impl Network {
    /// Trains with shuffled minibatches drawn without replacement.
    ///
    /// Each epoch is one pass over `train`. After every epoch the network is scored on
    /// `test`, if given.
    pub fn fit(
        &mut self,
        train: &Dataset,
        test: Option<&Dataset>,
        cfg: &TrainConfig,
    ) -> Result<FitReport> {
        cfg.validate()?;
        if train.is_empty() {
            return Err(Error::InvalidData(
                "train dataset must not be empty".to_owned(),
            ));
        }
        check_dataset(self, train)?;
        if let Some(test) = test {
            check_dataset(self, test)?;
        }
        if let Some(threads) = cfg.threads {
            self.set_threads(threads)?;
        }

        let sgd = Sgd::new(cfg.learning_rate)?;
        let mut trainer = match self.take_trainer() {
            Some(trainer) => trainer,
            None => Trainer::new(self, cfg.lanes)?,
        };
        let result = trainer
            .set_lanes(self, cfg.lanes)
            .and_then(|()| self.run_epochs(&mut trainer, &sgd, train, test, cfg));
        self.keep_trainer(trainer);
        result
    }

    fn run_epochs(
        &mut self,
        trainer: &mut Trainer,
        sgd: &Sgd,
        train: &Dataset,
        test: Option<&Dataset>,
        cfg: &TrainConfig,
    ) -> Result<FitReport> {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut shuffler = Shuffler::new(train.len());
        let mut batch = Vec::with_capacity(cfg.batch_size);
        let batches = train.len().div_ceil(cfg.batch_size);

        let mut epochs = Vec::with_capacity(cfg.epochs);
        for epoch in 0..cfg.epochs {
            let mut total = 0.0_f32;
            for _ in 0..batches {
                shuffler.next_batch(cfg.batch_size, &mut rng, &mut batch);
                let rate = sgd.rate_for_batch(batch.len());
                total += trainer.train_indices(self, train, &batch, rate, cfg.cost)?;
            }
            let mean_cost = total / train.len() as f32;
            let accuracy = match test {
                Some(test) if !test.is_empty() => Some(self.evaluate(test)?.accuracy),
                _ => None,
            };
            info!(epoch, mean_cost, accuracy = ?accuracy, "epoch finished");
            epochs.push(EpochReport {
                epoch,
                mean_cost,
                accuracy,
            });
        }

        Ok(FitReport { epochs })
    }

    /// Scores `data` by arg-max prediction against the label.
    pub fn evaluate(&mut self, data: &Dataset) -> Result<EvalReport> {
        if data.is_empty() {
            return Err(Error::InvalidData("dataset must not be empty".to_owned()));
        }
        check_dataset(self, data)?;

        let mut correct = 0;
        for idx in 0..data.len() {
            if self.predict(data.image(idx))? == data.label(idx) {
                correct += 1;
            }
        }
        Ok(EvalReport {
            correct,
            total: data.len(),
            accuracy: correct as f32 / data.len() as f32,
        })
    }
}

fn check_dataset(net: &Network, data: &Dataset) -> Result<()> {
    if data.image_len() != net.input_dim() {
        return Err(Error::InvalidData(format!(
            "dataset image_len {} does not match network input_dim {}",
            data.image_len(),
            net.input_dim()
        )));
    }
    if data.classes() != net.output_dim() {
        return Err(Error::InvalidData(format!(
            "dataset classes {} does not match network output_dim {}",
            data.classes(),
            net.output_dim()
        )));
    }
    Ok(())
}
