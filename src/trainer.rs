//! The training orchestrator.
//!
//! One [`Trainer`] runs per rank. Each outer step processes one frame batch
//! through a restart-bounded sequence of refinement rounds: every round runs
//! the network from the warm-started state, evaluates the loss, backpropagates
//! and folds the synchronized gradients into the cross-round accumulator. The
//! optimizer and schedule advance exactly once per outer step, after the last
//! round.
//!
//! Control flow is symmetric across ranks wherever a collective is involved:
//! the restart decision stream is seeded identically on every rank (rank 0
//! broadcasts the seed at startup), so all ranks execute the same number of
//! rounds and therefore the same number of gradient collectives per step.
//! The graph-mode coin flip has no collective behind it and is allowed to
//! diverge.

use std::sync::Arc;

use candle_nn::VarMap;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::checkpoint::{capture_varmap, restore_varmap, TrainCheckpoint};
use crate::config::TrainConfig;
use crate::data::{DistributedSampler, FrameBatch, FrameDataset, FrameLoader};
use crate::distributed::ProcessGroup;
use crate::error::{TrainError, TrainResult};
use crate::graph::{BaselineScorer, GraphBuilder};
use crate::loss::LossSuite;
use crate::metrics::{StepScalars, ValidationAccumulator, ValidationMetrics};
use crate::model::{RefinementNetwork, RefinementState, ANCHOR_FRAMES};
use crate::optim::{Adam, GradAccumulator, OneCycleSchedule};

pub struct Trainer {
    config: TrainConfig,
    group: ProcessGroup,
    network: Box<dyn RefinementNetwork>,
    varmap: VarMap,
    loss: Box<dyn LossSuite>,
    graph_builder: GraphBuilder,
    optimizer: Adam,
    schedule: OneCycleSchedule,
    accumulator: GradAccumulator,
    restart_rng: StdRng,
    train_dataset: Arc<dyn FrameDataset>,
    val_dataset: Arc<dyn FrameDataset>,
    step: usize,
    run_id: String,
}

impl Trainer {
    /// Assemble a trainer for one rank.
    ///
    /// Issues one collective: rank 0 broadcasts the restart-decision seed so
    /// every rank draws the identical stream. Must therefore be called
    /// concurrently on all ranks.
    pub fn new(
        config: TrainConfig,
        group: ProcessGroup,
        network: Box<dyn RefinementNetwork>,
        varmap: VarMap,
        loss: Box<dyn LossSuite>,
        train_dataset: Arc<dyn FrameDataset>,
        val_dataset: Arc<dyn FrameDataset>,
    ) -> TrainResult<Self> {
        config.validate()?;
        if config.batch != 1 {
            return Err(TrainError::invalid_config(format!(
                "the loader yields one frame set per step; batch must be 1, got {}",
                config.batch
            )));
        }
        if config.world_size != group.world_size() {
            return Err(TrainError::invalid_config(format!(
                "config world_size {} does not match process group world_size {}",
                config.world_size,
                group.world_size()
            )));
        }

        let restart_seed = group.broadcast_u64(config.seed)?;
        let restart_rng = StdRng::seed_from_u64(restart_seed);
        // Rank-offset stream for the graph-mode flip. No collective hides
        // behind the flip, so ranks may draw different modes safely.
        let graph_rng =
            StdRng::seed_from_u64(config.seed.wrapping_add(group.rank() as u64 + 1));
        let graph_builder = GraphBuilder::new(
            config.edges,
            Box::new(BaselineScorer {
                fmin: config.fmin,
                fmax: config.fmax,
            }),
            graph_rng,
        );

        let optimizer = Adam::new(config.lr, config.weight_decay);
        let schedule = OneCycleSchedule::new(config.lr, config.steps);
        let run_id = Utc::now().format("%Y%m%d_%H%M%S").to_string();

        Ok(Self {
            config,
            group,
            network,
            varmap,
            loss,
            graph_builder,
            optimizer,
            schedule,
            accumulator: GradAccumulator::new(),
            restart_rng,
            train_dataset,
            val_dataset,
            step: 0,
            run_id,
        })
    }

    /// Global outer-step counter.
    pub fn global_step(&self) -> usize {
        self.step
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Schedule phase, for inspection and tests.
    pub fn schedule(&self) -> &OneCycleSchedule {
        &self.schedule
    }

    /// Run the outer loop until the configured step count is reached.
    ///
    /// Epochs repeat over this rank's partition, reshuffled each time. Every
    /// `val_every` steps a reduced validation pass runs on all ranks; every
    /// `checkpoint_every` steps rank 0 writes a checkpoint.
    pub fn train(&mut self) -> TrainResult<()> {
        let sampler = DistributedSampler::new(
            self.train_dataset.len(),
            self.group.world_size(),
            self.group.rank(),
            true,
            self.config.seed,
        );
        if sampler.local_len() == 0 {
            return Err(TrainError::data(format!(
                "dataset of {} samples cannot feed {} ranks",
                self.train_dataset.len(),
                self.group.world_size()
            )));
        }
        let mut loader = FrameLoader::new(
            Arc::clone(&self.train_dataset),
            sampler,
            self.group.device().clone(),
            self.config.num_workers,
            self.config.prefetch_factor,
        );

        let mut epoch = 0u64;
        'run: loop {
            if epoch > 0 {
                loader.reset(epoch);
            }
            tracing::debug!(epoch, rank = self.group.rank(), "epoch start");
            while let Some(batch) = loader.next() {
                let batch = batch?;
                self.step += 1;
                let scalars = self.train_step(&batch)?;
                scalars.emit();

                if self.step % self.config.val_every == 0 {
                    let metrics = self.validate()?;
                    metrics.emit(self.step);
                }
                if self.step % self.config.checkpoint_every == 0 && self.group.is_lead() {
                    self.save_checkpoint()?;
                }
                if self.step >= self.config.steps {
                    break 'run;
                }
            }
            epoch += 1;
        }
        Ok(())
    }

    /// One outer step over one batch.
    fn train_step(&mut self, batch: &FrameBatch) -> TrainResult<StepScalars> {
        let mode = self.graph_builder.draw_mode();
        let graph = self.graph_builder.build(mode, batch)?;
        let intrinsics = RefinementState::scaled_intrinsics(batch)?;

        let mut state = RefinementState::from_ground_truth(batch)?;
        let mut rounds = 0usize;
        let mut final_round: Option<StepScalars> = None;

        // Restart-bounded refinement: draw after entering, so at least one
        // round always runs (restart_prob > 0 is enforced by validation).
        // The draw stream is shared across ranks, keeping round counts and
        // gradient collectives symmetric.
        let mut draw = 0.0f64;
        while draw < self.config.restart_prob {
            draw = self.restart_rng.gen::<f64>();
            rounds += 1;

            let output = self.network.forward(
                &state,
                &batch.images,
                &intrinsics,
                &graph,
                self.config.iterations,
                ANCHOR_FRAMES,
            )?;
            let breakdown = self.loss.evaluate(batch, &graph, &output)?;
            let combined = breakdown.combined(&self.config.loss_weights)?;

            let grads = combined.backward()?;
            self.accumulator
                .sync_and_absorb(&self.varmap, &grads, &self.group)?;

            // Warm start the next round from the detached final estimates.
            state = output.final_state()?;

            final_round = Some(StepScalars {
                step: self.step,
                geodesic_loss: f64::from(breakdown.geodesic.to_scalar::<f32>()?),
                residual_loss: f64::from(breakdown.residual.to_scalar::<f32>()?),
                flow_loss: f64::from(breakdown.flow.to_scalar::<f32>()?),
                combined_loss: f64::from(combined.to_scalar::<f32>()?),
                learning_rate: 0.0,
                grad_norm: 0.0,
                rounds: 0,
                rot_error: breakdown.rot_error,
                tr_error: breakdown.tr_error,
                flow_error: breakdown.flow_error,
            });
        }

        let mut scalars = final_round
            .ok_or_else(|| TrainError::training("outer step executed zero rounds"))?;

        // One update per outer step, however many rounds ran.
        self.optimizer.set_learning_rate(self.schedule.lr());
        let grad_norm = self.accumulator.clip_global_norm(self.config.clip)?;
        self.optimizer.step(&self.varmap, &self.accumulator)?;
        self.schedule.step();
        self.accumulator.clear();

        scalars.learning_rate = self.optimizer.learning_rate();
        scalars.grad_norm = grad_norm;
        scalars.rounds = rounds;
        Ok(scalars)
    }

    /// Reduced validation pass.
    ///
    /// Every rank evaluates the same capped number of batches from its fixed
    /// validation partition, always under the window graph and a single
    /// refinement round, then joins the barrier and the three SUM
    /// all-reduces that produce the globally averaged errors.
    pub fn validate(&mut self) -> TrainResult<ValidationMetrics> {
        let sampler = DistributedSampler::new(
            self.val_dataset.len(),
            self.group.world_size(),
            self.group.rank(),
            false,
            self.config.seed,
        );
        let cap = sampler.local_len().min(self.config.val_batch_cap);
        if cap == 0 {
            return Err(TrainError::data(format!(
                "validation dataset of {} samples cannot feed {} ranks",
                self.val_dataset.len(),
                self.group.world_size()
            )));
        }
        let loader = FrameLoader::new(
            Arc::clone(&self.val_dataset),
            sampler,
            self.group.device().clone(),
            self.config.num_workers,
            self.config.prefetch_factor,
        );

        let mut acc = ValidationAccumulator::new();
        for batch in loader.take(cap) {
            let batch = batch?;
            let graph = self.graph_builder.validation(batch.frames());
            let intrinsics = RefinementState::scaled_intrinsics(&batch)?;
            let state = RefinementState::from_ground_truth(&batch)?;
            let output = self.network.forward(
                &state,
                &batch.images,
                &intrinsics,
                &graph,
                self.config.iterations,
                ANCHOR_FRAMES,
            )?;
            let breakdown = self.loss.evaluate(&batch, &graph, &output)?;
            acc.record(breakdown.rot_error, breakdown.tr_error, breakdown.flow_error);
        }
        acc.reduce(&self.group)
    }

    /// Write the full training state. Called on rank 0 only.
    pub fn save_checkpoint(&self) -> TrainResult<std::path::PathBuf> {
        let checkpoint = TrainCheckpoint {
            run_id: self.run_id.clone(),
            experiment: self.config.experiment.clone(),
            step: self.step,
            created_at: Utc::now(),
            config: self.config.clone(),
            model: capture_varmap(&self.varmap)?,
            optimizer: self.optimizer.state()?,
            schedule: self.schedule.clone(),
        };
        checkpoint.save(&self.config.checkpoint_dir)
    }

    /// Resume from a checkpoint: model weights, optimizer moments, schedule
    /// phase and step counter are restored exactly.
    pub fn resume(&mut self, checkpoint: &TrainCheckpoint) -> TrainResult<()> {
        restore_varmap(&self.varmap, &checkpoint.model, self.group.device())?;
        self.optimizer
            .load_state(&checkpoint.optimizer, self.group.device())?;
        self.schedule = checkpoint.schedule.clone();
        self.step = checkpoint.step;
        self.run_id = checkpoint.run_id.clone();
        tracing::info!(step = self.step, "resumed from checkpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::latest_checkpoint;
    use crate::data::SyntheticTrajectoryDataset;
    use crate::loss::GammaLossSuite;
    use crate::model::TinyRefineNet;
    use candle_core::DType;
    use candle_nn::VarBuilder;
    use std::thread;

    fn build(config: TrainConfig, group: ProcessGroup) -> Trainer {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, group.device());
        let net = TinyRefineNet::new(vb).unwrap();
        let frames = config.frames;
        let train_ds = Arc::new(SyntheticTrajectoryDataset::new(8, frames, 32, 32, 5));
        let val_ds = Arc::new(SyntheticTrajectoryDataset::new(4, frames, 32, 32, 6));
        Trainer::new(
            config,
            group,
            Box::new(net),
            varmap,
            Box::new(GammaLossSuite::default()),
            train_ds,
            val_ds,
        )
        .unwrap()
    }

    fn quiet_config(dir: &std::path::Path) -> TrainConfig {
        let mut config = TrainConfig::test();
        config.checkpoint_dir = dir.to_path_buf();
        config.val_every = 1000;
        config.checkpoint_every = 1000;
        config
    }

    #[test]
    fn solo_run_reaches_step_count() {
        let dir = tempfile::tempdir().unwrap();
        let config = quiet_config(dir.path()).with_steps(4);
        let mut trainer = build(config, ProcessGroup::solo().unwrap());
        trainer.train().unwrap();
        assert_eq!(trainer.global_step(), 4);
        // One schedule advance per outer step, regardless of round counts.
        assert_eq!(trainer.schedule().step_count(), 4);
    }

    #[test]
    fn rejects_batch_above_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quiet_config(dir.path());
        config.batch = 2;
        let group = ProcessGroup::solo().unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, group.device());
        let net = TinyRefineNet::new(vb).unwrap();
        let ds = Arc::new(SyntheticTrajectoryDataset::new(4, config.frames, 32, 32, 1));
        let result = Trainer::new(
            config,
            group,
            Box::new(net),
            varmap,
            Box::new(GammaLossSuite::default()),
            Arc::clone(&ds) as Arc<dyn FrameDataset>,
            ds,
        );
        assert!(result.is_err());
    }

    #[test]
    fn validation_reduces_to_finite_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let config = quiet_config(dir.path());
        let mut trainer = build(config, ProcessGroup::solo().unwrap());
        let before = trainer.group().collective_ops();
        let metrics = trainer.validate().unwrap();
        assert!(metrics.rot_error.is_finite());
        assert!(metrics.tr_error.is_finite());
        assert!(metrics.flow_error.is_finite());
        // barrier plus three all-reduces
        assert_eq!(trainer.group().collective_ops() - before, 4);
    }

    #[test]
    fn two_ranks_issue_identical_collective_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quiet_config(dir.path()).with_steps(6).with_world_size(2);
        config.val_every = 3;
        let groups = ProcessGroup::spawn_local(2).unwrap();
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                let config = config.clone();
                thread::spawn(move || {
                    let mut trainer = build(config, group);
                    trainer.train().unwrap();
                    (trainer.global_step(), trainer.group().collective_ops())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0].0, 6);
        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn checkpoint_resume_restores_exact_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = quiet_config(dir.path()).with_steps(3);
        let mut trainer = build(config.clone(), ProcessGroup::solo().unwrap());
        trainer.train().unwrap();
        let path = trainer.save_checkpoint().unwrap();
        assert_eq!(latest_checkpoint(dir.path()).unwrap().unwrap(), path);
        let saved = TrainCheckpoint::load(&path).unwrap();

        let mut fresh = build(config, ProcessGroup::solo().unwrap());
        assert_eq!(fresh.global_step(), 0);
        fresh.resume(&saved).unwrap();
        assert_eq!(fresh.global_step(), 3);
        assert_eq!(fresh.schedule(), trainer.schedule());
        assert_eq!(
            capture_varmap(&fresh.varmap).unwrap()["pose_in.weight"].values,
            saved.model["pose_in.weight"].values
        );
    }

    #[test]
    fn restart_rounds_average_near_expectation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quiet_config(dir.path()).with_restart_prob(0.5);
        config.steps = 30;
        let mut trainer = build(config, ProcessGroup::solo().unwrap());
        let ds = SyntheticTrajectoryDataset::new(1, 5, 32, 32, 5);
        let batch = ds.sample(0, group_device(&trainer)).unwrap();
        let mut total_rounds = 0usize;
        for _ in 0..30 {
            trainer.step += 1;
            let scalars = trainer.train_step(&batch).unwrap();
            assert!(scalars.rounds >= 1);
            total_rounds += scalars.rounds;
        }
        // Expected rounds per step is 1 / (1 - 0.5) = 2.
        let avg = total_rounds as f64 / 30.0;
        assert!((1.4..2.8).contains(&avg), "average rounds {avg}");
    }

    fn group_device(trainer: &Trainer) -> &candle_core::Device {
        trainer.group().device()
    }
}
