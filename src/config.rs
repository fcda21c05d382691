//! Training configuration.
//!
//! Centralizes every recognized option of the orchestrator: experiment
//! identity, dataset paths, distributed layout, refinement-loop and
//! optimizer hyperparameters, and the validation/checkpoint cadences.
//! Configurations are serde round-trippable so a checkpoint can embed the
//! exact hyperparameters it was produced with.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};

/// Weights for the three loss terms combined per refinement round.
///
/// Each weight is independent and non-negative; a zero weight disables the
/// corresponding term. At least one weight must be positive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LossWeights {
    /// Geodesic pose-alignment loss weight
    pub geodesic: f64,
    /// Residual-magnitude regularization weight
    pub residual: f64,
    /// Flow-consistency loss weight
    pub flow: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            geodesic: 10.0,
            residual: 0.0,
            flow: 0.0,
        }
    }
}

/// Full configuration surface for a training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Experiment name, used in checkpoint file names and telemetry
    pub experiment: String,
    /// Directory checkpoints are written to (rank 0 only)
    pub checkpoint_dir: PathBuf,
    /// Training dataset path
    pub datapath: PathBuf,
    /// Validation dataset path (falls back to `datapath` when absent)
    pub val_datapath: Option<PathBuf>,
    /// Number of parallel worker processes (one per accelerator)
    pub world_size: usize,
    /// Samples per outer step. The reference loader supports 1.
    pub batch: usize,
    /// Internal model iteration count per refinement round
    pub iterations: usize,
    /// Total outer steps for the run
    pub steps: usize,
    /// Peak learning rate for the one-cycle schedule
    pub lr: f64,
    /// Global gradient-norm clip threshold
    pub clip: f64,
    /// Frames per batch (N)
    pub frames: usize,
    /// Loss term weights
    pub loss_weights: LossWeights,
    /// Minimum frame-sampling baseline
    pub fmin: f64,
    /// Maximum frame-sampling baseline
    pub fmax: f64,
    /// Edge budget for the heuristic co-visibility graph
    pub edges: usize,
    /// Probability of continuing to another refinement round. Must lie in
    /// (0, 1): a non-positive value would execute zero rounds and leave the
    /// step with undefined loss state.
    pub restart_prob: f64,
    /// Run a reduced validation pass every this many outer steps
    pub val_every: usize,
    /// Cap on validation batches per process per pass
    pub val_batch_cap: usize,
    /// Write a checkpoint every this many outer steps
    pub checkpoint_every: usize,
    /// Background data-loading workers per process
    pub num_workers: usize,
    /// Prefetch buffer size per worker
    pub prefetch_factor: usize,
    /// Seed for the shared restart-decision stream, broadcast from rank 0
    pub seed: u64,
    /// Adam weight decay, folded into the gradient
    pub weight_decay: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            experiment: "experiment".to_string(),
            checkpoint_dir: PathBuf::from("checkpoints"),
            datapath: PathBuf::from("datasets/train"),
            val_datapath: None,
            world_size: 4,
            batch: 1,
            iterations: 15,
            steps: 250_000,
            lr: 2.5e-4,
            clip: 2.5,
            frames: 7,
            loss_weights: LossWeights::default(),
            fmin: 8.0,
            fmax: 96.0,
            edges: 24,
            restart_prob: 0.2,
            val_every: 5000,
            val_batch_cap: 500,
            checkpoint_every: 10_000,
            num_workers: 2,
            prefetch_factor: 2,
            seed: 12345,
            weight_decay: 1e-5,
        }
    }
}

impl TrainConfig {
    /// Minimal configuration for unit tests: tiny frames, few steps,
    /// single process, no background workers.
    pub fn test() -> Self {
        Self {
            experiment: "test".to_string(),
            checkpoint_dir: PathBuf::from("checkpoints"),
            datapath: PathBuf::from("datasets/train"),
            val_datapath: None,
            world_size: 1,
            batch: 1,
            iterations: 2,
            steps: 20,
            lr: 1e-3,
            clip: 2.5,
            frames: 5,
            loss_weights: LossWeights {
                geodesic: 1.0,
                residual: 0.1,
                flow: 0.1,
            },
            fmin: 8.0,
            fmax: 96.0,
            edges: 6,
            restart_prob: 0.2,
            val_every: 10,
            val_batch_cap: 4,
            checkpoint_every: 10,
            num_workers: 0,
            prefetch_factor: 1,
            seed: 12345,
            weight_decay: 0.0,
        }
    }

    /// Set the experiment name
    pub fn with_experiment(mut self, name: impl Into<String>) -> Self {
        self.experiment = name.into();
        self
    }

    /// Set the world size
    pub fn with_world_size(mut self, world_size: usize) -> Self {
        self.world_size = world_size;
        self
    }

    /// Set the restart probability
    pub fn with_restart_prob(mut self, p: f64) -> Self {
        self.restart_prob = p;
        self
    }

    /// Set the total step count
    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    /// Validate the configuration.
    ///
    /// Rejects every setting that would silently corrupt a training step
    /// rather than fail loudly, most importantly a non-positive restart
    /// probability (zero refinement rounds leave the step with no loss and
    /// desynchronizes the gradient collective).
    pub fn validate(&self) -> TrainResult<()> {
        if !(self.restart_prob > 0.0 && self.restart_prob < 1.0) {
            return Err(TrainError::invalid_config(format!(
                "restart_prob must lie in (0, 1), got {}",
                self.restart_prob
            )));
        }
        if self.world_size == 0 {
            return Err(TrainError::invalid_config("world_size must be >= 1"));
        }
        if self.frames < 3 {
            return Err(TrainError::invalid_config(format!(
                "frames must be >= 3 (2 anchors plus at least one free frame), got {}",
                self.frames
            )));
        }
        if self.iterations == 0 {
            return Err(TrainError::invalid_config("iterations must be >= 1"));
        }
        if self.steps == 0 {
            return Err(TrainError::invalid_config("steps must be >= 1"));
        }
        if self.batch == 0 {
            return Err(TrainError::invalid_config("batch must be >= 1"));
        }
        if self.lr <= 0.0 {
            return Err(TrainError::invalid_config("lr must be positive"));
        }
        if self.clip <= 0.0 {
            return Err(TrainError::invalid_config("clip must be positive"));
        }
        if self.edges == 0 {
            return Err(TrainError::invalid_config("edges must be >= 1"));
        }
        let w = &self.loss_weights;
        if w.geodesic < 0.0 || w.residual < 0.0 || w.flow < 0.0 {
            return Err(TrainError::invalid_config(
                "loss weights must be non-negative",
            ));
        }
        if w.geodesic == 0.0 && w.residual == 0.0 && w.flow == 0.0 {
            return Err(TrainError::invalid_config(
                "at least one loss weight must be positive",
            ));
        }
        if self.fmin >= self.fmax {
            return Err(TrainError::invalid_config(format!(
                "fmin ({}) must be below fmax ({})",
                self.fmin, self.fmax
            )));
        }
        if self.val_every == 0 || self.checkpoint_every == 0 {
            return Err(TrainError::invalid_config(
                "val_every and checkpoint_every must be >= 1",
            ));
        }
        Ok(())
    }

    /// Load a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> TrainResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the configuration as pretty JSON.
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> TrainResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    /// Validation dataset path, falling back to the training path.
    pub fn val_path(&self) -> &PathBuf {
        self.val_datapath.as_ref().unwrap_or(&self.datapath)
    }

    /// Expected refinement rounds per outer step, `1 / (1 - restart_prob)`.
    pub fn expected_rounds(&self) -> f64 {
        1.0 / (1.0 - self.restart_prob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(TrainConfig::default().validate().is_ok());
        assert!(TrainConfig::test().validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_restart_prob() {
        // Zero rounds is an invalid configuration, not valid zero-loss behavior.
        let config = TrainConfig::test().with_restart_prob(0.0);
        assert!(config.validate().is_err());
        let config = TrainConfig::test().with_restart_prob(-0.5);
        assert!(config.validate().is_err());
        let config = TrainConfig::test().with_restart_prob(1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_all_zero_loss_weights() {
        let mut config = TrainConfig::test();
        config.loss_weights = LossWeights {
            geodesic: 0.0,
            residual: 0.0,
            flow: 0.0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_degenerate_layout() {
        let mut config = TrainConfig::test();
        config.frames = 2;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::test();
        config.world_size = 0;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::test();
        config.fmin = 100.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn expected_rounds_matches_geometric_mean() {
        let config = TrainConfig::test().with_restart_prob(0.2);
        assert!((config.expected_rounds() - 1.25).abs() < 1e-12);
        let config = TrainConfig::test().with_restart_prob(0.5);
        assert!((config.expected_rounds() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = TrainConfig::default().with_experiment("roundtrip");
        let json = serde_json::to_string(&config).unwrap();
        let back: TrainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.experiment, "roundtrip");
        assert_eq!(back.steps, config.steps);
        assert_eq!(back.restart_prob, config.restart_prob);
    }
}
