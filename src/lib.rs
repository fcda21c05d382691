//! Distributed training orchestrator for iterative pose-graph refinement
//!
//! This crate implements the outer training loop of a camera pose and depth
//! refinement system, providing:
//! - A process group with barrier / SUM all-reduce collectives and symmetric
//!   SPMD control flow across ranks
//! - Disjoint per-rank dataset partitioning with background prefetching
//! - Per-batch frame graph construction (temporal window or heuristic
//!   co-visibility, drawn by a coin flip)
//! - Restart-bounded refinement rounds with warm-started state and
//!   cross-round gradient accumulation
//! - One clipped Adam update and one-cycle schedule advance per outer step
//! - Periodic globally reduced validation and rank-0 checkpointing
//!
//! # Example
//!
//! ```no_run
//! use pose_graph_train_rs::prelude::*;
//! use std::sync::Arc;
//! use candle_core::DType;
//! use candle_nn::{VarBuilder, VarMap};
//!
//! let config = TrainConfig::test();
//! let group = ProcessGroup::solo().unwrap();
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, group.device());
//! let net = TinyRefineNet::new(vb).unwrap();
//! let dataset = Arc::new(SyntheticTrajectoryDataset::new(64, config.frames, 96, 128, 1));
//!
//! let mut trainer = Trainer::new(
//!     config,
//!     group,
//!     Box::new(net),
//!     varmap,
//!     Box::new(GammaLossSuite::default()),
//!     Arc::clone(&dataset) as Arc<dyn FrameDataset>,
//!     dataset,
//! )
//! .unwrap();
//! trainer.train().unwrap();
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod graph;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod trainer;

pub use checkpoint::{
    capture_varmap, latest_checkpoint, restore_varmap, TensorBlob, TrainCheckpoint,
};
pub use config::{LossWeights, TrainConfig};
pub use data::{
    DistributedSampler, FrameBatch, FrameDataset, FrameLoader, SyntheticTrajectoryDataset,
};
pub use distributed::ProcessGroup;
pub use error::{TrainError, TrainResult};
pub use graph::{BaselineScorer, CovisibilityScorer, FrameGraph, GraphBuilder, GraphMode};
pub use loss::{GammaLossSuite, LossBreakdown, LossSuite};
pub use metrics::{StepScalars, ValidationAccumulator, ValidationMetrics};
pub use model::{
    NetworkOutput, RefinementNetwork, RefinementState, TinyRefineNet, ANCHOR_FRAMES,
};
pub use optim::{Adam, GradAccumulator, OneCycleSchedule};
pub use trainer::Trainer;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{LossWeights, TrainConfig};
    pub use crate::data::{FrameBatch, FrameDataset, SyntheticTrajectoryDataset};
    pub use crate::distributed::ProcessGroup;
    pub use crate::error::{TrainError, TrainResult};
    pub use crate::graph::{FrameGraph, GraphMode};
    pub use crate::loss::{GammaLossSuite, LossSuite};
    pub use crate::model::{RefinementNetwork, TinyRefineNet};
    pub use crate::trainer::Trainer;
}
