//! Training telemetry and validation metric reduction.

use serde::{Deserialize, Serialize};

use crate::distributed::ProcessGroup;
use crate::error::{TrainError, TrainResult};

/// Scalars logged once per outer step, keyed by the global step counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepScalars {
    pub step: usize,
    pub geodesic_loss: f64,
    pub residual_loss: f64,
    pub flow_loss: f64,
    pub combined_loss: f64,
    pub learning_rate: f64,
    pub grad_norm: f64,
    pub rounds: usize,
    pub rot_error: f64,
    pub tr_error: f64,
    pub flow_error: f64,
}

impl StepScalars {
    /// Emit the per-step training record through the tracing subscriber.
    pub fn emit(&self) {
        tracing::info!(
            step = self.step,
            geo = self.geodesic_loss,
            res = self.residual_loss,
            flo = self.flow_loss,
            loss = self.combined_loss,
            lr = self.learning_rate,
            grad_norm = self.grad_norm,
            rounds = self.rounds,
            rot = self.rot_error,
            tr = self.tr_error,
            flow = self.flow_error,
            "train step"
        );
    }
}

/// Globally averaged validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub rot_error: f64,
    pub tr_error: f64,
    pub flow_error: f64,
}

impl ValidationMetrics {
    pub fn emit(&self, step: usize) {
        tracing::info!(
            step,
            rot = self.rot_error,
            tr = self.tr_error,
            flow = self.flow_error,
            "validation"
        );
    }
}

/// Local per-rank sums over the validation batches of one pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ValidationAccumulator {
    rot_sum: f64,
    tr_sum: f64,
    flow_sum: f64,
    batches: usize,
}

impl ValidationAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, rot_error: f64, tr_error: f64, flow_error: f64) {
        self.rot_sum += rot_error;
        self.tr_sum += tr_error;
        self.flow_sum += flow_error;
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Reduce to global averages: a barrier, then one SUM all-reduce per
    /// metric, each divided by `local_batches * world_size`. Every rank sees
    /// the same three batches count by construction, so the divisor is
    /// uniform.
    pub fn reduce(&self, group: &ProcessGroup) -> TrainResult<ValidationMetrics> {
        if self.batches == 0 {
            return Err(TrainError::training(
                "validation reduce with no recorded batches",
            ));
        }
        group.barrier();
        let divisor = (self.batches * group.world_size()) as f64;

        let mut rot = [self.rot_sum];
        group.all_reduce_sum(&mut rot)?;
        let mut tr = [self.tr_sum];
        group.all_reduce_sum(&mut tr)?;
        let mut flow = [self.flow_sum];
        group.all_reduce_sum(&mut flow)?;

        Ok(ValidationMetrics {
            rot_error: rot[0] / divisor,
            tr_error: tr[0] / divisor,
            flow_error: flow[0] / divisor,
        })
    }
}
