//! Loss collaborators.
//!
//! Three terms are combined per refinement round: a geodesic pose-alignment
//! loss over graph edges, a residual-magnitude regularization, and a
//! flow-consistency loss. The exact loss mathematics lives outside the
//! orchestrator; [`GammaLossSuite`] is an iteration-discounted reference
//! implementation that exercises the full gradient path and produces the
//! rotation/translation/flow error scalars used for telemetry and
//! validation.

use candle_core::{DType, Device, Tensor};

use crate::config::LossWeights;
use crate::data::FrameBatch;
use crate::error::{TrainError, TrainResult};
use crate::graph::FrameGraph;
use crate::model::{downsample_blocks, NetworkOutput, DEPTH_STRIDE};

/// Per-round loss terms plus the scalar error metrics of the final iteration.
#[derive(Debug)]
pub struct LossBreakdown {
    /// Geodesic pose-alignment term (scalar tensor)
    pub geodesic: Tensor,
    /// Residual-magnitude term (scalar tensor)
    pub residual: Tensor,
    /// Flow-consistency term (scalar tensor)
    pub flow: Tensor,
    /// Rotation error of the final estimate
    pub rot_error: f64,
    /// Translation error of the final estimate
    pub tr_error: f64,
    /// Induced-flow error of the final estimate
    pub flow_error: f64,
}

impl LossBreakdown {
    /// Fixed weighted sum of the three terms.
    pub fn combined(&self, weights: &LossWeights) -> TrainResult<Tensor> {
        let total = ((&self.geodesic * weights.geodesic)?
            + (&self.residual * weights.residual)?)?;
        Ok((total + (&self.flow * weights.flow)?)?)
    }
}

/// External loss computation seam. Losses are only evaluated over the edges
/// of the batch's frame graph.
pub trait LossSuite: Send {
    fn evaluate(
        &self,
        batch: &FrameBatch,
        graph: &FrameGraph,
        output: &NetworkOutput,
    ) -> TrainResult<LossBreakdown>;
}

/// Reference loss suite with geometric iteration discounting: iteration `t`
/// of `T` is weighted `gamma^(T-1-t)`, so later refinements dominate.
#[derive(Debug, Clone)]
pub struct GammaLossSuite {
    pub gamma: f64,
}

impl Default for GammaLossSuite {
    fn default() -> Self {
        Self { gamma: 0.9 }
    }
}

fn scalar_zero(device: &Device) -> TrainResult<Tensor> {
    Ok(Tensor::zeros((), DType::F32, device)?)
}

/// Gather the endpoint rows of every directed edge: `[E, ...]` pairs.
fn edge_gather(t: &Tensor, edges: &[(usize, usize)]) -> TrainResult<(Tensor, Tensor)> {
    let device = t.device();
    let is: Vec<u32> = edges.iter().map(|&(i, _)| i as u32).collect();
    let js: Vec<u32> = edges.iter().map(|&(_, j)| j as u32).collect();
    let i_idx = Tensor::from_vec(is, (edges.len(),), device)?;
    let j_idx = Tensor::from_vec(js, (edges.len(),), device)?;
    Ok((t.index_select(&i_idx, 0)?, t.index_select(&j_idx, 0)?))
}

impl GammaLossSuite {
    fn iteration_weight(&self, t: usize, total: usize) -> f64 {
        self.gamma.powi((total - 1 - t) as i32)
    }
}

impl LossSuite for GammaLossSuite {
    fn evaluate(
        &self,
        batch: &FrameBatch,
        graph: &FrameGraph,
        output: &NetworkOutput,
    ) -> TrainResult<LossBreakdown> {
        let edges = graph.edges();
        if edges.is_empty() {
            return Err(TrainError::graph("loss evaluated over an empty frame graph"));
        }
        if output.poses.is_empty() {
            return Err(TrainError::training("network produced no iterations"));
        }
        let device = batch.poses.device();
        let iterations = output.poses.len();

        // Ground-truth relative pose parameters per edge.
        let (gt_i, gt_j) = edge_gather(&batch.poses, &edges)?;
        let gt_rel = (&gt_i - &gt_j)?;
        let gt_disp = downsample_blocks(&batch.disps)?;
        let fx_scaled =
            f64::from(batch.intrinsics.to_vec2::<f32>()?[0][0]) / DEPTH_STRIDE as f64;

        let mut geodesic = scalar_zero(device)?;
        let mut residual = scalar_zero(device)?;
        let mut flow = scalar_zero(device)?;
        let mut rot_error = 0.0;
        let mut tr_error = 0.0;
        let mut flow_error = 0.0;

        for t in 0..iterations {
            let weight = self.iteration_weight(t, iterations);

            let (est_i, est_j) = edge_gather(&output.poses[t], &edges)?;
            let rel_err = ((est_i - est_j)? - &gt_rel)?;
            let geo_term = rel_err.sqr()?.mean_all()?;
            geodesic = (geodesic + (geo_term * weight)?)?;

            let res_term = output.residuals[t].abs()?.mean_all()?;
            residual = (residual + (res_term * weight)?)?;

            // Induced-flow proxy: inverse-depth disagreement at block centers
            // scaled by focal length, over the frames the graph constrains.
            let disp_err = (&output.disps[t] - &gt_disp)?.abs()?.mean_all()?;
            let flow_term = (disp_err * fx_scaled)?;
            flow = (flow + (&flow_term * weight)?)?;

            if t == iterations - 1 {
                let rot = rel_err.narrow(1, 0, 4)?.abs()?.mean_all()?;
                let tr = rel_err.narrow(1, 4, 3)?.abs()?.mean_all()?;
                rot_error = f64::from(rot.to_scalar::<f32>()?);
                tr_error = f64::from(tr.to_scalar::<f32>()?);
                flow_error = f64::from(flow_term.to_scalar::<f32>()?);
            }
        }

        Ok(LossBreakdown {
            geodesic,
            residual,
            flow,
            rot_error,
            tr_error,
            flow_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FrameDataset, SyntheticTrajectoryDataset};
    use crate::model::RefinementState;

    fn batch() -> FrameBatch {
        SyntheticTrajectoryDataset::new(1, 5, 32, 32, 17)
            .sample(0, &Device::Cpu)
            .unwrap()
    }

    /// Output that reproduces ground truth exactly.
    fn perfect_output(batch: &FrameBatch, iterations: usize) -> NetworkOutput {
        let gt_disp = downsample_blocks(&batch.disps).unwrap();
        NetworkOutput {
            poses: vec![batch.poses.clone(); iterations],
            disps: vec![gt_disp; iterations],
            residuals: vec![
                Tensor::zeros((4, 7), DType::F32, &Device::Cpu).unwrap();
                iterations
            ],
        }
    }

    #[test]
    fn perfect_estimates_give_zero_loss() {
        let batch = batch();
        let graph = FrameGraph::window(batch.frames(), 2);
        let output = perfect_output(&batch, 3);
        let suite = GammaLossSuite::default();
        let breakdown = suite.evaluate(&batch, &graph, &output).unwrap();
        assert!(breakdown.geodesic.to_scalar::<f32>().unwrap().abs() < 1e-7);
        assert!(breakdown.residual.to_scalar::<f32>().unwrap().abs() < 1e-7);
        assert!(breakdown.flow.to_scalar::<f32>().unwrap().abs() < 1e-7);
        assert!(breakdown.rot_error.abs() < 1e-7);
        assert!(breakdown.tr_error.abs() < 1e-7);
        assert!(breakdown.flow_error.abs() < 1e-7);
    }

    #[test]
    fn imperfect_estimates_give_positive_loss() {
        let batch = batch();
        let graph = FrameGraph::window(batch.frames(), 2);
        let state = RefinementState::from_ground_truth(&batch).unwrap();
        let output = NetworkOutput {
            poses: vec![state.poses.clone()],
            disps: vec![state.disps.clone()],
            residuals: vec![Tensor::ones((4, 7), DType::F32, &Device::Cpu).unwrap()],
        };
        let suite = GammaLossSuite::default();
        let breakdown = suite.evaluate(&batch, &graph, &output).unwrap();
        assert!(breakdown.geodesic.to_scalar::<f32>().unwrap() > 0.0);
        assert!(breakdown.residual.to_scalar::<f32>().unwrap() > 0.0);
        assert!(breakdown.flow.to_scalar::<f32>().unwrap() > 0.0);
    }

    #[test]
    fn zero_weight_disables_term() {
        let batch = batch();
        let graph = FrameGraph::window(batch.frames(), 2);
        let state = RefinementState::from_ground_truth(&batch).unwrap();
        let output = NetworkOutput {
            poses: vec![state.poses.clone()],
            disps: vec![state.disps.clone()],
            residuals: vec![Tensor::ones((4, 7), DType::F32, &Device::Cpu).unwrap()],
        };
        let breakdown = GammaLossSuite::default()
            .evaluate(&batch, &graph, &output)
            .unwrap();

        let only_res = LossWeights {
            geodesic: 0.0,
            residual: 1.0,
            flow: 0.0,
        };
        let combined = breakdown.combined(&only_res).unwrap();
        let expect = breakdown.residual.to_scalar::<f32>().unwrap();
        assert!((combined.to_scalar::<f32>().unwrap() - expect).abs() < 1e-6);
    }

    #[test]
    fn later_iterations_weigh_more() {
        let suite = GammaLossSuite { gamma: 0.5 };
        assert!(suite.iteration_weight(2, 3) > suite.iteration_weight(0, 3));
        assert_eq!(suite.iteration_weight(2, 3), 1.0);
        assert_eq!(suite.iteration_weight(0, 3), 0.25);
    }

    #[test]
    fn empty_graph_is_rejected() {
        let batch = batch();
        let graph = FrameGraph::from_edges(batch.frames(), Vec::new()).unwrap();
        let output = perfect_output(&batch, 1);
        assert!(GammaLossSuite::default()
            .evaluate(&batch, &graph, &output)
            .is_err());
    }
}
