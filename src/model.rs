//! Refinement state and the network collaborator seam.
//!
//! The network's internal computation is an external collaborator; this
//! module defines the state it consumes and produces, the warm-start
//! initialization of each outer step, and [`TinyRefineNet`], a small candle
//! reference network used by tests and the demo driver.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::data::FrameBatch;
use crate::error::{TrainError, TrainResult};
use crate::graph::FrameGraph;

/// Number of anchor frames whose poses are held fixed to ground truth,
/// removing the pose graph's gauge freedom.
pub const ANCHOR_FRAMES: usize = 2;

/// Spatial stride of the inverse-depth estimate: one value per 8x8 block.
pub const DEPTH_STRIDE: usize = 8;

/// Offset of the depth sample within its block (the block center).
pub const DEPTH_OFFSET: usize = 3;

/// Indices of block centers along one image axis of length `len`.
pub fn block_centers(len: usize) -> Vec<u32> {
    (DEPTH_OFFSET..len)
        .step_by(DEPTH_STRIDE)
        .map(|i| i as u32)
        .collect()
}

/// Subsample a `[N, H, W]` map at block centers, yielding `[N, H/8, W/8]`.
pub fn downsample_blocks(map: &Tensor) -> TrainResult<Tensor> {
    let dims = map.dims();
    if dims.len() != 3 {
        return Err(TrainError::training(format!(
            "expected [N, H, W] map, got {dims:?}"
        )));
    }
    let rows = block_centers(dims[1]);
    let cols = block_centers(dims[2]);
    if rows.is_empty() || cols.is_empty() {
        return Err(TrainError::training(format!(
            "map {dims:?} too small for {DEPTH_STRIDE}x{DEPTH_STRIDE} blocks"
        )));
    }
    let device = map.device();
    let (nr, nc) = (rows.len(), cols.len());
    let row_idx = Tensor::from_vec(rows, (nr,), device)?;
    let col_idx = Tensor::from_vec(cols, (nc,), device)?;
    let map = map.index_select(&row_idx, 1)?;
    Ok(map.index_select(&col_idx, 2)?)
}

/// Warm-started estimate state: pose set plus inverse depth.
///
/// Carried across refinement rounds within one outer step and reset from
/// ground truth at the start of the next. [`RefinementState::detach`] is the
/// checkpoint boundary between rounds: the returned state feeds the next
/// round but is severed from gradient flow, so the computation graph never
/// grows across rounds.
#[derive(Debug, Clone)]
pub struct RefinementState {
    /// Pose estimates, `[N, 7]` (quaternion xyzw + translation)
    pub poses: Tensor,
    /// Inverse-depth estimate at 1/8 resolution, `[N, H/8, W/8]`
    pub disps: Tensor,
}

impl RefinementState {
    /// Initialize the state for a new outer step.
    ///
    /// Anchor frame 0 receives the exact ground-truth pose. Every remaining
    /// frame, including anchor frame 1, is initialized to the ground-truth
    /// pose of frame 1, a coarse broadcast rather than an identity start.
    /// Inverse depth starts uniform at one estimate per 8x8 block.
    pub fn from_ground_truth(batch: &FrameBatch) -> TrainResult<Self> {
        let n = batch.frames();
        if n < ANCHOR_FRAMES + 1 {
            return Err(TrainError::training(format!(
                "need at least {} frames, got {n}",
                ANCHOR_FRAMES + 1
            )));
        }
        let first = batch.poses.narrow(0, 0, 1)?;
        let second = batch.poses.narrow(0, 1, 1)?;
        let rest = second.expand((n - 1, 7))?;
        let poses = Tensor::cat(&[&first, &rest], 0)?;

        let h = block_centers(batch.height()).len();
        let w = block_centers(batch.width()).len();
        if h == 0 || w == 0 {
            return Err(TrainError::training(format!(
                "images {}x{} too small for {DEPTH_STRIDE}x{DEPTH_STRIDE} depth blocks",
                batch.height(),
                batch.width()
            )));
        }
        let disps = Tensor::ones((n, h, w), DType::F32, batch.poses.device())?;
        Ok(Self { poses, disps })
    }

    /// Intrinsics scaled to the downsampled depth resolution.
    pub fn scaled_intrinsics(batch: &FrameBatch) -> TrainResult<Tensor> {
        Ok((&batch.intrinsics / DEPTH_STRIDE as f64)?)
    }

    /// Copy of the state severed from gradient flow.
    pub fn detach(&self) -> Self {
        Self {
            poses: self.poses.detach(),
            disps: self.disps.detach(),
        }
    }

    /// Number of frames.
    pub fn frames(&self) -> usize {
        self.poses.dims()[0]
    }
}

/// Output of one network invocation: intermediate estimates per internal
/// iteration plus per-iteration residual maps over graph edges.
#[derive(Debug)]
pub struct NetworkOutput {
    /// Pose estimates, one `[N, 7]` tensor per internal iteration
    pub poses: Vec<Tensor>,
    /// Inverse-depth estimates, one `[N, H/8, W/8]` tensor per iteration
    pub disps: Vec<Tensor>,
    /// Edge residual maps, one `[E, 7]` tensor per iteration
    pub residuals: Vec<Tensor>,
}

impl NetworkOutput {
    /// Warm-start state for the next round: the final estimates, detached.
    pub fn final_state(&self) -> TrainResult<RefinementState> {
        let poses = self
            .poses
            .last()
            .ok_or_else(|| TrainError::training("network produced no pose estimates"))?;
        let disps = self
            .disps
            .last()
            .ok_or_else(|| TrainError::training("network produced no depth estimates"))?;
        Ok(RefinementState {
            poses: poses.detach(),
            disps: disps.detach(),
        })
    }
}

/// The recurrent refinement network collaborator.
///
/// Implementations must pass the first `anchor_frames` poses through
/// bit-for-bit on every iteration; anchors are never optimizer-updated.
pub trait RefinementNetwork: Send {
    fn forward(
        &self,
        state: &RefinementState,
        images: &Tensor,
        intrinsics: &Tensor,
        graph: &FrameGraph,
        iterations: usize,
        anchor_frames: usize,
    ) -> TrainResult<NetworkOutput>;
}

/// Minimal refinement network: a pose-update MLP plus an image-conditioned
/// depth gate. Stands in for the real recurrent network so the orchestrator
/// can be exercised end to end with genuine gradient flow.
pub struct TinyRefineNet {
    pose_in: Linear,
    pose_out: Linear,
    disp_gate: Linear,
}

impl TinyRefineNet {
    pub const HIDDEN: usize = 32;

    pub fn new(vb: VarBuilder) -> TrainResult<Self> {
        Ok(Self {
            pose_in: linear(7, Self::HIDDEN, vb.pp("pose_in"))?,
            pose_out: linear(Self::HIDDEN, 7, vb.pp("pose_out"))?,
            disp_gate: linear(3, 1, vb.pp("disp_gate"))?,
        })
    }

    fn edge_residuals(&self, poses: &Tensor, graph: &FrameGraph, device: &Device) -> TrainResult<Tensor> {
        let edges = graph.edges();
        if edges.is_empty() {
            return Ok(Tensor::zeros((1, 7), DType::F32, device)?);
        }
        let is: Vec<u32> = edges.iter().map(|&(i, _)| i as u32).collect();
        let js: Vec<u32> = edges.iter().map(|&(_, j)| j as u32).collect();
        let i_idx = Tensor::from_vec(is, (edges.len(),), device)?;
        let j_idx = Tensor::from_vec(js, (edges.len(),), device)?;
        let pi = poses.index_select(&i_idx, 0)?;
        let pj = poses.index_select(&j_idx, 0)?;
        Ok((pi - pj)?)
    }
}

impl RefinementNetwork for TinyRefineNet {
    fn forward(
        &self,
        state: &RefinementState,
        images: &Tensor,
        _intrinsics: &Tensor,
        graph: &FrameGraph,
        iterations: usize,
        anchor_frames: usize,
    ) -> TrainResult<NetworkOutput> {
        let n = state.frames();
        if anchor_frames >= n {
            return Err(TrainError::training(format!(
                "{anchor_frames} anchors leave no free frames out of {n}"
            )));
        }
        let device = state.poses.device().clone();

        // Image statistic feeding the depth gate, constant across iterations.
        let pooled = images.flatten_from(2)?.mean(D::Minus1)?; // [N, 3]
        let gate = self.disp_gate.forward(&pooled)?.tanh()?; // [N, 1]
        let gate = (gate.unsqueeze(2)? * 1e-2)?; // [N, 1, 1]

        let mut poses = state.poses.clone();
        let mut disps = state.disps.clone();
        let mut out = NetworkOutput {
            poses: Vec::with_capacity(iterations),
            disps: Vec::with_capacity(iterations),
            residuals: Vec::with_capacity(iterations),
        };

        for _ in 0..iterations {
            let feats = self.pose_in.forward(&poses)?.tanh()?;
            let delta = (self.pose_out.forward(&feats)? * 1e-2)?;

            // Anchors pass through untouched; only free frames move.
            let anchors = poses.narrow(0, 0, anchor_frames)?;
            let free = (poses.narrow(0, anchor_frames, n - anchor_frames)?
                + delta.narrow(0, anchor_frames, n - anchor_frames)?)?;
            poses = Tensor::cat(&[&anchors, &free], 0)?;

            disps = disps.broadcast_add(&gate)?;

            out.residuals
                .push(self.edge_residuals(&poses, graph, &device)?);
            out.poses.push(poses.clone());
            out.disps.push(disps.clone());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FrameDataset, SyntheticTrajectoryDataset};
    use candle_nn::VarMap;

    fn batch() -> FrameBatch {
        SyntheticTrajectoryDataset::new(1, 5, 32, 48, 21)
            .sample(0, &Device::Cpu)
            .unwrap()
    }

    #[test]
    fn block_centers_match_stride_offset() {
        assert_eq!(block_centers(32), vec![3, 11, 19, 27]);
        assert_eq!(block_centers(8), vec![3]);
        assert_eq!(block_centers(11), vec![3]);
        assert_eq!(block_centers(12), vec![3, 11]);
        assert!(block_centers(3).is_empty());
    }

    #[test]
    fn downsample_picks_block_centers() {
        let values: Vec<f32> = (0..2 * 16 * 16).map(|v| v as f32).collect();
        let map = Tensor::from_vec(values, (2, 16, 16), &Device::Cpu).unwrap();
        let down = downsample_blocks(&map).unwrap();
        assert_eq!(down.dims(), &[2, 2, 2]);
        let got = down.to_vec3::<f32>().unwrap();
        // Frame 0, rows 3 and 11, cols 3 and 11.
        assert_eq!(got[0][0][0], (3 * 16 + 3) as f32);
        assert_eq!(got[0][1][1], (11 * 16 + 11) as f32);
    }

    #[test]
    fn initialization_broadcasts_second_frame_pose() {
        let batch = batch();
        let state = RefinementState::from_ground_truth(&batch).unwrap();
        let gt = batch.poses.to_vec2::<f32>().unwrap();
        let init = state.poses.to_vec2::<f32>().unwrap();
        assert_eq!(init[0], gt[0]);
        for row in &init[1..] {
            assert_eq!(row, &gt[1]);
        }
        // 32x48 image -> 4x6 depth blocks, uniform ones.
        assert_eq!(state.disps.dims(), &[5, 4, 6]);
        let disps = state.disps.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(disps.iter().all(|&d| d == 1.0));
    }

    #[test]
    fn scaled_intrinsics_divide_by_stride() {
        let batch = batch();
        let scaled = RefinementState::scaled_intrinsics(&batch).unwrap();
        let full = batch.intrinsics.to_vec2::<f32>().unwrap();
        let down = scaled.to_vec2::<f32>().unwrap();
        for (a, b) in full.iter().zip(down.iter()) {
            for (x, y) in a.iter().zip(b.iter()) {
                assert!((x / 8.0 - y).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn network_passes_anchors_through_exactly() {
        let batch = batch();
        let state = RefinementState::from_ground_truth(&batch).unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = TinyRefineNet::new(vb).unwrap();
        let graph = FrameGraph::window(batch.frames(), 2);
        let intrinsics = RefinementState::scaled_intrinsics(&batch).unwrap();

        let out = net
            .forward(&state, &batch.images, &intrinsics, &graph, 3, ANCHOR_FRAMES)
            .unwrap();
        assert_eq!(out.poses.len(), 3);
        assert_eq!(out.disps.len(), 3);
        assert_eq!(out.residuals.len(), 3);

        let init = state.poses.to_vec2::<f32>().unwrap();
        for est in &out.poses {
            let est = est.to_vec2::<f32>().unwrap();
            assert_eq!(est[0], init[0], "anchor 0 must be bit-identical");
            assert_eq!(est[1], init[1], "anchor 1 must be bit-identical");
            // Free frames must actually move unless the update is exactly zero.
            assert_eq!(est.len(), init.len());
        }
    }

    #[test]
    fn final_state_is_detached_warm_start() {
        let batch = batch();
        let state = RefinementState::from_ground_truth(&batch).unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = TinyRefineNet::new(vb).unwrap();
        let graph = FrameGraph::window(batch.frames(), 2);
        let intrinsics = RefinementState::scaled_intrinsics(&batch).unwrap();

        let out = net
            .forward(&state, &batch.images, &intrinsics, &graph, 2, ANCHOR_FRAMES)
            .unwrap();
        let warm = out.final_state().unwrap();
        assert_eq!(
            warm.poses.to_vec2::<f32>().unwrap(),
            out.poses.last().unwrap().to_vec2::<f32>().unwrap()
        );
        assert_eq!(warm.frames(), batch.frames());
    }
}
