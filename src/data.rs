//! Frame batches, dataset partitioning and background prefetching.
//!
//! The feed wraps a [`FrameDataset`] with a distributed partitioning policy:
//! every rank receives a disjoint strided slice of the (optionally shuffled)
//! index list, truncated so all ranks see the same local count. Training
//! partitions are reshuffled every epoch; validation partitions are fixed.
//! Batches are prefetched by a small pool of background worker threads.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::{TrainError, TrainResult};

/// One training or validation item: a fixed-size set of N frames.
///
/// Immutable once fetched. Poses are camera-to-world, stored as 7-vectors
/// (quaternion xyzw followed by translation xyz). Inverse-depth maps are at
/// full image resolution; intrinsics are `[fx, fy, cx, cy]` per frame.
#[derive(Debug, Clone)]
pub struct FrameBatch {
    /// Images, `[N, 3, H, W]`
    pub images: Tensor,
    /// Ground-truth camera-to-world poses, `[N, 7]`
    pub poses: Tensor,
    /// Ground-truth inverse-depth maps, `[N, H, W]`
    pub disps: Tensor,
    /// Camera intrinsics, `[N, 4]`
    pub intrinsics: Tensor,
}

impl FrameBatch {
    /// Number of frames N.
    pub fn frames(&self) -> usize {
        self.poses.dims()[0]
    }

    /// Image height.
    pub fn height(&self) -> usize {
        self.images.dims()[2]
    }

    /// Image width.
    pub fn width(&self) -> usize {
        self.images.dims()[3]
    }

    /// Camera baseline between frames `i` and `j`: the Euclidean distance
    /// between their ground-truth camera centers.
    pub fn baseline(&self, i: usize, j: usize) -> TrainResult<f64> {
        let ti = self.translation(i)?;
        let tj = self.translation(j)?;
        let d2: f64 = ti
            .iter()
            .zip(tj.iter())
            .map(|(a, b)| {
                let d = f64::from(a - b);
                d * d
            })
            .sum();
        Ok(d2.sqrt())
    }

    fn translation(&self, i: usize) -> TrainResult<Vec<f32>> {
        let row = self.poses.narrow(0, i, 1)?.squeeze(0)?;
        let row = row.narrow(0, 4, 3)?;
        Ok(row.to_vec1::<f32>()?)
    }
}

/// A source of frame batches.
///
/// Dataset reading and augmentation are external collaborators; this trait is
/// the seam they plug into. Implementations must be shareable across the
/// prefetch workers of one process.
pub trait FrameDataset: Send + Sync {
    /// Number of samples in the dataset.
    fn len(&self) -> usize;

    /// Whether the dataset is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialize the sample at `index` on `device`.
    fn sample(&self, index: usize, device: &Device) -> TrainResult<FrameBatch>;
}

/// Deterministic synthetic trajectory dataset for tests and the demo driver.
///
/// Each sample is generated from a per-index seed: a smooth forward
/// trajectory with small pose jitter, positive inverse depths and random
/// image content.
#[derive(Debug, Clone)]
pub struct SyntheticTrajectoryDataset {
    len: usize,
    frames: usize,
    height: usize,
    width: usize,
    seed: u64,
}

impl SyntheticTrajectoryDataset {
    pub fn new(len: usize, frames: usize, height: usize, width: usize, seed: u64) -> Self {
        Self {
            len,
            frames,
            height,
            width,
            seed,
        }
    }
}

impl FrameDataset for SyntheticTrajectoryDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn sample(&self, index: usize, device: &Device) -> TrainResult<FrameBatch> {
        if index >= self.len {
            return Err(TrainError::data(format!(
                "sample index {index} out of range for dataset of {}",
                self.len
            )));
        }
        let mut rng = StdRng::seed_from_u64(
            self.seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
        );
        let n = self.frames;
        let (h, w) = (self.height, self.width);

        let mut poses = Vec::with_capacity(n * 7);
        for k in 0..n {
            // Quaternion near identity, normalized.
            let jx = rng.gen_range(-0.05f32..0.05);
            let jy = rng.gen_range(-0.05f32..0.05);
            let jz = rng.gen_range(-0.05f32..0.05);
            let norm = (jx * jx + jy * jy + jz * jz + 1.0).sqrt();
            poses.extend_from_slice(&[jx / norm, jy / norm, jz / norm, 1.0 / norm]);
            // Forward motion along z with lateral jitter.
            poses.extend_from_slice(&[
                rng.gen_range(-0.02f32..0.02),
                rng.gen_range(-0.02f32..0.02),
                0.25 * k as f32 + rng.gen_range(-0.01f32..0.01),
            ]);
        }

        let images: Vec<f32> = (0..n * 3 * h * w).map(|_| rng.gen_range(0.0..1.0)).collect();
        let disps: Vec<f32> = (0..n * h * w).map(|_| rng.gen_range(0.5..1.5)).collect();
        let mut intrinsics = Vec::with_capacity(n * 4);
        for _ in 0..n {
            intrinsics.extend_from_slice(&[
                w as f32,
                w as f32,
                w as f32 / 2.0,
                h as f32 / 2.0,
            ]);
        }

        Ok(FrameBatch {
            images: Tensor::from_vec(images, (n, 3, h, w), device)?,
            poses: Tensor::from_vec(poses, (n, 7), device)?,
            disps: Tensor::from_vec(disps, (n, h, w), device)?,
            intrinsics: Tensor::from_vec(intrinsics, (n, 4), device)?,
        })
    }
}

/// Disjoint per-rank partitioning of dataset indices.
///
/// Each rank receives the strided slice `rank, rank + W, rank + 2W, ...` of
/// the epoch's index order, truncated to `floor(len / world_size)` entries so
/// every rank processes the same local count. When the dataset length is not
/// evenly divisible the tail is dropped; downstream averaging assumes the
/// resulting equal per-rank counts.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    world_size: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
}

impl DistributedSampler {
    pub fn new(len: usize, world_size: usize, rank: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            len,
            world_size,
            rank,
            shuffle,
            seed,
        }
    }

    /// Samples per rank per epoch. Identical on every rank by construction.
    pub fn local_len(&self) -> usize {
        self.len / self.world_size
    }

    /// Index order for this rank in the given epoch.
    pub fn epoch_indices(&self, epoch: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
        }
        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .take(self.local_len())
            .collect()
    }
}

struct LoaderState {
    queue: VecDeque<usize>,
    in_flight: usize,
}

/// Prefetching batch loader over one rank's partition.
///
/// A small fixed pool of worker threads pulls indices from the epoch queue,
/// materializes batches and parks them in a bounded buffer. Workers never
/// coordinate across processes. With `num_workers == 0` loading is
/// synchronous.
pub struct FrameLoader {
    dataset: Arc<dyn FrameDataset>,
    sampler: DistributedSampler,
    device: Device,
    num_workers: usize,
    buffer_capacity: usize,
    state: Arc<Mutex<LoaderState>>,
    buffer: Arc<Mutex<VecDeque<TrainResult<FrameBatch>>>>,
    stop_flag: Arc<Mutex<bool>>,
    workers: Vec<JoinHandle<()>>,
}

impl FrameLoader {
    pub fn new(
        dataset: Arc<dyn FrameDataset>,
        sampler: DistributedSampler,
        device: Device,
        num_workers: usize,
        prefetch_factor: usize,
    ) -> Self {
        let state = Arc::new(Mutex::new(LoaderState {
            queue: sampler.epoch_indices(0).into(),
            in_flight: 0,
        }));
        let mut loader = Self {
            dataset,
            sampler,
            device,
            num_workers,
            buffer_capacity: prefetch_factor.max(1) * num_workers.max(1),
            state,
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            stop_flag: Arc::new(Mutex::new(false)),
            workers: Vec::new(),
        };
        if loader.num_workers > 0 {
            loader.start_workers();
        }
        loader
    }

    /// Batches this loader will yield per epoch.
    pub fn batches_per_epoch(&self) -> usize {
        self.sampler.local_len()
    }

    fn start_workers(&mut self) {
        for _ in 0..self.num_workers {
            let dataset = Arc::clone(&self.dataset);
            let state = Arc::clone(&self.state);
            let buffer = Arc::clone(&self.buffer);
            let stop_flag = Arc::clone(&self.stop_flag);
            let device = self.device.clone();
            let capacity = self.buffer_capacity;

            let handle = thread::spawn(move || loop {
                if *stop_flag.lock().unwrap() {
                    break;
                }
                {
                    let buf = buffer.lock().unwrap();
                    if buf.len() >= capacity {
                        drop(buf);
                        thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                }
                let index = {
                    let mut st = state.lock().unwrap();
                    match st.queue.pop_front() {
                        Some(index) => {
                            st.in_flight += 1;
                            index
                        }
                        None => break,
                    }
                };
                let batch = dataset.sample(index, &device);
                {
                    let mut buf = buffer.lock().unwrap();
                    buf.push_back(batch);
                }
                state.lock().unwrap().in_flight -= 1;
            });
            self.workers.push(handle);
        }
    }

    fn next_batch(&mut self) -> Option<TrainResult<FrameBatch>> {
        if self.num_workers == 0 {
            let index = self.state.lock().unwrap().queue.pop_front()?;
            return Some(self.dataset.sample(index, &self.device));
        }
        loop {
            if let Some(batch) = self.buffer.lock().unwrap().pop_front() {
                return Some(batch);
            }
            {
                let st = self.state.lock().unwrap();
                if st.queue.is_empty() && st.in_flight == 0 && self.buffer.lock().unwrap().is_empty()
                {
                    return None;
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Restart the loader for a new epoch: stop workers, reshuffle this
    /// rank's partition and refill the prefetch pipeline.
    pub fn reset(&mut self, epoch: u64) {
        *self.stop_flag.lock().unwrap() = true;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.buffer.lock().unwrap().clear();
        {
            let mut st = self.state.lock().unwrap();
            st.queue = self.sampler.epoch_indices(epoch).into();
            st.in_flight = 0;
        }
        *self.stop_flag.lock().unwrap() = false;
        if self.num_workers > 0 {
            self.start_workers();
        }
    }
}

impl Iterator for FrameLoader {
    type Item = TrainResult<FrameBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}

impl Drop for FrameLoader {
    fn drop(&mut self) {
        *self.stop_flag.lock().unwrap() = true;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
