//! Distributed coordinator: process group, collectives, device binding.
//!
//! One [`ProcessGroup`] handle per worker process (SPMD, one per accelerator).
//! The group supports the two collectives the orchestrator needs (a barrier
//! and a SUM all-reduce) plus a u64 broadcast used to distribute the shared
//! restart-decision seed from rank 0 at startup.
//!
//! Transport is an in-process fabric: worker threads acting as ranks share a
//! lock/condvar arena. Ranks rendezvous through the `MASTER_ADDR` /
//! `MASTER_PORT` environment variables so that [`ProcessGroup::init`] keeps
//! the contract of a networked process group. There is no cancellation or
//! timeout on collectives: if any rank diverges in collective call count the
//! remaining ranks block indefinitely, so callers must keep control flow
//! symmetric across ranks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex, OnceLock, Weak};

use candle_core::Device;

use crate::error::{TrainError, TrainResult};

/// Endpoint registry so that ranks joining through [`ProcessGroup::init`]
/// find the same fabric. Entries are weak: once every handle of a run is
/// dropped the fabric is gone and the endpoint can be reused.
static REGISTRY: OnceLock<Mutex<HashMap<String, Weak<Fabric>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Weak<Fabric>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReducePhase {
    Accumulating,
    Draining,
}

#[derive(Debug)]
struct ReduceSlot {
    phase: ReducePhase,
    buf: Vec<f64>,
    joined: usize,
    drained: usize,
}

/// Shared communication arena for one group of ranks.
#[derive(Debug)]
struct Fabric {
    world_size: usize,
    barrier: Barrier,
    reduce: Mutex<ReduceSlot>,
    reduce_cvar: Condvar,
    joined_ranks: Mutex<Vec<bool>>,
}

impl Fabric {
    fn new(world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            barrier: Barrier::new(world_size),
            reduce: Mutex::new(ReduceSlot {
                phase: ReducePhase::Accumulating,
                buf: Vec::new(),
                joined: 0,
                drained: 0,
            }),
            reduce_cvar: Condvar::new(),
            joined_ranks: Mutex::new(vec![false; world_size]),
        })
    }
}

/// Handle to the communication group held by one rank.
///
/// Cheap to move into the worker thread that owns the rank. Every collective
/// increments an observable counter so tests can assert that all ranks issue
/// the same number of synchronizing operations per step.
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    fabric: Arc<Fabric>,
    device: Device,
    collective_ops: AtomicU64,
}

impl ProcessGroup {
    /// Join the communication group for this process.
    ///
    /// Reads the rendezvous endpoint from `MASTER_ADDR` / `MASTER_PORT`,
    /// binds the calling rank to its accelerator device and registers the
    /// rank with the fabric. Must be called exactly once per rank before any
    /// other component operates; any error here is fatal for the process.
    pub fn init(rank: usize, world_size: usize) -> TrainResult<Self> {
        let addr = std::env::var("MASTER_ADDR")
            .map_err(|_| TrainError::distributed("MASTER_ADDR is not set"))?;
        let port = std::env::var("MASTER_PORT")
            .map_err(|_| TrainError::distributed("MASTER_PORT is not set"))?;
        let endpoint = format!("{addr}:{port}");

        let fabric = {
            let mut map = registry().lock().unwrap();
            match map.get(&endpoint).and_then(Weak::upgrade) {
                Some(fabric) => fabric,
                None => {
                    let fabric = Fabric::new(world_size);
                    map.insert(endpoint.clone(), Arc::downgrade(&fabric));
                    fabric
                }
            }
        };

        Self::join(rank, world_size, fabric)
    }

    /// Build a ready-made group of `world_size` handles sharing one fabric,
    /// bypassing the env rendezvous. Used by tests and the local SPMD driver.
    pub fn spawn_local(world_size: usize) -> TrainResult<Vec<Self>> {
        let fabric = Fabric::new(world_size);
        (0..world_size)
            .map(|rank| Self::join(rank, world_size, Arc::clone(&fabric)))
            .collect()
    }

    /// A single-process group. Collectives are no-ops up to bookkeeping.
    pub fn solo() -> TrainResult<Self> {
        Self::join(0, 1, Fabric::new(1))
    }

    fn join(rank: usize, world_size: usize, fabric: Arc<Fabric>) -> TrainResult<Self> {
        if world_size == 0 {
            return Err(TrainError::distributed("world_size must be >= 1"));
        }
        if rank >= world_size {
            return Err(TrainError::distributed(format!(
                "rank {rank} out of range for world_size {world_size}"
            )));
        }
        if fabric.world_size != world_size {
            return Err(TrainError::distributed(format!(
                "rank {rank} joined with world_size {world_size}, group expects {}",
                fabric.world_size
            )));
        }
        {
            let mut joined = fabric.joined_ranks.lock().unwrap();
            if joined[rank] {
                return Err(TrainError::distributed(format!(
                    "rank {rank} joined the group twice"
                )));
            }
            joined[rank] = true;
        }

        let device = bind_device(rank)?;
        tracing::info!(rank, world_size, "process group rank joined");
        Ok(Self {
            rank,
            world_size,
            fabric,
            device,
            collective_ops: AtomicU64::new(0),
        })
    }

    /// Rank of this process in `[0, world_size)`.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks in the group.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Whether this rank is the designated writer (lowest rank).
    pub fn is_lead(&self) -> bool {
        self.rank == 0
    }

    /// Device this rank is bound to.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of collectives issued by this rank so far.
    pub fn collective_ops(&self) -> u64 {
        self.collective_ops.load(Ordering::Relaxed)
    }

    /// Block until every rank reaches the barrier.
    pub fn barrier(&self) {
        self.collective_ops.fetch_add(1, Ordering::Relaxed);
        self.fabric.barrier.wait();
    }

    /// SUM all-reduce: on return, `data` on every rank holds the element-wise
    /// sum of all ranks' inputs. Every rank must pass a buffer of the same
    /// length; a mismatch aborts the collective on the offending rank.
    pub fn all_reduce_sum(&self, data: &mut [f64]) -> TrainResult<()> {
        self.collective_ops.fetch_add(1, Ordering::Relaxed);

        let fabric = &self.fabric;
        let mut slot = fabric.reduce.lock().unwrap();

        // A previous reduce may still be draining on slower ranks.
        while slot.phase != ReducePhase::Accumulating {
            slot = fabric.reduce_cvar.wait(slot).unwrap();
        }

        if slot.joined == 0 {
            slot.buf.clear();
            slot.buf.resize(data.len(), 0.0);
        } else if slot.buf.len() != data.len() {
            return Err(TrainError::distributed(format!(
                "all_reduce length mismatch on rank {}: {} vs {}",
                self.rank,
                data.len(),
                slot.buf.len()
            )));
        }
        for (acc, value) in slot.buf.iter_mut().zip(data.iter()) {
            *acc += *value;
        }
        slot.joined += 1;

        if slot.joined == self.world_size {
            slot.phase = ReducePhase::Draining;
            fabric.reduce_cvar.notify_all();
        } else {
            while slot.phase != ReducePhase::Draining {
                slot = fabric.reduce_cvar.wait(slot).unwrap();
            }
        }

        data.copy_from_slice(&slot.buf);
        slot.drained += 1;
        if slot.drained == self.world_size {
            slot.joined = 0;
            slot.drained = 0;
            slot.phase = ReducePhase::Accumulating;
            fabric.reduce_cvar.notify_all();
        }
        Ok(())
    }

    /// Broadcast a u64 from rank 0 to every rank.
    ///
    /// Built on the SUM reduce: only rank 0 contributes its value. Used once
    /// at startup to distribute the restart-decision seed so every rank draws
    /// the identical stream. Values must stay below 2^53 to survive the f64
    /// carrier exactly; seeds do.
    pub fn broadcast_u64(&self, value: u64) -> TrainResult<u64> {
        let mut buf = [if self.rank == 0 { value as f64 } else { 0.0 }];
        self.all_reduce_sum(&mut buf)?;
        Ok(buf[0] as u64)
    }

    /// Leave the group. Must happen-after all in-flight collectives; the
    /// closing barrier enforces that ordering across ranks.
    pub fn shutdown(&self) {
        self.fabric.barrier.wait();
        tracing::info!(rank = self.rank, "process group rank shut down");
    }
}

/// Bind a rank to its accelerator device.
#[cfg(feature = "cuda")]
fn bind_device(rank: usize) -> TrainResult<Device> {
    Device::new_cuda(rank).map_err(|e| {
        TrainError::distributed(format!("failed to bind cuda device {rank}: {e}"))
    })
}

/// Bind a rank to its accelerator device (CPU build: all ranks share the host).
#[cfg(not(feature = "cuda"))]
fn bind_device(_rank: usize) -> TrainResult<Device> {
    Ok(Device::Cpu)
}
