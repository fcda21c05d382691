//! Checkpointing.
//!
//! Rank 0 periodically serializes the full training state (config, model
//! weights, optimizer moments, schedule phase, global step) as gzip-packed
//! JSON. A restored checkpoint resumes the run exactly: same step counter,
//! same Adam moments, same learning-rate phase.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::TrainConfig;
use crate::error::{TrainError, TrainResult};
use crate::optim::{AdamState, OneCycleSchedule};

/// A tensor flattened for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorBlob {
    pub dims: Vec<usize>,
    pub values: Vec<f32>,
}

impl TensorBlob {
    pub fn from_tensor(tensor: &Tensor) -> TrainResult<Self> {
        Ok(Self {
            dims: tensor.dims().to_vec(),
            values: tensor.flatten_all()?.to_vec1::<f32>()?,
        })
    }

    pub fn to_tensor(&self, device: &Device) -> TrainResult<Tensor> {
        let expect: usize = self.dims.iter().product();
        if self.values.len() != expect {
            return Err(TrainError::checkpoint(format!(
                "tensor blob holds {} values for shape {:?}",
                self.values.len(),
                self.dims
            )));
        }
        Ok(Tensor::from_vec(self.values.clone(), self.dims.as_slice(), device)?)
    }
}

/// Snapshot every parameter of a [`VarMap`] by name.
pub fn capture_varmap(varmap: &VarMap) -> TrainResult<BTreeMap<String, TensorBlob>> {
    let data = varmap.data().lock().unwrap();
    let mut blobs = BTreeMap::new();
    for (name, var) in data.iter() {
        blobs.insert(name.clone(), TensorBlob::from_tensor(var.as_tensor())?);
    }
    Ok(blobs)
}

/// Write saved parameters back into a [`VarMap`]. Every live parameter must
/// be present in the snapshot with a matching shape.
pub fn restore_varmap(
    varmap: &VarMap,
    blobs: &BTreeMap<String, TensorBlob>,
    device: &Device,
) -> TrainResult<()> {
    let data = varmap.data().lock().unwrap();
    for (name, var) in data.iter() {
        let blob = blobs.get(name).ok_or_else(|| {
            TrainError::checkpoint(format!("parameter {name} missing from checkpoint"))
        })?;
        if blob.dims != var.dims() {
            return Err(TrainError::checkpoint(format!(
                "parameter {name}: saved shape {:?} vs live shape {:?}",
                blob.dims,
                var.dims()
            )));
        }
        var.set(&blob.to_tensor(device)?)?;
    }
    Ok(())
}

/// Complete resumable training state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainCheckpoint {
    pub run_id: String,
    pub experiment: String,
    pub step: usize,
    pub created_at: DateTime<Utc>,
    pub config: TrainConfig,
    pub model: BTreeMap<String, TensorBlob>,
    pub optimizer: AdamState,
    pub schedule: OneCycleSchedule,
}

impl TrainCheckpoint {
    /// File name this checkpoint saves under.
    pub fn filename(&self) -> String {
        format!("{}_{}_{:06}.ckpt.gz", self.run_id, self.experiment, self.step)
    }

    /// Serialize to gzip-packed JSON under `dir`, creating the directory if
    /// needed. Returns the written path.
    pub fn save(&self, dir: &Path) -> TrainResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.filename());
        let json = serde_json::to_vec(self)?;
        let file = File::create(&path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&json)?;
        encoder.finish()?;
        tracing::info!(step = self.step, path = %path.display(), "checkpoint written");
        Ok(path)
    }

    /// Load a checkpoint written by [`save`](Self::save).
    pub fn load(path: &Path) -> TrainResult<Self> {
        let file = File::open(path).map_err(|e| {
            TrainError::checkpoint(format!("cannot open {}: {e}", path.display()))
        })?;
        let mut decoder = GzDecoder::new(file);
        let mut json = Vec::new();
        decoder.read_to_end(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// Most recent checkpoint in `dir` by step number embedded in the file name,
/// if any exist.
pub fn latest_checkpoint(dir: &Path) -> TrainResult<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".ckpt.gz"))
        })
        .collect();
    candidates.sort();
    Ok(candidates.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::Adam;
    use candle_core::DType;
    use candle_nn::Init;

    fn checkpoint_fixture() -> TrainResult<TrainCheckpoint> {
        let varmap = VarMap::new();
        varmap.get((2, 3), "layer.weight", Init::Const(0.5), DType::F32, &Device::Cpu)?;
        varmap.get((3,), "layer.bias", Init::Const(-1.0), DType::F32, &Device::Cpu)?;
        let mut schedule = OneCycleSchedule::new(2.5e-4, 100);
        for _ in 0..12 {
            schedule.step();
        }
        Ok(TrainCheckpoint {
            run_id: "20260824_120000".to_string(),
            experiment: "unit".to_string(),
            step: 12,
            created_at: Utc::now(),
            config: TrainConfig::test(),
            model: capture_varmap(&varmap)?,
            optimizer: Adam::new(1e-3, 0.0).state()?,
            schedule,
        })
    }

    #[test]
    fn filename_embeds_identity_and_step() {
        let ckpt = checkpoint_fixture().unwrap();
        assert_eq!(ckpt.filename(), "20260824_120000_unit_000012.ckpt.gz");
    }

    #[test]
    fn save_load_round_trips_exact_state() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = checkpoint_fixture().unwrap();
        let path = ckpt.save(dir.path()).unwrap();
        assert!(path.exists());

        let back = TrainCheckpoint::load(&path).unwrap();
        assert_eq!(back.step, 12);
        assert_eq!(back.schedule, ckpt.schedule);
        assert_eq!(back.experiment, "unit");
        assert_eq!(
            back.model["layer.weight"].values,
            ckpt.model["layer.weight"].values
        );
        assert_eq!(back.config.frames, ckpt.config.frames);
    }

    #[test]
    fn restore_rewrites_live_parameters() {
        let ckpt = checkpoint_fixture().unwrap();
        let varmap = VarMap::new();
        let w = varmap
            .get((2, 3), "layer.weight", Init::Const(9.0), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
            .get((3,), "layer.bias", Init::Const(9.0), DType::F32, &Device::Cpu)
            .unwrap();
        restore_varmap(&varmap, &ckpt.model, &Device::Cpu).unwrap();
        let row = w.to_vec2::<f32>().unwrap();
        assert!(row.iter().flatten().all(|&x| (x - 0.5).abs() < 1e-7));
    }

    #[test]
    fn restore_rejects_shape_mismatch_and_missing() {
        let ckpt = checkpoint_fixture().unwrap();

        let varmap = VarMap::new();
        varmap
            .get((4, 3), "layer.weight", Init::Const(0.0), DType::F32, &Device::Cpu)
            .unwrap();
        assert!(restore_varmap(&varmap, &ckpt.model, &Device::Cpu).is_err());

        let varmap = VarMap::new();
        varmap
            .get((2,), "unknown", Init::Const(0.0), DType::F32, &Device::Cpu)
            .unwrap();
        assert!(restore_varmap(&varmap, &ckpt.model, &Device::Cpu).is_err());
    }

    #[test]
    fn latest_checkpoint_picks_highest_step() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_checkpoint(dir.path()).unwrap().is_none());

        let mut ckpt = checkpoint_fixture().unwrap();
        ckpt.save(dir.path()).unwrap();
        ckpt.step = 40;
        let newer = ckpt.save(dir.path()).unwrap();
        assert_eq!(latest_checkpoint(dir.path()).unwrap().unwrap(), newer);
    }
}
