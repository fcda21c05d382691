//! Gradient accumulation, clipping, optimizer and learning-rate schedule.
//!
//! Gradients accumulate across the refinement rounds of one outer step and
//! are synchronized across ranks once per round with a single flattened SUM
//! all-reduce. After the last round the manager clips the global norm,
//! applies one Adam step and advances the one-cycle schedule exactly once,
//! regardless of how many rounds executed.

use std::collections::{BTreeMap, HashMap};

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::checkpoint::TensorBlob;
use crate::distributed::ProcessGroup;
use crate::error::{TrainError, TrainResult};

/// Cross-round gradient accumulator keyed by parameter name.
///
/// Cleared exactly once per outer step, after the optimizer update, never
/// between rounds.
#[derive(Debug, Default)]
pub struct GradAccumulator {
    grads: HashMap<String, Tensor>,
    sync_calls: u64,
}

impl GradAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronize one round's gradients across ranks and fold them into the
    /// accumulator.
    ///
    /// All parameters are flattened into a single buffer in sorted name
    /// order, so every rank issues exactly one collective per round; the
    /// reduced sum is divided by the world size (gradient averaging).
    /// Parameters without a gradient this round contribute zeros, keeping
    /// buffer layouts identical across ranks.
    pub fn sync_and_absorb(
        &mut self,
        varmap: &VarMap,
        grads: &GradStore,
        group: &ProcessGroup,
    ) -> TrainResult<()> {
        // (name, shape, device, values) per parameter, sorted by name.
        let mut segments: Vec<(String, Vec<usize>, Device, Vec<f32>)> = Vec::new();
        {
            let data = varmap.data().lock().unwrap();
            let mut names: Vec<&String> = data.keys().collect();
            names.sort();
            for name in names {
                let var = &data[name.as_str()];
                let values = match grads.get(var) {
                    Some(grad) => grad.flatten_all()?.to_vec1::<f32>()?,
                    None => vec![0.0; var.elem_count()],
                };
                segments.push((
                    name.clone(),
                    var.dims().to_vec(),
                    var.device().clone(),
                    values,
                ));
            }
        }

        let mut flat: Vec<f64> = segments
            .iter()
            .flat_map(|(_, _, _, values)| values.iter().map(|&v| f64::from(v)))
            .collect();
        group.all_reduce_sum(&mut flat)?;
        self.sync_calls += 1;

        let scale = 1.0 / group.world_size() as f64;
        let mut offset = 0;
        for (name, shape, device, values) in segments {
            let len = values.len();
            let reduced: Vec<f32> = flat[offset..offset + len]
                .iter()
                .map(|&v| (v * scale) as f32)
                .collect();
            offset += len;
            let tensor = Tensor::from_vec(reduced, shape, &device)?;
            match self.grads.remove(&name) {
                Some(existing) => {
                    self.grads.insert(name, (existing + tensor)?);
                }
                None => {
                    self.grads.insert(name, tensor);
                }
            }
        }
        Ok(())
    }

    /// Number of gradient-synchronization collectives issued so far.
    pub fn sync_calls(&self) -> u64 {
        self.sync_calls
    }

    /// Accumulated gradient for a parameter.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.grads.get(name)
    }

    /// Whether anything has been accumulated this step.
    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Global gradient norm across all accumulated parameters.
    pub fn global_norm(&self) -> TrainResult<f64> {
        let mut total = 0.0f64;
        for grad in self.grads.values() {
            total += f64::from(grad.sqr()?.sum_all()?.to_scalar::<f32>()?);
        }
        Ok(total.sqrt())
    }

    /// Clip the global norm to `max`, scaling every gradient uniformly.
    /// Returns the pre-clip norm.
    pub fn clip_global_norm(&mut self, max: f64) -> TrainResult<f64> {
        let norm = self.global_norm()?;
        if norm > max && norm > 0.0 {
            let scale = max / norm;
            for grad in self.grads.values_mut() {
                *grad = (grad.clone() * scale)?;
            }
        }
        Ok(norm)
    }

    /// Drop all accumulated gradients. Called once per outer step, after the
    /// optimizer update.
    pub fn clear(&mut self) {
        self.grads.clear();
    }
}

/// Serialized Adam state for checkpointing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamState {
    pub t: usize,
    pub m: BTreeMap<String, TensorBlob>,
    pub v: BTreeMap<String, TensorBlob>,
}

/// Adam over the parameters of a [`VarMap`], with weight decay folded into
/// the gradient.
#[derive(Debug)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    m: HashMap<String, Tensor>,
    v: HashMap<String, Tensor>,
    t: usize,
}

impl Adam {
    pub fn new(lr: f64, weight_decay: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay,
            m: HashMap::new(),
            v: HashMap::new(),
            t: 0,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Apply one update using the accumulated gradients.
    pub fn step(&mut self, varmap: &VarMap, grads: &GradAccumulator) -> TrainResult<()> {
        if grads.is_empty() {
            return Err(TrainError::training(
                "optimizer step with no accumulated gradients",
            ));
        }
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        let data = varmap.data().lock().unwrap();
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();

        for name in names {
            let var = &data[name.as_str()];
            let Some(grad) = grads.get(name) else {
                continue;
            };
            let grad = if self.weight_decay > 0.0 {
                (grad + (var.as_tensor() * self.weight_decay)?)?
            } else {
                grad.clone()
            };

            let m_prev = match self.m.get(name.as_str()) {
                Some(m) => m.clone(),
                None => grad.zeros_like()?,
            };
            let v_prev = match self.v.get(name.as_str()) {
                Some(v) => v.clone(),
                None => grad.zeros_like()?,
            };

            let m_new = ((m_prev * self.beta1)? + (&grad * (1.0 - self.beta1))?)?;
            let v_new = ((v_prev * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

            let m_hat = (&m_new / bc1)?;
            let v_hat = (&v_new / bc2)?;
            let denom = (v_hat.sqrt()? + self.eps)?;
            let update = ((m_hat / denom)? * self.lr)?;

            var.set(&(var.as_tensor() - update)?)?;
            self.m.insert(name.clone(), m_new);
            self.v.insert(name.clone(), v_new);
        }
        Ok(())
    }

    /// Snapshot the optimizer state for checkpointing.
    pub fn state(&self) -> TrainResult<AdamState> {
        let mut m = BTreeMap::new();
        let mut v = BTreeMap::new();
        for (name, tensor) in &self.m {
            m.insert(name.clone(), TensorBlob::from_tensor(tensor)?);
        }
        for (name, tensor) in &self.v {
            v.insert(name.clone(), TensorBlob::from_tensor(tensor)?);
        }
        Ok(AdamState { t: self.t, m, v })
    }

    /// Restore the optimizer state from a checkpoint.
    pub fn load_state(&mut self, state: &AdamState, device: &Device) -> TrainResult<()> {
        self.t = state.t;
        self.m.clear();
        self.v.clear();
        for (name, blob) in &state.m {
            self.m.insert(name.clone(), blob.to_tensor(device)?);
        }
        for (name, blob) in &state.v {
            self.v.insert(name.clone(), blob.to_tensor(device)?);
        }
        Ok(())
    }

    /// First-moment estimate for a parameter (test/inspection hook).
    pub fn first_moment(&self, name: &str) -> Option<&Tensor> {
        self.m.get(name)
    }
}

/// One-cycle learning-rate schedule: cosine warmup to the peak over
/// `pct_start` of the run, then cosine anneal to a small floor. Advanced by
/// exactly one step per outer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneCycleSchedule {
    max_lr: f64,
    total_steps: usize,
    pct_start: f64,
    div_factor: f64,
    final_div_factor: f64,
    step_count: usize,
}

impl OneCycleSchedule {
    pub fn new(max_lr: f64, total_steps: usize) -> Self {
        Self {
            max_lr,
            total_steps: total_steps.max(1),
            pct_start: 0.01,
            div_factor: 25.0,
            final_div_factor: 1e4,
            step_count: 0,
        }
    }

    fn warmup_steps(&self) -> usize {
        ((self.total_steps as f64 * self.pct_start).ceil() as usize).max(1)
    }

    /// Learning rate at the current phase.
    pub fn lr(&self) -> f64 {
        use std::f64::consts::PI;
        let initial = self.max_lr / self.div_factor;
        let floor = self.max_lr / self.final_div_factor;
        let warmup = self.warmup_steps();
        if self.step_count < warmup {
            let progress = self.step_count as f64 / warmup as f64;
            initial + (self.max_lr - initial) * 0.5 * (1.0 - (PI * progress).cos())
        } else {
            let span = (self.total_steps - warmup).max(1);
            let progress = ((self.step_count - warmup) as f64 / span as f64).min(1.0);
            floor + (self.max_lr - floor) * 0.5 * (1.0 + (PI * progress).cos())
        }
    }

    /// Advance the schedule by one outer step.
    pub fn step(&mut self) {
        self.step_count += 1;
    }

    /// Steps taken so far (the schedule phase).
    pub fn step_count(&self) -> usize {
        self.step_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::Init;

    fn one_var_map(value: f64) -> (VarMap, Tensor) {
        let varmap = VarMap::new();
        let w = varmap
            .get((2,), "w", Init::Const(value), DType::F32, &Device::Cpu)
            .unwrap();
        (varmap, w)
    }

    fn backward_of_square(w: &Tensor) -> GradStore {
        // d/dw sum(w^2) = 2w
        w.sqr().unwrap().sum_all().unwrap().backward().unwrap()
    }

    #[test]
    fn accumulator_sums_rounds() {
        let (varmap, w) = one_var_map(3.0);
        let group = ProcessGroup::solo().unwrap();
        let mut acc = GradAccumulator::new();

        acc.sync_and_absorb(&varmap, &backward_of_square(&w), &group)
            .unwrap();
        acc.sync_and_absorb(&varmap, &backward_of_square(&w), &group)
            .unwrap();

        // Two rounds of grad 2*3 = 6 accumulate to 12 per element.
        let grad = acc.get("w").unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(grad, vec![12.0, 12.0]);
        assert_eq!(acc.sync_calls(), 2);
        assert_eq!(group.collective_ops(), 2);
    }

    #[test]
    fn clip_scales_to_threshold() {
        let (varmap, w) = one_var_map(3.0);
        let group = ProcessGroup::solo().unwrap();
        let mut acc = GradAccumulator::new();
        acc.sync_and_absorb(&varmap, &backward_of_square(&w), &group)
            .unwrap();

        // Norm of [6, 6] is 6*sqrt(2) ~ 8.485.
        let norm = acc.clip_global_norm(1.0).unwrap();
        assert!((norm - 72.0f64.sqrt()).abs() < 1e-4);
        assert!((acc.global_norm().unwrap() - 1.0).abs() < 1e-4);

        // Below-threshold norms are untouched.
        let before = acc.global_norm().unwrap();
        let reported = acc.clip_global_norm(10.0).unwrap();
        assert!((reported - before).abs() < 1e-9);
    }

    #[test]
    fn adam_moves_params_against_gradient() {
        let (varmap, w) = one_var_map(3.0);
        let group = ProcessGroup::solo().unwrap();
        let mut acc = GradAccumulator::new();
        acc.sync_and_absorb(&varmap, &backward_of_square(&w), &group)
            .unwrap();

        let mut adam = Adam::new(0.1, 0.0);
        adam.step(&varmap, &acc).unwrap();

        let updated = w.to_vec1::<f32>().unwrap();
        assert!(updated.iter().all(|&x| x < 3.0));
        assert!(adam.first_moment("w").is_some());
    }

    #[test]
    fn adam_rejects_empty_accumulator() {
        let (varmap, _w) = one_var_map(1.0);
        let mut adam = Adam::new(0.1, 0.0);
        assert!(adam.step(&varmap, &GradAccumulator::new()).is_err());
    }

    #[test]
    fn adam_state_round_trips() {
        let (varmap, w) = one_var_map(2.0);
        let group = ProcessGroup::solo().unwrap();
        let mut acc = GradAccumulator::new();
        acc.sync_and_absorb(&varmap, &backward_of_square(&w), &group)
            .unwrap();
        let mut adam = Adam::new(0.05, 0.0);
        adam.step(&varmap, &acc).unwrap();

        let state = adam.state().unwrap();
        let mut restored = Adam::new(0.05, 0.0);
        restored.load_state(&state, &Device::Cpu).unwrap();
        assert_eq!(
            restored.first_moment("w").unwrap().to_vec1::<f32>().unwrap(),
            adam.first_moment("w").unwrap().to_vec1::<f32>().unwrap()
        );
        assert_eq!(restored.state().unwrap().t, 1);
    }

    #[test]
    fn schedule_warms_up_then_anneals() {
        let mut schedule = OneCycleSchedule::new(1e-3, 1000);
        let start_lr = schedule.lr();
        assert!(start_lr < 1e-3 / 10.0);

        for _ in 0..schedule.warmup_steps() {
            schedule.step();
        }
        let peak_lr = schedule.lr();
        assert!((peak_lr - 1e-3).abs() / 1e-3 < 0.01);

        for _ in schedule.step_count()..1000 {
            schedule.step();
        }
        let end_lr = schedule.lr();
        assert!(end_lr < start_lr);
        assert_eq!(schedule.step_count(), 1000);
    }

    #[test]
    fn schedule_serde_preserves_phase() {
        let mut schedule = OneCycleSchedule::new(2.5e-4, 100);
        for _ in 0..7 {
            schedule.step();
        }
        let json = serde_json::to_string(&schedule).unwrap();
        let back: OneCycleSchedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schedule);
        assert_eq!(back.step_count(), 7);
        assert_eq!(back.lr(), schedule.lr());
    }
}
