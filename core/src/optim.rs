/// Grouped SGD with momentum, step learning-rate decay and per-group
/// multipliers.
///
/// The optimizer never names parameters. It walks the model's structural
/// enumeration and derives each tensor's effective learning rate from its
/// (block, kind) tag: effective_lr = lr * multiplier(block, kind) * decay.
/// Weight decay applies to weight tensors only. Velocity buffers are kept
/// per tensor in enumeration order and serialize with the checkpoint.

use serde::{Deserialize, Serialize};

use crate::model::{decays, lr_multiplier, MsNetParams};

/// Hyperparameters, fixed for a training run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SgdConfig {
    /// Base learning rate before group multipliers and decay.
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    /// Epochs between learning-rate decays.
    pub stepsize: usize,
    /// Multiplicative decay applied every `stepsize` epochs.
    pub gamma: f32,
}

impl SgdConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.lr <= 0.0 {
            return Err("lr must be > 0".into());
        }
        if self.stepsize == 0 {
            return Err("stepsize must be >= 1".into());
        }
        if self.gamma <= 0.0 {
            return Err("gamma must be > 0".into());
        }
        Ok(())
    }
}

/// Serializable optimizer state: one velocity buffer per parameter tensor,
/// in the model's enumeration order, plus the epoch counter that drives the
/// step decay schedule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SgdState {
    pub velocity: Vec<Vec<f32>>,
    pub epochs_seen: usize,
}

/// The optimizer. Owns its state; hyperparameters are immutable.
pub struct GroupedSgd {
    cfg: SgdConfig,
    state: SgdState,
}

impl GroupedSgd {
    /// Fresh optimizer with zeroed velocity shaped after `params`.
    pub fn new(cfg: SgdConfig, params: &MsNetParams) -> Self {
        let velocity = params
            .tensors()
            .iter()
            .map(|(_, _, t)| vec![0.0f32; t.len()])
            .collect();
        GroupedSgd {
            cfg,
            state: SgdState {
                velocity,
                epochs_seen: 0,
            },
        }
    }

    /// Step-decay factor for the current epoch: gamma^(epochs_seen / stepsize).
    pub fn decay_factor(&self) -> f32 {
        let steps = (self.state.epochs_seen / self.cfg.stepsize) as i32;
        self.cfg.gamma.powi(steps)
    }

    /// Decayed base learning rate, before group multipliers. Logged once per
    /// epoch by the trainer.
    pub fn current_lr(&self) -> f32 {
        self.cfg.lr * self.decay_factor()
    }

    /// One SGD step: v = momentum * v + (g + wd * w); w -= effective_lr * v.
    /// Weight decay is skipped for bias tensors.
    pub fn step(&mut self, params: &mut MsNetParams, grads: &MsNetParams) {
        let decayed = self.cfg.lr * self.decay_factor();
        let g_list = grads.tensors();
        let p_list = params.tensors_mut();
        assert_eq!(p_list.len(), g_list.len(), "gradient layout mismatch");
        assert_eq!(p_list.len(), self.state.velocity.len(), "velocity layout mismatch");

        for (((block, kind, w), (_, _, g)), v) in p_list
            .into_iter()
            .zip(g_list.into_iter())
            .zip(self.state.velocity.iter_mut())
        {
            assert_eq!(w.len(), g.len(), "gradient tensor length mismatch");
            let eff_lr = decayed * lr_multiplier(block, kind);
            let wd = if decays(kind) { self.cfg.weight_decay } else { 0.0 };
            for ((wi, &gi), vi) in w.iter_mut().zip(g.iter()).zip(v.iter_mut()) {
                *vi = self.cfg.momentum * *vi + gi + wd * *wi;
                *wi -= eff_lr * *vi;
            }
        }
    }

    /// Advance the decay schedule. Called once at the end of each epoch.
    pub fn end_epoch(&mut self) {
        self.state.epochs_seen += 1;
    }

    pub fn epochs_seen(&self) -> usize {
        self.state.epochs_seen
    }

    pub fn state(&self) -> &SgdState {
        &self.state
    }

    /// Restore optimizer state from a checkpoint. Velocity layout must match
    /// the current parameter enumeration exactly.
    pub fn load_state(&mut self, state: SgdState, params: &MsNetParams) -> Result<(), String> {
        let layout: Vec<usize> = params.tensors().iter().map(|(_, _, t)| t.len()).collect();
        if state.velocity.len() != layout.len() {
            return Err(format!(
                "optimizer state has {} velocity buffers, model has {} tensors",
                state.velocity.len(),
                layout.len()
            ));
        }
        for (i, (v, &len)) in state.velocity.iter().zip(layout.iter()).enumerate() {
            if v.len() != len {
                return Err(format!(
                    "velocity buffer {i} has {} elements, tensor has {len}",
                    v.len()
                ));
            }
        }
        self.state = state;
        Ok(())
    }
}
