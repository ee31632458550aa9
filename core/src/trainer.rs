/// Training loop: gradient accumulation, grouped SGD, per-epoch checkpoints
/// and periodic visualization.
///
/// The loop mirrors the update discipline exactly: per-batch loss is scaled
/// by 1/itersize, gradients accumulate across `itersize` batches, and the
/// optimizer steps once per full cycle. A non-finite loss is reported and
/// poisons the current cycle (the step is skipped, the buffer cleared) but
/// never corrupts the counter or later cycles.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bilinear::KernelCache;
use crate::forward::{msnet_forward, ForwardError, FusionMode};
use crate::loss::multiscale_edge_loss;
use crate::model::{
    load_checkpoint, load_encoder_pretrained, save_checkpoint, Checkpoint, CheckpointError,
    MsNetConfig, MsNetParams, PretrainError,
};
use crate::optim::{GroupedSgd, SgdConfig};
use crate::tensor::Tensor;

// ── Configuration ────────────────────────────────────────────────────

/// Run configuration, typically deserialized from a JSON file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub max_epoch: usize,
    /// Batches per optimizer step (gradient accumulation).
    pub itersize: usize,
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    pub stepsize: usize,
    pub gamma: f32,
    /// Directory receiving per-epoch checkpoint files.
    pub checkpoint_dir: PathBuf,
    /// Optional pretrained encoder weights (JSON).
    pub pretrained_path: Option<PathBuf>,
    /// Optional checkpoint to resume from.
    pub resume_path: Option<PathBuf>,
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be >= 1".into());
        }
        if self.max_epoch == 0 {
            return Err("max_epoch must be >= 1".into());
        }
        if self.itersize == 0 {
            return Err("itersize must be >= 1".into());
        }
        self.sgd().validate()
    }

    fn sgd(&self) -> SgdConfig {
        SgdConfig {
            lr: self.lr,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
            stepsize: self.stepsize,
            gamma: self.gamma,
        }
    }
}

// ── Data and metric seams ────────────────────────────────────────────

/// One training batch. `wavelet_weights` presence toggles the fusion
/// cascade for the batch; its contents are advisory side data.
#[derive(Clone, Debug)]
pub struct Batch {
    /// Input images [n, c, h, w].
    pub image: Tensor,
    /// Edge labels [n, 1, h, w] in [0, 1].
    pub mask: Tensor,
    /// Sample identifier for logging.
    pub id: String,
    pub wavelet_weights: Option<Tensor>,
}

/// Batch provider. One epoch is one `reset` followed by draining
/// `next_batch` until `None`.
pub trait DataSource {
    /// Batches per epoch.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn reset(&mut self);
    fn next_batch(&mut self) -> Option<Batch>;
}

/// Scalar / image metric recorder. Failures are reported by the trainer
/// but never abort training.
pub trait MetricSink {
    fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> std::io::Result<()>;
    fn add_images(&mut self, tag: &str, images: &Tensor, step: usize) -> std::io::Result<()>;
}

/// Sink that drops everything.
pub struct NullSink;

impl MetricSink for NullSink {
    fn add_scalar(&mut self, _tag: &str, _value: f32, _step: usize) -> std::io::Result<()> {
        Ok(())
    }
    fn add_images(&mut self, _tag: &str, _images: &Tensor, _step: usize) -> std::io::Result<()> {
        Ok(())
    }
}

// ── Accumulation state machine ───────────────────────────────────────

/// What to do after recording a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepDecision {
    /// Keep accumulating gradients.
    Accumulate,
    /// Cycle complete: apply the optimizer step and clear the buffer.
    Step,
}

/// Bookkeeping for the accumulation cycle. The only transition is
/// `record_batch`, so the counter can never drift from the step count:
/// `global_step` advances exactly once per `itersize` batches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Optimizer steps completed across all epochs.
    pub global_step: usize,
    /// Batches accumulated in the current cycle.
    pub accumulation_counter: usize,
    pub epoch: usize,
}

impl TrainingState {
    pub fn record_batch(&mut self, itersize: usize) -> StepDecision {
        self.accumulation_counter += 1;
        if self.accumulation_counter >= itersize {
            self.accumulation_counter = 0;
            self.global_step += 1;
            StepDecision::Step
        } else {
            StepDecision::Accumulate
        }
    }
}

/// Running average for epoch-level loss reporting.
#[derive(Clone, Debug, Default)]
pub struct AvgMeter {
    sum: f64,
    count: usize,
}

impl AvgMeter {
    pub fn update(&mut self, value: f32) {
        self.sum += value as f64;
        self.count += 1;
    }

    pub fn avg(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum / self.count as f64) as f32
        }
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum TrainerError {
    Config(String),
    Forward(ForwardError),
    Checkpoint(CheckpointError),
    Pretrain(PretrainError),
    /// A batch whose buffers disagree with the declared shapes.
    BadBatch { id: String, detail: String },
}

impl std::fmt::Display for TrainerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainerError::Config(e) => write!(f, "invalid configuration: {e}"),
            TrainerError::Forward(e) => write!(f, "forward pass failed: {e}"),
            TrainerError::Checkpoint(e) => write!(f, "checkpoint error: {e}"),
            TrainerError::Pretrain(e) => write!(f, "pretrained weights error: {e}"),
            TrainerError::BadBatch { id, detail } => {
                write!(f, "malformed batch {id}: {detail}")
            }
        }
    }
}

impl std::error::Error for TrainerError {}

impl From<ForwardError> for TrainerError {
    fn from(e: ForwardError) -> Self {
        TrainerError::Forward(e)
    }
}

impl From<CheckpointError> for TrainerError {
    fn from(e: CheckpointError) -> Self {
        TrainerError::Checkpoint(e)
    }
}

impl From<PretrainError> for TrainerError {
    fn from(e: PretrainError) -> Self {
        TrainerError::Pretrain(e)
    }
}

// ── Trainer ──────────────────────────────────────────────────────────

/// Owns the parameters, the optimizer, the accumulation buffer and the
/// bilinear kernel cache for the lifetime of a run.
pub struct Trainer {
    pub cfg: TrainerConfig,
    pub model_cfg: MsNetConfig,
    pub params: MsNetParams,
    opt: GroupedSgd,
    kernels: KernelCache,
    accum: MsNetParams,
    pub state: TrainingState,
    /// Average training loss per completed epoch.
    pub loss_history: Vec<f32>,
    /// A non-finite loss occurred in the current accumulation cycle.
    cycle_tainted: bool,
}

impl Trainer {
    /// Build a trainer: validate config, initialize (or resume) parameters,
    /// optionally overlay pretrained encoder weights.
    pub fn new(model_cfg: MsNetConfig, cfg: TrainerConfig) -> Result<Self, TrainerError> {
        model_cfg.validate().map_err(TrainerError::Config)?;
        cfg.validate().map_err(TrainerError::Config)?;
        std::fs::create_dir_all(&cfg.checkpoint_dir)
            .map_err(|e| TrainerError::Checkpoint(CheckpointError::Io(e)))?;

        let mut params = MsNetParams::init(&model_cfg, model_cfg.seed);
        let mut opt = GroupedSgd::new(cfg.sgd(), &params);
        let mut state = TrainingState::default();

        if let Some(path) = &cfg.resume_path {
            let ckpt = load_checkpoint(path, &model_cfg)?;
            log::info!("resuming from {} at epoch {}", path.display(), ckpt.epoch);
            params = ckpt.params;
            opt.load_state(ckpt.optimizer, &params)
                .map_err(TrainerError::Config)?;
            state.epoch = ckpt.epoch;
        } else if let Some(path) = &cfg.pretrained_path {
            load_encoder_pretrained(&mut params, path)?;
            log::info!("loaded pretrained encoder from {}", path.display());
        }

        let accum = params.zeros_like();
        Ok(Trainer {
            cfg,
            model_cfg,
            params,
            opt,
            kernels: KernelCache::new(),
            accum,
            state,
            loss_history: Vec::new(),
            cycle_tainted: false,
        })
    }

    fn batch_dims(&self, batch: &Batch) -> Result<(usize, usize, usize), TrainerError> {
        let shape = &batch.image.shape;
        if shape.len() != 4 || shape[1] != self.model_cfg.in_channels {
            return Err(TrainerError::BadBatch {
                id: batch.id.clone(),
                detail: format!("image shape {shape:?}"),
            });
        }
        let (n, h, w) = (shape[0], shape[2], shape[3]);
        if batch.mask.data.len() != n * h * w {
            return Err(TrainerError::BadBatch {
                id: batch.id.clone(),
                detail: format!(
                    "mask has {} elements for a {n}x{h}x{w} batch",
                    batch.mask.data.len()
                ),
            });
        }
        Ok((n, h, w))
    }

    /// Run one epoch. Returns the average (itersize-scaled) batch loss.
    pub fn train_epoch(
        &mut self,
        data: &mut dyn DataSource,
        sink: &mut dyn MetricSink,
    ) -> Result<f32, TrainerError> {
        data.reset();
        let num_batches = data.len();
        let viz_interval = (num_batches / 10).max(1);
        let mut meter = AvgMeter::default();
        let inv_itersize = 1.0 / self.cfg.itersize as f32;

        while let Some(batch) = data.next_batch() {
            let (n, h, w) = self.batch_dims(&batch)?;
            let mode = FusionMode::from_batch(batch.wavelet_weights.is_some());

            let (outputs, cache) = msnet_forward(
                &self.params,
                &self.model_cfg,
                &batch.image.data,
                n,
                h,
                w,
                mode,
                &mut self.kernels,
            )?;

            let (raw_loss, mut d_logits) =
                multiscale_edge_loss(&outputs.maps, &batch.mask.data, n, h, w);
            let loss = raw_loss * inv_itersize;

            if loss.is_finite() {
                for d in d_logits.iter_mut() {
                    for v in d.iter_mut() {
                        *v *= inv_itersize;
                    }
                }
                let grads = crate::backward::msnet_backward(
                    &self.params,
                    &self.model_cfg,
                    &cache,
                    &d_logits,
                    &mut self.kernels,
                );
                self.accum.accumulate(&grads);
                meter.update(loss);
            } else {
                log::error!(
                    "non-finite loss on batch {} at step {}, skipping its gradient",
                    batch.id,
                    self.state.global_step
                );
                self.cycle_tainted = true;
            }

            match self.state.record_batch(self.cfg.itersize) {
                StepDecision::Accumulate => {}
                StepDecision::Step => {
                    if self.cycle_tainted {
                        log::warn!(
                            "skipping optimizer step at {} after non-finite loss",
                            self.state.global_step
                        );
                    } else {
                        self.opt.step(&mut self.params, &self.accum);
                    }
                    self.accum.zero();
                    self.cycle_tainted = false;
                }
            }

            if loss.is_finite() {
                if let Err(e) = sink.add_scalar("loss/train", loss, self.state.global_step) {
                    log::warn!("metric sink rejected scalar: {e}");
                }
            }

            if self.state.global_step % viz_interval == 0 {
                self.visualize(sink, &batch, &outputs.maps[5], n, h, w);
            }
        }

        // A partial cycle at the epoch boundary is discarded, never stepped.
        if self.state.accumulation_counter > 0 {
            log::debug!(
                "dropping {} accumulated batch gradients at epoch boundary",
                self.state.accumulation_counter
            );
            self.state.accumulation_counter = 0;
            self.accum.zero();
            self.cycle_tainted = false;
        }

        self.opt.end_epoch();
        self.state.epoch += 1;

        let avg = meter.avg();
        self.loss_history.push(avg);
        if let Err(e) = sink.add_scalar("loss/avg", avg, self.state.epoch) {
            log::warn!("metric sink rejected scalar: {e}");
        }
        if let Err(e) = sink.add_scalar("learning_rate", self.opt.current_lr(), self.state.epoch) {
            log::warn!("metric sink rejected scalar: {e}");
        }

        let path = self
            .cfg
            .checkpoint_dir
            .join(format!("checkpoint_epoch{}.json", self.state.epoch));
        self.save(&path)?;
        log::info!(
            "epoch {} done: avg loss {:.6}, lr {:.6}, checkpoint {}",
            self.state.epoch,
            avg,
            self.opt.current_lr(),
            path.display()
        );

        Ok(avg)
    }

    fn visualize(
        &self,
        sink: &mut dyn MetricSink,
        batch: &Batch,
        fused: &[f32],
        n: usize,
        h: usize,
        w: usize,
    ) {
        let step = self.state.global_step;
        let pred: Vec<f32> = fused
            .iter()
            .map(|&p| if p > 0.5 { 1.0 } else { 0.0 })
            .collect();
        let pred = Tensor::from_vec(pred, &[n, 1, h, w]);
        for (tag, img) in [
            ("images", &batch.image),
            ("masks/true", &batch.mask),
            ("masks/pred", &pred),
        ] {
            if let Err(e) = sink.add_images(tag, img, step) {
                log::warn!("metric sink rejected images for {tag}: {e}");
            }
        }
    }

    /// Forward-only pass over a dataset, emitting the fused probability map
    /// and its inversion for inspection.
    pub fn evaluate(
        &mut self,
        data: &mut dyn DataSource,
        sink: &mut dyn MetricSink,
    ) -> Result<(), TrainerError> {
        data.reset();
        let mut step = 0usize;
        while let Some(batch) = data.next_batch() {
            let (n, h, w) = self.batch_dims(&batch)?;
            let mode = FusionMode::from_batch(batch.wavelet_weights.is_some());
            let (outputs, _) = msnet_forward(
                &self.params,
                &self.model_cfg,
                &batch.image.data,
                n,
                h,
                w,
                mode,
                &mut self.kernels,
            )?;
            let fuse = &outputs.maps[5];
            let inverted: Vec<f32> = fuse.iter().map(|&p| 1.0 - p).collect();
            let fuse_t = Tensor::from_vec(fuse.clone(), &[n, 1, h, w]);
            let inv_t = Tensor::from_vec(inverted, &[n, 1, h, w]);
            if let Err(e) = sink.add_images("eval/fuse", &fuse_t, step) {
                log::warn!("metric sink rejected eval images: {e}");
            }
            if let Err(e) = sink.add_images("eval/fuse_inverted", &inv_t, step) {
                log::warn!("metric sink rejected eval images: {e}");
            }
            step += 1;
        }
        Ok(())
    }

    /// Snapshot the full training state to `path` atomically.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let ckpt = Checkpoint {
            epoch: self.state.epoch,
            params: self.params.clone(),
            optimizer: self.opt.state().clone(),
        };
        save_checkpoint(path, &ckpt)
    }

    pub fn current_lr(&self) -> f32 {
        self.opt.current_lr()
    }
}
