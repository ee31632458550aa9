/// Model configuration and parameters for the multiscale edge detector.
///
/// Five-stage convolutional encoder (VGG-style: 2,2,3,3,3 convs per stage,
/// maxpool between stages 2-5), five 1x1 side-output projections, four 1x1
/// wavelet-fusion convolutions and one final 1x1 fuse head. All weights are
/// flat Vec<f32>, row-major [out_c, in_c, k, k].
///
/// Learning-rate grouping is structural: every tensor is visited in one
/// fixed enumeration that tags it with its (block, kind) pair at the site
/// that owns it. No name pattern matching anywhere.

use serde::{Deserialize, Serialize};

use crate::tensor::SimpleRng;

/// Convs per encoder stage, fixed by the architecture.
pub const STAGE_CONVS: [usize; 5] = [2, 2, 3, 3, 3];

/// Number of encoder stages / side outputs.
pub const NUM_SCALES: usize = 5;

/// Model configuration — immutable after construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MsNetConfig {
    /// Input image channels (3 for RGB).
    pub in_channels: usize,
    /// Feature depth per encoder stage.
    pub channels: [usize; 5],
    /// Parameter init seed.
    pub seed: u64,
}

impl MsNetConfig {
    /// Production configuration: VGG16-width encoder.
    pub fn default_config() -> Self {
        MsNetConfig {
            in_channels: 3,
            channels: [64, 128, 256, 512, 512],
            seed: 42,
        }
    }

    /// Tiny widths for fast tests; distinct depths catch index bugs.
    pub fn test_config() -> Self {
        MsNetConfig {
            in_channels: 3,
            channels: [4, 5, 6, 7, 7],
            seed: 42,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.in_channels == 0 {
            return Err("in_channels must be >= 1".into());
        }
        if self.channels.iter().any(|&c| c == 0) {
            return Err("encoder channel depths must be >= 1".into());
        }
        Ok(())
    }
}

/// One convolution layer: weight [out_c, in_c, k, k] + bias [out_c].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvParams {
    pub w: Vec<f32>,
    pub b: Vec<f32>,
    pub in_c: usize,
    pub out_c: usize,
    pub k: usize,
}

impl ConvParams {
    fn init(rng: &mut SimpleRng, in_c: usize, out_c: usize, k: usize, scale: f32) -> Self {
        let mut w = vec![0.0f32; out_c * in_c * k * k];
        rng.fill_uniform(&mut w, scale);
        ConvParams {
            w,
            b: vec![0.0f32; out_c],
            in_c,
            out_c,
            k,
        }
    }

    fn zeros(in_c: usize, out_c: usize, k: usize) -> Self {
        ConvParams {
            w: vec![0.0f32; out_c * in_c * k * k],
            b: vec![0.0f32; out_c],
            in_c,
            out_c,
            k,
        }
    }
}

// ── Learning-rate grouping ───────────────────────────────────────────

/// Structural parameter block. Together with [`ParamKind`] this yields the
/// eight optimizer groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LrBlock {
    /// Encoder stages 1-4.
    Enc14,
    /// Encoder stage 5.
    Enc5,
    /// Side-output projections and wavelet-fusion convolutions.
    Cascade,
    /// Final fuse head.
    Fuse,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamKind {
    Weight,
    Bias,
}

/// Documented learning-rate multiplier per (block, kind) group.
pub fn lr_multiplier(block: LrBlock, kind: ParamKind) -> f32 {
    match (block, kind) {
        (LrBlock::Enc14, ParamKind::Weight) => 1.0,
        (LrBlock::Enc14, ParamKind::Bias) => 2.0,
        (LrBlock::Enc5, ParamKind::Weight) => 100.0,
        (LrBlock::Enc5, ParamKind::Bias) => 200.0,
        (LrBlock::Cascade, ParamKind::Weight) => 0.01,
        (LrBlock::Cascade, ParamKind::Bias) => 0.02,
        (LrBlock::Fuse, ParamKind::Weight) => 0.001,
        (LrBlock::Fuse, ParamKind::Bias) => 0.002,
    }
}

/// Weight decay applies to weight tensors only, never biases.
pub fn decays(kind: ParamKind) -> bool {
    matches!(kind, ParamKind::Weight)
}

/// Immutable view of one parameter tensor in the structural enumeration.
pub type TensorRef<'a> = (LrBlock, ParamKind, &'a Vec<f32>);

/// Mutable view of one parameter tensor in the structural enumeration.
pub type TensorMut<'a> = (LrBlock, ParamKind, &'a mut Vec<f32>);

// ── Parameters ───────────────────────────────────────────────────────

/// All learnable parameters. Also reused as a gradient container
/// (`zeros_like` + `accumulate`), so the optimizer and the accumulation
/// buffer share one structural enumeration with the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MsNetParams {
    /// Encoder conv stacks, stage-major: encoder[s] has STAGE_CONVS[s] convs.
    pub encoder: Vec<Vec<ConvParams>>,
    /// Per-scale 1x1 side-output projections (channels[i] -> 1).
    pub side: Vec<ConvParams>,
    /// Wavelet fusion 1x1 convs for scales 2..=5 (4 -> 1 channels each).
    pub fusew: Vec<ConvParams>,
    /// Final 1x1 fuse head (5 -> 1 channels).
    pub fuse: ConvParams,
}

impl MsNetParams {
    /// Deterministic initialization: He-style uniform for the encoder,
    /// small uniform for the 1x1 projection heads, zero biases.
    pub fn init(cfg: &MsNetConfig, seed: u64) -> Self {
        let mut rng = SimpleRng::new(seed);
        let mut encoder = Vec::with_capacity(NUM_SCALES);
        let mut in_c = cfg.in_channels;
        for (s, &depth) in cfg.channels.iter().enumerate() {
            let mut stage = Vec::with_capacity(STAGE_CONVS[s]);
            for _ in 0..STAGE_CONVS[s] {
                let scale = (2.0f32 / (in_c * 9) as f32).sqrt();
                stage.push(ConvParams::init(&mut rng, in_c, depth, 3, scale));
                in_c = depth;
            }
            encoder.push(stage);
        }
        let side = cfg
            .channels
            .iter()
            .map(|&c| ConvParams::init(&mut rng, c, 1, 1, 0.01))
            .collect();
        let fusew = (0..NUM_SCALES - 1)
            .map(|_| ConvParams::init(&mut rng, 4, 1, 1, 0.01))
            .collect();
        let fuse = ConvParams::init(&mut rng, NUM_SCALES, 1, 1, 0.01);
        MsNetParams {
            encoder,
            side,
            fusew,
            fuse,
        }
    }

    /// Zero-filled parameter set with the same layout — gradient buffer.
    pub fn zeros_like(&self) -> Self {
        let encoder = self
            .encoder
            .iter()
            .map(|stage| {
                stage
                    .iter()
                    .map(|c| ConvParams::zeros(c.in_c, c.out_c, c.k))
                    .collect()
            })
            .collect();
        let side = self
            .side
            .iter()
            .map(|c| ConvParams::zeros(c.in_c, c.out_c, c.k))
            .collect();
        let fusew = self
            .fusew
            .iter()
            .map(|c| ConvParams::zeros(c.in_c, c.out_c, c.k))
            .collect();
        let fuse = ConvParams::zeros(self.fuse.in_c, self.fuse.out_c, self.fuse.k);
        MsNetParams {
            encoder,
            side,
            fusew,
            fuse,
        }
    }

    /// The structural enumeration: every tensor in a fixed order, tagged
    /// with its (block, kind). The optimizer, the gradient buffer and the
    /// checkpoint validator all iterate this same list.
    pub fn tensors(&self) -> Vec<TensorRef<'_>> {
        let mut out = Vec::new();
        for (s, stage) in self.encoder.iter().enumerate() {
            let block = if s < 4 { LrBlock::Enc14 } else { LrBlock::Enc5 };
            for conv in stage {
                out.push((block, ParamKind::Weight, &conv.w));
                out.push((block, ParamKind::Bias, &conv.b));
            }
        }
        for conv in &self.side {
            out.push((LrBlock::Cascade, ParamKind::Weight, &conv.w));
            out.push((LrBlock::Cascade, ParamKind::Bias, &conv.b));
        }
        for conv in &self.fusew {
            out.push((LrBlock::Cascade, ParamKind::Weight, &conv.w));
            out.push((LrBlock::Cascade, ParamKind::Bias, &conv.b));
        }
        out.push((LrBlock::Fuse, ParamKind::Weight, &self.fuse.w));
        out.push((LrBlock::Fuse, ParamKind::Bias, &self.fuse.b));
        out
    }

    /// Mutable twin of [`MsNetParams::tensors`], same order.
    pub fn tensors_mut(&mut self) -> Vec<TensorMut<'_>> {
        let mut out: Vec<TensorMut<'_>> = Vec::new();
        for (s, stage) in self.encoder.iter_mut().enumerate() {
            let block = if s < 4 { LrBlock::Enc14 } else { LrBlock::Enc5 };
            for conv in stage {
                out.push((block, ParamKind::Weight, &mut conv.w));
                out.push((block, ParamKind::Bias, &mut conv.b));
            }
        }
        for conv in &mut self.side {
            out.push((LrBlock::Cascade, ParamKind::Weight, &mut conv.w));
            out.push((LrBlock::Cascade, ParamKind::Bias, &mut conv.b));
        }
        for conv in &mut self.fusew {
            out.push((LrBlock::Cascade, ParamKind::Weight, &mut conv.w));
            out.push((LrBlock::Cascade, ParamKind::Bias, &mut conv.b));
        }
        out.push((LrBlock::Fuse, ParamKind::Weight, &mut self.fuse.w));
        out.push((LrBlock::Fuse, ParamKind::Bias, &mut self.fuse.b));
        out
    }

    /// Tensor count per (block, kind) group, derived from the enumeration.
    /// Order: (Enc14, Enc5, Cascade, Fuse) x (Weight, Bias).
    pub fn group_counts(&self) -> [[usize; 2]; 4] {
        let mut counts = [[0usize; 2]; 4];
        for (block, kind, _) in self.tensors() {
            let b = match block {
                LrBlock::Enc14 => 0,
                LrBlock::Enc5 => 1,
                LrBlock::Cascade => 2,
                LrBlock::Fuse => 3,
            };
            let k = match kind {
                ParamKind::Weight => 0,
                ParamKind::Bias => 1,
            };
            counts[b][k] += 1;
        }
        counts
    }

    /// Labeled tensor lengths for shape validation of loaded checkpoints.
    pub fn describe(&self) -> Vec<(String, usize)> {
        let mut out = Vec::new();
        for (s, stage) in self.encoder.iter().enumerate() {
            for (c, conv) in stage.iter().enumerate() {
                out.push((format!("enc{}.conv{}.w", s + 1, c), conv.w.len()));
                out.push((format!("enc{}.conv{}.b", s + 1, c), conv.b.len()));
            }
        }
        for (i, conv) in self.side.iter().enumerate() {
            out.push((format!("side{}.w", i + 1), conv.w.len()));
            out.push((format!("side{}.b", i + 1), conv.b.len()));
        }
        for (i, conv) in self.fusew.iter().enumerate() {
            out.push((format!("fusew{}.w", i + 2), conv.w.len()));
            out.push((format!("fusew{}.b", i + 2), conv.b.len()));
        }
        out.push(("fuse.w".into(), self.fuse.w.len()));
        out.push(("fuse.b".into(), self.fuse.b.len()));
        out
    }

    /// Element-wise accumulate: self += other. Panics on layout mismatch —
    /// gradient buffers are always built with `zeros_like`.
    pub fn accumulate(&mut self, other: &MsNetParams) {
        let src = other.tensors();
        let dst = self.tensors_mut();
        assert_eq!(dst.len(), src.len(), "parameter layout mismatch");
        for ((_, _, d), (_, _, s)) in dst.into_iter().zip(src.into_iter()) {
            assert_eq!(d.len(), s.len(), "parameter tensor length mismatch");
            for (dv, &sv) in d.iter_mut().zip(s.iter()) {
                *dv += sv;
            }
        }
    }

    /// Reset every tensor to zero (gradient buffer clear).
    pub fn zero(&mut self) {
        for (_, _, t) in self.tensors_mut() {
            for v in t.iter_mut() {
                *v = 0.0;
            }
        }
    }
}

// ── Checkpoints ──────────────────────────────────────────────────────

/// Errors from checkpoint load / save.
#[derive(Debug)]
pub enum CheckpointError {
    Io(std::io::Error),
    Parse(String),
    /// A loaded tensor does not match the current architecture.
    ShapeMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointError::Io(e) => write!(f, "checkpoint I/O error: {e}"),
            CheckpointError::Parse(e) => write!(f, "checkpoint parse error: {e}"),
            CheckpointError::ShapeMismatch {
                name,
                expected,
                found,
            } => write!(
                f,
                "checkpoint tensor {name} has {found} elements, architecture expects {expected}"
            ),
        }
    }
}

impl std::error::Error for CheckpointError {}

impl From<std::io::Error> for CheckpointError {
    fn from(e: std::io::Error) -> Self {
        CheckpointError::Io(e)
    }
}

/// Full training checkpoint: epoch, parameter snapshot, optimizer state.
/// Immutable once written.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub params: MsNetParams,
    pub optimizer: crate::optim::SgdState,
}

/// Persist a checkpoint atomically: serialize to a sibling temp file, then
/// rename over the target path.
pub fn save_checkpoint(path: &std::path::Path, ckpt: &Checkpoint) -> Result<(), CheckpointError> {
    let json = serde_json::to_string(ckpt).map_err(|e| CheckpointError::Parse(e.to_string()))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a checkpoint and validate every tensor length against the
/// architecture described by `cfg`. Mismatches are rejected, never adapted.
pub fn load_checkpoint(
    path: &std::path::Path,
    cfg: &MsNetConfig,
) -> Result<Checkpoint, CheckpointError> {
    let json = std::fs::read_to_string(path)?;
    let ckpt: Checkpoint =
        serde_json::from_str(&json).map_err(|e| CheckpointError::Parse(e.to_string()))?;
    let reference = MsNetParams::init(cfg, cfg.seed);
    let expected = reference.describe();
    let found = ckpt.params.describe();
    if expected.len() != found.len() {
        return Err(CheckpointError::ShapeMismatch {
            name: "tensor count".into(),
            expected: expected.len(),
            found: found.len(),
        });
    }
    for ((name, exp), (_, got)) in expected.iter().zip(found.iter()) {
        if exp != got {
            return Err(CheckpointError::ShapeMismatch {
                name: name.clone(),
                expected: *exp,
                found: *got,
            });
        }
    }
    Ok(ckpt)
}

// ── Pretrained encoder weights ───────────────────────────────────────

/// Errors from the pretrained-encoder loader. Failures always propagate —
/// a partially loaded encoder is worse than none.
#[derive(Debug)]
pub enum PretrainError {
    Io(std::io::Error),
    Parse(String),
    /// The source file does not contain the requested layer.
    MissingLayer { stage: usize, conv: usize },
    ShapeMismatch {
        stage: usize,
        conv: usize,
        expected: usize,
        found: usize,
    },
}

impl std::fmt::Display for PretrainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PretrainError::Io(e) => write!(f, "pretrained weights I/O error: {e}"),
            PretrainError::Parse(e) => write!(f, "pretrained weights parse error: {e}"),
            PretrainError::MissingLayer { stage, conv } => {
                write!(f, "pretrained weights missing stage {stage} conv {conv}")
            }
            PretrainError::ShapeMismatch {
                stage,
                conv,
                expected,
                found,
            } => write!(
                f,
                "pretrained stage {stage} conv {conv}: {found} elements, expected {expected}"
            ),
        }
    }
}

impl std::error::Error for PretrainError {}

impl From<std::io::Error> for PretrainError {
    fn from(e: std::io::Error) -> Self {
        PretrainError::Io(e)
    }
}

/// On-disk format for pretrained encoder weights: stages of conv layers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncoderWeights {
    pub stages: Vec<Vec<ConvParams>>,
}

/// Overwrite the encoder stages in place from a JSON weights file. Every
/// layer must be present with exactly matching tensor sizes.
pub fn load_encoder_pretrained(
    params: &mut MsNetParams,
    path: &std::path::Path,
) -> Result<(), PretrainError> {
    let json = std::fs::read_to_string(path)?;
    let src: EncoderWeights =
        serde_json::from_str(&json).map_err(|e| PretrainError::Parse(e.to_string()))?;
    // Validate everything before mutating anything.
    for (s, stage) in params.encoder.iter().enumerate() {
        let src_stage = src
            .stages
            .get(s)
            .ok_or(PretrainError::MissingLayer { stage: s, conv: 0 })?;
        for (c, conv) in stage.iter().enumerate() {
            let src_conv = src_stage
                .get(c)
                .ok_or(PretrainError::MissingLayer { stage: s, conv: c })?;
            if src_conv.w.len() != conv.w.len() {
                return Err(PretrainError::ShapeMismatch {
                    stage: s,
                    conv: c,
                    expected: conv.w.len(),
                    found: src_conv.w.len(),
                });
            }
            if src_conv.b.len() != conv.b.len() {
                return Err(PretrainError::ShapeMismatch {
                    stage: s,
                    conv: c,
                    expected: conv.b.len(),
                    found: src_conv.b.len(),
                });
            }
        }
    }
    for (s, stage) in params.encoder.iter_mut().enumerate() {
        for (c, conv) in stage.iter_mut().enumerate() {
            conv.w.copy_from_slice(&src.stages[s][c].w);
            conv.b.copy_from_slice(&src.stages[s][c].b);
        }
    }
    Ok(())
}
