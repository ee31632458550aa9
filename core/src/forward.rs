/// Forward pass: encoder, side-output & fusion cascade, upsample-crop-fuse
/// head. Returns the six probability maps plus the cache the backward pass
/// consumes.
///
/// The cascade is evaluated in strictly increasing scale order: each scale's
/// fused side output feeds the wavelet decomposition that conditions the
/// next scale, so the chain cannot be reordered or parallelized across
/// scales. Scale 5 fuses the previous scale's detail bands exactly like
/// scales 2-4 do.

use crate::bilinear::{
    conv_transpose2d_fixed, crop_to, deconv_out_extent, CropError, KernelCache,
};
use crate::model::{MsNetConfig, MsNetParams, NUM_SCALES, STAGE_CONVS};
use crate::tensor::{concat_channels, conv2d_forward, maxpool2d_forward, relu_forward, sigmoid_f32};
use crate::wavelet::{dwt2_forward, WaveletError};

/// Whether the wavelet fusion branch is active for the current batch.
/// Decided once per forward call, never threaded as a nullable argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FusionMode {
    Enabled,
    Disabled,
}

impl FusionMode {
    /// Auxiliary wavelet weights present for the batch => fusion on.
    pub fn from_batch(has_wavelet_weights: bool) -> Self {
        if has_wavelet_weights {
            FusionMode::Enabled
        } else {
            FusionMode::Disabled
        }
    }
}

/// Errors from the forward pass.
#[derive(Debug)]
pub enum ForwardError {
    /// Input buffer length disagrees with the declared (n, c, h, w).
    BadInput { expected: usize, found: usize },
    /// Input too small to survive four rounds of pooling.
    InputTooSmall { h: usize, w: usize },
    Wavelet(WaveletError),
    Crop(CropError),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::BadInput { expected, found } => {
                write!(f, "input has {found} elements, shape implies {expected}")
            }
            ForwardError::InputTooSmall { h, w } => {
                write!(f, "input {h}x{w} is below the 16x16 minimum for five scales")
            }
            ForwardError::Wavelet(e) => write!(f, "wavelet decomposition failed: {e}"),
            ForwardError::Crop(e) => write!(f, "alignment crop failed: {e}"),
        }
    }
}

impl std::error::Error for ForwardError {}

impl From<WaveletError> for ForwardError {
    fn from(e: WaveletError) -> Self {
        ForwardError::Wavelet(e)
    }
}

impl From<CropError> for ForwardError {
    fn from(e: CropError) -> Self {
        ForwardError::Crop(e)
    }
}

/// Per-conv cache: layer input and pre-ReLU activation.
#[derive(Debug)]
pub struct ConvCache {
    pub x: Vec<f32>,
    pub z: Vec<f32>,
}

/// Per-stage cache: pool routing (stages 2-5) plus the conv chain.
#[derive(Debug)]
pub struct StageCache {
    pub pool_arg: Option<Vec<usize>>,
    pub convs: Vec<ConvCache>,
}

/// Everything the backward pass needs from one forward evaluation.
#[derive(Debug)]
pub struct MsNetCache {
    pub n: usize,
    pub h: usize,
    pub w: usize,
    pub mode: FusionMode,
    pub stages: Vec<StageCache>,
    /// Post-ReLU stage outputs (inputs to the side projections).
    pub features: Vec<Vec<f32>>,
    /// Spatial extent per scale.
    pub dims: [(usize, usize); NUM_SCALES],
    /// Pre-crop extent per scale (native for scale 1, deconv output for 2-5).
    pub up_dims: [(usize, usize); NUM_SCALES],
    /// Fusion conv inputs [n,4,hi,wi] for scales 2..=5 (fusion enabled only).
    pub fcat: Vec<Option<Vec<f32>>>,
    /// Fuse head input [n,5,h,w].
    pub fusecat: Vec<f32>,
    /// Cropped logits in output order (so1..so5, fuse).
    pub logits: [Vec<f32>; 6],
}

/// The six probability maps in fixed order [so1..so5, fuse], each [n,1,h,w].
/// The trainer indexes the last element as the primary prediction.
#[derive(Debug)]
pub struct MsNetOutputs {
    pub maps: [Vec<f32>; 6],
    pub n: usize,
    pub h: usize,
    pub w: usize,
}

/// Upsampling stride for scale index i (0-based): 1, 2, 4, 8, 16.
pub fn scale_stride(i: usize) -> usize {
    1 << i
}

/// Full forward pass over one batch [n, in_channels, h, w].
pub fn msnet_forward(
    params: &MsNetParams,
    cfg: &MsNetConfig,
    x: &[f32],
    n: usize,
    h: usize,
    w: usize,
    mode: FusionMode,
    kernels: &mut KernelCache,
) -> Result<(MsNetOutputs, MsNetCache), ForwardError> {
    let expected = n * cfg.in_channels * h * w;
    if x.len() != expected {
        return Err(ForwardError::BadInput {
            expected,
            found: x.len(),
        });
    }
    let min_extent = 1 << (NUM_SCALES - 1);
    if h < min_extent || w < min_extent {
        return Err(ForwardError::InputTooSmall { h, w });
    }

    // ── Encoder ──────────────────────────────────────────────────────
    let mut stages = Vec::with_capacity(NUM_SCALES);
    let mut features: Vec<Vec<f32>> = Vec::with_capacity(NUM_SCALES);
    let mut dims = [(0usize, 0usize); NUM_SCALES];

    let mut cur = x.to_vec();
    let mut cur_c = cfg.in_channels;
    let mut cur_h = h;
    let mut cur_w = w;

    for s in 0..NUM_SCALES {
        let mut pool_arg = None;
        if s > 0 {
            let (pooled, arg) = maxpool2d_forward(&cur, n, cur_c, cur_h, cur_w);
            cur = pooled;
            cur_h /= 2;
            cur_w /= 2;
            pool_arg = Some(arg);
        }
        let mut convs = Vec::with_capacity(STAGE_CONVS[s]);
        for conv in &params.encoder[s] {
            let z = conv2d_forward(
                &cur, &conv.w, &conv.b, n, conv.in_c, conv.out_c, cur_h, cur_w, conv.k,
            );
            let out = relu_forward(&z);
            convs.push(ConvCache { x: cur, z });
            cur = out;
            cur_c = conv.out_c;
        }
        dims[s] = (cur_h, cur_w);
        features.push(cur.clone());
        stages.push(StageCache { pool_arg, convs });
    }

    // ── Side projections + fusion cascade ────────────────────────────
    let so_raw: Vec<Vec<f32>> = (0..NUM_SCALES)
        .map(|i| {
            let side = &params.side[i];
            conv2d_forward(
                &features[i], &side.w, &side.b, n, side.in_c, 1, dims[i].0, dims[i].1, 1,
            )
        })
        .collect();

    let mut fcat: Vec<Option<Vec<f32>>> = vec![None; NUM_SCALES - 1];
    let so: Vec<Vec<f32>> = match mode {
        FusionMode::Disabled => so_raw,
        FusionMode::Enabled => {
            let mut so = Vec::with_capacity(NUM_SCALES);
            so.push(so_raw[0].clone());
            for i in 1..NUM_SCALES {
                let (ph, pw) = dims[i - 1];
                let bands = dwt2_forward(&so[i - 1], n, ph, pw)?;
                debug_assert_eq!((bands.h, bands.w), dims[i]);
                let cat = concat_channels(
                    &[&so_raw[i], &bands.ch, &bands.cv, &bands.cd],
                    n,
                    dims[i].0,
                    dims[i].1,
                );
                let fw = &params.fusew[i - 1];
                let fused =
                    conv2d_forward(&cat, &fw.w, &fw.b, n, 4, 1, dims[i].0, dims[i].1, 1);
                fcat[i - 1] = Some(cat);
                so.push(fused);
            }
            so
        }
    };

    // ── Upsample, crop, fuse ─────────────────────────────────────────
    let mut up_dims = [(0usize, 0usize); NUM_SCALES];
    up_dims[0] = dims[0];
    let mut cropped: Vec<Vec<f32>> = Vec::with_capacity(NUM_SCALES);
    cropped.push(crop_to(&so[0], n, 1, dims[0].0, dims[0].1, h, w)?);
    for i in 1..NUM_SCALES {
        let stride = scale_stride(i);
        let ksz = 2 * stride;
        let kernel = kernels.get(ksz).to_vec();
        let up = conv_transpose2d_fixed(&so[i], &kernel, n, dims[i].0, dims[i].1, stride, ksz);
        let uh = deconv_out_extent(dims[i].0, stride, ksz);
        let uw = deconv_out_extent(dims[i].1, stride, ksz);
        up_dims[i] = (uh, uw);
        cropped.push(crop_to(&up, n, 1, uh, uw, h, w)?);
    }

    let fusecat = concat_channels(
        &[
            &cropped[0],
            &cropped[1],
            &cropped[2],
            &cropped[3],
            &cropped[4],
        ],
        n,
        h,
        w,
    );
    let fuse_logit = conv2d_forward(
        &fusecat,
        &params.fuse.w,
        &params.fuse.b,
        n,
        NUM_SCALES,
        1,
        h,
        w,
        1,
    );

    let maps = [
        sigmoid_f32(&cropped[0]),
        sigmoid_f32(&cropped[1]),
        sigmoid_f32(&cropped[2]),
        sigmoid_f32(&cropped[3]),
        sigmoid_f32(&cropped[4]),
        sigmoid_f32(&fuse_logit),
    ];
    let logits = [
        std::mem::take(&mut cropped[0]),
        std::mem::take(&mut cropped[1]),
        std::mem::take(&mut cropped[2]),
        std::mem::take(&mut cropped[3]),
        std::mem::take(&mut cropped[4]),
        fuse_logit,
    ];

    let outputs = MsNetOutputs { maps, n, h, w };
    let cache = MsNetCache {
        n,
        h,
        w,
        mode,
        stages,
        features,
        dims,
        up_dims,
        fcat,
        fusecat,
        logits,
    };
    Ok((outputs, cache))
}
