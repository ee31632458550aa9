/// Deterministic bilinear upsampling for the fusion head.
///
/// A transposed convolution with a fixed bilinear kernel (size = 2 * stride)
/// upsamples each non-base side output back to input resolution; a top-left
/// crop then reconciles the small deconvolution overshoot. The kernels are
/// pure functions of their size, never learned, and memoized in an explicit
/// cache owned by the caller rather than regenerated per forward pass.

use std::collections::HashMap;

/// Fixed 2-D bilinear interpolation kernel for transposed convolution.
/// Pure function of `size`; identical output every call.
pub fn make_bilinear_kernel(size: usize) -> Vec<f32> {
    debug_assert!(size >= 2);
    let factor = (size + 1) / 2;
    let center = if size % 2 == 1 {
        (factor - 1) as f32
    } else {
        factor as f32 - 0.5
    };
    let f = factor as f32;
    let mut k = vec![0.0f32; size * size];
    for y in 0..size {
        for x in 0..size {
            let wy = 1.0 - (y as f32 - center).abs() / f;
            let wx = 1.0 - (x as f32 - center).abs() / f;
            k[y * size + x] = wy * wx;
        }
    }
    k
}

/// Memo for bilinear kernels keyed by size. One instance lives with the
/// model context; correctness does not depend on it, only allocation churn.
#[derive(Default)]
pub struct KernelCache {
    kernels: HashMap<usize, Vec<f32>>,
}

impl KernelCache {
    pub fn new() -> Self {
        KernelCache {
            kernels: HashMap::new(),
        }
    }

    pub fn get(&mut self, size: usize) -> &[f32] {
        self.kernels
            .entry(size)
            .or_insert_with(|| make_bilinear_kernel(size))
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

/// Output extent of a stride-s transposed convolution with kernel size k.
pub fn deconv_out_extent(in_extent: usize, stride: usize, k: usize) -> usize {
    (in_extent - 1) * stride + k
}

/// Transposed convolution of a single-channel map [n,1,h,w] with a fixed
/// k x k kernel and the given stride. The kernel carries no gradient; only
/// the input-gradient path exists.
pub fn conv_transpose2d_fixed(
    x: &[f32],
    kernel: &[f32],
    n: usize,
    h: usize,
    w: usize,
    stride: usize,
    k: usize,
) -> Vec<f32> {
    debug_assert_eq!(x.len(), n * h * w);
    debug_assert_eq!(kernel.len(), k * k);
    let ho = deconv_out_extent(h, stride, k);
    let wo = deconv_out_extent(w, stride, k);
    let mut out = vec![0.0f32; n * ho * wo];
    for b in 0..n {
        let xb = &x[b * h * w..(b + 1) * h * w];
        let ob = &mut out[b * ho * wo..(b + 1) * ho * wo];
        for iy in 0..h {
            for ix in 0..w {
                let v = xb[iy * w + ix];
                if v == 0.0 {
                    continue;
                }
                let oy0 = iy * stride;
                let ox0 = ix * stride;
                for ky in 0..k {
                    for kx in 0..k {
                        ob[(oy0 + ky) * wo + ox0 + kx] += v * kernel[ky * k + kx];
                    }
                }
            }
        }
    }
    out
}

/// Input gradient of [`conv_transpose2d_fixed`]: correlate the upstream
/// gradient with the kernel at each stride offset.
pub fn conv_transpose2d_fixed_backward_input(
    d_out: &[f32],
    kernel: &[f32],
    n: usize,
    h: usize,
    w: usize,
    stride: usize,
    k: usize,
) -> Vec<f32> {
    let ho = deconv_out_extent(h, stride, k);
    let wo = deconv_out_extent(w, stride, k);
    debug_assert_eq!(d_out.len(), n * ho * wo);
    debug_assert_eq!(kernel.len(), k * k);
    let mut d_x = vec![0.0f32; n * h * w];
    for b in 0..n {
        let gb = &d_out[b * ho * wo..(b + 1) * ho * wo];
        let db = &mut d_x[b * h * w..(b + 1) * h * w];
        for iy in 0..h {
            for ix in 0..w {
                let oy0 = iy * stride;
                let ox0 = ix * stride;
                let mut acc = 0.0f32;
                for ky in 0..k {
                    for kx in 0..k {
                        acc += gb[(oy0 + ky) * wo + ox0 + kx] * kernel[ky * k + kx];
                    }
                }
                db[iy * w + ix] = acc;
            }
        }
    }
    d_x
}

// ── Cropping ─────────────────────────────────────────────────────────

/// Errors from the alignment crop.
#[derive(Clone, Debug, PartialEq)]
pub enum CropError {
    /// Target window larger than the source map — never silently padded.
    TargetExceedsSource {
        src_h: usize,
        src_w: usize,
        dst_h: usize,
        dst_w: usize,
    },
}

impl std::fmt::Display for CropError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CropError::TargetExceedsSource {
                src_h,
                src_w,
                dst_h,
                dst_w,
            } => write!(
                f,
                "crop target {dst_h}x{dst_w} exceeds source {src_h}x{src_w}"
            ),
        }
    }
}

impl std::error::Error for CropError {}

/// Top-left-aligned crop of a [n,c,src_h,src_w] map to (dst_h, dst_w).
/// A no-op copy when the sizes already match; an error when the target is
/// larger on either axis.
pub fn crop_to(
    x: &[f32],
    n: usize,
    c: usize,
    src_h: usize,
    src_w: usize,
    dst_h: usize,
    dst_w: usize,
) -> Result<Vec<f32>, CropError> {
    debug_assert_eq!(x.len(), n * c * src_h * src_w);
    if dst_h > src_h || dst_w > src_w {
        return Err(CropError::TargetExceedsSource {
            src_h,
            src_w,
            dst_h,
            dst_w,
        });
    }
    if dst_h == src_h && dst_w == src_w {
        return Ok(x.to_vec());
    }
    let mut out = vec![0.0f32; n * c * dst_h * dst_w];
    for plane in 0..n * c {
        let src_base = plane * src_h * src_w;
        let dst_base = plane * dst_h * dst_w;
        for y in 0..dst_h {
            let s = src_base + y * src_w;
            let d = dst_base + y * dst_w;
            out[d..d + dst_w].copy_from_slice(&x[s..s + dst_w]);
        }
    }
    Ok(out)
}

/// Crop backward: scatter the cropped-window gradient into a zeroed map of
/// the pre-crop extent.
pub fn crop_backward(
    d_out: &[f32],
    n: usize,
    c: usize,
    src_h: usize,
    src_w: usize,
    dst_h: usize,
    dst_w: usize,
) -> Vec<f32> {
    debug_assert_eq!(d_out.len(), n * c * dst_h * dst_w);
    let mut d_x = vec![0.0f32; n * c * src_h * src_w];
    for plane in 0..n * c {
        let src_base = plane * src_h * src_w;
        let dst_base = plane * dst_h * dst_w;
        for y in 0..dst_h {
            let s = src_base + y * src_w;
            let d = dst_base + y * dst_w;
            d_x[s..s + dst_w].copy_from_slice(&d_out[d..d + dst_w]);
        }
    }
    d_x
}
