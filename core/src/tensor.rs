/// Minimal tensor utilities for the multiscale edge trainer.
///
/// All operations are free functions on flat f32 slices with explicit
/// dimensions. No generics, no traits on Tensor — every kernel has an
/// explicit analytical backward next to it. Row-major NCHW layout
/// throughout.

/// Flat f32 tensor with shape metadata.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        Tensor {
            data: vec![0.0; n],
            shape: shape.to_vec(),
        }
    }

    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Tensor {
            data,
            shape: shape.to_vec(),
        }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

// ── Convolution ──────────────────────────────────────────────────────
//
// Same-padding KxK convolution (K odd, pad = K/2). The encoder uses K=3,
// every projection/fusion head uses K=1. Weight layout: [out_c, in_c, K, K].

/// Conv2D forward: out[n,oc,y,x] = bias[oc] + Σ w[oc,ic,ky,kx] * x[n,ic,y+ky-pad,x+kx-pad].
///
/// Returns the output buffer [n, out_c, h, w]. Zero padding outside the map.
pub fn conv2d_forward(
    x: &[f32],
    w: &[f32],
    bias: &[f32],
    n: usize,
    in_c: usize,
    out_c: usize,
    h: usize,
    wd: usize,
    k: usize,
) -> Vec<f32> {
    debug_assert_eq!(x.len(), n * in_c * h * wd);
    debug_assert_eq!(w.len(), out_c * in_c * k * k);
    debug_assert_eq!(bias.len(), out_c);
    debug_assert!(k % 2 == 1, "conv2d supports odd kernels only");

    let pad = k / 2;
    let mut out = vec![0.0f32; n * out_c * h * wd];
    for b in 0..n {
        for oc in 0..out_c {
            let out_base = (b * out_c + oc) * h * wd;
            for y in 0..h {
                for xx in 0..wd {
                    let mut acc = bias[oc];
                    for ic in 0..in_c {
                        let x_base = (b * in_c + ic) * h * wd;
                        let w_base = (oc * in_c + ic) * k * k;
                        for ky in 0..k {
                            let sy = y as isize + ky as isize - pad as isize;
                            if sy < 0 || sy >= h as isize {
                                continue;
                            }
                            for kx in 0..k {
                                let sx = xx as isize + kx as isize - pad as isize;
                                if sx < 0 || sx >= wd as isize {
                                    continue;
                                }
                                acc += w[w_base + ky * k + kx]
                                    * x[x_base + sy as usize * wd + sx as usize];
                            }
                        }
                    }
                    out[out_base + y * wd + xx] = acc;
                }
            }
        }
    }
    out
}

/// Conv2D backward. Returns (d_x, d_w, d_bias).
///
/// `d_out`: [n, out_c, h, w] upstream gradient, same spatial size as input
/// (same padding).
pub fn conv2d_backward(
    d_out: &[f32],
    x: &[f32],
    w: &[f32],
    n: usize,
    in_c: usize,
    out_c: usize,
    h: usize,
    wd: usize,
    k: usize,
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    debug_assert_eq!(d_out.len(), n * out_c * h * wd);
    debug_assert_eq!(x.len(), n * in_c * h * wd);
    debug_assert_eq!(w.len(), out_c * in_c * k * k);

    let pad = k / 2;
    let mut d_x = vec![0.0f32; n * in_c * h * wd];
    let mut d_w = vec![0.0f32; out_c * in_c * k * k];
    let mut d_b = vec![0.0f32; out_c];

    for b in 0..n {
        for oc in 0..out_c {
            let out_base = (b * out_c + oc) * h * wd;
            for y in 0..h {
                for xx in 0..wd {
                    let g = d_out[out_base + y * wd + xx];
                    if g == 0.0 {
                        continue;
                    }
                    d_b[oc] += g;
                    for ic in 0..in_c {
                        let x_base = (b * in_c + ic) * h * wd;
                        let w_base = (oc * in_c + ic) * k * k;
                        for ky in 0..k {
                            let sy = y as isize + ky as isize - pad as isize;
                            if sy < 0 || sy >= h as isize {
                                continue;
                            }
                            for kx in 0..k {
                                let sx = xx as isize + kx as isize - pad as isize;
                                if sx < 0 || sx >= wd as isize {
                                    continue;
                                }
                                let xi = x_base + sy as usize * wd + sx as usize;
                                d_w[w_base + ky * k + kx] += g * x[xi];
                                d_x[xi] += g * w[w_base + ky * k + kx];
                            }
                        }
                    }
                }
            }
        }
    }
    (d_x, d_w, d_b)
}

// ── Max pooling ──────────────────────────────────────────────────────

/// 2x2 stride-2 max pool, floor semantics on odd extents.
///
/// Returns (out [n, c, h/2, w/2], argmax flat-input-index per output element).
pub fn maxpool2d_forward(
    x: &[f32],
    n: usize,
    c: usize,
    h: usize,
    wd: usize,
) -> (Vec<f32>, Vec<usize>) {
    debug_assert_eq!(x.len(), n * c * h * wd);
    let ho = h / 2;
    let wo = wd / 2;
    let mut out = vec![0.0f32; n * c * ho * wo];
    let mut arg = vec![0usize; n * c * ho * wo];
    for b in 0..n {
        for ch in 0..c {
            let in_base = (b * c + ch) * h * wd;
            let out_base = (b * c + ch) * ho * wo;
            for y in 0..ho {
                for xx in 0..wo {
                    let mut best = f32::NEG_INFINITY;
                    let mut best_i = in_base + (2 * y) * wd + 2 * xx;
                    for dy in 0..2 {
                        for dx in 0..2 {
                            let i = in_base + (2 * y + dy) * wd + 2 * xx + dx;
                            if x[i] > best {
                                best = x[i];
                                best_i = i;
                            }
                        }
                    }
                    out[out_base + y * wo + xx] = best;
                    arg[out_base + y * wo + xx] = best_i;
                }
            }
        }
    }
    (out, arg)
}

/// Max pool backward: scatter each upstream gradient to its argmax location.
pub fn maxpool2d_backward(
    d_out: &[f32],
    arg: &[usize],
    n: usize,
    c: usize,
    h: usize,
    wd: usize,
) -> Vec<f32> {
    debug_assert_eq!(d_out.len(), arg.len());
    debug_assert_eq!(d_out.len(), n * c * (h / 2) * (wd / 2));
    let mut d_x = vec![0.0f32; n * c * h * wd];
    for (g, &i) in d_out.iter().zip(arg.iter()) {
        d_x[i] += g;
    }
    d_x
}

// ── Activations ──────────────────────────────────────────────────────

/// ReLU applied out-of-place. The pre-activation buffer is what backward needs.
pub fn relu_forward(z: &[f32]) -> Vec<f32> {
    z.iter().map(|&v| if v > 0.0 { v } else { 0.0 }).collect()
}

/// ReLU backward: d_z = d_out where z > 0, else 0.
pub fn relu_backward(d_out: &[f32], z: &[f32]) -> Vec<f32> {
    debug_assert_eq!(d_out.len(), z.len());
    d_out
        .iter()
        .zip(z.iter())
        .map(|(&g, &v)| if v > 0.0 { g } else { 0.0 })
        .collect()
}

/// Elementwise logistic sigmoid.
pub fn sigmoid_f32(z: &[f32]) -> Vec<f32> {
    z.iter().map(|&v| 1.0 / (1.0 + (-v).exp())).collect()
}

// ── Channel concat / split ───────────────────────────────────────────

/// Concatenate m single-channel maps [n,1,h,w] into one [n,m,h,w] buffer.
pub fn concat_channels(maps: &[&[f32]], n: usize, h: usize, wd: usize) -> Vec<f32> {
    let m = maps.len();
    let hw = h * wd;
    for map in maps {
        debug_assert_eq!(map.len(), n * hw);
    }
    let mut out = vec![0.0f32; n * m * hw];
    for b in 0..n {
        for (j, map) in maps.iter().enumerate() {
            let dst = (b * m + j) * hw;
            let src = b * hw;
            out[dst..dst + hw].copy_from_slice(&map[src..src + hw]);
        }
    }
    out
}

/// Extract channel `ch` of [n,c,h,w] as a [n,1,h,w] buffer. Exact inverse of
/// the concat above, used to split gradients.
pub fn split_channel(x: &[f32], n: usize, c: usize, h: usize, wd: usize, ch: usize) -> Vec<f32> {
    debug_assert_eq!(x.len(), n * c * h * wd);
    debug_assert!(ch < c);
    let hw = h * wd;
    let mut out = vec![0.0f32; n * hw];
    for b in 0..n {
        let src = (b * c + ch) * hw;
        out[b * hw..(b + 1) * hw].copy_from_slice(&x[src..src + hw]);
    }
    out
}

/// Elementwise accumulate: dst += src.
pub fn add_into(dst: &mut [f32], src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        *d += s;
    }
}

// ── Deterministic RNG ────────────────────────────────────────────────

/// xorshift64 — deterministic, seedable, no external dependency. Used only
/// for parameter initialization and test fixtures.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng {
            state: seed.max(1), // zero state is a fixed point
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f32) -> f32 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u as f32 - 1.0) * scale
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f32], scale: f32) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv1x1_is_weighted_channel_sum() {
        // 1 batch, 2 channels, 2x2; w = [1, 10], bias = 0.5
        let x = [1.0, 2.0, 3.0, 4.0, 0.1, 0.2, 0.3, 0.4f32];
        let w = [1.0, 10.0f32];
        let out = conv2d_forward(&x, &w, &[0.5], 1, 2, 1, 2, 2, 1);
        assert_eq!(out, vec![2.5, 4.5, 6.5, 8.5]);
    }

    #[test]
    fn conv3x3_identity_kernel() {
        let x: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let mut w = vec![0.0f32; 9];
        w[4] = 1.0; // center tap
        let out = conv2d_forward(&x, &w, &[0.0], 1, 1, 1, 4, 4, 3);
        assert_eq!(out, x);
    }

    #[test]
    fn maxpool_picks_max_and_routes_gradient() {
        let x = [1.0, 5.0, 2.0, 3.0, 0.0, 0.0, 0.0, 9.0f32];
        // shape (1,1,2,4) -> out (1,1,1,2)
        let (out, arg) = maxpool2d_forward(&x, 1, 1, 2, 4);
        assert_eq!(out, vec![5.0, 9.0]);
        let d_x = maxpool2d_backward(&[1.0, 2.0], &arg, 1, 1, 2, 4);
        assert_eq!(d_x[1], 1.0);
        assert_eq!(d_x[7], 2.0);
        assert_eq!(d_x.iter().sum::<f32>(), 3.0);
    }

    #[test]
    fn concat_split_roundtrip() {
        let a = [1.0, 2.0, 3.0, 4.0f32];
        let b = [5.0, 6.0, 7.0, 8.0f32];
        let cat = concat_channels(&[&a, &b], 1, 2, 2);
        assert_eq!(split_channel(&cat, 1, 2, 2, 2, 0), a.to_vec());
        assert_eq!(split_channel(&cat, 1, 2, 2, 2, 1), b.to_vec());
    }

    #[test]
    fn rng_is_deterministic() {
        let mut r1 = SimpleRng::new(7);
        let mut r2 = SimpleRng::new(7);
        for _ in 0..64 {
            assert_eq!(r1.next_u64(), r2.next_u64());
        }
    }
}
