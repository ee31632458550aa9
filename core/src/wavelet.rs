/// Fixed wavelet filter bank for cross-scale feature fusion.
///
/// Single-level 2-D discrete wavelet decomposition with the orthogonal
/// Daubechies 4-tap (D4) filters and periodized boundary handling. The
/// transform is deterministic and carries no learned state; the backward
/// pass through the fusion cascade uses the exact adjoint of the analysis
/// operator, implemented next to it.
///
/// Band dimensions are floor(h/2) x floor(w/2), which matches the encoder's
/// floor-halving pooling, so detail bands of scale i-1 line up exactly with
/// the raw side output of scale i.

/// D4 analysis low-pass filter.
const LO: [f32; 4] = [
    0.482_962_91,
    0.836_516_30,
    0.224_143_87,
    -0.129_409_52,
];

/// D4 analysis high-pass filter (quadrature mirror of LO).
const HI: [f32; 4] = [
    -0.129_409_52,
    -0.224_143_87,
    0.836_516_30,
    -0.482_962_91,
];

/// Minimum spatial extent the filter bank accepts on either axis.
pub const MIN_EXTENT: usize = LO.len();

/// Errors from wavelet decomposition.
#[derive(Clone, Debug, PartialEq)]
pub enum WaveletError {
    /// Input map smaller than the analysis filter on some axis.
    TooSmall { h: usize, w: usize },
}

impl std::fmt::Display for WaveletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaveletError::TooSmall { h, w } => write!(
                f,
                "map {h}x{w} is below the minimum wavelet extent {MIN_EXTENT}x{MIN_EXTENT}"
            ),
        }
    }
}

impl std::error::Error for WaveletError {}

/// Four sub-bands of a single-channel map: approximation plus the
/// horizontal / vertical / diagonal detail bands. Each band is
/// [n, 1, h, w] flat with the halved dimensions recorded alongside.
#[derive(Clone, Debug, PartialEq)]
pub struct WaveletBands {
    pub ca: Vec<f32>,
    pub ch: Vec<f32>,
    pub cv: Vec<f32>,
    pub cd: Vec<f32>,
    /// Band height = floor(input h / 2).
    pub h: usize,
    /// Band width = floor(input w / 2).
    pub w: usize,
}

/// Single-level periodized 2-D DWT of a batched single-channel map [n,1,h,w].
///
/// Rows are filtered and downsampled first, then columns. Indices wrap
/// modulo the input extent, so the operator is linear and square-summable
/// and its adjoint is exact.
pub fn dwt2_forward(x: &[f32], n: usize, h: usize, w: usize) -> Result<WaveletBands, WaveletError> {
    if h < MIN_EXTENT || w < MIN_EXTENT {
        return Err(WaveletError::TooSmall { h, w });
    }
    debug_assert_eq!(x.len(), n * h * w);

    let ho = h / 2;
    let wo = w / 2;
    let mut ca = vec![0.0f32; n * ho * wo];
    let mut chb = vec![0.0f32; n * ho * wo];
    let mut cv = vec![0.0f32; n * ho * wo];
    let mut cd = vec![0.0f32; n * ho * wo];

    let mut lo_r = vec![0.0f32; h * wo];
    let mut hi_r = vec![0.0f32; h * wo];

    for b in 0..n {
        let xb = &x[b * h * w..(b + 1) * h * w];

        // Row pass: h rows of length w -> h rows of length wo.
        for y in 0..h {
            for k in 0..wo {
                let mut acc_lo = 0.0f32;
                let mut acc_hi = 0.0f32;
                for j in 0..LO.len() {
                    let sx = (2 * k + j) % w;
                    let v = xb[y * w + sx];
                    acc_lo += LO[j] * v;
                    acc_hi += HI[j] * v;
                }
                lo_r[y * wo + k] = acc_lo;
                hi_r[y * wo + k] = acc_hi;
            }
        }

        // Column pass: LL -> cA, LH -> cH, HL -> cV, HH -> cD.
        let out_base = b * ho * wo;
        for ky in 0..ho {
            for kx in 0..wo {
                let mut ll = 0.0f32;
                let mut lh = 0.0f32;
                let mut hl = 0.0f32;
                let mut hh = 0.0f32;
                for j in 0..LO.len() {
                    let sy = (2 * ky + j) % h;
                    let lv = lo_r[sy * wo + kx];
                    let hv = hi_r[sy * wo + kx];
                    ll += LO[j] * lv;
                    lh += HI[j] * lv;
                    hl += LO[j] * hv;
                    hh += HI[j] * hv;
                }
                ca[out_base + ky * wo + kx] = ll;
                chb[out_base + ky * wo + kx] = lh;
                cv[out_base + ky * wo + kx] = hl;
                cd[out_base + ky * wo + kx] = hh;
            }
        }
    }

    Ok(WaveletBands {
        ca,
        ch: chb,
        cv,
        cd,
        h: ho,
        w: wo,
    })
}

/// Exact adjoint of [`dwt2_forward`]: scatters band gradients back to a
/// [n,1,h,w] map. Bands that received no gradient can be passed as zeros
/// (the cascade discards cA, so its slot is usually all-zero).
pub fn dwt2_adjoint(bands: &WaveletBands, n: usize, h: usize, w: usize) -> Vec<f32> {
    let ho = h / 2;
    let wo = w / 2;
    debug_assert_eq!(bands.h, ho);
    debug_assert_eq!(bands.w, wo);
    debug_assert_eq!(bands.ca.len(), n * ho * wo);

    let mut d_x = vec![0.0f32; n * h * w];
    let mut d_lo_r = vec![0.0f32; h * wo];
    let mut d_hi_r = vec![0.0f32; h * wo];

    for b in 0..n {
        let in_base = b * ho * wo;
        for v in d_lo_r.iter_mut() {
            *v = 0.0;
        }
        for v in d_hi_r.iter_mut() {
            *v = 0.0;
        }

        // Column pass adjoint.
        for ky in 0..ho {
            for kx in 0..wo {
                let g_ca = bands.ca[in_base + ky * wo + kx];
                let g_ch = bands.ch[in_base + ky * wo + kx];
                let g_cv = bands.cv[in_base + ky * wo + kx];
                let g_cd = bands.cd[in_base + ky * wo + kx];
                for j in 0..LO.len() {
                    let sy = (2 * ky + j) % h;
                    d_lo_r[sy * wo + kx] += LO[j] * g_ca + HI[j] * g_ch;
                    d_hi_r[sy * wo + kx] += LO[j] * g_cv + HI[j] * g_cd;
                }
            }
        }

        // Row pass adjoint.
        let out = &mut d_x[b * h * w..(b + 1) * h * w];
        for y in 0..h {
            for k in 0..wo {
                let g_lo = d_lo_r[y * wo + k];
                let g_hi = d_hi_r[y * wo + k];
                for j in 0..LO.len() {
                    let sx = (2 * k + j) % w;
                    out[y * w + sx] += LO[j] * g_lo + HI[j] * g_hi;
                }
            }
        }
    }

    d_x
}
