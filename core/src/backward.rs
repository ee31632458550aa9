/// Full backward pass, hand-derived layer by layer.
///
/// Consumes the forward cache and the six per-map logit gradients and
/// produces a gradient container with the same layout as the parameters.
/// The cascade is walked in decreasing scale order so that each scale's
/// wavelet-adjoint contribution lands on the previous scale's side output
/// before that scale is processed.

use crate::bilinear::{conv_transpose2d_fixed_backward_input, crop_backward, KernelCache};
use crate::forward::{scale_stride, FusionMode, MsNetCache};
use crate::model::{MsNetConfig, MsNetParams, NUM_SCALES};
use crate::tensor::{
    add_into, conv2d_backward, maxpool2d_backward, relu_backward, split_channel,
};
use crate::wavelet::{dwt2_adjoint, WaveletBands};

/// Backpropagate the six logit gradients through the fuse head, the
/// upsampling paths, the fusion cascade, the side projections and the
/// encoder. Returns parameter gradients in a fresh `zeros_like` container.
pub fn msnet_backward(
    params: &MsNetParams,
    cfg: &MsNetConfig,
    cache: &MsNetCache,
    d_logits: &[Vec<f32>; 6],
    kernels: &mut KernelCache,
) -> MsNetParams {
    let n = cache.n;
    let h = cache.h;
    let w = cache.w;
    let mut grads = params.zeros_like();

    // ── Fuse head ────────────────────────────────────────────────────
    let (d_fusecat, d_fw, d_fb) = conv2d_backward(
        &d_logits[5],
        &cache.fusecat,
        &params.fuse.w,
        n,
        NUM_SCALES,
        1,
        h,
        w,
        1,
    );
    add_into(&mut grads.fuse.w, &d_fw);
    add_into(&mut grads.fuse.b, &d_fb);

    // ── Crop + upsample backward per scale ───────────────────────────
    // Each cropped map receives its own loss gradient plus its channel of
    // the fuse-input gradient.
    let mut d_so: Vec<Vec<f32>> = Vec::with_capacity(NUM_SCALES);
    for i in 0..NUM_SCALES {
        let mut d_crop = d_logits[i].clone();
        add_into(&mut d_crop, &split_channel(&d_fusecat, n, NUM_SCALES, h, w, i));

        let (uh, uw) = cache.up_dims[i];
        let d_up = crop_backward(&d_crop, n, 1, uh, uw, h, w);
        if i == 0 {
            d_so.push(d_up);
        } else {
            let stride = scale_stride(i);
            let ksz = 2 * stride;
            let kernel = kernels.get(ksz).to_vec();
            d_so.push(conv_transpose2d_fixed_backward_input(
                &d_up,
                &kernel,
                n,
                cache.dims[i].0,
                cache.dims[i].1,
                stride,
                ksz,
            ));
        }
    }

    // ── Fusion cascade backward, decreasing scale order ──────────────
    // d_so[i] holds the gradient on the post-fusion side output; after this
    // loop d_so holds the gradient on the raw (pre-fusion) projections.
    if cache.mode == FusionMode::Enabled {
        for i in (1..NUM_SCALES).rev() {
            let (hi, wi) = cache.dims[i];
            let fcat = match &cache.fcat[i - 1] {
                Some(c) => c,
                None => continue,
            };
            let fw = &params.fusew[i - 1];
            let (d_cat, d_w, d_b) =
                conv2d_backward(&d_so[i], fcat, &fw.w, n, 4, 1, hi, wi, 1);
            add_into(&mut grads.fusew[i - 1].w, &d_w);
            add_into(&mut grads.fusew[i - 1].b, &d_b);

            d_so[i] = split_channel(&d_cat, n, 4, hi, wi, 0);

            let bands = WaveletBands {
                ca: vec![0.0f32; n * hi * wi],
                ch: split_channel(&d_cat, n, 4, hi, wi, 1),
                cv: split_channel(&d_cat, n, 4, hi, wi, 2),
                cd: split_channel(&d_cat, n, 4, hi, wi, 3),
                h: hi,
                w: wi,
            };
            let (ph, pw) = cache.dims[i - 1];
            let d_prev = dwt2_adjoint(&bands, n, ph, pw);
            add_into(&mut d_so[i - 1], &d_prev);
        }
    }

    // ── Side projections ─────────────────────────────────────────────
    let mut d_features: Vec<Vec<f32>> = Vec::with_capacity(NUM_SCALES);
    for i in 0..NUM_SCALES {
        let (hi, wi) = cache.dims[i];
        let side = &params.side[i];
        let (d_feat, d_w, d_b) = conv2d_backward(
            &d_so[i],
            &cache.features[i],
            &side.w,
            n,
            cfg.channels[i],
            1,
            hi,
            wi,
            1,
        );
        add_into(&mut grads.side[i].w, &d_w);
        add_into(&mut grads.side[i].b, &d_b);
        d_features.push(d_feat);
    }

    // ── Encoder, decreasing stage order ──────────────────────────────
    for s in (0..NUM_SCALES).rev() {
        let (hs, ws) = cache.dims[s];
        let stage = &cache.stages[s];
        let mut d = std::mem::take(&mut d_features[s]);
        for (c, conv) in params.encoder[s].iter().enumerate().rev() {
            let cc = &stage.convs[c];
            let d_z = relu_backward(&d, &cc.z);
            let (d_x, d_w, d_b) =
                conv2d_backward(&d_z, &cc.x, &conv.w, n, conv.in_c, conv.out_c, hs, ws, conv.k);
            add_into(&mut grads.encoder[s][c].w, &d_w);
            add_into(&mut grads.encoder[s][c].b, &d_b);
            d = d_x;
        }
        if s > 0 {
            let arg = match &stage.pool_arg {
                Some(a) => a,
                None => continue,
            };
            let (ph, pw) = cache.dims[s - 1];
            let d_pool = maxpool2d_backward(&d, arg, n, cfg.channels[s - 1], ph, pw);
            add_into(&mut d_features[s - 1], &d_pool);
        }
    }

    grads
}
