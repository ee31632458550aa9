/// Gradient checks for the full network: directional finite differences
/// against the hand-derived backward pass, in both fusion modes.
///
/// The check compares (L(p + eps*u) - L(p - eps*u)) / (2*eps) with <g, u>
/// for a random direction u over every parameter tensor. Single-precision
/// forward noise limits how tight the tolerance can be, so eps is chosen
/// large enough to dominate rounding and the comparison is relative.
///
/// Run: cargo test --test test_gradients

use msnet_core::backward::msnet_backward;
use msnet_core::bilinear::KernelCache;
use msnet_core::forward::{msnet_forward, FusionMode};
use msnet_core::loss::multiscale_edge_loss;
use msnet_core::model::{MsNetConfig, MsNetParams};
use msnet_core::tensor::SimpleRng;

fn make_fixture(seed: u64, n: usize, h: usize, w: usize) -> (MsNetConfig, Vec<f32>, Vec<f32>) {
    let cfg = MsNetConfig::test_config();
    let mut rng = SimpleRng::new(seed);
    let mut x = vec![0.0f32; n * cfg.in_channels * h * w];
    rng.fill_uniform(&mut x, 1.0);
    let mut labels = vec![0.0f32; n * h * w];
    for (i, v) in labels.iter_mut().enumerate() {
        if i % 5 == 0 {
            *v = 1.0;
        }
    }
    (cfg, x, labels)
}

fn loss_at(
    params: &MsNetParams,
    cfg: &MsNetConfig,
    x: &[f32],
    labels: &[f32],
    n: usize,
    h: usize,
    w: usize,
    mode: FusionMode,
) -> f32 {
    let mut kernels = KernelCache::new();
    let (outputs, _) = msnet_forward(params, cfg, x, n, h, w, mode, &mut kernels).unwrap();
    multiscale_edge_loss(&outputs.maps, labels, n, h, w).0
}

/// Random direction with the parameter layout, entries in [-1, 1].
fn random_direction(params: &MsNetParams, seed: u64) -> MsNetParams {
    let mut dir = params.zeros_like();
    let mut rng = SimpleRng::new(seed);
    for (_, _, t) in dir.tensors_mut() {
        rng.fill_uniform(t, 1.0);
    }
    dir
}

fn perturbed(params: &MsNetParams, dir: &MsNetParams, eps: f32) -> MsNetParams {
    let mut out = params.clone();
    let d_list = dir.tensors();
    for ((_, _, t), (_, _, d)) in out.tensors_mut().into_iter().zip(d_list.into_iter()) {
        for (v, &dv) in t.iter_mut().zip(d.iter()) {
            *v += eps * dv;
        }
    }
    out
}

fn directional_check(mode: FusionMode, dir_seed: u64) {
    let (n, h, w) = (1, 32, 32);
    let (cfg, x, labels) = make_fixture(7, n, h, w);
    let params = MsNetParams::init(&cfg, 42);
    let mut kernels = KernelCache::new();

    let (outputs, cache) =
        msnet_forward(&params, &cfg, &x, n, h, w, mode, &mut kernels).unwrap();
    let (_, d_logits) = multiscale_edge_loss(&outputs.maps, &labels, n, h, w);
    let grads = msnet_backward(&params, &cfg, &cache, &d_logits, &mut kernels);

    let dir = random_direction(&params, dir_seed);
    let analytic: f64 = grads
        .tensors()
        .iter()
        .zip(dir.tensors().iter())
        .map(|((_, _, g), (_, _, d))| {
            g.iter()
                .zip(d.iter())
                .map(|(&a, &b)| a as f64 * b as f64)
                .sum::<f64>()
        })
        .sum();

    let eps = 1e-2f32;
    let lp = loss_at(&perturbed(&params, &dir, eps), &cfg, &x, &labels, n, h, w, mode);
    let lm = loss_at(&perturbed(&params, &dir, -eps), &cfg, &x, &labels, n, h, w, mode);
    let fd = ((lp - lm) as f64) / (2.0 * eps as f64);

    let denom = analytic.abs().max(fd.abs()).max(1e-3);
    let rel = (analytic - fd).abs() / denom;
    assert!(
        rel < 0.1,
        "directional derivative mismatch: analytic {analytic}, fd {fd}, rel {rel}"
    );
}

#[test]
fn directional_derivative_fusion_enabled() {
    directional_check(FusionMode::Enabled, 11);
}

#[test]
fn directional_derivative_fusion_disabled() {
    directional_check(FusionMode::Disabled, 13);
}

#[test]
fn directional_derivative_second_direction() {
    // A second independent direction catches sign errors that a single
    // direction can mask by cancellation.
    directional_check(FusionMode::Enabled, 29);
}

#[test]
fn every_group_receives_gradient_when_fused() {
    let (n, h, w) = (1, 32, 32);
    let (cfg, x, labels) = make_fixture(3, n, h, w);
    let params = MsNetParams::init(&cfg, 42);
    let mut kernels = KernelCache::new();
    let (outputs, cache) =
        msnet_forward(&params, &cfg, &x, n, h, w, FusionMode::Enabled, &mut kernels).unwrap();
    let (_, d_logits) = multiscale_edge_loss(&outputs.maps, &labels, n, h, w);
    let grads = msnet_backward(&params, &cfg, &cache, &d_logits, &mut kernels);

    for (i, (block, kind, t)) in grads.tensors().into_iter().enumerate() {
        let norm: f32 = t.iter().map(|v| v * v).sum();
        assert!(
            norm > 0.0,
            "tensor {i} ({block:?}, {kind:?}) received no gradient"
        );
    }
}
