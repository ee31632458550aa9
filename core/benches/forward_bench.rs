/// Criterion benchmarks for the multiscale forward and backward passes.
///
/// Uses the tiny test configuration at a few input extents so the sweep
/// stays fast while still exercising pooling, the wavelet cascade and the
/// upsampling head.
///
/// Run: cargo bench --bench forward_bench
/// Reports saved to: target/criterion/

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use msnet_core::backward::msnet_backward;
use msnet_core::bilinear::KernelCache;
use msnet_core::forward::{msnet_forward, FusionMode};
use msnet_core::loss::multiscale_edge_loss;
use msnet_core::model::{MsNetConfig, MsNetParams};
use msnet_core::tensor::SimpleRng;

fn make_input(cfg: &MsNetConfig, h: usize, w: usize) -> Vec<f32> {
    let mut rng = SimpleRng::new(42);
    let mut x = vec![0.0f32; cfg.in_channels * h * w];
    rng.fill_uniform(&mut x, 1.0);
    x
}

fn bench_forward(c: &mut Criterion) {
    let cfg = MsNetConfig::test_config();
    let params = MsNetParams::init(&cfg, 42);
    let mut group = c.benchmark_group("forward");
    for extent in [32usize, 64] {
        let x = make_input(&cfg, extent, extent);
        let mut kernels = KernelCache::new();
        group.bench_with_input(
            BenchmarkId::new("fusion_on", extent),
            &extent,
            |b, &e| {
                b.iter(|| {
                    msnet_forward(&params, &cfg, &x, 1, e, e, FusionMode::Enabled, &mut kernels)
                        .unwrap()
                });
            },
        );
        group.bench_with_input(
            BenchmarkId::new("fusion_off", extent),
            &extent,
            |b, &e| {
                b.iter(|| {
                    msnet_forward(&params, &cfg, &x, 1, e, e, FusionMode::Disabled, &mut kernels)
                        .unwrap()
                });
            },
        );
    }
    group.finish();
}

fn bench_backward(c: &mut Criterion) {
    let cfg = MsNetConfig::test_config();
    let params = MsNetParams::init(&cfg, 42);
    let extent = 32usize;
    let x = make_input(&cfg, extent, extent);
    let labels: Vec<f32> = (0..extent * extent)
        .map(|i| if i % 7 == 0 { 1.0 } else { 0.0 })
        .collect();
    let mut kernels = KernelCache::new();

    c.bench_function("backward/32", |b| {
        b.iter(|| {
            let (outputs, cache) = msnet_forward(
                &params,
                &cfg,
                &x,
                1,
                extent,
                extent,
                FusionMode::Enabled,
                &mut kernels,
            )
            .unwrap();
            let (_, d_logits) =
                multiscale_edge_loss(&outputs.maps, &labels, 1, extent, extent);
            msnet_backward(&params, &cfg, &cache, &d_logits, &mut kernels)
        });
    });
}

criterion_group!(benches, bench_forward, bench_backward);
criterion_main!(benches);
