//! Nearest-codebook search and full-stack quantization on the CPU backend.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use burn::backend::NdArray;

use vqinflect::model::quantizer::{AssemblyMode, VqLayerConfig, VqStackConfig};
use vqinflect::ComputeContext;

type B = NdArray;

/// Benchmark: nearest entry for a batch of 128 vectors, K=6 and K=64.
fn bench_nearest(c: &mut Criterion) {
    let mut ctx = ComputeContext::<B>::new(Default::default(), 0);
    let x = ctx.standard_normal([128, 60]);

    let mut group = c.benchmark_group("nearest");
    for k in [6, 64] {
        let layer = VqLayerConfig::new(k, 60).init::<B>(&ctx.device);
        group.bench_function(format!("k{}_d60_b128", k), |b| {
            b.iter(|| layer.nearest(black_box(x.clone())))
        });
    }
    group.finish();
}

/// Benchmark: 11-layer stack forward, one group per layer vs. summed.
fn bench_stack(c: &mut Criterion) {
    let mut ctx = ComputeContext::<B>::new(Default::default(), 0);
    let x = ctx.standard_normal([128, 660]);

    let mut group = c.benchmark_group("stack_forward");
    for (name, mode) in [
        ("sum_and_concat", AssemblyMode::SumAndConcat { groups: 11 }),
        ("sum", AssemblyMode::Sum),
    ] {
        let stack = VqStackConfig::new()
            .with_mode(mode)
            .init::<B>(&ctx.device)
            .expect("valid stack config");
        group.bench_function(name, |b| b.iter(|| stack.forward(black_box(x.clone()))));
    }
    group.finish();
}

criterion_group!(benches, bench_nearest, bench_stack);
criterion_main!(benches);
