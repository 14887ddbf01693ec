//! Benchmarks for ordered map across backends.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use parlane::{BackendKind, Config, ErrorStrategy};
use std::convert::Infallible;

fn busy(x: u64) -> Result<u64, Infallible> {
    Ok((0..2_000).fold(x, |acc, i| acc.wrapping_mul(31).wrapping_add(i)))
}

fn map_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("map");
    for strategy in [ErrorStrategy::Raise, ErrorStrategy::Collect] {
        let config = Config::builder()
            .backend(BackendKind::SharedMemory)
            .error_strategy(strategy)
            .build()
            .unwrap();
        group.bench_with_input(BenchmarkId::new("shared", strategy), &config, |b, config| {
            b.iter(|| parlane::map(busy, black_box(0..512_u64), config).unwrap());
        });
    }
    group.bench_function("sequential", |b| {
        b.iter(|| black_box(0..512_u64).map(busy).collect::<Result<Vec<_>, _>>());
    });
    group.finish();
}

fn pipeline_benchmark(c: &mut Criterion) {
    let pipeline = parlane::pipeline(0..512_u64)
        .backend(BackendKind::SharedMemory)
        .map(busy)
        .filter(|x: &u64| Ok::<_, Infallible>(x % 2 == 0))
        .batch(16)
        .unwrap();
    c.bench_function("pipeline", |b| {
        b.iter(|| black_box(pipeline.count().unwrap()));
    });
}

fn cooperative_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let config = Config::builder().workers(16).build().unwrap();
    c.bench_function("cooperative", |b| {
        b.iter(|| {
            runtime.block_on(parlane::cooperative::map(
                |x: u64| async move {
                    tokio::task::yield_now().await;
                    busy(x)
                },
                black_box(0..512_u64),
                &config,
            ))
        });
    });
}

criterion_group!(benches, map_benchmark, pipeline_benchmark, cooperative_benchmark);
criterion_main!(benches);
