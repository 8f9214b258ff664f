//! Benchmarks for the stretched SHA-256 engine.
//!
//! Measures how hashing time scales with the cost parameter, and the
//! overhead of the offload round trip compared to an inline call.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use threadhash::{CoreConfig, HashEngine, HashRequest, NativeCore, StretchedSha256};

const SALT: &str = "hash343454523f";

// ---------------------------------------------------------------------------
// Cost scaling
// ---------------------------------------------------------------------------

fn hash_cost_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_cost");
    group.warm_up_time(Duration::from_secs(1));
    group.sample_size(20);

    let engine = StretchedSha256::default();
    for &cost in &[1i64, 5, 10, 20] {
        let request = HashRequest::new("password", SALT, cost).unwrap();
        group.throughput(Throughput::Elements(cost as u64));
        group.bench_with_input(BenchmarkId::new("stretched_sha256", cost), &request, |b, req| {
            b.iter(|| criterion::black_box(engine.compute(req).unwrap()));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Inline vs offloaded
// ---------------------------------------------------------------------------

fn inline_vs_offload(c: &mut Criterion) {
    let mut group = c.benchmark_group("inline_vs_offload");
    group.sample_size(20);

    let core = NativeCore::new(CoreConfig::default()).unwrap();
    group.bench_function("inline", |b| {
        b.iter(|| core.hash_password("password", SALT, 5).unwrap());
    });
    group.bench_function("offload", |b| {
        b.iter(|| {
            let pending = core.hash_password_async("password", SALT, 5);
            core.wait(&pending, Duration::from_secs(30)).unwrap()
        });
    });
    group.finish();
}

criterion_group!(benches, hash_cost_scaling, inline_vs_offload);
criterion_main!(benches);
