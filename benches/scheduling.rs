//! Scheduling throughput benchmarks.
//!
//! Measures fan-out/fan-in round trips, record recycling under sustained
//! submission, and work stealing with an imbalanced workload.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use framejob::JobSystem;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn spin(work: u64) -> u64 {
    let mut acc = 0u64;
    for i in 0..work {
        acc = acc.wrapping_add(std::hint::black_box(i));
    }
    acc
}

fn bench_fan_out(c: &mut Criterion) {
    let scheduler = JobSystem::new();

    let mut group = c.benchmark_group("fan_out");
    for jobs in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(jobs as u64));
        group.bench_function(BenchmarkId::new("fan_in", jobs), |b| {
            b.iter(|| {
                let completed = Arc::new(AtomicUsize::new(0));
                let counter = Arc::clone(&completed);
                scheduler.run_job_with(move |cx| {
                    for _ in 0..jobs {
                        let counter = Arc::clone(&counter);
                        cx.schedule(move || {
                            counter.fetch_add(1, Ordering::Relaxed);
                        });
                    }
                });
                assert_eq!(completed.load(Ordering::Relaxed), jobs);
            });
        });
    }
    group.finish();

    scheduler.shutdown().expect("shutdown failed");
}

fn bench_recycling(c: &mut Criterion) {
    let scheduler = JobSystem::new();

    let mut group = c.benchmark_group("recycling");
    group.throughput(Throughput::Elements(1));
    group.bench_function("run_job_round_trip", |b| {
        b.iter(|| {
            scheduler.run_job_with(|cx| {
                cx.schedule(|| {
                    std::hint::black_box(());
                });
            });
        });
    });
    group.finish();

    scheduler.shutdown().expect("shutdown failed");
}

fn bench_imbalanced_stealing(c: &mut Criterion) {
    let scheduler = JobSystem::new();

    let mut group = c.benchmark_group("work_stealing");
    group.sample_size(10);
    for jobs in [1_000usize, 10_000] {
        group.throughput(Throughput::Elements(jobs as u64));

        // Pre-roll the weights so every iteration sees the same imbalance.
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let weights: Arc<Vec<u64>> = Arc::new(
            (0..jobs)
                .map(|_| if rng.gen_ratio(1, 10) { 2_000 } else { 50 })
                .collect(),
        );

        group.bench_function(BenchmarkId::new("imbalanced", jobs), |b| {
            b.iter(|| {
                let weights = Arc::clone(&weights);
                scheduler.run_job_with(move |cx| {
                    for i in 0..weights.len() {
                        let weights = Arc::clone(&weights);
                        cx.schedule(move || {
                            std::hint::black_box(spin(weights[i]));
                        });
                    }
                });
            });
        });
    }
    group.finish();

    scheduler.shutdown().expect("shutdown failed");
}

criterion_group!(
    benches,
    bench_fan_out,
    bench_recycling,
    bench_imbalanced_stealing
);
criterion_main!(benches);
