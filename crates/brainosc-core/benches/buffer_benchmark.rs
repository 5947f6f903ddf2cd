//! Performance benchmarks for the sample buffer
//!
//! Ingest and snapshot both run once per cycle for every channel, so they
//! dominate the cycle budget at high device rates.

use brainosc_core::{Sample, SampleBuffer, Timestamp};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

fn filled_buffer(channels: usize, capacity: usize) -> SampleBuffer {
    let mut buffer = SampleBuffer::new(channels, capacity);
    for i in 0..capacity as u64 {
        for channel in 0..channels {
            let sample = Sample::new(channel, i as f64, Timestamp::from_micros(i * 4_000));
            let _ = buffer.ingest(sample);
        }
    }
    buffer
}

/// Benchmark ingest into full rings (every push evicts)
fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");

    for &channels in &[1usize, 4, 8, 16] {
        group.bench_with_input(
            BenchmarkId::new("evicting", format!("{}ch", channels)),
            &channels,
            |b, &channels| {
                let mut buffer = filled_buffer(channels, 250);
                let mut tick = 250u64;
                b.iter(|| {
                    tick += 1;
                    for channel in 0..channels {
                        let sample =
                            Sample::new(channel, tick as f64, Timestamp::from_micros(tick * 4_000));
                        black_box(buffer.ingest(black_box(sample)).ok());
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark walking a one-second snapshot
fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for &capacity in &[250usize, 1_000, 4_000] {
        let buffer = filled_buffer(4, capacity);
        group.bench_with_input(BenchmarkId::new("sum", capacity), &buffer, |b, buffer| {
            b.iter(|| {
                let total: f64 = buffer
                    .snapshot(black_box(0), Duration::from_secs(1))
                    .map(|s| s.value)
                    .sum();
                black_box(total)
            });
        });
    }

    group.finish();
}

/// Benchmark reclaiming half of each ring
fn bench_reclaim(c: &mut Criterion) {
    c.bench_function("reclaim_half", |b| {
        b.iter_batched(
            || filled_buffer(8, 1_000),
            |mut buffer| black_box(buffer.reclaim(Duration::from_secs(2))),
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_ingest, bench_snapshot, bench_reclaim);
criterion_main!(benches);
