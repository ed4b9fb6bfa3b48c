//! # Buffer Generator Benchmark
//!
//! Measures software buffer allocation from many preparation threads and
//! the cost of a frame flush.
//!
//! Target: 10k quads allocated and flushed in under 1ms.

#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use prism_render::config::BufferConfig;
use prism_render::{BufferGenerator, HeadlessDevice, Vertex};
use rayon::prelude::*;

fn generator() -> (Arc<HeadlessDevice>, BufferGenerator<Vertex>) {
    let device = Arc::new(HeadlessDevice::new());
    let config = BufferConfig {
        max_software_buffers_per_hardware_buffer: 4096,
        ..BufferConfig::default()
    };
    let generator = BufferGenerator::new(device.clone(), config, 4);
    (device, generator)
}

/// One frame: reset, N quad allocations, flush
fn bench_single_thread_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("generator_frame");

    for quads in [100_u64, 1_000, 10_000] {
        let (device, generator) = generator();
        let mut frame = 0;
        group.throughput(Throughput::Elements(quads));
        group.bench_with_input(BenchmarkId::new("quads", quads), &quads, |b, &quads| {
            b.iter(|| {
                frame += 1;
                generator.reset(frame);
                for _ in 0..quads {
                    let buffer = generator.allocate(4, 6, false).expect("allocate");
                    black_box(buffer);
                }
                generator.flush().expect("flush");
                device.take_commands();
            });
        });
    }

    group.finish();
}

/// Same frame, allocations spread over the rayon pool
fn bench_parallel_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("generator_parallel");
    let (device, generator) = generator();
    let mut frame = 0;

    group.throughput(Throughput::Elements(10_000));
    group.bench_function("quads_10000", |b| {
        b.iter(|| {
            frame += 1;
            generator.reset(frame);
            (0..10_000).into_par_iter().for_each(|_| {
                let buffer = generator.allocate(4, 6, false).expect("allocate");
                black_box(buffer);
            });
            generator.flush().expect("flush");
            device.take_commands();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_single_thread_frame, bench_parallel_allocate);
criterion_main!(benches);
