//! # Frame Pipeline Benchmark
//!
//! Full begin -> fill -> prepare -> draw cycle against the headless device,
//! inline and with the dedicated draw thread.

#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use prism_render::batch::QuadItem;
use prism_render::device::{RenderStates, TextureId};
use prism_render::{HeadlessDevice, RenderConfig, RenderCoordinator, RenderManager};

const LAYERS: i32 = 16;

fn fill(manager: &RenderManager, coordinator: &RenderCoordinator, quads_per_layer: usize) {
    let frame = coordinator.begin_frame(None).expect("begin frame");
    for layer in 0..LAYERS {
        let batch = manager
            .new_geometry(Some(&*frame), layer, None, RenderStates::default())
            .expect("geometry batch");
        batch
            .add_quads((0..quads_per_layer).map(|i| {
                QuadItem::rect(
                    Some(TextureId(layer as u32 % 4)),
                    [i as f32, layer as f32],
                    [8.0, 8.0],
                    0.0,
                    [255; 4],
                )
            }))
            .expect("add quads");
        batch.dispose().expect("dispose");
    }
    coordinator.end_draw().expect("end draw");
}

fn bench_pipeline(c: &mut Criterion, name: &str, config: &RenderConfig) {
    let mut group = c.benchmark_group(name);

    for quads in [8_usize, 64, 512] {
        let device = Arc::new(HeadlessDevice::new());
        let manager = RenderManager::new(config.clone(), device.clone()).expect("manager");
        let coordinator = RenderCoordinator::new(Arc::clone(&manager)).expect("coordinator");

        group.bench_with_input(BenchmarkId::new("quads_per_layer", quads), &quads, |b, &quads| {
            b.iter(|| {
                fill(&manager, &coordinator, quads);
                device.take_commands();
            });
        });

        coordinator.wait_for_active_draws().expect("drain");
        coordinator.shutdown();
    }

    group.finish();
}

fn bench_inline(c: &mut Criterion) {
    bench_pipeline(c, "frame_pipeline_inline", &RenderConfig::single_threaded());
}

fn bench_threaded(c: &mut Criterion) {
    let mut config = RenderConfig::production();
    config.coordinator.device_settle_ms = 0;
    bench_pipeline(c, "frame_pipeline_threaded", &config);
}

criterion_group!(benches, bench_inline, bench_threaded);
criterion_main!(benches);
