//! Integration tests for the frame pipeline: ordering, combining,
//! parallel preparation, buffer growth and batch lifecycle.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use prism_render::batch::{BatchKind, BatchPhase, QuadItem};
use prism_render::config::{BufferConfig, RenderConfig};
use prism_render::device::{
    DeviceCommand, HeadlessDevice, MaterialId, RenderStates, ResolvedDraw, ScissorRect, TextureId,
};
use prism_render::{BatchRef, BufferGenerator, RenderCoordinator, RenderError, RenderManager};

fn setup(config: RenderConfig) -> (Arc<HeadlessDevice>, Arc<RenderManager>) {
    let device = Arc::new(HeadlessDevice::new());
    let manager = RenderManager::new(config, device.clone()).unwrap();
    (device, manager)
}

fn rect(layer: i32) -> ScissorRect {
    ScissorRect {
        x: layer,
        y: 0,
        width: 10,
        height: 10,
    }
}

fn quads(texture: u32, count: usize, seed: f32) -> Vec<QuadItem> {
    (0..count)
        .map(|i| {
            QuadItem::rect(
                Some(TextureId(texture)),
                [seed + i as f32, seed],
                [1.0, 2.0],
                0.5,
                [i as u8, 0, 255, 255],
            )
        })
        .collect()
}

fn scissor_order(device: &HeadlessDevice) -> Vec<i32> {
    device
        .commands()
        .into_iter()
        .filter_map(|c| match c {
            DeviceCommand::Scissor(Some(rect)) => Some(rect.x),
            _ => None,
        })
        .collect()
}

fn vertex_stream(draws: &[ResolvedDraw]) -> Vec<u8> {
    draws.iter().flat_map(|d| d.vertices.iter().copied()).collect()
}

// ============================================================================
// ORDERING
// ============================================================================

#[test]
fn test_issue_order_is_layer_then_creation() {
    let (device, manager) = setup(RenderConfig::single_threaded());
    let frame = manager.create_frame(None);
    for layer in [3, 1, 2] {
        manager.new_scissor(Some(&*frame), layer, Some(rect(layer))).unwrap();
    }
    // Same layer as an earlier batch: created later, issued later.
    manager
        .new_scissor(Some(&*frame), 1, Some(rect(10)))
        .unwrap();

    manager.prepare_frame(&frame).unwrap();
    manager.draw_frame(&frame).unwrap();

    assert_eq!(scissor_order(&device), vec![1, 10, 2, 3]);
    frame.dispose(&manager).unwrap();
}

#[test]
fn test_material_breaks_layer_ties() {
    let (device, manager) = setup(RenderConfig::single_threaded());
    let frame = manager.create_frame(None);

    let textured = |material: u32, texture: u32| {
        let batch = manager
            .new_geometry(Some(&*frame), 0, Some(MaterialId(material)), RenderStates::default())
            .unwrap();
        batch.add_quads(quads(texture, 1, 0.0)).unwrap();
        batch.dispose().unwrap();
    };
    textured(7, 70);
    textured(2, 20);

    manager.prepare_frame(&frame).unwrap();
    manager.draw_frame(&frame).unwrap();

    let textures: Vec<_> = device.resolved_draws().iter().map(|d| d.texture).collect();
    assert_eq!(textures, vec![Some(TextureId(20)), Some(TextureId(70))]);
}

// ============================================================================
// COMBINING
// ============================================================================

fn draw_two_batches(combine: bool, n: usize) -> (Vec<ResolvedDraw>, Vec<BatchRef>) {
    let mut config = RenderConfig::single_threaded();
    config.combine.enabled = combine;
    let (device, manager) = setup(config);
    let frame = manager.create_frame(None);

    let batches: Vec<_> = (0..2)
        .map(|b| {
            let batch = manager
                .new_geometry(Some(&*frame), 0, None, RenderStates::default())
                .unwrap();
            batch.add_quads(quads(1, n, b as f32 * 100.0)).unwrap();
            batch.dispose().unwrap();
            batch
        })
        .collect();

    manager.prepare_frame(&frame).unwrap();
    manager.draw_frame(&frame).unwrap();
    (device.resolved_draws(), batches)
}

#[test]
fn test_combined_batch_draws_same_geometry() {
    let n = 5;
    let (merged_draws, merged) = draw_two_batches(true, n);
    let (separate_draws, _) = draw_two_batches(false, n);

    assert_eq!(merged[0].item_count(), 2 * n);
    assert!(merged[1].is_combined());
    assert_eq!(merged[1].times_issued(), 0);
    assert_eq!(merged[0].times_issued(), 1);

    assert_eq!(merged_draws.len(), 1);
    assert_eq!(separate_draws.len(), 2);
    assert_eq!(vertex_stream(&merged_draws), vertex_stream(&separate_draws));
}

#[test]
fn test_frame_stats_count_combined() {
    let (_device, manager) = setup(RenderConfig::single_threaded());
    let frame = manager.create_frame(Some("stats"));
    for _ in 0..4 {
        let batch = manager
            .new_geometry(Some(&*frame), 0, None, RenderStates::default())
            .unwrap();
        batch.add_quads(quads(1, 2, 0.0)).unwrap();
        batch.dispose().unwrap();
    }

    manager.prepare_frame(&frame).unwrap();
    let stats = manager.draw_frame(&frame).unwrap();

    assert_eq!(stats.batches, 4);
    assert_eq!(stats.combined, 3);
    assert_eq!(stats.issued, 1);
    assert_eq!(stats.draw_calls, 1);
    assert!((stats.combine_ratio() - 0.75).abs() < f32::EPSILON);
}

// ============================================================================
// PARALLEL PREPARATION
// ============================================================================

fn run_workload(workers: usize) -> (Vec<i32>, Vec<ResolvedDraw>) {
    let mut config = RenderConfig::single_threaded();
    config.prepare.threaded = workers > 1;
    config.prepare.worker_count = workers;
    let (device, manager) = setup(config);
    let frame = manager.create_frame(None);

    let layers = [5, 2, 9, 2, 7, 0, 3, 3, 8, 1, 6, 4];
    for (i, &layer) in layers.iter().enumerate() {
        manager
            .new_scissor(Some(&*frame), layer, Some(rect(i as i32)))
            .unwrap();
        let states = RenderStates {
            use_z_buffer: i % 3 == 0,
            ..RenderStates::default()
        };
        let batch = manager
            .new_geometry(Some(&*frame), layer, None, states)
            .unwrap();
        batch
            .add_quads(quads(i as u32 % 4, 3 + i % 5, i as f32))
            .unwrap();
        batch.dispose().unwrap();
    }

    manager.prepare_frame(&frame).unwrap();
    manager.draw_frame(&frame).unwrap();
    frame.dispose(&manager).unwrap();
    (scissor_order(&device), device.resolved_draws())
}

#[test]
fn test_worker_count_does_not_change_output() {
    let (single_order, single_draws) = run_workload(1);
    let (parallel_order, parallel_draws) = run_workload(8);

    assert_eq!(single_order, parallel_order);
    assert_eq!(single_draws, parallel_draws);
    assert!(!single_draws.is_empty());
}

// ============================================================================
// BUFFER GENERATOR
// ============================================================================

fn small_generator() -> (Arc<HeadlessDevice>, BufferGenerator<[u32; 2]>) {
    let device = Arc::new(HeadlessDevice::new());
    let config = BufferConfig {
        max_vertices_per_buffer: 1024,
        max_indices_per_buffer: 1024,
        initial_array_capacity: 64,
        ..BufferConfig::default()
    };
    let generator = BufferGenerator::new(device.clone(), config, 2);
    (device, generator)
}

#[test]
fn test_single_growth_preserves_reserved_data() {
    let (device, generator) = small_generator();

    let mut first = generator.allocate(40, 40, false).unwrap();
    {
        let mut writer = first.write().unwrap();
        let (vertices, indices) = writer.split();
        for (i, v) in vertices.iter_mut().enumerate() {
            *v = [7, i as u32];
        }
        for (i, index) in indices.iter_mut().enumerate() {
            *index = i as u16;
        }
    }

    // Overflows both arrays once: 40 + 100 > 64, rounded up to 256.
    let second = generator.allocate(100, 100, false).unwrap();
    let stats = generator.stats();
    assert_eq!(stats.vertex_growths, 1);
    assert_eq!(stats.index_growths, 1);
    assert_eq!(stats.vertex_capacity, 256);
    assert_eq!(stats.pending_copies, 2);

    generator.flush().unwrap();
    assert_eq!(generator.stats().pending_copies, 0);

    let binding = first.binding().unwrap();
    let contents = device.buffer_contents(binding.vertex_buffer).unwrap();
    let vertices: Vec<[u32; 2]> = bytemuck::pod_collect_to_vec(&contents);
    let start = binding.base_vertex as usize;
    for (i, vertex) in vertices[start..start + 40].iter().enumerate() {
        assert_eq!(*vertex, [7, i as u32]);
    }
    assert!(second.is_uploaded());
}

#[test]
fn test_concurrent_ranges_are_disjoint() {
    let (_device, generator) = small_generator();
    let generator = Arc::new(generator);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let generator = Arc::clone(&generator);
            thread::spawn(move || {
                (0..16)
                    .map(|i| {
                        let buffer = generator.allocate(1 + (t + i) % 5, 3, false).unwrap();
                        (buffer.vertex_byte_range(), buffer.index_range())
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut vertex_ranges = Vec::new();
    let mut index_ranges = Vec::new();
    for handle in handles {
        for (vertices, indices) in handle.join().unwrap() {
            vertex_ranges.push(vertices);
            index_ranges.push(indices);
        }
    }

    for ranges in [&mut vertex_ranges, &mut index_ranges] {
        ranges.sort_by_key(|r| r.start);
        for pair in ranges.windows(2) {
            assert!(pair[0].end <= pair[1].start, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
    }
}

#[test]
fn test_reset_is_idempotent() {
    let (device, generator) = small_generator();
    generator.allocate(8, 12, false).unwrap();
    generator.flush().unwrap();
    generator.reset(1);
    let live = device.live_buffer_count();
    let first = generator.stats();

    generator.reset(2);
    let second = generator.stats();

    assert_eq!(second.vertices_reserved, 0);
    assert_eq!(second.indices_reserved, 0);
    assert_eq!(first.available_buffers, second.available_buffers);
    assert_eq!(first.expiring_buffers, second.expiring_buffers);
    assert_eq!(device.live_buffer_count(), live);
}

#[test]
fn test_usage_errors_fail_loudly() {
    let (_device, generator) = small_generator();
    assert!(matches!(
        generator.allocate(1025, 6, false),
        Err(RenderError::AllocationTooLarge { what: "vertices", .. })
    ));

    generator.flush().unwrap();
    assert_eq!(generator.flush(), Err(RenderError::AlreadyFlushed));
}

#[test]
fn test_geometry_respects_configured_vertex_limit() {
    let mut config = RenderConfig::single_threaded();
    config.buffers = BufferConfig {
        max_vertices_per_buffer: 64,
        max_indices_per_buffer: 96,
        ..BufferConfig::default()
    };
    let (_device, manager) = setup(config);
    let frame = manager.create_frame(None);

    // 16 quads fill the device buffer exactly; 17 do not fit.
    let fits = manager
        .new_geometry(Some(&*frame), 0, None, RenderStates::default())
        .unwrap();
    fits.add_quads(quads(1, 16, 0.0)).unwrap();
    let oversized = manager
        .new_geometry(Some(&*frame), 1, None, RenderStates::default())
        .unwrap();
    oversized.add_quads(quads(1, 17, 0.0)).unwrap();

    assert_eq!(
        manager.prepare_frame(&frame),
        Err(RenderError::AllocationTooLarge {
            what: "vertices",
            requested: 68,
            maximum: 64,
        })
    );
    frame.dispose(&manager).unwrap();
}

// ============================================================================
// BATCH LIFECYCLE
// ============================================================================

#[test]
fn test_released_batch_matches_fresh_instance() {
    let (_device, manager) = setup(RenderConfig::single_threaded());
    let frame = manager.create_frame(None);
    let batch = manager
        .new_geometry(Some(&*frame), 4, Some(MaterialId(9)), RenderStates::default())
        .unwrap();
    batch.set_name("sprites");
    batch.add_quads(quads(2, 3, 0.0)).unwrap();
    batch.dispose().unwrap();

    manager.prepare_frame(&frame).unwrap();
    manager.draw_frame(&frame).unwrap();
    frame.dispose(&manager).unwrap();

    let (_other_device, fresh_manager) = setup(RenderConfig::single_threaded());
    let fresh = fresh_manager.allocate_batch(BatchKind::Geometry);
    assert!(batch.is_released());
    assert_eq!(batch.snapshot(), fresh.snapshot());
}

#[test]
fn test_draw_requires_prepare_and_rejects_released() {
    let (device, manager) = setup(RenderConfig::single_threaded());
    let frame = manager.create_frame(None);
    manager.new_scissor(Some(&*frame), 0, None).unwrap();

    assert!(matches!(
        manager.draw_frame(&frame),
        Err(RenderError::InvalidFrameState { expected: "Prepared", .. })
    ));
    assert_eq!(device.draw_count(), 0);

    manager.prepare_frame(&frame).unwrap();
    frame.dispose(&manager).unwrap();
    assert!(matches!(
        frame.draw(&manager, &*device),
        Err(RenderError::InvalidFrameState { .. })
    ));
    assert!(device.commands().is_empty());
}

#[test]
fn test_suspended_batch_times_out_and_stays_releasable() {
    let mut config = RenderConfig::single_threaded();
    config.prepare.suspend_timeout_ms = 30;
    let (_device, manager) = setup(config);
    let frame = manager.create_frame(None);
    let batch = manager
        .new_geometry(Some(&*frame), 0, None, RenderStates::default())
        .unwrap();
    batch.suspend().unwrap();
    assert!(matches!(batch.suspend(), Err(RenderError::AlreadySuspended(_))));

    let result = manager.prepare_frame(&frame);
    assert!(matches!(result, Err(RenderError::SuspendTimeout { .. })));
    assert_eq!(batch.phase(), BatchPhase::Initialized);

    batch.dispose().unwrap();
    frame.dispose(&manager).unwrap();
    assert!(batch.is_released());
}

#[test]
fn test_suspended_batch_waits_for_producer() {
    let (device, manager) = setup(RenderConfig::single_threaded());
    let frame = manager.create_frame(None);
    let batch = manager
        .new_geometry(Some(&*frame), 0, None, RenderStates::default())
        .unwrap();
    batch.suspend().unwrap();

    let producer = {
        let batch = Arc::clone(&batch);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            batch.add_quads(quads(3, 2, 0.0)).unwrap();
            batch.dispose().unwrap();
        })
    };

    manager.prepare_frame(&frame).unwrap();
    producer.join().unwrap();
    manager.draw_frame(&frame).unwrap();

    assert_eq!(device.draw_count(), 1);
    assert_eq!(device.resolved_draws()[0].vertices.len(), 2 * 6 * 24);
}

// ============================================================================
// COORDINATOR
// ============================================================================

#[test]
fn test_threaded_coordinator_overlaps_frames() {
    let device = Arc::new(HeadlessDevice::new());
    let mut config = RenderConfig::production();
    config.prepare.worker_count = 4;
    config.coordinator.device_settle_ms = 0;
    let manager = RenderManager::new(config, device.clone()).unwrap();
    let coordinator = RenderCoordinator::new(Arc::clone(&manager)).unwrap();

    for f in 0..10 {
        let frame = coordinator.begin_frame(Some("main")).unwrap();
        for layer in 0..6 {
            let batch = manager
                .new_geometry(Some(&*frame), layer, None, RenderStates::default())
                .unwrap();
            batch.add_quads(quads(layer as u32, 4, f as f32)).unwrap();
            batch.dispose().unwrap();
        }
        coordinator.end_draw().unwrap();
    }
    coordinator.wait_for_active_draws().unwrap();

    assert_eq!(coordinator.frames_drawn(), 10);
    assert_eq!(device.draw_count(), 60);
    assert!(coordinator.take_draw_error().is_none());

    coordinator.shutdown();
    assert!(manager.frame_pool_stats().reused >= 8);
}

#[test]
fn test_device_loss_skips_then_recovers() {
    let device = Arc::new(HeadlessDevice::new());
    let mut config = RenderConfig::production();
    config.prepare.worker_count = 2;
    config.coordinator.device_settle_ms = 0;
    let manager = RenderManager::new(config, device.clone()).unwrap();
    let coordinator = RenderCoordinator::new(Arc::clone(&manager)).unwrap();

    let submit = || {
        let frame = coordinator.begin_frame(None).unwrap();
        let batch = manager
            .new_geometry(Some(&*frame), 0, None, RenderStates::default())
            .unwrap();
        batch.add_quads(quads(1, 2, 0.0)).unwrap();
        batch.dispose().unwrap();
        coordinator.end_draw().unwrap();
        coordinator.wait_for_active_draws().unwrap();
    };

    submit();
    device.set_lost(true);
    submit();
    submit();
    assert!(coordinator.is_device_lost());
    assert_eq!(coordinator.frames_skipped(), 2);
    assert_eq!(device.draw_count(), 1);

    coordinator.reset_device().unwrap();
    submit();
    assert_eq!(coordinator.frames_drawn(), 2);
    assert_eq!(device.draw_count(), 2);
    assert!(coordinator.take_draw_error().is_none());
}

#[test]
fn test_device_loss_ends_when_device_reports_normal() {
    let device = Arc::new(HeadlessDevice::new());
    let mut config = RenderConfig::production();
    config.prepare.worker_count = 2;
    config.coordinator.device_settle_ms = 0;
    let manager = RenderManager::new(config, device.clone()).unwrap();
    let coordinator = RenderCoordinator::new(Arc::clone(&manager)).unwrap();

    let submit = || {
        let frame = coordinator.begin_frame(None).unwrap();
        let batch = manager
            .new_geometry(Some(&*frame), 0, None, RenderStates::default())
            .unwrap();
        batch.add_quads(quads(1, 2, 0.0)).unwrap();
        batch.dispose().unwrap();
        coordinator.end_draw().unwrap();
        coordinator.wait_for_active_draws().unwrap();
    };

    device.set_lost(true);
    submit();
    assert!(coordinator.is_device_lost());
    assert_eq!(coordinator.frames_skipped(), 1);

    device.set_lost(false);
    submit();
    submit();
    assert!(!coordinator.is_device_lost());
    assert_eq!(coordinator.frames_skipped(), 1);
    assert_eq!(coordinator.frames_drawn(), 2);
    assert_eq!(device.draw_count(), 2);
    assert!(coordinator.take_draw_error().is_none());
}
