//! # Render Manager
//!
//! Central registry for one rendering context: batch pools per kind, list
//! pools, the frame pool, typed buffer generators, array pools, the prepare
//! manager and the combiner set.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytemuck::Pod;
use parking_lot::Mutex;
use prism_core::{ListPool, ObjectPool, PoolStats};

use crate::batch::{BatchContainer, BatchKind, BatchPool, BatchRef, PayloadLists, Vertex};
use crate::buffer::{BufferGenerator, ErasedGenerator};
use crate::combine::{combine_batches, sort_batches, BatchCombiner, GeometryCombiner};
use crate::config::RenderConfig;
use crate::device::{ClearRequest, GraphicsDevice, MaterialId, RenderStates, ScissorRect};
use crate::error::{RenderError, RenderResult};
use crate::frame::Frame;
use crate::prepare::PrepareManager;
use crate::stats::GeneratorStats;

struct GeneratorSlot {
    erased: Arc<dyn ErasedGenerator>,
    typed: Arc<dyn Any + Send + Sync>,
}

/// Owns everything a rendering context reuses from frame to frame.
///
/// # Example
///
/// ```rust,ignore
/// let manager = RenderManager::new(RenderConfig::default(), device)?;
///
/// let frame = manager.create_frame(Some("main"));
/// let sprite = manager.new_geometry(Some(&*frame), 0, None, RenderStates::default())?;
/// sprite.add_quad(quad)?;
/// sprite.dispose()?;
///
/// manager.prepare_frame(&frame)?;
/// manager.draw_frame(&frame)?;
/// frame.dispose(&manager)?;
/// ```
pub struct RenderManager {
    config: RenderConfig,
    device: Arc<dyn GraphicsDevice>,
    sequence: Arc<AtomicU64>,
    batch_pools: Vec<Arc<BatchPool>>,
    lists: PayloadLists,
    frame_pool: ObjectPool<Arc<Frame>>,
    frame_counter: AtomicU64,
    generators: Mutex<HashMap<TypeId, GeneratorSlot>>,
    vertex_generator: Arc<BufferGenerator<Vertex>>,
    preparer: PrepareManager,
    combiners: Vec<Box<dyn BatchCombiner>>,
    release_queue: Mutex<Vec<BatchRef>>,
}

impl RenderManager {
    /// Creates a manager.
    ///
    /// # Errors
    ///
    /// - [`RenderError::InvalidConfig`] if `config` fails validation
    /// - [`RenderError::WorkerPool`] if preparation workers cannot start
    pub fn new(config: RenderConfig, device: Arc<dyn GraphicsDevice>) -> RenderResult<Arc<Self>> {
        config.validate()?;

        let sequence = Arc::new(AtomicU64::new(0));
        let list_config = config.pools.list_pool();
        let lists = PayloadLists {
            quads: Arc::new(ListPool::new(list_config.clone())),
            children: Arc::new(ListPool::new(list_config)),
        };
        let batch_pools = BatchKind::ALL
            .iter()
            .map(|&kind| {
                BatchPool::new(
                    kind,
                    config.pools.batch_pool_capacity,
                    Arc::clone(&sequence),
                    lists.clone(),
                )
            })
            .collect();

        let vertex_generator = Arc::new(BufferGenerator::<Vertex>::new(
            Arc::clone(&device),
            config.buffers.clone(),
            config.pools.arrays_per_size_class,
        ));
        let mut generators = HashMap::new();
        generators.insert(
            TypeId::of::<Vertex>(),
            GeneratorSlot {
                erased: vertex_generator.clone(),
                typed: vertex_generator.clone(),
            },
        );

        let combiners: Vec<Box<dyn BatchCombiner>> = if config.combine.enabled {
            vec![Box::new(GeometryCombiner::new(config.combine.max_item_count))]
        } else {
            Vec::new()
        };

        let preparer = PrepareManager::new(&config.prepare)?;
        tracing::info!(
            "render manager ready: {} preparation workers, combining {}",
            preparer.worker_count(),
            if combiners.is_empty() { "off" } else { "on" }
        );

        Ok(Arc::new(Self {
            frame_pool: ObjectPool::new(config.pools.frame_pool_capacity, || {
                Arc::new(Frame::pooled())
            }),
            config,
            device,
            sequence,
            batch_pools,
            lists,
            frame_counter: AtomicU64::new(0),
            generators: Mutex::new(generators),
            vertex_generator,
            preparer,
            combiners,
            release_queue: Mutex::new(Vec::new()),
        }))
    }

    /// Configuration the manager was built with.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// The graphics device.
    #[inline]
    #[must_use]
    pub fn device(&self) -> &Arc<dyn GraphicsDevice> {
        &self.device
    }

    /// The prepare manager.
    #[inline]
    #[must_use]
    pub const fn preparer(&self) -> &PrepareManager {
        &self.preparer
    }

    /// Highest creation index handed out so far.
    #[must_use]
    pub fn last_creation_index(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    // =========================================================================
    // Batches
    // =========================================================================

    /// The pool for batches of `kind`.
    #[must_use]
    pub fn batch_pool(&self, kind: BatchKind) -> &Arc<BatchPool> {
        &self.batch_pools[kind.index()]
    }

    /// Takes an uninitialized batch of `kind` out of its pool.
    #[must_use]
    pub fn allocate_batch(&self, kind: BatchKind) -> BatchRef {
        self.batch_pool(kind).allocate()
    }

    /// Changes the capacity of one batch pool.
    ///
    /// # Returns
    ///
    /// `false` if `capacity` is zero and nothing changed.
    pub fn try_set_pool_capacity(&self, kind: BatchKind, capacity: usize) -> bool {
        if capacity == 0 {
            return false;
        }
        self.batch_pool(kind).set_capacity(capacity);
        true
    }

    /// Counters of every batch pool, in kind order.
    #[must_use]
    pub fn pool_stats(&self) -> Vec<(BatchKind, PoolStats)> {
        self.batch_pools.iter().map(|p| (p.kind(), p.stats())).collect()
    }

    /// Pooled list counts: `(quad lists, child lists)`, each as
    /// `(small, large)`.
    #[must_use]
    pub fn list_pool_counts(&self) -> ((usize, usize), (usize, usize)) {
        (self.lists.quads.pooled_counts(), self.lists.children.pooled_counts())
    }

    /// Blocks until lists queued for background clearing are back in their
    /// pools.
    ///
    /// # Returns
    ///
    /// `false` if `timeout` elapsed first.
    pub fn wait_for_list_clears(&self, timeout: Duration) -> bool {
        self.lists.quads.wait_for_work_items(timeout)
            && self.lists.children.wait_for_work_items(timeout)
    }

    /// Initialized clear batch.
    ///
    /// # Errors
    ///
    /// [`RenderError::EmptyClear`] if `request` clears nothing, or any error
    /// from `container.add`.
    pub fn new_clear(
        &self,
        container: Option<&dyn BatchContainer>,
        layer: i32,
        request: ClearRequest,
    ) -> RenderResult<BatchRef> {
        if request.is_empty() {
            return Err(RenderError::EmptyClear);
        }
        let batch = self.allocate_batch(BatchKind::Clear);
        batch.initialize(None, layer, None)?;
        batch.set_clear(request)?;
        attach(&batch, container)?;
        Ok(batch)
    }

    /// Initialized scissor batch; `None` resets the scissor.
    ///
    /// # Errors
    ///
    /// Any error from `container.add`.
    pub fn new_scissor(
        &self,
        container: Option<&dyn BatchContainer>,
        layer: i32,
        rect: Option<ScissorRect>,
    ) -> RenderResult<BatchRef> {
        let batch = self.allocate_batch(BatchKind::Scissor);
        batch.initialize(None, layer, None)?;
        batch.set_scissor(rect)?;
        attach(&batch, container)?;
        Ok(batch)
    }

    /// Initialized, empty geometry batch.
    ///
    /// # Errors
    ///
    /// Any error from `container.add`.
    pub fn new_geometry(
        &self,
        container: Option<&dyn BatchContainer>,
        layer: i32,
        material: Option<MaterialId>,
        states: RenderStates,
    ) -> RenderResult<BatchRef> {
        let batch = self.allocate_batch(BatchKind::Geometry);
        batch.initialize(None, layer, material)?;
        batch.set_render_states(states)?;
        attach(&batch, container)?;
        Ok(batch)
    }

    /// Initialized, empty group batch.
    ///
    /// # Errors
    ///
    /// Any error from `container.add`.
    pub fn new_group(&self, container: Option<&dyn BatchContainer>, layer: i32) -> RenderResult<BatchRef> {
        let batch = self.allocate_batch(BatchKind::Group);
        batch.initialize(None, layer, None)?;
        attach(&batch, container)?;
        Ok(batch)
    }

    /// Combines and sorts `batches` with the configured combiners.
    ///
    /// # Returns
    ///
    /// Number of batches absorbed into `combined`.
    pub fn combine(&self, batches: &mut Vec<BatchRef>, combined: &mut Vec<BatchRef>) -> usize {
        if self.combiners.is_empty() {
            sort_batches(batches);
            return 0;
        }
        combine_batches(batches, &self.combiners, combined)
    }

    /// Hands `batch` off and releases it after the next frame draws.
    pub fn queue_release(&self, batch: BatchRef) {
        self.release_queue.lock().push(batch);
    }

    /// Releases every batch queued with [`queue_release`].
    ///
    /// [`queue_release`]: RenderManager::queue_release
    pub fn drain_release_queue(&self) {
        let queued = std::mem::take(&mut *self.release_queue.lock());
        for batch in queued {
            let result = batch.dispose().and_then(|()| batch.release_resources());
            if let Err(error) = result {
                tracing::warn!("deferred release of {} failed: {}", batch, error);
            }
        }
    }

    // =========================================================================
    // Frames
    // =========================================================================

    /// Next frame index.
    pub fn pick_frame_index(&self) -> u64 {
        self.frame_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Takes a frame out of the pool.
    #[must_use]
    pub fn create_frame(&self, label: Option<&str>) -> Arc<Frame> {
        let frame = self.frame_pool.allocate();
        frame.begin(self.pick_frame_index(), label);
        frame
    }

    pub(crate) fn release_frame(&self, frame: Arc<Frame>) {
        self.frame_pool.release(frame);
    }

    /// Frame pool counters.
    #[must_use]
    pub fn frame_pool_stats(&self) -> PoolStats {
        self.frame_pool.stats()
    }

    /// Resets the buffer generators, then combines, sorts and prepares
    /// `frame`.
    ///
    /// # Errors
    ///
    /// Any error from [`Frame::prepare`].
    pub fn prepare_frame(&self, frame: &Frame) -> RenderResult<()> {
        self.reset_buffer_generators(frame.index());
        frame.prepare(self, self.config.prepare.threaded)
    }

    /// Flushes the buffer generators, then issues `frame`.
    ///
    /// # Errors
    ///
    /// Any flush error, or any error from [`Frame::draw`].
    pub fn draw_frame(&self, frame: &Frame) -> RenderResult<crate::stats::FrameStats> {
        self.flush_buffer_generators()?;
        frame.draw(self, self.device.as_ref())
    }

    // =========================================================================
    // Buffer generators
    // =========================================================================

    /// The generator for vertex type `V`, created on first use.
    #[must_use]
    pub fn buffer_generator<V: Pod + Send + Sync>(&self) -> Arc<BufferGenerator<V>> {
        let mut generators = self.generators.lock();
        if let Some(slot) = generators.get(&TypeId::of::<V>()) {
            if let Ok(generator) = Arc::clone(&slot.typed).downcast::<BufferGenerator<V>>() {
                return generator;
            }
        }

        let generator = Arc::new(BufferGenerator::<V>::new(
            Arc::clone(&self.device),
            self.config.buffers.clone(),
            self.config.pools.arrays_per_size_class,
        ));
        generators.insert(
            TypeId::of::<V>(),
            GeneratorSlot {
                erased: generator.clone(),
                typed: generator.clone(),
            },
        );
        tracing::debug!("created buffer generator for {}", std::any::type_name::<V>());
        generator
    }

    /// The generator geometry batches write into.
    #[must_use]
    pub fn vertex_generator(&self) -> Arc<BufferGenerator<Vertex>> {
        Arc::clone(&self.vertex_generator)
    }

    fn erased_generators(&self) -> Vec<Arc<dyn ErasedGenerator>> {
        self.generators
            .lock()
            .values()
            .map(|slot| Arc::clone(&slot.erased))
            .collect()
    }

    /// Starts a new frame in every generator.
    pub fn reset_buffer_generators(&self, frame_index: u64) {
        for generator in self.erased_generators() {
            generator.reset(frame_index);
        }
    }

    /// Uploads every generator's allocations.
    ///
    /// # Errors
    ///
    /// The first flush error. Remaining generators are still flushed.
    pub fn flush_buffer_generators(&self) -> RenderResult<()> {
        let mut first_error = None;
        for generator in self.erased_generators() {
            if let Err(error) = generator.flush() {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Forgets every device buffer after a device reset.
    pub fn discard_device_buffers(&self) {
        for generator in self.erased_generators() {
            generator.discard_device_buffers();
        }
    }

    /// Counters of every generator.
    #[must_use]
    pub fn generator_stats(&self) -> Vec<GeneratorStats> {
        self.erased_generators().iter().map(|g| g.stats()).collect()
    }
}

/// Adds `batch` to `container`, if any.
fn attach(batch: &BatchRef, container: Option<&dyn BatchContainer>) -> RenderResult<()> {
    match container {
        Some(container) => container.add(batch),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeadlessDevice;

    fn manager() -> Arc<RenderManager> {
        RenderManager::new(RenderConfig::single_threaded(), Arc::new(HeadlessDevice::new())).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RenderConfig::single_threaded();
        config.buffers.max_software_buffers_per_hardware_buffer = 0;
        let result = RenderManager::new(config, Arc::new(HeadlessDevice::new()));
        assert!(matches!(result, Err(RenderError::InvalidConfig(_))));
    }

    #[test]
    fn test_frame_indices_increase() {
        let manager = manager();
        let a = manager.create_frame(None);
        let b = manager.create_frame(Some("second"));
        assert_eq!(b.index(), a.index() + 1);
        assert_eq!(b.label().as_deref(), Some("second"));
        assert!(manager.pick_frame_index() > b.index());
    }

    #[test]
    fn test_frames_are_pooled() {
        let manager = manager();
        let frame = manager.create_frame(None);
        frame.dispose(&manager).unwrap();

        let again = manager.create_frame(None);
        assert!(Arc::ptr_eq(&frame, &again));
        assert_eq!(manager.frame_pool_stats().reused, 1);
    }

    #[test]
    fn test_generator_registry_returns_same_instance() {
        let manager = manager();
        let a = manager.buffer_generator::<[f32; 4]>();
        let b = manager.buffer_generator::<[f32; 4]>();
        assert!(Arc::ptr_eq(&a, &b));

        let vertex = manager.buffer_generator::<Vertex>();
        assert!(Arc::ptr_eq(&vertex, &manager.vertex_generator()));
        assert_eq!(manager.generator_stats().len(), 2);
    }

    #[test]
    fn test_reset_and_flush_cover_every_generator() {
        let manager = manager();
        let extra = manager.buffer_generator::<[u8; 4]>();
        extra.allocate(4, 6, false).unwrap();

        manager.flush_buffer_generators().unwrap();
        assert!(extra.is_flushed());
        assert!(manager.vertex_generator().is_flushed());

        manager.reset_buffer_generators(7);
        assert!(!extra.is_flushed());
        assert_eq!(extra.frame_index(), 7);
    }

    #[test]
    fn test_try_set_pool_capacity() {
        let manager = manager();
        assert!(manager.try_set_pool_capacity(BatchKind::Geometry, 3));
        assert_eq!(manager.batch_pool(BatchKind::Geometry).capacity(), 3);
        assert!(!manager.try_set_pool_capacity(BatchKind::Geometry, 0));
    }

    #[test]
    fn test_empty_clear_rejected_before_allocation() {
        let manager = manager();
        let result = manager.new_clear(None, 0, ClearRequest::default());
        assert_eq!(result.err(), Some(RenderError::EmptyClear));
        assert_eq!(manager.batch_pool(BatchKind::Clear).stats().created, 0);
    }

    #[test]
    fn test_queued_release_drained() {
        let manager = manager();
        let batch = manager.new_scissor(None, 0, None).unwrap();
        manager.queue_release(Arc::clone(&batch));

        manager.drain_release_queue();
        assert!(batch.is_released());
    }
}
