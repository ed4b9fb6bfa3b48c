//! Software/hardware buffer allocation and upload.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use super::array::{GrowableArray, SharedArray};
use super::cached::CachedBuffer;
use crate::config::BufferConfig;
use crate::device::{BufferId, BufferKind, GraphicsDevice};
use crate::error::{RenderError, RenderResult};
use crate::stats::GeneratorStats;

/// Bytes per index.
const INDEX_SIZE: usize = std::mem::size_of::<u16>();

/// Excludes writers while the generator flushes or resets.
struct WriteGate {
    lock: RwLock<()>,
    flushed: AtomicBool,
    /// Bumped on every reset so stale handles cannot write.
    epoch: AtomicU64,
}

/// A pair of device buffers owned by the generator.
#[derive(Debug)]
pub(super) struct DeviceBuffers {
    pub(super) vertices: BufferId,
    pub(super) indices: BufferId,
    pub(super) vertex_capacity: usize,
    pub(super) index_capacity: usize,
    /// Resets survived without being used.
    age: u32,
}

impl DeviceBuffers {
    pub(super) fn create(
        device: &dyn GraphicsDevice,
        vertex_capacity: usize,
        index_capacity: usize,
        vertex_stride: usize,
    ) -> RenderResult<Self> {
        let vertices = device.create_buffer(BufferKind::Vertex, vertex_capacity * vertex_stride)?;
        let indices = match device.create_buffer(BufferKind::Index, index_capacity * INDEX_SIZE) {
            Ok(indices) => indices,
            Err(error) => {
                device.destroy_buffer(vertices);
                return Err(error.into());
            }
        };
        Ok(Self {
            vertices,
            indices,
            vertex_capacity,
            index_capacity,
            age: 0,
        })
    }

    pub(super) fn destroy(self, device: &dyn GraphicsDevice) {
        device.destroy_buffer(self.vertices);
        device.destroy_buffer(self.indices);
    }
}

/// One software buffer's slice of a hardware entry.
#[derive(Clone, Copy, Debug)]
struct Region {
    vertex_start: usize,
    vertex_count: usize,
    index_start: usize,
    index_count: usize,
    hardware_vertex: usize,
    hardware_index: usize,
}

struct EntryState {
    vertices_claimed: usize,
    indices_claimed: usize,
    regions: Vec<Region>,
    /// Device buffers while the entry is live this frame.
    buffers: Option<DeviceBuffers>,
    /// Buffer handles once every region has been uploaded. Survives reset
    /// so the frame being drawn keeps its bindings.
    uploaded: Option<(BufferId, BufferId)>,
}

/// Tracks how much of one device buffer pair has been claimed.
struct HardwareEntry {
    id: u64,
    vertex_capacity: usize,
    index_capacity: usize,
    exclusive: bool,
    state: Mutex<EntryState>,
}

impl HardwareEntry {
    fn try_claim(
        &self,
        vertex_start: usize,
        vertex_count: usize,
        index_start: usize,
        index_count: usize,
        max_regions: usize,
    ) -> Option<(usize, usize)> {
        let mut state = self.state.lock();
        let full = (self.exclusive && !state.regions.is_empty())
            || state.regions.len() >= max_regions
            || state.vertices_claimed + vertex_count > self.vertex_capacity
            || state.indices_claimed + index_count > self.index_capacity;
        if full {
            return None;
        }

        let hardware_vertex = state.vertices_claimed;
        let hardware_index = state.indices_claimed;
        state.regions.push(Region {
            vertex_start,
            vertex_count,
            index_start,
            index_count,
            hardware_vertex,
            hardware_index,
        });
        state.vertices_claimed += vertex_count;
        state.indices_claimed += index_count;
        Some((hardware_vertex, hardware_index))
    }
}

#[derive(Default)]
struct Pools {
    /// Entries that received allocations since the last reset.
    used: Vec<Arc<HardwareEntry>>,
    /// Idle device buffers, ascending by capacity.
    available: Vec<DeviceBuffers>,
    /// Device buffers to destroy at the next flush.
    doomed: Vec<DeviceBuffers>,
    /// Reused upload scratch.
    staging: Vec<u8>,
    next_entry: u64,
}

impl Pools {
    fn take_best_fit(&mut self, vertices: usize, indices: usize) -> Option<DeviceBuffers> {
        let index = self
            .available
            .iter()
            .position(|b| b.vertex_capacity >= vertices && b.index_capacity >= indices)?;
        Some(self.available.remove(index))
    }
}

/// Device buffer binding for a flushed software buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBinding {
    /// Device vertex buffer.
    pub vertex_buffer: BufferId,
    /// Device index buffer.
    pub index_buffer: BufferId,
    /// Offset of the first vertex within the device vertex buffer.
    pub base_vertex: u32,
    /// Offset of the first index within the device index buffer.
    pub first_index: u32,
    /// Vertices in the region.
    pub vertex_count: u32,
    /// Indices in the region.
    pub index_count: u32,
}

/// Caller-visible handle to a reserved region of the backing arrays.
///
/// Indices written through the handle are relative to the region's first
/// vertex; [`BufferBinding::base_vertex`] rebases them at draw time.
pub struct SoftwareBuffer<V: Pod> {
    gate: Arc<WriteGate>,
    epoch: u64,
    vertex_array: Arc<SharedArray<V>>,
    index_array: Arc<SharedArray<u16>>,
    vertex_start: usize,
    vertex_count: usize,
    index_start: usize,
    index_count: usize,
    entry: Arc<HardwareEntry>,
    hardware_vertex: usize,
    hardware_index: usize,
}

/// Write access to a software buffer's region.
///
/// Holds the generator's write gate open, so flush and reset wait until the
/// writer is dropped.
pub struct BufferWriter<'a, V> {
    _gate: RwLockReadGuard<'a, ()>,
    vertices: &'a mut [V],
    indices: &'a mut [u16],
}

impl<V> BufferWriter<'_, V> {
    /// The region's vertices.
    #[inline]
    pub fn vertices(&mut self) -> &mut [V] {
        self.vertices
    }

    /// The region's indices.
    #[inline]
    pub fn indices(&mut self) -> &mut [u16] {
        self.indices
    }

    /// Both halves of the region at once.
    #[inline]
    pub fn split(&mut self) -> (&mut [V], &mut [u16]) {
        (self.vertices, self.indices)
    }
}

impl<V: Pod> SoftwareBuffer<V> {
    /// Range of the backing vertex array owned by this buffer.
    #[inline]
    #[must_use]
    pub fn vertex_range(&self) -> Range<usize> {
        self.vertex_start..self.vertex_start + self.vertex_count
    }

    /// Range of the backing index array owned by this buffer.
    #[inline]
    #[must_use]
    pub fn index_range(&self) -> Range<usize> {
        self.index_start..self.index_start + self.index_count
    }

    /// Byte range of the backing vertex array owned by this buffer.
    #[must_use]
    pub fn vertex_byte_range(&self) -> Range<usize> {
        let stride = std::mem::size_of::<V>();
        self.vertex_start * stride..(self.vertex_start + self.vertex_count) * stride
    }

    /// Offset of this buffer's first vertex inside its device buffer.
    #[inline]
    #[must_use]
    pub const fn hardware_vertex_offset(&self) -> usize {
        self.hardware_vertex
    }

    /// Offset of this buffer's first index inside its device buffer.
    #[inline]
    #[must_use]
    pub const fn hardware_index_offset(&self) -> usize {
        self.hardware_index
    }

    /// Identifier of the hardware entry this buffer was assigned to.
    #[must_use]
    pub fn hardware_entry(&self) -> u64 {
        self.entry.id
    }

    /// Opens the region for writing.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::WriteAfterFlush`] if the generator was flushed
    /// or reset since the buffer was allocated.
    pub fn write(&mut self) -> RenderResult<BufferWriter<'_, V>> {
        let this: &Self = self;
        let gate = this.gate.lock.read_recursive();
        if this.gate.flushed.load(Ordering::Acquire)
            || this.gate.epoch.load(Ordering::Acquire) != this.epoch
        {
            return Err(RenderError::WriteAfterFlush("writes"));
        }
        // SAFETY: the ranges were reserved for this handle alone, `&mut self`
        // prevents a second writer from the same handle, and the gate keeps
        // flush/reset from reading or recycling the arrays meanwhile.
        let (vertices, indices) = unsafe {
            (
                this.vertex_array.slice_mut(this.vertex_start, this.vertex_count),
                this.index_array.slice_mut(this.index_start, this.index_count),
            )
        };
        Ok(BufferWriter {
            _gate: gate,
            vertices,
            indices,
        })
    }

    /// Returns true once the region has been uploaded to the device.
    #[must_use]
    pub fn is_uploaded(&self) -> bool {
        self.entry.state.lock().uploaded.is_some()
    }

    /// Device binding, available once the generator has been flushed.
    #[must_use]
    pub fn binding(&self) -> Option<BufferBinding> {
        let (vertex_buffer, index_buffer) = self.entry.state.lock().uploaded?;
        Some(BufferBinding {
            vertex_buffer,
            index_buffer,
            base_vertex: u32::try_from(self.hardware_vertex).ok()?,
            first_index: u32::try_from(self.hardware_index).ok()?,
            vertex_count: u32::try_from(self.vertex_count).ok()?,
            index_count: u32::try_from(self.index_count).ok()?,
        })
    }
}

impl<V: Pod> std::fmt::Debug for SoftwareBuffer<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareBuffer")
            .field("vertices", &self.vertex_range())
            .field("indices", &self.index_range())
            .field("entry", &self.entry.id)
            .field("hardware_vertex", &self.hardware_vertex)
            .field("hardware_index", &self.hardware_index)
            .finish()
    }
}

/// Thread-safe vertex/index allocator for one vertex type.
///
/// # Thread Safety
///
/// `allocate` may be called from any number of preparation threads. Range
/// reservation is lock-free on the common path; only the choice of device
/// buffer is serialized, by a lock scoped to the currently filling entry.
/// `reset` and `flush` exclude every allocation and write.
///
/// # Example
///
/// ```rust,ignore
/// let generator = manager.buffer_generator::<Vertex>();
///
/// let mut buffer = generator.allocate(4, 6, false)?;
/// {
///     let mut writer = buffer.write()?;
///     writer.vertices().copy_from_slice(&corners);
///     writer.indices().copy_from_slice(&[0, 1, 2, 0, 2, 3]);
/// }
///
/// generator.flush()?;
/// let binding = buffer.binding().unwrap();
/// ```
pub struct BufferGenerator<V: Pod + Send + Sync> {
    device: Arc<dyn GraphicsDevice>,
    config: BufferConfig,
    vertices: GrowableArray<V>,
    indices: GrowableArray<u16>,
    gate: Arc<WriteGate>,
    filling: Mutex<Option<Arc<HardwareEntry>>>,
    pools: Mutex<Pools>,
    cached: Mutex<HashMap<String, CachedBuffer<V>>>,
    allocations: AtomicU64,
    flushes: AtomicU64,
    frame_index: AtomicU64,
}

impl<V: Pod + Send + Sync> BufferGenerator<V> {
    /// Creates a generator.
    ///
    /// # Arguments
    ///
    /// * `device` - Receives buffer creation, upload and destruction
    /// * `config` - Capacity limits and aging policy
    /// * `arrays_per_size_class` - Backing arrays kept for reuse per size
    #[must_use]
    pub fn new(
        device: Arc<dyn GraphicsDevice>,
        config: BufferConfig,
        arrays_per_size_class: usize,
    ) -> Self {
        let initial = config.initial_array_capacity;
        Self {
            device,
            vertices: GrowableArray::new("vertex", initial, arrays_per_size_class),
            indices: GrowableArray::new("index", initial, arrays_per_size_class),
            config,
            gate: Arc::new(WriteGate {
                lock: RwLock::new(()),
                flushed: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
            }),
            filling: Mutex::new(None),
            pools: Mutex::new(Pools::default()),
            cached: Mutex::new(HashMap::new()),
            allocations: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            frame_index: AtomicU64::new(0),
        }
    }

    /// Returns the generator configuration.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Frame index passed to the last reset.
    #[must_use]
    pub fn frame_index(&self) -> u64 {
        self.frame_index.load(Ordering::Relaxed)
    }

    /// Returns true if the generator was flushed since the last reset.
    #[must_use]
    pub fn is_flushed(&self) -> bool {
        self.gate.flushed.load(Ordering::Acquire)
    }

    /// Reserves `vertex_count` vertices and `index_count` indices.
    ///
    /// # Arguments
    ///
    /// * `exclusive` - Give the region a device buffer of its own
    ///
    /// # Errors
    ///
    /// - [`RenderError::AllocationTooLarge`] if either count exceeds what one
    ///   device buffer holds. Nothing is reserved in that case.
    /// - [`RenderError::WriteAfterFlush`] if the generator was flushed this
    ///   frame.
    pub fn allocate(
        &self,
        vertex_count: usize,
        index_count: usize,
        exclusive: bool,
    ) -> RenderResult<SoftwareBuffer<V>> {
        if vertex_count > self.config.max_vertices_per_buffer {
            return Err(RenderError::AllocationTooLarge {
                what: "vertices",
                requested: vertex_count,
                maximum: self.config.max_vertices_per_buffer,
            });
        }
        if index_count > self.config.max_indices_per_buffer {
            return Err(RenderError::AllocationTooLarge {
                what: "indices",
                requested: index_count,
                maximum: self.config.max_indices_per_buffer,
            });
        }

        let _gate = self.gate.lock.read_recursive();
        if self.gate.flushed.load(Ordering::Acquire) {
            return Err(RenderError::WriteAfterFlush("allocation"));
        }
        let epoch = self.gate.epoch.load(Ordering::Acquire);

        let (vertex_array, vertex_start) = self.vertices.reserve(vertex_count);
        let (index_array, index_start) = self.indices.reserve(index_count);
        let (entry, hardware_vertex, hardware_index) =
            self.claim(vertex_start, vertex_count, index_start, index_count, exclusive);

        self.allocations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            "allocated {} vertices @{} / {} indices @{} in entry {}",
            vertex_count,
            vertex_start,
            index_count,
            index_start,
            entry.id
        );

        Ok(SoftwareBuffer {
            gate: Arc::clone(&self.gate),
            epoch,
            vertex_array,
            index_array,
            vertex_start,
            vertex_count,
            index_start,
            index_count,
            entry,
            hardware_vertex,
            hardware_index,
        })
    }

    fn claim(
        &self,
        vertex_start: usize,
        vertex_count: usize,
        index_start: usize,
        index_count: usize,
        exclusive: bool,
    ) -> (Arc<HardwareEntry>, usize, usize) {
        let max_regions = self.config.max_software_buffers_per_hardware_buffer;
        let mut filling = self.filling.lock();

        if !exclusive {
            if let Some(entry) = filling.as_ref() {
                if let Some((hv, hi)) =
                    entry.try_claim(vertex_start, vertex_count, index_start, index_count, max_regions)
                {
                    return (Arc::clone(entry), hv, hi);
                }
            }
        }

        let (want_vertices, want_indices) = if exclusive {
            (vertex_count.max(1), index_count.max(1))
        } else {
            (
                self.config.max_vertices_per_buffer,
                self.config.max_indices_per_buffer,
            )
        };

        let mut pools = self.pools.lock();
        let buffers = pools.take_best_fit(want_vertices, want_indices);
        let (vertex_capacity, index_capacity) = buffers
            .as_ref()
            .map_or((want_vertices, want_indices), |b| (b.vertex_capacity, b.index_capacity));
        pools.next_entry += 1;
        let entry = Arc::new(HardwareEntry {
            id: pools.next_entry,
            vertex_capacity,
            index_capacity,
            exclusive,
            state: Mutex::new(EntryState {
                vertices_claimed: 0,
                indices_claimed: 0,
                regions: Vec::new(),
                buffers,
                uploaded: None,
            }),
        });
        pools.used.push(Arc::clone(&entry));
        drop(pools);

        // A fresh entry always fits: both counts were range-checked against
        // the per-buffer maximum.
        let (hv, hi) = entry
            .try_claim(vertex_start, vertex_count, index_start, index_count, max_regions.max(1))
            .unwrap_or((0, 0));
        if !exclusive {
            *filling = Some(Arc::clone(&entry));
        }
        (entry, hv, hi)
    }

    /// Runs pending copy-forwards, then uploads every used entry.
    ///
    /// Device buffers doomed by the last reset are destroyed first.
    ///
    /// # Errors
    ///
    /// - [`RenderError::AlreadyFlushed`] if called twice without a reset
    /// - [`RenderError::Device`] if buffer creation or upload fails
    pub fn flush(&self) -> RenderResult<()> {
        let _gate = self.gate.lock.write();
        if self.gate.flushed.swap(true, Ordering::AcqRel) {
            return Err(RenderError::AlreadyFlushed);
        }

        // SAFETY: the write gate excludes every allocation and writer.
        unsafe {
            self.vertices.apply_copies();
            self.indices.apply_copies();
        }
        let vertex_array = self.vertices.current();
        let index_array = self.indices.current();

        let mut pools = self.pools.lock();
        for doomed in std::mem::take(&mut pools.doomed) {
            doomed.destroy(self.device.as_ref());
        }

        let Pools { used, staging, .. } = &mut *pools;
        for entry in used.iter() {
            self.upload_entry(entry, &vertex_array, &index_array, staging)?;
        }
        let entries = used.len();
        drop(pools);

        for cached in self.cached.lock().values() {
            cached.upload(self.device.as_ref())?;
        }

        self.flushes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "flushed {} vertices / {} indices across {} device buffers",
            self.vertices.reserved(),
            self.indices.reserved(),
            entries
        );
        Ok(())
    }

    fn upload_entry(
        &self,
        entry: &HardwareEntry,
        vertex_array: &SharedArray<V>,
        index_array: &SharedArray<u16>,
        staging: &mut Vec<u8>,
    ) -> RenderResult<()> {
        let stride = std::mem::size_of::<V>();
        let mut state = entry.state.lock();
        if state.buffers.is_none() {
            state.buffers = Some(DeviceBuffers::create(
                self.device.as_ref(),
                entry.vertex_capacity,
                entry.index_capacity,
                stride,
            )?);
        }
        let Some((vertex_buffer, index_buffer)) =
            state.buffers.as_ref().map(|b| (b.vertices, b.indices))
        else {
            return Ok(());
        };

        staging.clear();
        staging.resize(state.vertices_claimed * stride, 0);
        for region in &state.regions {
            // SAFETY: flush holds the write gate; no writer is active.
            let source = unsafe { vertex_array.slice(region.vertex_start, region.vertex_count) };
            let offset = region.hardware_vertex * stride;
            staging[offset..offset + region.vertex_count * stride]
                .copy_from_slice(bytemuck::cast_slice(source));
        }
        if !staging.is_empty() {
            self.device.upload(vertex_buffer, 0, staging)?;
        }

        staging.clear();
        staging.resize(state.indices_claimed * INDEX_SIZE, 0);
        for region in &state.regions {
            // SAFETY: as above.
            let source = unsafe { index_array.slice(region.index_start, region.index_count) };
            let offset = region.hardware_index * INDEX_SIZE;
            staging[offset..offset + region.index_count * INDEX_SIZE]
                .copy_from_slice(bytemuck::cast_slice(source));
        }
        if !staging.is_empty() {
            self.device.upload(index_buffer, 0, staging)?;
        }

        state.uploaded = Some((vertex_buffer, index_buffer));
        Ok(())
    }

    /// Starts a new frame.
    ///
    /// Device buffers used last frame return to the available pool. Idle
    /// buffers age by one; those reaching the maximum age, or exceeding the
    /// unused-buffer cap, are destroyed at the next flush. Backing arrays
    /// are rewound and every outstanding software buffer becomes read-only.
    pub fn reset(&self, frame_index: u64) {
        let _gate = self.gate.lock.write();
        self.gate.epoch.fetch_add(1, Ordering::AcqRel);
        self.gate.flushed.store(false, Ordering::Release);
        self.filling.lock().take();

        let mut pools = self.pools.lock();
        for buffers in &mut pools.available {
            buffers.age += 1;
        }
        for entry in std::mem::take(&mut pools.used) {
            if let Some(mut buffers) = entry.state.lock().buffers.take() {
                buffers.age = 0;
                pools.available.push(buffers);
            }
        }

        let max_age = self.config.max_buffer_age;
        let Pools {
            available, doomed, ..
        } = &mut *pools;
        let mut i = 0;
        while i < available.len() {
            if available[i].age >= max_age {
                doomed.push(available.swap_remove(i));
            } else {
                i += 1;
            }
        }
        if available.len() > self.config.max_unused_buffers {
            available.sort_by_key(|b| b.age);
            doomed.extend(available.drain(self.config.max_unused_buffers..));
        }
        available.sort_by_key(|b| (b.vertex_capacity, b.index_capacity));
        let (idle, expiring) = (available.len(), doomed.len());
        drop(pools);

        self.vertices.reset();
        self.indices.reset();
        self.frame_index.store(frame_index, Ordering::Relaxed);
        tracing::trace!(
            "generator reset for frame {}: {} idle device buffers, {} expiring",
            frame_index,
            idle,
            expiring
        );
    }

    /// Forgets every device buffer without destroying it.
    ///
    /// Called after a device reset, when the old handles are already gone.
    /// Buffers are recreated on the next flush.
    pub fn discard_device_buffers(&self) {
        let _gate = self.gate.lock.write();
        self.filling.lock().take();
        let mut pools = self.pools.lock();
        pools.available.clear();
        pools.doomed.clear();
        for entry in &pools.used {
            let mut state = entry.state.lock();
            state.buffers = None;
            state.uploaded = None;
        }
        drop(pools);
        for cached in self.cached.lock().values() {
            cached.discard();
        }
    }

    /// Returns the cached buffer registered under `key`, creating an empty
    /// one if needed.
    ///
    /// Cached buffers persist across frames, are uploaded at flush whenever
    /// their contents changed and are never aged out.
    pub fn get_or_create_cached(&self, key: &str) -> CachedBuffer<V> {
        self.cached
            .lock()
            .entry(key.to_owned())
            .or_insert_with(|| CachedBuffer::new(key))
            .clone()
    }

    /// Removes a cached buffer. Its device buffers are destroyed at the next
    /// flush.
    ///
    /// # Returns
    ///
    /// `true` if a buffer was registered under `key`.
    pub fn remove_cached(&self, key: &str) -> bool {
        let Some(cached) = self.cached.lock().remove(key) else {
            return false;
        };
        if let Some(buffers) = cached.take_buffers() {
            self.pools.lock().doomed.push(buffers);
        }
        true
    }

    /// Returns a snapshot of the generator counters.
    #[must_use]
    pub fn stats(&self) -> GeneratorStats {
        let pools = self.pools.lock();
        GeneratorStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            vertices_reserved: self.vertices.reserved(),
            indices_reserved: self.indices.reserved(),
            vertex_capacity: self.vertices.capacity(),
            index_capacity: self.indices.capacity(),
            growths: self.vertices.growths() + self.indices.growths(),
            vertex_growths: self.vertices.growths(),
            index_growths: self.indices.growths(),
            pending_copies: self.vertices.pending_copies() + self.indices.pending_copies(),
            used_entries: pools.used.len(),
            available_buffers: pools.available.len(),
            expiring_buffers: pools.doomed.len(),
            cached_buffers: self.cached.lock().len(),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

impl<V: Pod + Send + Sync> Drop for BufferGenerator<V> {
    fn drop(&mut self) {
        let device = Arc::clone(&self.device);
        let pools = self.pools.get_mut();
        for buffers in pools.available.drain(..).chain(pools.doomed.drain(..)) {
            buffers.destroy(device.as_ref());
        }
        for entry in pools.used.drain(..) {
            if let Some(buffers) = entry.state.lock().buffers.take() {
                buffers.destroy(device.as_ref());
            }
        }
        for (_, cached) in self.cached.get_mut().drain() {
            if let Some(buffers) = cached.take_buffers() {
                buffers.destroy(device.as_ref());
            }
        }
    }
}

impl<V: Pod + Send + Sync> std::fmt::Debug for BufferGenerator<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferGenerator")
            .field("vertex_type", &std::any::type_name::<V>())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Frame-cycle operations shared by every generator regardless of vertex type.
pub(crate) trait ErasedGenerator: Send + Sync {
    fn reset(&self, frame_index: u64);
    fn flush(&self) -> RenderResult<()>;
    fn discard_device_buffers(&self);
    fn stats(&self) -> GeneratorStats;
}

impl<V: Pod + Send + Sync> ErasedGenerator for BufferGenerator<V> {
    fn reset(&self, frame_index: u64) {
        BufferGenerator::reset(self, frame_index);
    }

    fn flush(&self) -> RenderResult<()> {
        BufferGenerator::flush(self)
    }

    fn discard_device_buffers(&self) {
        BufferGenerator::discard_device_buffers(self);
    }

    fn stats(&self) -> GeneratorStats {
        BufferGenerator::stats(self)
    }
}
