//! Persistent geometry owned by a generator across frames.

use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::Mutex;

use super::generator::{BufferBinding, DeviceBuffers};
use crate::device::GraphicsDevice;
use crate::error::RenderResult;

struct CachedState<V> {
    key: String,
    vertices: Vec<V>,
    indices: Vec<u16>,
    buffers: Option<DeviceBuffers>,
    dirty: bool,
}

/// Geometry that survives generator resets.
///
/// Contents are uploaded at the next flush after every [`update`], and the
/// device buffers are never aged out. Handles are cheap to clone and all
/// refer to the same buffer.
///
/// [`update`]: CachedBuffer::update
pub struct CachedBuffer<V> {
    inner: Arc<Mutex<CachedState<V>>>,
}

impl<V> Clone for CachedBuffer<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Pod> CachedBuffer<V> {
    pub(super) fn new(key: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CachedState {
                key: key.to_owned(),
                vertices: Vec::new(),
                indices: Vec::new(),
                buffers: None,
                dirty: true,
            })),
        }
    }

    /// Key the buffer is registered under.
    #[must_use]
    pub fn key(&self) -> String {
        self.inner.lock().key.clone()
    }

    /// Vertices currently stored.
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.inner.lock().vertices.len()
    }

    /// Indices currently stored.
    #[must_use]
    pub fn index_count(&self) -> usize {
        self.inner.lock().indices.len()
    }

    /// Edits the contents and schedules an upload.
    pub fn update(&self, edit: impl FnOnce(&mut Vec<V>, &mut Vec<u16>)) {
        let mut state = self.inner.lock();
        let CachedState {
            vertices, indices, ..
        } = &mut *state;
        edit(vertices, indices);
        state.dirty = true;
    }

    /// Returns true if the contents changed since the last upload.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    /// Device binding of the last upload, or `None` while changes are pending.
    #[must_use]
    pub fn binding(&self) -> Option<BufferBinding> {
        let state = self.inner.lock();
        if state.dirty {
            return None;
        }
        let buffers = state.buffers.as_ref()?;
        Some(BufferBinding {
            vertex_buffer: buffers.vertices,
            index_buffer: buffers.indices,
            base_vertex: 0,
            first_index: 0,
            vertex_count: u32::try_from(state.vertices.len()).ok()?,
            index_count: u32::try_from(state.indices.len()).ok()?,
        })
    }

    pub(super) fn upload(&self, device: &dyn GraphicsDevice) -> RenderResult<()> {
        let mut state = self.inner.lock();
        if !state.dirty {
            return Ok(());
        }

        let vertex_count = state.vertices.len().max(1);
        let index_count = state.indices.len().max(1);
        let fits = state
            .buffers
            .as_ref()
            .is_some_and(|b| b.vertex_capacity >= vertex_count && b.index_capacity >= index_count);
        if !fits {
            if let Some(old) = state.buffers.take() {
                old.destroy(device);
            }
            state.buffers = Some(DeviceBuffers::create(
                device,
                vertex_count,
                index_count,
                std::mem::size_of::<V>(),
            )?);
        }

        if let Some(buffers) = state.buffers.as_ref() {
            if !state.vertices.is_empty() {
                device.upload(buffers.vertices, 0, bytemuck::cast_slice(&state.vertices))?;
            }
            if !state.indices.is_empty() {
                device.upload(buffers.indices, 0, bytemuck::cast_slice(&state.indices))?;
            }
        }
        state.dirty = false;
        tracing::trace!("uploaded cached buffer '{}'", state.key);
        Ok(())
    }

    pub(super) fn discard(&self) {
        let mut state = self.inner.lock();
        state.buffers = None;
        state.dirty = true;
    }

    pub(super) fn take_buffers(&self) -> Option<DeviceBuffers> {
        let mut state = self.inner.lock();
        state.dirty = true;
        state.buffers.take()
    }
}

impl<V> std::fmt::Debug for CachedBuffer<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("CachedBuffer")
            .field("key", &state.key)
            .field("vertices", &state.vertices.len())
            .field("indices", &state.indices.len())
            .field("dirty", &state.dirty)
            .finish()
    }
}
