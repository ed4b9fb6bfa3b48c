//! In-memory graphics device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{
    BufferId, BufferKind, ClearRequest, DeviceError, DeviceStatus, DrawIndexed, GraphicsDevice,
    ScissorRect, TextureId,
};

/// A command received by a [`HeadlessDevice`].
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceCommand {
    /// Buffer created.
    CreateBuffer {
        /// New handle.
        id: BufferId,
        /// Buffer contents.
        kind: BufferKind,
        /// Size in bytes.
        size: usize,
    },
    /// Buffer destroyed.
    DestroyBuffer(BufferId),
    /// Bytes uploaded.
    Upload {
        /// Target buffer.
        buffer: BufferId,
        /// Byte offset.
        offset: usize,
        /// Byte length.
        len: usize,
    },
    /// Buffers bound.
    Bind {
        /// Vertex buffer.
        vertices: BufferId,
        /// Index buffer.
        indices: BufferId,
    },
    /// Indexed draw issued.
    Draw(DrawIndexed),
    /// Render target cleared.
    Clear(ClearRequest),
    /// Scissor set or reset.
    Scissor(Option<ScissorRect>),
    /// Texture read back.
    ReadTexture(TextureId),
    /// Frame presented.
    Present,
}

/// A draw resolved into the vertex bytes it would rasterize.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDraw {
    /// Texture sampled by the draw.
    pub texture: Option<TextureId>,
    /// Bytes per vertex.
    pub stride: usize,
    /// Vertex bytes in index order, `stride` bytes per vertex.
    pub vertices: Vec<u8>,
}

#[derive(Default)]
struct State {
    buffers: HashMap<BufferId, Vec<u8>>,
    textures: HashMap<TextureId, Vec<u8>>,
    bound: Option<(BufferId, BufferId)>,
    commands: Vec<DeviceCommand>,
    resolved: Vec<ResolvedDraw>,
}

/// A recording [`GraphicsDevice`] that keeps everything in memory.
///
/// Uploaded bytes are stored per buffer and every draw is resolved into the
/// vertex bytes it reads, so two command streams can be compared for visual
/// equivalence without a GPU.
///
/// # Example
///
/// ```rust,ignore
/// let device = Arc::new(HeadlessDevice::new());
/// let manager = RenderManager::new(RenderConfig::single_threaded(), device.clone())?;
/// // ... draw a frame ...
/// assert_eq!(device.draw_count(), 3);
/// ```
#[derive(Default)]
pub struct HeadlessDevice {
    state: Mutex<State>,
    next_buffer: AtomicU64,
    lost: AtomicBool,
    fail_draws: AtomicBool,
}

impl HeadlessDevice {
    /// Creates an empty device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a texture with the given contents.
    pub fn add_texture(&self, texture: TextureId, contents: Vec<u8>) {
        self.state.lock().textures.insert(texture, contents);
    }

    /// Simulates losing the device. Cleared by [`GraphicsDevice::reset`].
    pub fn set_lost(&self, lost: bool) {
        self.lost.store(lost, Ordering::Release);
    }

    /// Makes every subsequent draw fail with a backend error.
    pub fn set_fail_draws(&self, fail: bool) {
        self.fail_draws.store(fail, Ordering::Release);
    }

    /// Returns every recorded command.
    #[must_use]
    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.state.lock().commands.clone()
    }

    /// Returns and clears the recorded commands and resolved draws.
    pub fn take_commands(&self) -> Vec<DeviceCommand> {
        let mut state = self.state.lock();
        state.resolved.clear();
        std::mem::take(&mut state.commands)
    }

    /// Returns every draw resolved into vertex bytes.
    #[must_use]
    pub fn resolved_draws(&self) -> Vec<ResolvedDraw> {
        self.state.lock().resolved.clone()
    }

    /// Number of draws issued.
    #[must_use]
    pub fn draw_count(&self) -> usize {
        self.state.lock().resolved.len()
    }

    /// Number of live device buffers.
    #[must_use]
    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Returns a copy of a buffer's contents.
    #[must_use]
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).cloned()
    }

    fn check_lost(&self) -> Result<(), DeviceError> {
        if self.lost.load(Ordering::Acquire) {
            Err(DeviceError::Lost)
        } else {
            Ok(())
        }
    }
}

impl GraphicsDevice for HeadlessDevice {
    fn status(&self) -> DeviceStatus {
        if self.lost.load(Ordering::Acquire) {
            DeviceStatus::Lost
        } else {
            DeviceStatus::Normal
        }
    }

    fn reset(&self) -> Result<(), DeviceError> {
        self.lost.store(false, Ordering::Release);
        self.state.lock().bound = None;
        Ok(())
    }

    fn create_buffer(&self, kind: BufferKind, size_bytes: usize) -> Result<BufferId, DeviceError> {
        self.check_lost()?;
        let id = BufferId(self.next_buffer.fetch_add(1, Ordering::Relaxed) + 1);
        let mut state = self.state.lock();
        state.buffers.insert(id, vec![0; size_bytes]);
        state.commands.push(DeviceCommand::CreateBuffer {
            id,
            kind,
            size: size_bytes,
        });
        Ok(id)
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer).is_some() {
            state.commands.push(DeviceCommand::DestroyBuffer(buffer));
        }
        if matches!(state.bound, Some((v, i)) if v == buffer || i == buffer) {
            state.bound = None;
        }
    }

    fn upload(&self, buffer: BufferId, offset_bytes: usize, data: &[u8]) -> Result<(), DeviceError> {
        self.check_lost()?;
        let mut state = self.state.lock();
        let contents = state
            .buffers
            .get_mut(&buffer)
            .ok_or(DeviceError::UnknownBuffer(buffer))?;
        let capacity = contents.len();
        let target = contents
            .get_mut(offset_bytes..offset_bytes + data.len())
            .ok_or(DeviceError::OutOfRange {
                offset: offset_bytes,
                len: data.len(),
                capacity,
            })?;
        target.copy_from_slice(data);
        state.commands.push(DeviceCommand::Upload {
            buffer,
            offset: offset_bytes,
            len: data.len(),
        });
        Ok(())
    }

    fn bind_buffers(&self, vertices: BufferId, indices: BufferId) -> Result<(), DeviceError> {
        self.check_lost()?;
        let mut state = self.state.lock();
        for buffer in [vertices, indices] {
            if !state.buffers.contains_key(&buffer) {
                return Err(DeviceError::UnknownBuffer(buffer));
            }
        }
        state.bound = Some((vertices, indices));
        state.commands.push(DeviceCommand::Bind { vertices, indices });
        Ok(())
    }

    fn draw_indexed(&self, call: &DrawIndexed) -> Result<(), DeviceError> {
        self.check_lost()?;
        if self.fail_draws.load(Ordering::Acquire) {
            return Err(DeviceError::Backend("draw rejected".into()));
        }

        let mut state = self.state.lock();
        let (vertex_buffer, index_buffer) = state.bound.ok_or(DeviceError::NothingBound)?;
        let vertex_bytes = state
            .buffers
            .get(&vertex_buffer)
            .ok_or(DeviceError::UnknownBuffer(vertex_buffer))?;
        let index_bytes = state
            .buffers
            .get(&index_buffer)
            .ok_or(DeviceError::UnknownBuffer(index_buffer))?;

        let stride = call.vertex_stride as usize;
        let first = call.first_index as usize * 2;
        let count = call.index_count as usize;
        let indices = index_bytes
            .get(first..first + count * 2)
            .ok_or(DeviceError::OutOfRange {
                offset: first,
                len: count * 2,
                capacity: index_bytes.len(),
            })?;

        let mut vertices = Vec::with_capacity(count * stride);
        for pair in indices.chunks_exact(2) {
            let index = u16::from_le_bytes([pair[0], pair[1]]) as usize;
            let offset = (call.base_vertex as usize + index) * stride;
            let vertex = vertex_bytes
                .get(offset..offset + stride)
                .ok_or(DeviceError::OutOfRange {
                    offset,
                    len: stride,
                    capacity: vertex_bytes.len(),
                })?;
            vertices.extend_from_slice(vertex);
        }

        state.resolved.push(ResolvedDraw {
            texture: call.texture,
            stride,
            vertices,
        });
        state.commands.push(DeviceCommand::Draw(*call));
        Ok(())
    }

    fn clear(&self, request: &ClearRequest) -> Result<(), DeviceError> {
        self.check_lost()?;
        self.state.lock().commands.push(DeviceCommand::Clear(*request));
        Ok(())
    }

    fn set_scissor(&self, rect: Option<ScissorRect>) -> Result<(), DeviceError> {
        self.check_lost()?;
        self.state.lock().commands.push(DeviceCommand::Scissor(rect));
        Ok(())
    }

    fn texture_size(&self, texture: TextureId) -> Option<usize> {
        self.state.lock().textures.get(&texture).map(Vec::len)
    }

    fn read_texture(&self, texture: TextureId, destination: &mut [u8]) -> Result<(), DeviceError> {
        self.check_lost()?;
        let mut state = self.state.lock();
        let contents = state
            .textures
            .get(&texture)
            .ok_or(DeviceError::UnknownTexture(texture))?;
        let capacity = destination.len();
        let target = destination
            .get_mut(..contents.len())
            .ok_or(DeviceError::OutOfRange {
                offset: 0,
                len: contents.len(),
                capacity,
            })?;
        target.copy_from_slice(contents);
        state.commands.push(DeviceCommand::ReadTexture(texture));
        Ok(())
    }

    fn present(&self) -> Result<(), DeviceError> {
        self.check_lost()?;
        self.state.lock().commands.push(DeviceCommand::Present);
        Ok(())
    }
}

impl std::fmt::Debug for HeadlessDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessDevice")
            .field("status", &self.status())
            .field("live_buffers", &self.live_buffer_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_and_resolve_draw() {
        let device = HeadlessDevice::new();
        let vb = device.create_buffer(BufferKind::Vertex, 8).unwrap();
        let ib = device.create_buffer(BufferKind::Index, 6).unwrap();

        device.upload(vb, 0, &[1, 1, 2, 2, 3, 3, 4, 4]).unwrap();
        device.upload(ib, 0, bytemuck::cast_slice(&[0u16, 1, 3])).unwrap();
        device.bind_buffers(vb, ib).unwrap();

        let call = DrawIndexed {
            vertex_stride: 2,
            base_vertex: 0,
            first_index: 0,
            index_count: 3,
            texture: Some(TextureId(9)),
            material: None,
            states: crate::device::RenderStates::default(),
        };
        device.draw_indexed(&call).unwrap();

        let draws = device.resolved_draws();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].vertices, vec![1, 1, 2, 2, 4, 4]);
        assert_eq!(draws[0].texture, Some(TextureId(9)));
    }

    #[test]
    fn test_upload_out_of_range() {
        let device = HeadlessDevice::new();
        let vb = device.create_buffer(BufferKind::Vertex, 4).unwrap();
        let result = device.upload(vb, 2, &[0; 4]);
        assert!(matches!(result, Err(DeviceError::OutOfRange { .. })));
    }

    #[test]
    fn test_lost_device_rejects_commands() {
        let device = HeadlessDevice::new();
        device.set_lost(true);
        assert_eq!(device.status(), DeviceStatus::Lost);
        assert_eq!(device.present(), Err(DeviceError::Lost));

        device.reset().unwrap();
        assert_eq!(device.status(), DeviceStatus::Normal);
        assert!(device.present().is_ok());
    }

    #[test]
    fn test_destroy_buffer() {
        let device = HeadlessDevice::new();
        let vb = device.create_buffer(BufferKind::Vertex, 16).unwrap();
        assert_eq!(device.live_buffer_count(), 1);
        device.destroy_buffer(vb);
        assert_eq!(device.live_buffer_count(), 0);
        assert!(device.buffer_contents(vb).is_none());
    }

    #[test]
    fn test_readback_requires_room() {
        let device = HeadlessDevice::new();
        device.add_texture(TextureId(1), vec![7; 4]);
        assert_eq!(device.texture_size(TextureId(1)), Some(4));

        let mut small = [0u8; 2];
        assert!(device.read_texture(TextureId(1), &mut small).is_err());

        let mut exact = [0u8; 4];
        device.read_texture(TextureId(1), &mut exact).unwrap();
        assert_eq!(exact, [7; 4]);
    }
}
