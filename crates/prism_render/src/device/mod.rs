//! # Graphics Device Abstraction
//!
//! The rendering core never talks to a concrete graphics API. It consumes
//! this trait: create/destroy geometry buffers, upload bytes, bind buffers,
//! issue indexed draws, clear, set scissor, read textures back and present.
//! Device status is polled so the coordinator can skip issuance while the
//! device is lost.
//!
//! [`HeadlessDevice`] implements the trait in memory. It records every
//! command and keeps uploaded bytes, which makes it suitable for tools,
//! servers and tests.

mod headless;

pub use headless::{DeviceCommand, HeadlessDevice, ResolvedDraw};

use thiserror::Error;

/// Opaque device buffer handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Opaque texture handle assigned by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

/// Opaque material handle assigned by the host at registration time.
///
/// Batches sort by material handle; `None` sorts before every material.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u32);

/// What a device buffer holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Vertex data.
    Vertex,
    /// 16-bit index data.
    Index,
}

/// Device health as reported by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeviceStatus {
    /// Commands can be issued.
    #[default]
    Normal,
    /// The device was lost; commands are discarded until it is reset.
    Lost,
}

/// Blend state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum BlendMode {
    /// Source replaces destination.
    Opaque,
    /// Premultiplied alpha blending.
    #[default]
    Alpha,
    /// Additive blending.
    Additive,
}

/// Texture sampling state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum SamplerMode {
    /// Nearest-neighbour, clamped.
    PointClamp,
    /// Bilinear, clamped.
    #[default]
    LinearClamp,
    /// Bilinear, wrapped.
    LinearWrap,
}

/// Fixed-function state attached to geometry.
///
/// Two geometry batches may only be combined when their states are equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct RenderStates {
    /// Blend state.
    pub blend: BlendMode,
    /// Primary sampler.
    pub sampler: SamplerMode,
    /// Secondary sampler.
    pub sampler2: SamplerMode,
    /// Depth test/write enabled.
    pub use_z_buffer: bool,
    /// Depth is used for ordering only.
    pub z_buffer_only_sorting: bool,
}

/// Scissor rectangle in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScissorRect {
    /// Left edge.
    pub x: i32,
    /// Top edge.
    pub y: i32,
    /// Width.
    pub width: u32,
    /// Height.
    pub height: u32,
}

/// Which render target planes to clear and to what.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct ClearRequest {
    /// Clear color, if the color plane is cleared.
    pub color: Option<[f32; 4]>,
    /// Clear depth, if the depth plane is cleared.
    pub depth: Option<f32>,
    /// Clear stencil, if the stencil plane is cleared.
    pub stencil: Option<i32>,
}

impl ClearRequest {
    /// Returns true if nothing would be cleared.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.color.is_none() && self.depth.is_none() && self.stencil.is_none()
    }
}

/// An indexed draw over the currently bound buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawIndexed {
    /// Bytes per vertex.
    pub vertex_stride: u32,
    /// Added to every index before fetching a vertex.
    pub base_vertex: u32,
    /// First index to read.
    pub first_index: u32,
    /// Number of indices to read.
    pub index_count: u32,
    /// Texture sampled by the draw.
    pub texture: Option<TextureId>,
    /// Material used by the draw.
    pub material: Option<MaterialId>,
    /// Fixed-function state.
    pub states: RenderStates,
}

/// Errors reported by a graphics device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device is lost.
    #[error("device is lost")]
    Lost,
    /// The buffer handle is unknown or destroyed.
    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferId),
    /// The texture handle is unknown.
    #[error("unknown texture {0:?}")]
    UnknownTexture(TextureId),
    /// A write or read fell outside a buffer.
    #[error("{len} bytes at offset {offset} overflow a buffer of {capacity} bytes")]
    OutOfRange {
        /// Byte offset.
        offset: usize,
        /// Byte length.
        len: usize,
        /// Buffer size in bytes.
        capacity: usize,
    },
    /// A draw was issued with no buffers bound.
    #[error("no buffers bound")]
    NothingBound,
    /// Backend-specific failure.
    #[error("{0}")]
    Backend(String),
}

/// The graphics device consumed by the rendering core.
///
/// Implementations are shared between the preparing threads (buffer
/// creation during flush) and the draw thread (issuance). The coordinator
/// serializes access around device resets.
pub trait GraphicsDevice: Send + Sync {
    /// Current device status.
    fn status(&self) -> DeviceStatus;

    /// Recreates the device after a loss.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be restored yet.
    fn reset(&self) -> Result<(), DeviceError>;

    /// Creates a device-resident buffer of `size_bytes` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot allocate the buffer.
    fn create_buffer(&self, kind: BufferKind, size_bytes: usize) -> Result<BufferId, DeviceError>;

    /// Destroys a device-resident buffer. Unknown handles are ignored.
    fn destroy_buffer(&self, buffer: BufferId);

    /// Copies `data` into `buffer` starting at `offset_bytes`.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is unknown or the range overflows it.
    fn upload(&self, buffer: BufferId, offset_bytes: usize, data: &[u8]) -> Result<(), DeviceError>;

    /// Binds the vertex and index buffers used by subsequent draws.
    ///
    /// # Errors
    ///
    /// Returns an error if either buffer is unknown.
    fn bind_buffers(&self, vertices: BufferId, indices: BufferId) -> Result<(), DeviceError>;

    /// Issues an indexed draw over the bound buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing is bound or the draw reads out of range.
    fn draw_indexed(&self, call: &DrawIndexed) -> Result<(), DeviceError>;

    /// Clears the current render target.
    ///
    /// # Errors
    ///
    /// Returns an error if the device rejects the clear.
    fn clear(&self, request: &ClearRequest) -> Result<(), DeviceError>;

    /// Sets or resets the scissor rectangle.
    ///
    /// # Errors
    ///
    /// Returns an error if the device rejects the rectangle.
    fn set_scissor(&self, rect: Option<ScissorRect>) -> Result<(), DeviceError>;

    /// Size in bytes of a texture's contents, if the texture exists.
    fn texture_size(&self, texture: TextureId) -> Option<usize>;

    /// Copies a texture's contents into `destination`.
    ///
    /// # Errors
    ///
    /// Returns an error if the texture is unknown or `destination` is too small.
    fn read_texture(&self, texture: TextureId, destination: &mut [u8]) -> Result<(), DeviceError>;

    /// Presents the finished frame.
    ///
    /// # Errors
    ///
    /// Returns an error if presentation fails.
    fn present(&self) -> Result<(), DeviceError>;
}
