//! Per-kind draw payloads carried by batches.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::buffer::{BufferGenerator, SoftwareBuffer};
use crate::device::{
    ClearRequest, DrawIndexed, GraphicsDevice, MaterialId, RenderStates, ScissorRect, TextureId,
};
use crate::error::{RenderError, RenderResult};

use super::BatchRef;

/// Vertices per quad.
pub const QUAD_VERTICES: usize = 4;
/// Indices per quad.
pub const QUAD_INDICES: usize = 6;

/// Vertex layout emitted by geometry batches.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    /// Position.
    pub position: [f32; 3],
    /// Texture coordinate.
    pub texcoord: [f32; 2],
    /// RGBA8 color.
    pub color: [u8; 4],
}

/// One textured quad.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct QuadItem {
    /// Texture sampled by the quad.
    pub texture: Option<TextureId>,
    /// Corners in winding order: top-left, top-right, bottom-right, bottom-left.
    pub corners: [Vertex; 4],
}

impl QuadItem {
    /// Axis-aligned rectangle covering the whole texture.
    #[must_use]
    pub fn rect(
        texture: Option<TextureId>,
        origin: [f32; 2],
        size: [f32; 2],
        depth: f32,
        color: [u8; 4],
    ) -> Self {
        let [x, y] = origin;
        let [w, h] = size;
        let corner = |px: f32, py: f32, u: f32, v: f32| Vertex {
            position: [px, py, depth],
            texcoord: [u, v],
            color,
        };
        Self {
            texture,
            corners: [
                corner(x, y, 0.0, 0.0),
                corner(x + w, y, 1.0, 0.0),
                corner(x + w, y + h, 1.0, 1.0),
                corner(x, y + h, 0.0, 1.0),
            ],
        }
    }
}

/// Device work run around a group's children.
pub type IssueCallback = Arc<dyn Fn(&dyn GraphicsDevice) -> RenderResult<()> + Send + Sync>;

/// Consecutive quads sharing a texture, issued as one draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DrawRun {
    pub(crate) texture: Option<TextureId>,
    pub(crate) first_quad: usize,
    pub(crate) quad_count: usize,
}

#[derive(Default)]
pub(crate) struct GeometryPayload {
    pub(crate) states: RenderStates,
    pub(crate) items: Vec<QuadItem>,
    pub(crate) prepared: Option<SoftwareBuffer<Vertex>>,
    pub(crate) runs: Vec<DrawRun>,
}

impl GeometryPayload {
    /// Writes every quad into one software buffer and groups draw runs.
    pub(crate) fn prepare(&mut self, generator: &BufferGenerator<Vertex>) -> RenderResult<()> {
        self.prepared = None;
        self.runs.clear();
        if self.items.is_empty() {
            return Ok(());
        }

        let vertex_count = self.items.len() * QUAD_VERTICES;
        let mut buffer =
            generator.allocate(vertex_count, self.items.len() * QUAD_INDICES, false)?;
        {
            let mut writer = buffer.write()?;
            let (vertices, indices) = writer.split();
            for (i, item) in self.items.iter().enumerate() {
                let v = i * QUAD_VERTICES;
                vertices[v..v + QUAD_VERTICES].copy_from_slice(&item.corners);
                // Fits: allocate caps vertex_count at max_vertices_per_buffer,
                // which config validation keeps within u16.
                let base = v as u16;
                indices[i * QUAD_INDICES..(i + 1) * QUAD_INDICES]
                    .copy_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
            }
        }

        for (i, item) in self.items.iter().enumerate() {
            match self.runs.last_mut() {
                Some(run) if run.texture == item.texture => run.quad_count += 1,
                _ => self.runs.push(DrawRun {
                    texture: item.texture,
                    first_quad: i,
                    quad_count: 1,
                }),
            }
        }
        self.prepared = Some(buffer);
        Ok(())
    }

    /// Binds the uploaded buffers and draws each run.
    ///
    /// # Returns
    ///
    /// Number of draw calls issued.
    pub(crate) fn issue(
        &self,
        device: &dyn GraphicsDevice,
        material: Option<MaterialId>,
        describe: impl FnOnce() -> String,
    ) -> RenderResult<u32> {
        let Some(buffer) = &self.prepared else {
            return Ok(0);
        };
        let binding = buffer
            .binding()
            .ok_or_else(|| RenderError::NotUploaded(describe()))?;

        device.bind_buffers(binding.vertex_buffer, binding.index_buffer)?;
        let mut draws = 0;
        for run in &self.runs {
            device.draw_indexed(&DrawIndexed {
                vertex_stride: std::mem::size_of::<Vertex>() as u32,
                base_vertex: binding.base_vertex,
                first_index: binding.first_index + (run.first_quad * QUAD_INDICES) as u32,
                index_count: (run.quad_count * QUAD_INDICES) as u32,
                texture: run.texture,
                material,
                states: self.states,
            })?;
            draws += 1;
        }
        Ok(draws)
    }
}

#[derive(Default)]
pub(crate) struct GroupPayload {
    pub(crate) children: Vec<BatchRef>,
    pub(crate) combined: Vec<BatchRef>,
    pub(crate) before: Option<IssueCallback>,
    pub(crate) after: Option<IssueCallback>,
}

/// Closed set of draw payloads, one per batch kind.
pub(crate) enum BatchPayload {
    Clear(ClearRequest),
    Scissor(Option<ScissorRect>),
    Geometry(GeometryPayload),
    Group(GroupPayload),
}

impl BatchPayload {
    /// Payload of a pooled, never-used batch.
    pub(crate) fn empty(kind: super::BatchKind) -> Self {
        match kind {
            super::BatchKind::Clear => Self::Clear(ClearRequest::default()),
            super::BatchKind::Scissor => Self::Scissor(None),
            super::BatchKind::Geometry => Self::Geometry(GeometryPayload::default()),
            super::BatchKind::Group => Self::Group(GroupPayload::default()),
        }
    }

    /// Draw items carried by the payload.
    pub(crate) fn item_count(&self) -> usize {
        match self {
            Self::Clear(_) | Self::Scissor(_) => 1,
            Self::Geometry(geometry) => geometry.items.len(),
            Self::Group(group) => group.children.len(),
        }
    }

    /// Drops prepared output so the payload can be prepared again.
    pub(crate) fn clear_prepared(&mut self) {
        if let Self::Geometry(geometry) = self {
            geometry.prepared = None;
            geometry.runs.clear();
        }
    }
}
