// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::commands::CommandPool;
use crate::context::DeviceContext;
use crate::error::VkResult;
use crate::memory::DeviceBuffer;
use crate::staging::upload_to_device_local;

// Matches the vertex shader inputs:
//   - binding 0, location 0: R32G32B32_SFLOAT (pos)
//   - binding 0, location 1: R32G32B32_SFLOAT (color)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub color: [f32; 3],
}

impl Vertex {
    pub const fn new(pos: [f32; 3], color: [f32; 3]) -> Self {
        Self { pos, color }
    }

    pub(crate) fn binding() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub(crate) fn attributes() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, pos) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, color) as u32,
            },
        ]
    }
}

/// Host-side geometry waiting to be uploaded.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Option<Vec<u32>>,
}

impl MeshData {
    /// An axis-aligned quad in clip space, two triangles over four vertices.
    pub fn quad(x: [f32; 2], y: [f32; 2], color: [f32; 3]) -> Self {
        let [x0, x1] = x;
        let [y0, y1] = y;
        Self {
            vertices: vec![
                Vertex::new([x0, y0, 0.0], color),
                Vertex::new([x1, y0, 0.0], color),
                Vertex::new([x1, y1, 0.0], color),
                Vertex::new([x0, y1, 0.0], color),
            ],
            indices: Some(vec![0, 1, 2, 2, 3, 0]),
        }
    }
}

/// What the renderer draws when it is given nothing else: two quads side by side.
pub fn demo_scene() -> Vec<MeshData> {
    vec![
        MeshData::quad([-0.9, -0.1], [-0.5, 0.5], [0.9, 0.3, 0.2]),
        MeshData::quad([0.1, 0.9], [-0.5, 0.5], [0.2, 0.5, 0.9]),
    ]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawParams {
    pub vertex_count: u32,
    /// Zero means the mesh is drawn non-indexed.
    pub index_count: u32,
}

/// Device-local vertex (and optional index) buffers for one mesh.
///
/// Immutable once built. Buffers are released on drop, which the owner must
/// sequence after the device is idle and before the device itself goes away.
pub struct Mesh {
    vertices: DeviceBuffer,
    indices: Option<DeviceBuffer>,
    vertex_count: u32,
    index_count: u32,
}

impl Mesh {
    /// Uploads vertices and indices through two independent staging transfers.
    pub fn upload(ctx: &DeviceContext, pool: &CommandPool, data: &MeshData) -> VkResult<Self> {
        Self::upload_with_usage(ctx, pool, data, vk::BufferUsageFlags::empty())
    }

    /// Like [`Mesh::upload`] but with extra usage bits on both buffers
    /// (e.g. `TRANSFER_SRC` to read them back).
    pub fn upload_with_usage(
        ctx: &DeviceContext,
        pool: &CommandPool,
        data: &MeshData,
        extra: vk::BufferUsageFlags,
    ) -> VkResult<Self> {
        let vertices = upload_to_device_local(
            ctx,
            pool,
            bytemuck::cast_slice(&data.vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER | extra,
        )?;
        let indices = match data.indices.as_deref() {
            Some(idx) if !idx.is_empty() => Some(upload_to_device_local(
                ctx,
                pool,
                bytemuck::cast_slice(idx),
                vk::BufferUsageFlags::INDEX_BUFFER | extra,
            )?),
            _ => None,
        };
        Ok(Self {
            vertices,
            indices,
            vertex_count: data.vertices.len() as u32,
            index_count: data
                .indices
                .as_ref()
                .map_or(0, |idx| idx.len() as u32),
        })
    }

    pub fn draw_params(&self) -> DrawParams {
        DrawParams {
            vertex_count: self.vertex_count,
            index_count: if self.indices.is_some() { self.index_count } else { 0 },
        }
    }

    #[inline]
    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertices.handle()
    }

    #[inline]
    pub fn index_buffer(&self) -> Option<vk::Buffer> {
        self.indices.as_ref().map(DeviceBuffer::handle)
    }

    pub fn vertex_device_buffer(&self) -> &DeviceBuffer {
        &self.vertices
    }

    pub fn index_device_buffer(&self) -> Option<&DeviceBuffer> {
        self.indices.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_shader_inputs() {
        assert_eq!(std::mem::size_of::<Vertex>(), 24);
        let attrs = Vertex::attributes();
        assert_eq!(attrs[0].offset, 0);
        assert_eq!(attrs[1].offset, 12);
        assert_eq!(Vertex::binding().stride, 24);
    }

    #[test]
    fn quad_is_four_vertices_six_indices() {
        let q = MeshData::quad([-0.9, -0.1], [-0.5, 0.5], [1.0, 0.0, 0.0]);
        assert_eq!(q.vertices.len(), 4);
        assert_eq!(q.indices.as_deref(), Some(&[0, 1, 2, 2, 3, 0][..]));
        assert!(q.vertices.iter().all(|v| (-0.9..=-0.1).contains(&v.pos[0])));
    }

    #[test]
    fn demo_quads_do_not_overlap() {
        let scene = demo_scene();
        assert_eq!(scene.len(), 2);
        let max_left = scene[0].vertices.iter().map(|v| v.pos[0]).fold(f32::MIN, f32::max);
        let min_right = scene[1].vertices.iter().map(|v| v.pos[0]).fold(f32::MAX, f32::min);
        assert!(max_left < min_right);
        assert!(scene.iter().all(|m| m.indices.is_some()));
    }
}
