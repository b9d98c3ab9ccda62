//! Meshes resident in device-local memory
//!
//! Vertex and index data are uploaded once through a staging buffer and then
//! bound per draw. Asset loading stays outside the engine; callers hand over a
//! [`ModelData`] they built themselves.

use std::mem::{offset_of, size_of};
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};

use super::buffer::Buffer;
use super::device::Device;
use super::error::{VulkanError, VulkanResult};

/// Interleaved vertex matching the `location`s of the mesh shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    /// Object-space position, `location = 0`
    pub position: [f32; 3],
    /// Linear RGB, `location = 1`
    pub color: [f32; 3],
    /// Object-space normal, `location = 2`
    pub normal: [f32; 3],
    /// Texture coordinate, `location = 3`
    pub uv: [f32; 2],
}

impl Vertex {
    /// One interleaved per-vertex binding
    pub fn binding_descriptions() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    /// Position, color, normal and uv attributes
    pub fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        let attribute = |location: u32, format: vk::Format, offset: usize| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset: offset as u32,
        };
        vec![
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, position)),
            attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, color)),
            attribute(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, normal)),
            attribute(3, vk::Format::R32G32_SFLOAT, offset_of!(Self, uv)),
        ]
    }
}

/// CPU-side mesh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelData {
    /// Vertices
    pub vertices: Vec<Vertex>,
    /// Triangle list indices; empty for non-indexed drawing
    pub indices: Vec<u32>,
}

impl ModelData {
    /// Unit cube centered on `offset`, one color per face pair
    pub fn cube(offset: [f32; 3]) -> Self {
        // (normal, u axis, v axis, color)
        const FACES: [([f32; 3], [f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [0.9, 0.9, 0.9]),
            ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.8, 0.8, 0.1]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.9, 0.6, 0.1]),
            ([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.8, 0.1, 0.1]),
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.1, 0.1, 0.8]),
            ([0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.1, 0.8, 0.1]),
        ];

        let mut data = Self::default();
        for (normal, u, v, color) in FACES {
            let base = data.vertices.len() as u32;
            for (su, sv) in [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)] {
                let position = std::array::from_fn(|i| offset[i] + normal[i] * 0.5 + u[i] * su + v[i] * sv);
                data.vertices.push(Vertex {
                    position,
                    color,
                    normal,
                    uv: [su + 0.5, sv + 0.5],
                });
            }
            data.indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        data
    }
}

/// Device-local vertex buffer plus an optional index buffer
pub struct Model {
    device: Arc<Device>,
    vertex_buffer: Buffer,
    vertex_count: u32,
    index_buffer: Option<Buffer>,
    index_count: u32,
}

impl Model {
    /// Upload `data`; at least one triangle is required
    pub fn new(device: &Arc<Device>, data: &ModelData) -> VulkanResult<Self> {
        if data.vertices.len() < 3 {
            return Err(VulkanError::invalid("model needs at least three vertices"));
        }
        let vertex_buffer = upload(
            device,
            bytemuck::cast_slice(&data.vertices),
            size_of::<Vertex>() as vk::DeviceSize,
            data.vertices.len() as u32,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index_buffer = if data.indices.is_empty() {
            None
        } else {
            Some(upload(
                device,
                bytemuck::cast_slice(&data.indices),
                size_of::<u32>() as vk::DeviceSize,
                data.indices.len() as u32,
                vk::BufferUsageFlags::INDEX_BUFFER,
            )?)
        };

        log::debug!(
            "Uploaded model with {} vertices and {} indices",
            data.vertices.len(),
            data.indices.len()
        );
        Ok(Self {
            device: Arc::clone(device),
            vertex_buffer,
            vertex_count: data.vertices.len() as u32,
            index_buffer,
            index_count: data.indices.len() as u32,
        })
    }

    /// Bind vertex buffer 0 and, if present, the index buffer
    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        let raw = self.device.raw();
        raw.cmd_bind_vertex_buffers(command_buffer, 0, &[self.vertex_buffer.handle()], &[0]);
        if let Some(index_buffer) = &self.index_buffer {
            raw.cmd_bind_index_buffer(command_buffer, index_buffer.handle(), 0, vk::IndexType::UINT32);
        }
    }

    /// Draw one instance
    pub fn draw(&self, command_buffer: vk::CommandBuffer) {
        let raw = self.device.raw();
        if self.index_buffer.is_some() {
            raw.cmd_draw_indexed(command_buffer, self.index_count, 1, 0, 0, 0);
        } else {
            raw.cmd_draw(command_buffer, self.vertex_count, 1, 0, 0);
        }
    }

    /// Number of vertices
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Number of indices, 0 when drawn without an index buffer
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Vertex buffer handle
    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertex_buffer.handle()
    }
}

fn upload(device: &Arc<Device>, bytes: &[u8], element_size: vk::DeviceSize, count: u32, usage: vk::BufferUsageFlags) -> VulkanResult<Buffer> {
    let staging = Buffer::staging_with_data(device, bytes)?;
    let buffer = Buffer::new(
        device,
        element_size,
        count,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        0,
    )?;
    device.copy_buffer(staging.handle(), buffer.handle(), buffer.size())?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backend::headless::HeadlessDevice;
    use crate::render::arena::ArenaStats;

    #[test]
    fn test_vertex_layout() {
        assert_eq!(size_of::<Vertex>(), 44);
        let attributes = Vertex::attribute_descriptions();
        let offsets: Vec<u32> = attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24, 36]);
        assert_eq!(Vertex::binding_descriptions()[0].stride, 44);
    }

    #[test]
    fn test_cube_geometry() {
        let cube = ModelData::cube([0.0, 1.0, 0.0]);
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        assert!(cube.indices.iter().all(|&i| (i as usize) < cube.vertices.len()));
        for vertex in &cube.vertices {
            assert!(vertex.position[1] >= 0.5 && vertex.position[1] <= 1.5);
            // every vertex lies on the face its normal points out of
            let along: f32 = (0..3).map(|i| (vertex.position[i] - [0.0, 1.0, 0.0][i]) * vertex.normal[i]).sum();
            assert!((along - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_upload_reaches_device_local_buffers() {
        let headless = HeadlessDevice::new();
        let device = Device::new(Box::new(headless.clone()));
        let cube = ModelData::cube([0.0; 3]);
        let model = Model::new(&device, &cube).unwrap();

        assert_eq!(model.vertex_count(), 24);
        assert_eq!(model.index_count(), 36);
        assert_eq!(
            headless.buffer_contents(model.vertex_buffer()),
            Some(bytemuck::cast_slice::<Vertex, u8>(&cube.vertices).to_vec())
        );
        // staging buffers are gone, vertex and index buffers remain
        assert_eq!(device.arena_stats().buffers, 2);

        drop(model);
        assert_eq!(device.arena_stats(), ArenaStats::default());
    }

    #[test]
    fn test_rejects_degenerate_mesh() {
        let device = Device::new(Box::new(HeadlessDevice::new()));
        let data = ModelData {
            vertices: vec![Vertex::default(); 2],
            indices: Vec::new(),
        };
        assert!(matches!(Model::new(&device, &data), Err(VulkanError::InvalidOperation { .. })));
    }
}
