//! Per-frame data shared by the render systems
//!
//! [`GlobalUbo`] mirrors the `GlobalUbo` block of the shaders (std140) and is
//! written once per frame into the [`FrameUniforms`] instance of the current
//! frame slot. The slot's fence has signaled by the time `begin_frame` returns,
//! so the instance is never read by the GPU while it is rewritten.

use std::mem::size_of;
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};

use super::buffer::Buffer;
use super::camera::Camera;
use super::descriptors::{DescriptorAllocator, DescriptorBuilder, DescriptorLayoutCache};
use super::device::Device;
use super::error::VulkanResult;
use super::game_object::GameObjectMap;
use super::swapchain::MAX_FRAMES_IN_FLIGHT;
use crate::foundation::math::{mat4_to_cols, vec4_from, Mat4, Vec3};

/// Capacity of the point light array; specialization constant 0 of the light shaders
pub const MAX_LIGHTS: usize = 10;

/// One point light: position in xyz, color in rgb with intensity in w
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PointLightUbo {
    /// World-space position, w unused
    pub position: [f32; 4],
    /// Color, w is intensity
    pub color: [f32; 4],
}

/// Global uniform block
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GlobalUbo {
    pub projection: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub inverse_view: [[f32; 4]; 4],
    /// Ambient color, w is intensity
    pub ambient_light_color: [f32; 4],
    /// Direction the directional light travels, w unused
    pub light_direction: [f32; 4],
    /// Directional light color, w is intensity
    pub light_color: [f32; 4],
    pub point_lights: [PointLightUbo; MAX_LIGHTS],
    pub num_lights: i32,
    pub _pad: [i32; 3],
}

impl Default for GlobalUbo {
    fn default() -> Self {
        let identity = mat4_to_cols(&Mat4::identity());
        Self {
            projection: identity,
            view: identity,
            inverse_view: identity,
            ambient_light_color: [1.0, 1.0, 1.0, 0.02],
            light_direction: vec4_from(&Vec3::new(1.0, -3.0, -1.0).normalize(), 0.0),
            light_color: [1.0, 1.0, 1.0, 0.0],
            point_lights: [PointLightUbo::default(); MAX_LIGHTS],
            num_lights: 0,
            _pad: [0; 3],
        }
    }
}

impl GlobalUbo {
    /// Copy the camera's matrices in
    pub fn set_camera(&mut self, camera: &Camera) {
        self.projection = mat4_to_cols(camera.projection());
        self.view = mat4_to_cols(camera.view());
        self.inverse_view = mat4_to_cols(camera.inverse_view());
    }

    /// Active point lights
    pub fn active_lights(&self) -> &[PointLightUbo] {
        let count = usize::try_from(self.num_lights).unwrap_or(0).min(MAX_LIGHTS);
        &self.point_lights[..count]
    }
}

/// Everything a system needs to record one frame
pub struct FrameInfo<'a> {
    /// Frame slot, `0..MAX_FRAMES_IN_FLIGHT`
    pub frame_index: usize,
    /// Seconds since the previous frame
    pub frame_time: f32,
    /// Command buffer being recorded
    pub command_buffer: vk::CommandBuffer,
    pub camera: &'a Camera,
    /// Global set of this frame slot
    pub global_descriptor_set: vk::DescriptorSet,
    pub game_objects: &'a mut GameObjectMap,
}

/// One persistently mapped `GlobalUbo` per frame slot, each with its descriptor set
pub struct FrameUniforms {
    buffer: Buffer,
    layout: vk::DescriptorSetLayout,
    sets: Vec<vk::DescriptorSet>,
}

impl FrameUniforms {
    /// Create the buffer and one set per frame slot at binding 0
    pub fn new(device: &Arc<Device>, cache: &mut DescriptorLayoutCache, allocator: &mut DescriptorAllocator) -> VulkanResult<Self> {
        let mut buffer = Buffer::new(
            device,
            size_of::<GlobalUbo>() as vk::DeviceSize,
            MAX_FRAMES_IN_FLIGHT as u32,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            device.limits().min_uniform_buffer_offset_alignment,
        )?;
        buffer.map()?;

        let mut layout = vk::DescriptorSetLayout::null();
        let mut sets = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for slot in 0..MAX_FRAMES_IN_FLIGHT as u32 {
            let (set, set_layout) = DescriptorBuilder::begin(cache, allocator)
                .bind_buffer(
                    0,
                    buffer.descriptor_info_for_index(slot),
                    vk::DescriptorType::UNIFORM_BUFFER,
                    vk::ShaderStageFlags::ALL_GRAPHICS,
                )
                .build()?;
            layout = set_layout;
            sets.push(set);
        }

        for slot in 0..MAX_FRAMES_IN_FLIGHT as u32 {
            buffer.write_value(&GlobalUbo::default(), slot)?;
            buffer.flush_index(slot)?;
        }

        Ok(Self { buffer, layout, sets })
    }

    /// Write and flush the instance of `frame_index`
    pub fn write(&mut self, frame_index: usize, ubo: &GlobalUbo) -> VulkanResult<()> {
        let index = frame_index as u32;
        self.buffer.write_value(ubo, index)?;
        self.buffer.flush_index(index)
    }

    /// Set bound as set 0 during `frame_index`
    pub fn descriptor_set(&self, frame_index: usize) -> vk::DescriptorSet {
        self.sets[frame_index % self.sets.len()]
    }

    /// Layout shared by every slot's set
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Backing buffer
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DescriptorPoolConfig;
    use crate::render::backend::headless::{HeadlessDevice, HeadlessEvent};
    use crate::render::error::VulkanError;

    #[test]
    fn test_ubo_layout_matches_std140() {
        assert_eq!(size_of::<PointLightUbo>(), 32);
        assert_eq!(size_of::<GlobalUbo>(), 3 * 64 + 3 * 16 + MAX_LIGHTS * 32 + 16);
        assert_eq!(size_of::<GlobalUbo>() % 16, 0);
    }

    #[test]
    fn test_active_lights_clamps_count() {
        let mut ubo = GlobalUbo::default();
        assert!(ubo.active_lights().is_empty());
        ubo.num_lights = 3;
        assert_eq!(ubo.active_lights().len(), 3);
        ubo.num_lights = -1;
        assert!(ubo.active_lights().is_empty());
    }

    #[test]
    fn test_frame_uniforms_write_lands_at_aligned_offset() {
        let headless = HeadlessDevice::new();
        let device = Device::new(Box::new(headless.clone()));
        let mut cache = DescriptorLayoutCache::new(&device);
        let mut allocator = DescriptorAllocator::new(&device, &DescriptorPoolConfig::default());
        let mut uniforms = FrameUniforms::new(&device, &mut cache, &mut allocator).unwrap();

        assert_eq!(uniforms.buffer().alignment_size(), 768);
        assert_ne!(uniforms.descriptor_set(0), uniforms.descriptor_set(1));
        assert_eq!(cache.len(), 1);

        let mut ubo = GlobalUbo::default();
        ubo.num_lights = 4;
        ubo.point_lights[3].color = [0.5, 0.25, 1.0, 2.0];
        uniforms.write(1, &ubo).unwrap();

        let bytes = headless.buffer_contents(uniforms.buffer().handle()).unwrap();
        let offset = uniforms.buffer().alignment_size() as usize;
        let stored: GlobalUbo = bytemuck::pod_read_unaligned(&bytes[offset..offset + size_of::<GlobalUbo>()]);
        assert_eq!(stored, ubo);
        assert_eq!(uniforms.buffer().read_index(0).unwrap(), bytemuck::bytes_of(&GlobalUbo::default()));

        assert!(matches!(uniforms.write(MAX_FRAMES_IN_FLIGHT, &ubo), Err(VulkanError::InvalidOperation { .. })));

        let writes = headless
            .events()
            .iter()
            .filter(|e| matches!(e, HeadlessEvent::UpdateDescriptorSet { binding: 0, .. }))
            .count();
        assert_eq!(writes, MAX_FRAMES_IN_FLIGHT);
    }
}
