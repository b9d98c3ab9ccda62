//! Logical device wrapper
//!
//! [`Device`] owns the backend and the resource arena. Every GPU object that
//! holds memory is created through it and keeps an `Arc<Device>`, so the device
//! is always the last thing dropped. Also hosts the queries and one-shot
//! command helpers shared by buffers, images and models.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;

use super::arena::{
    ArenaStats, BufferKey, BufferRecord, ImageKey, ImageRecord, ResourceArena, SwapchainKey,
    SwapchainRecord,
};
use super::backend::{DeviceLimits, GpuDevice, ImageBarrier, ImageDesc, SubmitDesc};
use super::error::{VulkanError, VulkanResult};

/// Buffer handles returned by [`Device::create_buffer`]
#[derive(Debug, Clone, Copy)]
pub struct AllocatedBuffer {
    /// Arena key, released through [`Device::destroy_buffer`]
    pub key: BufferKey,
    /// Buffer handle
    pub buffer: vk::Buffer,
    /// Backing memory
    pub memory: vk::DeviceMemory,
    /// Property flags of the memory type actually chosen
    pub memory_flags: vk::MemoryPropertyFlags,
}

/// Image handles returned by [`Device::create_image`]
#[derive(Debug, Clone, Copy)]
pub struct AllocatedImage {
    /// Arena key, released through [`Device::destroy_image`]
    pub key: ImageKey,
    /// Image handle
    pub image: vk::Image,
    /// Backing memory
    pub memory: vk::DeviceMemory,
    /// Default view over the requested aspect
    pub view: vk::ImageView,
}

/// Logical GPU connection plus the arena of everything allocated on it
pub struct Device {
    raw: Box<dyn GpuDevice>,
    limits: DeviceLimits,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    arena: Mutex<ResourceArena>,
}

impl Device {
    /// Wrap a backend
    pub fn new(raw: Box<dyn GpuDevice>) -> Arc<Self> {
        let limits = raw.limits();
        let memory_properties = raw.memory_properties();
        log::info!(
            "Created {} device (min UBO offset alignment {})",
            raw.name(),
            limits.min_uniform_buffer_offset_alignment
        );
        Arc::new(Self {
            raw,
            limits,
            memory_properties,
            arena: Mutex::new(ResourceArena::default()),
        })
    }

    /// Backend command surface
    pub fn raw(&self) -> &dyn GpuDevice {
        self.raw.as_ref()
    }

    /// Physical device limits
    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn arena(&self) -> MutexGuard<'_, ResourceArena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live resource counts
    pub fn arena_stats(&self) -> ArenaStats {
        self.arena().stats()
    }

    /// Block until the GPU has finished all submitted work
    pub fn wait_idle(&self) -> VulkanResult<()> {
        self.raw.wait_idle().map_err(VulkanError::from)
    }

    /// Index of a memory type allowed by `type_filter` with all of `properties`
    pub fn find_memory_type(&self, type_filter: u32, properties: vk::MemoryPropertyFlags) -> VulkanResult<u32> {
        let props = &self.memory_properties;
        (0..props.memory_type_count)
            .find(|&i| {
                (type_filter & (1 << i)) != 0
                    && props.memory_types[i as usize].property_flags.contains(properties)
            })
            .ok_or(VulkanError::NoSuitableMemoryType)
    }

    /// First candidate whose tiling supports `features`
    pub fn find_supported_format(&self, candidates: &[vk::Format], tiling: vk::ImageTiling, features: vk::FormatFeatureFlags) -> VulkanResult<vk::Format> {
        candidates
            .iter()
            .copied()
            .find(|&format| {
                let props = self.raw.format_properties(format);
                match tiling {
                    vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                    vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
                    _ => false,
                }
            })
            .ok_or(VulkanError::NoSupportedFormat)
    }

    /// Create a buffer with bound memory and register it
    pub fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags, properties: vk::MemoryPropertyFlags) -> VulkanResult<AllocatedBuffer> {
        let (buffer, requirements) = self.raw.create_buffer(size, usage)?;
        let memory_type = match self.find_memory_type(requirements.memory_type_bits, properties) {
            Ok(index) => index,
            Err(e) => {
                self.raw.destroy_buffer(buffer);
                return Err(e);
            }
        };
        let memory = match self.raw.allocate_memory(requirements.size, memory_type) {
            Ok(memory) => memory,
            Err(e) => {
                self.raw.destroy_buffer(buffer);
                return Err(e.into());
            }
        };
        if let Err(e) = self.raw.bind_buffer_memory(buffer, memory) {
            self.raw.destroy_buffer(buffer);
            self.raw.free_memory(memory);
            return Err(e.into());
        }

        let key = self.arena().insert_buffer(BufferRecord {
            buffer,
            memory,
            mapped: false,
        });
        Ok(AllocatedBuffer {
            key,
            buffer,
            memory,
            memory_flags: self.memory_properties.memory_types[memory_type as usize].property_flags,
        })
    }

    /// Map part of a registered buffer's memory
    pub fn map_buffer(&self, key: BufferKey, offset: vk::DeviceSize, size: vk::DeviceSize) -> VulkanResult<*mut u8> {
        let mut arena = self.arena();
        let record = arena
            .buffer_mut(key)
            .ok_or_else(|| VulkanError::invalid("mapping a buffer that was released"))?;
        let ptr = self.raw.map_memory(record.memory, offset, size)?;
        record.mapped = true;
        Ok(ptr)
    }

    /// Unmap a registered buffer's memory
    pub fn unmap_buffer(&self, key: BufferKey) {
        let mut arena = self.arena();
        if let Some(record) = arena.buffer_mut(key) {
            if record.mapped {
                self.raw.unmap_memory(record.memory);
                record.mapped = false;
            }
        }
    }

    /// Destroy a registered buffer now
    pub fn destroy_buffer(&self, key: BufferKey) {
        if !self.arena().release_buffer(self.raw(), key) {
            log::warn!("Buffer {key:?} released twice");
        }
    }

    /// Create an image with bound memory and a view over `aspect`, and register it
    pub fn create_image(&self, desc: &ImageDesc, properties: vk::MemoryPropertyFlags, aspect: vk::ImageAspectFlags) -> VulkanResult<AllocatedImage> {
        let (image, requirements) = self.raw.create_image(desc)?;
        let cleanup_image = |e: VulkanError| {
            self.raw.destroy_image(image);
            e
        };
        let memory_type = self
            .find_memory_type(requirements.memory_type_bits, properties)
            .map_err(cleanup_image)?;
        let memory = self
            .raw
            .allocate_memory(requirements.size, memory_type)
            .map_err(|e| cleanup_image(e.into()))?;
        let view = self
            .raw
            .bind_image_memory(image, memory)
            .and_then(|()| self.raw.create_image_view(image, desc.format, aspect));
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                self.raw.destroy_image(image);
                self.raw.free_memory(memory);
                return Err(e.into());
            }
        };

        let key = self.arena().insert_image(ImageRecord { image, memory, view });
        Ok(AllocatedImage {
            key,
            image,
            memory,
            view,
        })
    }

    /// Destroy a registered image now
    pub fn destroy_image(&self, key: ImageKey) {
        if !self.arena().release_image(self.raw(), key) {
            log::warn!("Image {key:?} released twice");
        }
    }

    pub(crate) fn register_swapchain(&self, record: SwapchainRecord) -> SwapchainKey {
        self.arena().insert_swapchain(record)
    }

    pub(crate) fn destroy_swapchain(&self, key: SwapchainKey) {
        if !self.arena().release_swapchain(self.raw(), key) {
            log::warn!("Swapchain {key:?} released twice");
        }
    }

    /// Allocate primary command buffers from the shared pool
    pub fn allocate_command_buffers(&self, count: u32) -> VulkanResult<Vec<vk::CommandBuffer>> {
        self.raw.allocate_command_buffers(count).map_err(VulkanError::from)
    }

    /// Return command buffers to the shared pool
    pub fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        self.raw.free_command_buffers(command_buffers);
    }

    /// Allocate and begin a one-time-submit command buffer
    pub fn begin_single_time_commands(&self) -> VulkanResult<vk::CommandBuffer> {
        let command_buffer = self
            .raw
            .allocate_command_buffers(1)?
            .into_iter()
            .next()
            .ok_or_else(|| VulkanError::invalid("command pool returned no command buffer"))?;
        if let Err(e) = self.raw.begin_command_buffer(command_buffer, true) {
            self.raw.free_command_buffers(&[command_buffer]);
            return Err(e.into());
        }
        Ok(command_buffer)
    }

    /// End, submit and wait for a command buffer from [`Device::begin_single_time_commands`]
    pub fn end_single_time_commands(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        let result = self
            .raw
            .end_command_buffer(command_buffer)
            .and_then(|()| {
                self.raw.queue_submit(
                    &SubmitDesc {
                        command_buffers: &[command_buffer],
                        ..Default::default()
                    },
                    vk::Fence::null(),
                )
            })
            .and_then(|()| self.raw.queue_wait_idle());
        self.raw.free_command_buffers(&[command_buffer]);
        result.map_err(VulkanError::from)
    }

    /// Copy `size` bytes between buffers and wait for completion
    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) -> VulkanResult<()> {
        let command_buffer = self.begin_single_time_commands()?;
        self.raw.cmd_copy_buffer(
            command_buffer,
            src,
            dst,
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            }],
        );
        self.end_single_time_commands(command_buffer)
    }

    /// Copy tightly packed texels into a `TRANSFER_DST_OPTIMAL` image and wait
    pub fn copy_buffer_to_image(&self, buffer: vk::Buffer, image: vk::Image, extent: vk::Extent2D) -> VulkanResult<()> {
        let command_buffer = self.begin_single_time_commands()?;
        self.raw.cmd_copy_buffer_to_image(command_buffer, buffer, image, extent);
        self.end_single_time_commands(command_buffer)
    }

    /// Transition a color image between layouts and wait
    pub fn transition_image_layout(&self, image: vk::Image, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> VulkanResult<()> {
        let barrier = layout_transition(image, vk::ImageAspectFlags::COLOR, old_layout, new_layout)?;
        let command_buffer = self.begin_single_time_commands()?;
        self.raw.cmd_image_barrier(command_buffer, &barrier);
        self.end_single_time_commands(command_buffer)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.raw.wait_idle() {
            log::error!("wait_idle failed during device teardown: {e:?}");
        }
        let leaked = self
            .arena
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .teardown(self.raw.as_ref());
        if leaked != ArenaStats::default() {
            log::warn!("Device dropped with live resources: {leaked:?}");
        }
        log::debug!("Device destroyed");
    }
}

/// Barrier for the layout transitions textures go through
pub fn layout_transition(image: vk::Image, aspect: vk::ImageAspectFlags, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> VulkanResult<ImageBarrier> {
    let (src_access, dst_access, src_stage, dst_stage) = match (old_layout, new_layout) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        _ => {
            return Err(VulkanError::invalid(format!(
                "unsupported layout transition {old_layout:?} -> {new_layout:?}"
            )))
        }
    };
    Ok(ImageBarrier {
        image,
        aspect,
        old_layout,
        new_layout,
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backend::headless::{memory_types, HeadlessConfig, HeadlessDevice};

    fn device() -> (Arc<Device>, HeadlessDevice) {
        let headless = HeadlessDevice::new();
        (Device::new(Box::new(headless.clone())), headless)
    }

    #[test]
    fn test_find_memory_type() {
        let (device, _) = device();
        assert_eq!(
            device.find_memory_type(0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            memory_types::DEVICE_LOCAL
        );
        assert_eq!(
            device
                .find_memory_type(0b111, vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT)
                .unwrap(),
            memory_types::HOST_COHERENT
        );
        assert!(matches!(
            device.find_memory_type(0b001, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Err(VulkanError::NoSuitableMemoryType)
        ));
    }

    #[test]
    fn test_find_supported_format_follows_candidate_order() {
        let headless = HeadlessDevice::with_config(HeadlessConfig {
            depth_formats: vec![vk::Format::D24_UNORM_S8_UINT],
            ..Default::default()
        });
        let device = Device::new(Box::new(headless));
        let candidates = [vk::Format::D32_SFLOAT, vk::Format::D24_UNORM_S8_UINT];
        let format = device
            .find_supported_format(&candidates, vk::ImageTiling::OPTIMAL, vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            .unwrap();
        assert_eq!(format, vk::Format::D24_UNORM_S8_UINT);
        assert!(matches!(
            device.find_supported_format(&candidates[..1], vk::ImageTiling::OPTIMAL, vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT),
            Err(VulkanError::NoSupportedFormat)
        ));
    }

    #[test]
    fn test_teardown_destroys_leftovers() {
        let (device, headless) = device();
        device
            .create_buffer(64, vk::BufferUsageFlags::UNIFORM_BUFFER, vk::MemoryPropertyFlags::HOST_VISIBLE)
            .unwrap();
        let extent = vk::Extent2D { width: 4, height: 4 };
        device
            .create_image(
                &ImageDesc {
                    extent,
                    format: vk::Format::R8G8B8A8_SRGB,
                    tiling: vk::ImageTiling::OPTIMAL,
                    usage: vk::ImageUsageFlags::SAMPLED,
                },
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::ImageAspectFlags::COLOR,
            )
            .unwrap();
        assert_eq!(device.arena_stats().buffers, 1);
        assert_eq!(device.arena_stats().images, 1);

        drop(device);
        assert_eq!(headless.live_object_count(), 0);
        assert!(headless.validation_errors().is_empty());
    }

    #[test]
    fn test_single_time_copy_reaches_destination() {
        let (device, headless) = device();
        let src = device
            .create_buffer(4, vk::BufferUsageFlags::TRANSFER_SRC, vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT)
            .unwrap();
        let dst = device
            .create_buffer(4, vk::BufferUsageFlags::TRANSFER_DST, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        let ptr = device.map_buffer(src.key, 0, vk::WHOLE_SIZE).unwrap();
        unsafe { std::ptr::copy_nonoverlapping([9u8, 8, 7, 6].as_ptr(), ptr, 4) };
        device.unmap_buffer(src.key);

        device.copy_buffer(src.buffer, dst.buffer, 4).unwrap();
        assert_eq!(headless.buffer_contents(dst.buffer), Some(vec![9, 8, 7, 6]));

        device.destroy_buffer(src.key);
        device.destroy_buffer(dst.key);
        assert_eq!(device.arena_stats(), ArenaStats::default());
    }

    #[test]
    fn test_layout_transition_table() {
        let barrier = layout_transition(
            vk::Image::null(),
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(barrier.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barrier.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);

        assert!(layout_transition(
            vk::Image::null(),
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
        .is_err());
    }
}
