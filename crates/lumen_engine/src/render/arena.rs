//! Device-owned registry of GPU allocations
//!
//! Buffers, images and swapchains register their raw handles here and keep a
//! slotmap key. Releasing a key destroys the handles immediately; whatever is
//! still registered when the [`Device`](super::Device) drops is destroyed in
//! dependency order (swapchains, then images, then buffers) and reported.

use ash::vk;
use slotmap::SlotMap;

use super::backend::GpuDevice;

slotmap::new_key_type! {
    /// Arena key of a buffer allocation
    pub struct BufferKey;
    /// Arena key of an image allocation
    pub struct ImageKey;
    /// Arena key of a swapchain and everything built on it
    pub struct SwapchainKey;
}

pub(crate) struct BufferRecord {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub mapped: bool,
}

pub(crate) struct ImageRecord {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
}

/// Everything a swapchain owns, destroyed together
#[derive(Default)]
pub(crate) struct SwapchainRecord {
    pub swapchain: vk::SwapchainKHR,
    pub image_views: Vec<vk::ImageView>,
    pub depth_images: Vec<ImageKey>,
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub semaphores: Vec<vk::Semaphore>,
    pub fences: Vec<vk::Fence>,
}

/// Live resource counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Registered buffers
    pub buffers: usize,
    /// Registered images (depth attachments included)
    pub images: usize,
    /// Registered swapchains
    pub swapchains: usize,
}

#[derive(Default)]
pub(crate) struct ResourceArena {
    buffers: SlotMap<BufferKey, BufferRecord>,
    images: SlotMap<ImageKey, ImageRecord>,
    swapchains: SlotMap<SwapchainKey, SwapchainRecord>,
}

impl ResourceArena {
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            buffers: self.buffers.len(),
            images: self.images.len(),
            swapchains: self.swapchains.len(),
        }
    }

    pub fn insert_buffer(&mut self, record: BufferRecord) -> BufferKey {
        self.buffers.insert(record)
    }

    pub fn buffer_mut(&mut self, key: BufferKey) -> Option<&mut BufferRecord> {
        self.buffers.get_mut(key)
    }

    pub fn insert_image(&mut self, record: ImageRecord) -> ImageKey {
        self.images.insert(record)
    }

    pub fn insert_swapchain(&mut self, record: SwapchainRecord) -> SwapchainKey {
        self.swapchains.insert(record)
    }

    pub fn release_buffer(&mut self, raw: &dyn GpuDevice, key: BufferKey) -> bool {
        match self.buffers.remove(key) {
            Some(record) => {
                destroy_buffer(raw, &record);
                true
            }
            None => false,
        }
    }

    pub fn release_image(&mut self, raw: &dyn GpuDevice, key: ImageKey) -> bool {
        match self.images.remove(key) {
            Some(record) => {
                destroy_image(raw, &record);
                true
            }
            None => false,
        }
    }

    pub fn release_swapchain(&mut self, raw: &dyn GpuDevice, key: SwapchainKey) -> bool {
        let Some(record) = self.swapchains.remove(key) else {
            return false;
        };
        for framebuffer in &record.framebuffers {
            raw.destroy_framebuffer(*framebuffer);
        }
        raw.destroy_render_pass(record.render_pass);
        for view in &record.image_views {
            raw.destroy_image_view(*view);
        }
        for depth in &record.depth_images {
            self.release_image(raw, *depth);
        }
        for semaphore in &record.semaphores {
            raw.destroy_semaphore(*semaphore);
        }
        for fence in &record.fences {
            raw.destroy_fence(*fence);
        }
        raw.destroy_swapchain(record.swapchain);
        true
    }

    /// Destroy every remaining resource; returns what was left over
    pub fn teardown(&mut self, raw: &dyn GpuDevice) -> ArenaStats {
        let leaked = self.stats();
        let swapchains: Vec<_> = self.swapchains.keys().collect();
        for key in swapchains {
            log::warn!("Destroying swapchain {key:?} still registered at device teardown");
            self.release_swapchain(raw, key);
        }
        for (key, record) in self.images.drain() {
            log::warn!("Destroying image {key:?} still registered at device teardown");
            destroy_image(raw, &record);
        }
        for (key, record) in self.buffers.drain() {
            log::warn!("Destroying buffer {key:?} still registered at device teardown");
            destroy_buffer(raw, &record);
        }
        leaked
    }
}

fn destroy_buffer(raw: &dyn GpuDevice, record: &BufferRecord) {
    if record.mapped {
        raw.unmap_memory(record.memory);
    }
    raw.destroy_buffer(record.buffer);
    raw.free_memory(record.memory);
}

fn destroy_image(raw: &dyn GpuDevice, record: &ImageRecord) {
    raw.destroy_image_view(record.view);
    raw.destroy_image(record.image);
    raw.free_memory(record.memory);
}
