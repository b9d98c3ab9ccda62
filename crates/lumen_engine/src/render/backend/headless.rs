//! Software-simulated GPU backend
//!
//! `HeadlessDevice` implements [`GpuDevice`] without a driver. It keeps enough
//! state to check the synchronization contract the core relies on:
//!
//! - submissions complete lazily; a fence attached to a submission stays
//!   pending until someone waits on it (logged as a blocking wait) or the
//!   device idles
//! - binary semaphores must be signaled before they are waited on and must be
//!   waited on before they are signaled again
//! - a swapchain image must be acquired before it is presented
//! - descriptor pools refuse to hand out more than `max_sets` sets
//!
//! Violations land in [`HeadlessDevice::validation_errors`] the way validation
//! layer messages would. Every call that matters for frame sequencing is
//! appended to an event log, and acquire/present results can be scripted to
//! inject out-of-date and suboptimal swapchains.
//!
//! The device is a cheap handle over shared state: clone it before boxing it
//! into a [`Device`](crate::render::Device) to keep scripting and inspecting it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};

use super::{
    DescriptorBinding, DescriptorResource, DescriptorWrite, DeviceLimits, GpuDevice,
    GraphicsPipelineDesc, ImageBarrier, ImageDesc, RenderPassBegin, RenderPassDesc, SamplerDesc,
    SubmitDesc, SwapchainDesc,
};

pub use crate::render::shader::SPIRV_MAGIC;

/// Memory type indices exposed by the headless device
pub mod memory_types {
    /// `DEVICE_LOCAL`
    pub const DEVICE_LOCAL: u32 = 0;
    /// `HOST_VISIBLE | HOST_COHERENT`
    pub const HOST_COHERENT: u32 = 1;
    /// `HOST_VISIBLE | HOST_CACHED`, needs explicit flushes
    pub const HOST_CACHED: u32 = 2;
}

/// Simulated device and surface description
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Reported limits
    pub limits: DeviceLimits,
    /// Surface formats, in preference order of the "driver"
    pub surface_formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes
    pub present_modes: Vec<vk::PresentModeKHR>,
    /// Surface minimum image count
    pub min_image_count: u32,
    /// Surface maximum image count, 0 for unbounded
    pub max_image_count: u32,
    /// Fixed surface extent, or `None` for the "window decides" sentinel
    pub current_extent: Option<vk::Extent2D>,
    /// Smallest allowed extent
    pub min_image_extent: vk::Extent2D,
    /// Largest allowed extent
    pub max_image_extent: vk::Extent2D,
    /// Depth formats usable as optimal-tiling depth attachments
    pub depth_formats: Vec<vk::Format>,
    /// Cap on simultaneously live descriptor pools
    pub max_descriptor_pools: Option<usize>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            limits: DeviceLimits::default(),
            surface_formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![
                vk::PresentModeKHR::FIFO,
                vk::PresentModeKHR::MAILBOX,
                vk::PresentModeKHR::IMMEDIATE,
            ],
            min_image_count: 2,
            max_image_count: 8,
            current_extent: None,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            depth_formats: vec![vk::Format::D32_SFLOAT, vk::Format::D24_UNORM_S8_UINT],
            max_descriptor_pools: None,
        }
    }
}

/// Kinds of object the headless device tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// `VkDeviceMemory`
    Memory,
    /// `VkBuffer`
    Buffer,
    /// `VkImage`
    Image,
    /// `VkImageView`
    ImageView,
    /// `VkSampler`
    Sampler,
    /// `VkSemaphore`
    Semaphore,
    /// `VkFence`
    Fence,
    /// `VkCommandBuffer`
    CommandBuffer,
    /// `VkDescriptorSetLayout`
    DescriptorSetLayout,
    /// `VkDescriptorPool`
    DescriptorPool,
    /// `VkDescriptorSet`
    DescriptorSet,
    /// `VkShaderModule`
    ShaderModule,
    /// `VkPipelineLayout`
    PipelineLayout,
    /// `VkPipeline`
    Pipeline,
    /// `VkRenderPass`
    RenderPass,
    /// `VkFramebuffer`
    Framebuffer,
    /// `VkSwapchainKHR`
    Swapchain,
}

/// Recorded device call
#[derive(Debug, Clone, PartialEq)]
pub enum HeadlessEvent {
    /// Swapchain created
    CreateSwapchain {
        /// New handle
        swapchain: vk::SwapchainKHR,
        /// Predecessor passed as `oldSwapchain`
        old_swapchain: vk::SwapchainKHR,
        /// Number of images
        image_count: u32,
        /// Image width
        width: u32,
        /// Image height
        height: u32,
        /// Selected present mode
        present_mode: vk::PresentModeKHR,
        /// Selected color format
        format: vk::Format,
    },
    /// Swapchain destroyed
    DestroySwapchain(vk::SwapchainKHR),
    /// Image acquisition attempt
    Acquire {
        /// Swapchain
        swapchain: vk::SwapchainKHR,
        /// Semaphore to signal
        semaphore: vk::Semaphore,
        /// Image index or failure code
        result: Result<u32, vk::Result>,
    },
    /// Fence wait
    WaitFence {
        /// Fence waited on
        fence: vk::Fence,
        /// Whether the wait had to complete outstanding work
        blocked: bool,
    },
    /// Fence reset
    ResetFence(vk::Fence),
    /// Queue submission
    Submit {
        /// Waited semaphores
        wait_semaphores: Vec<vk::Semaphore>,
        /// Executed command buffers
        command_buffers: Vec<vk::CommandBuffer>,
        /// Signaled semaphores
        signal_semaphores: Vec<vk::Semaphore>,
        /// Completion fence
        fence: vk::Fence,
    },
    /// Presentation attempt
    Present {
        /// Swapchain
        swapchain: vk::SwapchainKHR,
        /// Presented image
        image_index: u32,
        /// Waited semaphore
        wait_semaphore: vk::Semaphore,
        /// Suboptimal flag or failure code
        result: Result<bool, vk::Result>,
    },
    /// `vkDeviceWaitIdle`
    WaitIdle,
    /// `vkQueueWaitIdle`
    QueueWaitIdle,
    /// Command buffer recording started
    BeginCommandBuffer(vk::CommandBuffer),
    /// Render pass begun
    BeginRenderPass {
        /// Framebuffer rendered into
        framebuffer: vk::Framebuffer,
        /// Render area width
        width: u32,
        /// Render area height
        height: u32,
    },
    /// Render pass ended
    EndRenderPass,
    /// Dynamic viewport
    SetViewport {
        /// Viewport width
        width: f32,
        /// Viewport height
        height: f32,
    },
    /// Dynamic scissor
    SetScissor {
        /// Scissor width
        width: u32,
        /// Scissor height
        height: u32,
    },
    /// Pipeline bound
    BindPipeline(vk::Pipeline),
    /// Descriptor sets bound
    BindDescriptorSets {
        /// First set index
        first_set: u32,
        /// Bound sets
        sets: Vec<vk::DescriptorSet>,
    },
    /// Push constants updated
    PushConstants {
        /// Stages
        stages: vk::ShaderStageFlags,
        /// Payload
        data: Vec<u8>,
    },
    /// Non-indexed draw
    Draw {
        /// Vertices
        vertex_count: u32,
        /// Instances
        instance_count: u32,
    },
    /// Indexed draw
    DrawIndexed {
        /// Indices
        index_count: u32,
        /// Instances
        instance_count: u32,
    },
    /// Descriptor pool created
    CreateDescriptorPool {
        /// New pool
        pool: vk::DescriptorPool,
        /// Its set capacity
        max_sets: u32,
    },
    /// Descriptor pool reset
    ResetDescriptorPool(vk::DescriptorPool),
    /// Descriptor set layout created
    CreateDescriptorSetLayout(vk::DescriptorSetLayout),
    /// Descriptor set allocation attempt
    AllocateDescriptorSet {
        /// Source pool
        pool: vk::DescriptorPool,
        /// New set or failure code
        result: Result<vk::DescriptorSet, vk::Result>,
    },
    /// Descriptor written
    UpdateDescriptorSet {
        /// Destination set
        set: vk::DescriptorSet,
        /// Destination binding
        binding: u32,
    },
    /// Mapped range flushed
    FlushMemory {
        /// Memory object
        memory: vk::DeviceMemory,
        /// Range start
        offset: vk::DeviceSize,
        /// Range size
        size: vk::DeviceSize,
    },
    /// Mapped range invalidated
    InvalidateMemory {
        /// Memory object
        memory: vk::DeviceMemory,
        /// Range start
        offset: vk::DeviceSize,
        /// Range size
        size: vk::DeviceSize,
    },
    /// Layout transition recorded
    ImageBarrier(ImageBarrier),
}

struct MemoryState {
    bytes: Box<[u8]>,
    type_index: u32,
    /// Mapped byte range, end exclusive
    mapped: Option<(vk::DeviceSize, vk::DeviceSize)>,
}

struct BufferState {
    size: vk::DeviceSize,
    memory: Option<u64>,
}

#[derive(Default)]
struct FenceState {
    signaled: bool,
    pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Executable,
}

struct PendingCopy {
    src: u64,
    src_offset: vk::DeviceSize,
    dst: u64,
    dst_offset: vk::DeviceSize,
    size: vk::DeviceSize,
}

struct CommandBufferState {
    state: RecordState,
    in_render_pass: bool,
    copies: Vec<PendingCopy>,
}

struct SwapchainState {
    images: Vec<vk::Image>,
    acquired: Vec<bool>,
    next_image: u32,
}

struct PoolState {
    max_sets: u32,
    sets: Vec<u64>,
}

struct State {
    config: HeadlessConfig,
    next_handle: u64,
    live: HashMap<u64, ObjectKind>,
    memory: HashMap<u64, MemoryState>,
    buffers: HashMap<u64, BufferState>,
    semaphores: HashMap<u64, bool>,
    fences: HashMap<u64, FenceState>,
    command_buffers: HashMap<u64, CommandBufferState>,
    pools: HashMap<u64, PoolState>,
    swapchains: HashMap<u64, SwapchainState>,
    acquire_results: VecDeque<vk::Result>,
    present_results: VecDeque<vk::Result>,
    submit_results: VecDeque<vk::Result>,
    acquire_order: VecDeque<u32>,
    events: Vec<HeadlessEvent>,
    validation_errors: Vec<String>,
}

impl State {
    fn new(config: HeadlessConfig) -> Self {
        Self {
            config,
            next_handle: 0x1000,
            live: HashMap::new(),
            memory: HashMap::new(),
            buffers: HashMap::new(),
            semaphores: HashMap::new(),
            fences: HashMap::new(),
            command_buffers: HashMap::new(),
            pools: HashMap::new(),
            swapchains: HashMap::new(),
            acquire_results: VecDeque::new(),
            present_results: VecDeque::new(),
            submit_results: VecDeque::new(),
            acquire_order: VecDeque::new(),
            events: Vec::new(),
            validation_errors: Vec::new(),
        }
    }

    fn alloc(&mut self, kind: ObjectKind) -> u64 {
        self.next_handle += 1;
        self.live.insert(self.next_handle, kind);
        self.next_handle
    }

    /// Forget a live object; false when the handle was null or unknown
    fn release(&mut self, raw: u64, kind: ObjectKind) -> bool {
        if raw == 0 {
            return false;
        }
        match self.live.get(&raw) {
            Some(found) if *found == kind => {
                self.live.remove(&raw);
                true
            }
            Some(found) => {
                let found = *found;
                self.error(format!("destroying {found:?} {raw:#x} as {kind:?}"));
                false
            }
            None => {
                self.error(format!("destroying unknown {kind:?} {raw:#x}"));
                false
            }
        }
    }

    fn is_live(&self, raw: u64, kind: ObjectKind) -> bool {
        self.live.get(&raw) == Some(&kind)
    }

    fn error(&mut self, message: String) {
        log::warn!("headless validation: {message}");
        self.validation_errors.push(message);
    }

    /// Flush/invalidate range rules: inside the mapping, and on non-coherent
    /// memory aligned to `non_coherent_atom_size` unless it runs to the end
    fn check_mapped_range(&mut self, what: &str, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) {
        let raw = memory.as_raw();
        let atom = self.config.limits.non_coherent_atom_size.max(1);
        let (len, type_index, mapped) = match self.memory.get(&raw) {
            Some(m) => (m.bytes.len() as vk::DeviceSize, m.type_index, m.mapped),
            None => {
                self.error(format!("{what} of unknown memory {raw:#x}"));
                return;
            }
        };
        let Some((map_start, map_end)) = mapped else {
            self.error(format!("{what} of memory {raw:#x} that is not mapped"));
            return;
        };
        let end = if size == vk::WHOLE_SIZE {
            map_end
        } else {
            match offset.checked_add(size) {
                Some(end) => end,
                None => {
                    self.error(format!("{what} range {offset}+{size} overflows"));
                    return;
                }
            }
        };
        if offset < map_start || end > map_end {
            self.error(format!("{what} range {offset}..{end} outside mapping {map_start}..{map_end}"));
        }
        if type_index != memory_types::HOST_CACHED {
            return;
        }
        if offset % atom != 0 {
            self.error(format!("{what} offset {offset} not a multiple of nonCoherentAtomSize {atom}"));
        }
        let tail_ok = end % atom == 0 || end == len;
        if size == vk::WHOLE_SIZE && !tail_ok {
            self.error(format!("{what} to a mapping end {end} not a multiple of nonCoherentAtomSize {atom}"));
        }
        if size != vk::WHOLE_SIZE && size % atom != 0 && end != len {
            self.error(format!("{what} size {size} not a multiple of nonCoherentAtomSize {atom}"));
        }
    }

    /// Whether `command_buffer` accepts commands; reports misuse
    fn recording(&mut self, command_buffer: vk::CommandBuffer, what: &str) -> bool {
        let raw = command_buffer.as_raw();
        match self.command_buffers.get(&raw) {
            Some(cb) if cb.state == RecordState::Recording => true,
            _ => {
                self.error(format!("{what} on command buffer {raw:#x} that is not recording"));
                false
            }
        }
    }

    fn in_render_pass(&self, command_buffer: vk::CommandBuffer) -> bool {
        self.command_buffers
            .get(&command_buffer.as_raw())
            .is_some_and(|cb| cb.in_render_pass)
    }

    fn require_render_pass(&mut self, command_buffer: vk::CommandBuffer, what: &str) -> bool {
        if self.recording(command_buffer, what) {
            if self.in_render_pass(command_buffer) {
                return true;
            }
            self.error(format!("{what} outside of a render pass"));
        }
        false
    }

    fn complete_pending(&mut self) {
        for fence in self.fences.values_mut() {
            if fence.pending {
                fence.pending = false;
                fence.signaled = true;
            }
        }
    }

    fn run_copy(&mut self, copy: &PendingCopy) {
        let source = self
            .buffers
            .get(&copy.src)
            .and_then(|b| b.memory)
            .and_then(|memory| self.memory.get(&memory))
            .map(|m| {
                let start = copy.src_offset as usize;
                m.bytes[start..start + copy.size as usize].to_vec()
            });
        let Some(source) = source else {
            self.error(format!("copy from buffer {:#x} without memory", copy.src));
            return;
        };
        let destination = self
            .buffers
            .get(&copy.dst)
            .and_then(|b| b.memory)
            .and_then(|memory| self.memory.get_mut(&memory));
        match destination {
            Some(m) => {
                let start = copy.dst_offset as usize;
                m.bytes[start..start + source.len()].copy_from_slice(&source);
            }
            None => self.error(format!("copy into buffer {:#x} without memory", copy.dst)),
        }
    }

    fn signal_semaphore(&mut self, semaphore: vk::Semaphore, by: &str) {
        let raw = semaphore.as_raw();
        match self.semaphores.get_mut(&raw) {
            Some(signaled) if *signaled => {
                self.error(format!("{by} signals semaphore {raw:#x} that is already signaled"));
            }
            Some(signaled) => *signaled = true,
            None => self.error(format!("{by} signals unknown semaphore {raw:#x}")),
        }
    }

    fn consume_semaphore(&mut self, semaphore: vk::Semaphore, by: &str) {
        let raw = semaphore.as_raw();
        match self.semaphores.get_mut(&raw) {
            Some(signaled) if *signaled => *signaled = false,
            Some(_) => self.error(format!("{by} waits on semaphore {raw:#x} that nothing signaled")),
            None => self.error(format!("{by} waits on unknown semaphore {raw:#x}")),
        }
    }
}

fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Software GPU; see the module docs
#[derive(Clone)]
pub struct HeadlessDevice {
    state: Arc<Mutex<State>>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    /// Device with the default surface and limits
    pub fn new() -> Self {
        Self::with_config(HeadlessConfig::default())
    }

    /// Device with a custom surface and limits
    pub fn with_config(config: HeadlessConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new(config))),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Calls recorded so far
    pub fn events(&self) -> Vec<HeadlessEvent> {
        self.state().events.clone()
    }

    /// Drop the recorded calls
    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    /// Contract violations observed so far
    pub fn validation_errors(&self) -> Vec<String> {
        self.state().validation_errors.clone()
    }

    /// Objects created and not yet destroyed
    pub fn live_object_count(&self) -> usize {
        self.state().live.len()
    }

    /// Live objects of one kind
    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.state().live.values().filter(|k| **k == kind).count()
    }

    /// Make the next acquire return `result` (`SUBOPTIMAL_KHR` still yields an image)
    pub fn push_acquire_result(&self, result: vk::Result) {
        self.state().acquire_results.push_back(result);
    }

    /// Make the next present return `result`
    pub fn push_present_result(&self, result: vk::Result) {
        self.state().present_results.push_back(result);
    }

    /// Make the next queue submission fail with `result` before it has any effect
    pub fn push_submit_result(&self, result: vk::Result) {
        self.state().submit_results.push_back(result);
    }

    /// Override the round-robin image order for the next acquires
    pub fn queue_acquire_images(&self, indices: &[u32]) {
        self.state().acquire_order.extend(indices.iter().copied());
    }

    /// Change which depth formats the "driver" supports
    pub fn set_depth_formats(&self, formats: Vec<vk::Format>) {
        self.state().config.depth_formats = formats;
    }

    /// Change the extent the surface reports (`None` for the sentinel)
    pub fn set_surface_extent(&self, extent: Option<vk::Extent2D>) {
        self.state().config.current_extent = extent;
    }

    /// Cap the number of simultaneously live descriptor pools
    pub fn set_max_descriptor_pools(&self, limit: Option<usize>) {
        self.state().config.max_descriptor_pools = limit;
    }

    /// Whether a fence is currently signaled
    pub fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state()
            .fences
            .get(&fence.as_raw())
            .is_some_and(|f| f.signaled)
    }

    /// Bytes of the memory bound to a buffer
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        let state = self.state();
        let bound = state.buffers.get(&buffer.as_raw())?;
        let memory = state.memory.get(&bound.memory?)?;
        Some(memory.bytes[..bound.size as usize].to_vec())
    }
}

impl GpuDevice for HeadlessDevice {
    fn name(&self) -> &str {
        "headless"
    }

    fn limits(&self) -> DeviceLimits {
        self.state().config.limits
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            memory_heap_count: 1,
            ..Default::default()
        };
        properties.memory_types[memory_types::DEVICE_LOCAL as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        properties.memory_types[memory_types::HOST_COHERENT as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 0,
        };
        properties.memory_types[memory_types::HOST_CACHED as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_CACHED,
            heap_index: 0,
        };
        properties.memory_heaps[0] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        properties
    }

    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        let state = self.state();
        let optimal = if state.config.depth_formats.contains(&format) {
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
        } else if is_depth_format(format) {
            vk::FormatFeatureFlags::empty()
        } else {
            vk::FormatFeatureFlags::SAMPLED_IMAGE
                | vk::FormatFeatureFlags::COLOR_ATTACHMENT
                | vk::FormatFeatureFlags::TRANSFER_DST
        };
        vk::FormatProperties {
            optimal_tiling_features: optimal,
            ..Default::default()
        }
    }

    fn wait_idle(&self) -> VkResult<()> {
        let mut state = self.state();
        state.complete_pending();
        state.events.push(HeadlessEvent::WaitIdle);
        Ok(())
    }

    fn queue_wait_idle(&self) -> VkResult<()> {
        let mut state = self.state();
        state.complete_pending();
        state.events.push(HeadlessEvent::QueueWaitIdle);
        Ok(())
    }

    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> VkResult<vk::DeviceMemory> {
        let mut state = self.state();
        if memory_type_index > memory_types::HOST_CACHED {
            state.error(format!("memory type {memory_type_index} does not exist"));
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let raw = state.alloc(ObjectKind::Memory);
        state.memory.insert(
            raw,
            MemoryState {
                bytes: vec![0u8; size as usize].into_boxed_slice(),
                type_index: memory_type_index,
                mapped: None,
            },
        );
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state();
        if state.release(memory.as_raw(), ObjectKind::Memory) {
            state.memory.remove(&memory.as_raw());
        }
    }

    fn map_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<*mut u8> {
        let mut state = self.state();
        let raw = memory.as_raw();
        let problem = match state.memory.get(&raw) {
            None => Some(format!("mapping unknown memory {raw:#x}")),
            Some(m) if m.mapped.is_some() => Some(format!("memory {raw:#x} is already mapped")),
            Some(m) if m.type_index == memory_types::DEVICE_LOCAL => {
                Some(format!("memory {raw:#x} is not host visible"))
            }
            Some(m) => {
                let len = m.bytes.len() as vk::DeviceSize;
                let end = if size == vk::WHOLE_SIZE { len } else { offset + size };
                (offset > len || end > len)
                    .then(|| format!("mapping {offset}..{end} of {len}-byte memory {raw:#x}"))
            }
        };
        if let Some(problem) = problem {
            state.error(problem);
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let m = state
            .memory
            .get_mut(&raw)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let len = m.bytes.len() as vk::DeviceSize;
        let end = if size == vk::WHOLE_SIZE { len } else { offset + size };
        m.mapped = Some((offset, end));
        // The boxed slice never moves while the memory object lives.
        Ok(m.bytes[offset as usize..].as_mut_ptr())
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state();
        let raw = memory.as_raw();
        match state.memory.get_mut(&raw) {
            Some(m) if m.mapped.is_some() => m.mapped = None,
            _ => state.error(format!("unmapping memory {raw:#x} that is not mapped")),
        }
    }

    fn flush_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()> {
        let mut state = self.state();
        state.check_mapped_range("flush", memory, offset, size);
        state.events.push(HeadlessEvent::FlushMemory { memory, offset, size });
        Ok(())
    }

    fn invalidate_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()> {
        let mut state = self.state();
        state.check_mapped_range("invalidate", memory, offset, size);
        state.events.push(HeadlessEvent::InvalidateMemory { memory, offset, size });
        Ok(())
    }

    fn create_buffer(&self, size: vk::DeviceSize, _usage: vk::BufferUsageFlags) -> VkResult<(vk::Buffer, vk::MemoryRequirements)> {
        let mut state = self.state();
        if size == 0 {
            state.error("creating a zero-sized buffer".to_string());
        }
        let raw = state.alloc(ObjectKind::Buffer);
        state.buffers.insert(raw, BufferState { size, memory: None });
        let requirements = vk::MemoryRequirements {
            size,
            alignment: 16,
            memory_type_bits: 0b111,
        };
        Ok((vk::Buffer::from_raw(raw), requirements))
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        let mut state = self.state();
        let memory_len = state.memory.get(&memory.as_raw()).map(|m| m.bytes.len());
        let problem = match (state.buffers.get_mut(&buffer.as_raw()), memory_len) {
            (Some(b), Some(len)) if b.memory.is_none() && b.size as usize <= len => {
                b.memory = Some(memory.as_raw());
                None
            }
            (Some(_), Some(_)) => Some("buffer already bound or memory too small"),
            _ => Some("binding unknown buffer or memory"),
        };
        if let Some(problem) = problem {
            state.error(problem.to_string());
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state();
        if state.release(buffer.as_raw(), ObjectKind::Buffer) {
            state.buffers.remove(&buffer.as_raw());
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<(vk::Image, vk::MemoryRequirements)> {
        let mut state = self.state();
        if desc.extent.width == 0 || desc.extent.height == 0 {
            state.error("creating a zero-sized image".to_string());
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let raw = state.alloc(ObjectKind::Image);
        let requirements = vk::MemoryRequirements {
            size: vk::DeviceSize::from(desc.extent.width) * vk::DeviceSize::from(desc.extent.height) * 4,
            alignment: 256,
            memory_type_bits: 0b111,
        };
        Ok((vk::Image::from_raw(raw), requirements))
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()> {
        let mut state = self.state();
        if !state.is_live(image.as_raw(), ObjectKind::Image) || !state.memory.contains_key(&memory.as_raw()) {
            state.error("binding unknown image or memory".to_string());
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        Ok(())
    }

    fn destroy_image(&self, image: vk::Image) {
        self.state().release(image.as_raw(), ObjectKind::Image);
    }

    fn create_image_view(&self, image: vk::Image, _format: vk::Format, _aspect: vk::ImageAspectFlags) -> VkResult<vk::ImageView> {
        let mut state = self.state();
        if image == vk::Image::null() {
            state.error("creating a view of a null image".to_string());
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        Ok(vk::ImageView::from_raw(state.alloc(ObjectKind::ImageView)))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state().release(view.as_raw(), ObjectKind::ImageView);
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> VkResult<vk::Sampler> {
        Ok(vk::Sampler::from_raw(self.state().alloc(ObjectKind::Sampler)))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state().release(sampler.as_raw(), ObjectKind::Sampler);
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state();
        let raw = state.alloc(ObjectKind::Semaphore);
        state.semaphores.insert(raw, false);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state();
        if state.release(semaphore.as_raw(), ObjectKind::Semaphore) {
            state.semaphores.remove(&semaphore.as_raw());
        }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state();
        let raw = state.alloc(ObjectKind::Fence);
        state.fences.insert(
            raw,
            FenceState {
                signaled,
                pending: false,
            },
        );
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state();
        if state.release(fence.as_raw(), ObjectKind::Fence) {
            state.fences.remove(&fence.as_raw());
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
        let mut state = self.state();
        let raw = fence.as_raw();
        let blocked = match state.fences.get_mut(&raw) {
            Some(f) if f.signaled => false,
            Some(f) if f.pending => {
                f.pending = false;
                f.signaled = true;
                true
            }
            Some(_) => {
                state.error(format!("waiting on fence {raw:#x} that no submission will signal"));
                return Err(vk::Result::ERROR_DEVICE_LOST);
            }
            None => {
                state.error(format!("waiting on unknown fence {raw:#x}"));
                return Err(vk::Result::ERROR_DEVICE_LOST);
            }
        };
        state.events.push(HeadlessEvent::WaitFence { fence, blocked });
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state();
        let raw = fence.as_raw();
        match state.fences.get_mut(&raw) {
            Some(f) if f.pending => {
                state.error(format!("resetting fence {raw:#x} while its submission is in flight"));
            }
            Some(f) => f.signaled = false,
            None => state.error(format!("resetting unknown fence {raw:#x}")),
        }
        state.events.push(HeadlessEvent::ResetFence(fence));
        Ok(())
    }

    fn allocate_command_buffers(&self, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state();
        Ok((0..count)
            .map(|_| {
                let raw = state.alloc(ObjectKind::CommandBuffer);
                state.command_buffers.insert(
                    raw,
                    CommandBufferState {
                        state: RecordState::Initial,
                        in_render_pass: false,
                        copies: Vec::new(),
                    },
                );
                vk::CommandBuffer::from_raw(raw)
            })
            .collect())
    }

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        let mut state = self.state();
        for command_buffer in command_buffers {
            if state.release(command_buffer.as_raw(), ObjectKind::CommandBuffer) {
                state.command_buffers.remove(&command_buffer.as_raw());
            }
        }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, _one_time_submit: bool) -> VkResult<()> {
        let mut state = self.state();
        let raw = command_buffer.as_raw();
        match state.command_buffers.get_mut(&raw) {
            Some(cb) if cb.state == RecordState::Recording => {
                state.error(format!("beginning command buffer {raw:#x} twice"));
                return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
            }
            Some(cb) => {
                cb.state = RecordState::Recording;
                cb.in_render_pass = false;
                cb.copies.clear();
            }
            None => {
                state.error(format!("beginning unknown command buffer {raw:#x}"));
                return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
            }
        }
        state.events.push(HeadlessEvent::BeginCommandBuffer(command_buffer));
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state();
        if !state.recording(command_buffer, "end") {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        if state.in_render_pass(command_buffer) {
            state.error("ending a command buffer inside a render pass".to_string());
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        if let Some(cb) = state.command_buffers.get_mut(&command_buffer.as_raw()) {
            cb.state = RecordState::Executable;
        }
        Ok(())
    }

    fn queue_submit(&self, submit: &SubmitDesc<'_>, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state();
        if let Some(result) = state.submit_results.pop_front() {
            return Err(result);
        }
        if submit.wait_semaphores.len() != submit.wait_stages.len() {
            state.error("wait semaphore and wait stage counts differ".to_string());
        }

        let mut copies = Vec::new();
        for command_buffer in submit.command_buffers {
            let raw = command_buffer.as_raw();
            match state.command_buffers.get_mut(&raw) {
                Some(cb) if cb.state == RecordState::Executable => copies.append(&mut cb.copies),
                _ => state.error(format!("submitting command buffer {raw:#x} that is not executable")),
            }
        }
        for semaphore in submit.wait_semaphores {
            state.consume_semaphore(*semaphore, "submit");
        }
        for copy in &copies {
            state.run_copy(copy);
        }
        for semaphore in submit.signal_semaphores {
            state.signal_semaphore(*semaphore, "submit");
        }
        if fence != vk::Fence::null() {
            let raw = fence.as_raw();
            match state.fences.get_mut(&raw) {
                Some(f) if f.signaled || f.pending => {
                    state.error(format!("submitting with fence {raw:#x} that is not reset"));
                }
                Some(f) => f.pending = true,
                None => state.error(format!("submitting with unknown fence {raw:#x}")),
            }
        }

        state.events.push(HeadlessEvent::Submit {
            wait_semaphores: submit.wait_semaphores.to_vec(),
            command_buffers: submit.command_buffers.to_vec(),
            signal_semaphores: submit.signal_semaphores.to_vec(),
            fence,
        });
        Ok(())
    }

    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin) {
        let mut state = self.state();
        if !state.recording(command_buffer, "begin render pass") {
            return;
        }
        if state.in_render_pass(command_buffer) {
            state.error("beginning a render pass inside another".to_string());
            return;
        }
        if !state.is_live(begin.framebuffer.as_raw(), ObjectKind::Framebuffer)
            || !state.is_live(begin.render_pass.as_raw(), ObjectKind::RenderPass)
        {
            state.error("beginning a render pass with a destroyed framebuffer or pass".to_string());
        }
        if let Some(cb) = state.command_buffers.get_mut(&command_buffer.as_raw()) {
            cb.in_render_pass = true;
        }
        state.events.push(HeadlessEvent::BeginRenderPass {
            framebuffer: begin.framebuffer,
            width: begin.extent.width,
            height: begin.extent.height,
        });
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        let mut state = self.state();
        if state.require_render_pass(command_buffer, "end render pass") {
            if let Some(cb) = state.command_buffers.get_mut(&command_buffer.as_raw()) {
                cb.in_render_pass = false;
            }
            state.events.push(HeadlessEvent::EndRenderPass);
        }
    }

    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        let mut state = self.state();
        if state.recording(command_buffer, "set viewport") {
            state.events.push(HeadlessEvent::SetViewport {
                width: viewport.width,
                height: viewport.height,
            });
        }
    }

    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        let mut state = self.state();
        if state.recording(command_buffer, "set scissor") {
            state.events.push(HeadlessEvent::SetScissor {
                width: scissor.extent.width,
                height: scissor.extent.height,
            });
        }
    }

    fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline) {
        let mut state = self.state();
        if state.recording(command_buffer, "bind pipeline") {
            if !state.is_live(pipeline.as_raw(), ObjectKind::Pipeline) {
                state.error(format!("binding unknown pipeline {:#x}", pipeline.as_raw()));
            }
            state.events.push(HeadlessEvent::BindPipeline(pipeline));
        }
    }

    fn cmd_bind_descriptor_sets(&self, command_buffer: vk::CommandBuffer, layout: vk::PipelineLayout, first_set: u32, sets: &[vk::DescriptorSet]) {
        let mut state = self.state();
        if !state.recording(command_buffer, "bind descriptor sets") {
            return;
        }
        if !state.is_live(layout.as_raw(), ObjectKind::PipelineLayout) {
            state.error("binding descriptor sets with an unknown pipeline layout".to_string());
        }
        for set in sets {
            if !state.is_live(set.as_raw(), ObjectKind::DescriptorSet) {
                state.error(format!("binding descriptor set {:#x} that is not allocated", set.as_raw()));
            }
        }
        state.events.push(HeadlessEvent::BindDescriptorSets {
            first_set,
            sets: sets.to_vec(),
        });
    }

    fn cmd_push_constants(&self, command_buffer: vk::CommandBuffer, _layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, offset: u32, data: &[u8]) {
        let mut state = self.state();
        if !state.recording(command_buffer, "push constants") {
            return;
        }
        let limit = state.config.limits.max_push_constants_size;
        if offset as usize + data.len() > limit as usize {
            state.error(format!("push constants of {} bytes exceed {limit}", data.len()));
        }
        state.events.push(HeadlessEvent::PushConstants {
            stages,
            data: data.to_vec(),
        });
    }

    fn cmd_bind_vertex_buffers(&self, command_buffer: vk::CommandBuffer, _first_binding: u32, buffers: &[vk::Buffer], offsets: &[vk::DeviceSize]) {
        let mut state = self.state();
        if state.recording(command_buffer, "bind vertex buffers") && buffers.len() != offsets.len() {
            state.error("vertex buffer and offset counts differ".to_string());
        }
    }

    fn cmd_bind_index_buffer(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, _offset: vk::DeviceSize, _index_type: vk::IndexType) {
        let mut state = self.state();
        if state.recording(command_buffer, "bind index buffer") && !state.buffers.contains_key(&buffer.as_raw()) {
            state.error("binding an unknown index buffer".to_string());
        }
    }

    fn cmd_draw(&self, command_buffer: vk::CommandBuffer, vertex_count: u32, instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        let mut state = self.state();
        if state.require_render_pass(command_buffer, "draw") {
            state.events.push(HeadlessEvent::Draw {
                vertex_count,
                instance_count,
            });
        }
    }

    fn cmd_draw_indexed(&self, command_buffer: vk::CommandBuffer, index_count: u32, instance_count: u32, _first_index: u32, _vertex_offset: i32, _first_instance: u32) {
        let mut state = self.state();
        if state.require_render_pass(command_buffer, "draw indexed") {
            state.events.push(HeadlessEvent::DrawIndexed {
                index_count,
                instance_count,
            });
        }
    }

    fn cmd_copy_buffer(&self, command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        let mut state = self.state();
        if !state.recording(command_buffer, "copy buffer") {
            return;
        }
        let src_size = state.buffers.get(&src.as_raw()).map(|b| b.size);
        let dst_size = state.buffers.get(&dst.as_raw()).map(|b| b.size);
        let (Some(src_size), Some(dst_size)) = (src_size, dst_size) else {
            state.error("copying between unknown buffers".to_string());
            return;
        };
        for region in regions {
            if region.src_offset + region.size > src_size || region.dst_offset + region.size > dst_size {
                state.error(format!("buffer copy of {} bytes is out of range", region.size));
                continue;
            }
            let copy = PendingCopy {
                src: src.as_raw(),
                src_offset: region.src_offset,
                dst: dst.as_raw(),
                dst_offset: region.dst_offset,
                size: region.size,
            };
            if let Some(cb) = state.command_buffers.get_mut(&command_buffer.as_raw()) {
                cb.copies.push(copy);
            }
        }
    }

    fn cmd_copy_buffer_to_image(&self, command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Image, _extent: vk::Extent2D) {
        let mut state = self.state();
        if state.recording(command_buffer, "copy buffer to image")
            && (!state.buffers.contains_key(&src.as_raw()) || !state.is_live(dst.as_raw(), ObjectKind::Image))
        {
            state.error("copying between an unknown buffer and image".to_string());
        }
    }

    fn cmd_image_barrier(&self, command_buffer: vk::CommandBuffer, barrier: &ImageBarrier) {
        let mut state = self.state();
        if state.recording(command_buffer, "image barrier") {
            state.events.push(HeadlessEvent::ImageBarrier(*barrier));
        }
    }

    fn create_descriptor_set_layout(&self, bindings: &[DescriptorBinding]) -> VkResult<vk::DescriptorSetLayout> {
        let mut state = self.state();
        let mut seen: Vec<u32> = bindings.iter().map(|b| b.binding).collect();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != bindings.len() {
            state.error("descriptor set layout repeats a binding index".to_string());
        }
        let layout = vk::DescriptorSetLayout::from_raw(state.alloc(ObjectKind::DescriptorSetLayout));
        state.events.push(HeadlessEvent::CreateDescriptorSetLayout(layout));
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state().release(layout.as_raw(), ObjectKind::DescriptorSetLayout);
    }

    fn create_descriptor_pool(&self, max_sets: u32, _sizes: &[vk::DescriptorPoolSize]) -> VkResult<vk::DescriptorPool> {
        let mut state = self.state();
        if let Some(limit) = state.config.max_descriptor_pools {
            if state.pools.len() >= limit {
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
        }
        if max_sets == 0 {
            state.error("descriptor pool with max_sets = 0".to_string());
        }
        let raw = state.alloc(ObjectKind::DescriptorPool);
        state.pools.insert(
            raw,
            PoolState {
                max_sets,
                sets: Vec::new(),
            },
        );
        let pool = vk::DescriptorPool::from_raw(raw);
        state.events.push(HeadlessEvent::CreateDescriptorPool { pool, max_sets });
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state();
        if state.release(pool.as_raw(), ObjectKind::DescriptorPool) {
            if let Some(freed) = state.pools.remove(&pool.as_raw()) {
                for set in freed.sets {
                    state.live.remove(&set);
                }
            }
        }
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        let mut state = self.state();
        let Some(freed) = state.pools.get_mut(&pool.as_raw()).map(|p| std::mem::take(&mut p.sets)) else {
            state.error(format!("resetting unknown descriptor pool {:#x}", pool.as_raw()));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };
        for set in freed {
            state.live.remove(&set);
        }
        state.events.push(HeadlessEvent::ResetDescriptorPool(pool));
        Ok(())
    }

    fn allocate_descriptor_set(&self, pool: vk::DescriptorPool, layout: vk::DescriptorSetLayout) -> VkResult<vk::DescriptorSet> {
        let mut state = self.state();
        if !state.is_live(layout.as_raw(), ObjectKind::DescriptorSetLayout) {
            state.error(format!("allocating with unknown layout {:#x}", layout.as_raw()));
        }
        let exhausted = match state.pools.get(&pool.as_raw()) {
            Some(p) => p.sets.len() >= p.max_sets as usize,
            None => {
                state.error(format!("allocating from unknown pool {:#x}", pool.as_raw()));
                return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
            }
        };
        let result = if exhausted {
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
        } else {
            let raw = state.alloc(ObjectKind::DescriptorSet);
            if let Some(p) = state.pools.get_mut(&pool.as_raw()) {
                p.sets.push(raw);
            }
            Ok(vk::DescriptorSet::from_raw(raw))
        };
        state.events.push(HeadlessEvent::AllocateDescriptorSet { pool, result });
        result
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let mut state = self.state();
        for write in writes {
            if !state.is_live(write.set.as_raw(), ObjectKind::DescriptorSet) {
                state.error(format!("writing descriptor set {:#x} that is not allocated", write.set.as_raw()));
            }
            let resource_live = match write.resource {
                DescriptorResource::Buffer(info) => state.buffers.contains_key(&info.buffer.as_raw()),
                DescriptorResource::Image(info) => {
                    state.is_live(info.image_view.as_raw(), ObjectKind::ImageView)
                }
            };
            if !resource_live {
                state.error(format!("descriptor write to binding {} references a dead resource", write.binding));
            }
            state.events.push(HeadlessEvent::UpdateDescriptorSet {
                set: write.set,
                binding: write.binding,
            });
        }
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let mut state = self.state();
        if code.first() != Some(&SPIRV_MAGIC) {
            state.error("shader module without the SPIR-V magic number".to_string());
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        Ok(vk::ShaderModule::from_raw(state.alloc(ObjectKind::ShaderModule)))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state().release(module.as_raw(), ObjectKind::ShaderModule);
    }

    fn create_pipeline_layout(&self, set_layouts: &[vk::DescriptorSetLayout], push_constant_ranges: &[vk::PushConstantRange]) -> VkResult<vk::PipelineLayout> {
        let mut state = self.state();
        for layout in set_layouts {
            if !state.is_live(layout.as_raw(), ObjectKind::DescriptorSetLayout) {
                state.error(format!("pipeline layout uses unknown set layout {:#x}", layout.as_raw()));
            }
        }
        let limit = state.config.limits.max_push_constants_size;
        for range in push_constant_ranges {
            if range.offset + range.size > limit {
                state.error(format!("push constant range of {} bytes exceeds {limit}", range.size));
            }
        }
        Ok(vk::PipelineLayout::from_raw(state.alloc(ObjectKind::PipelineLayout)))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state().release(layout.as_raw(), ObjectKind::PipelineLayout);
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> VkResult<vk::Pipeline> {
        let mut state = self.state();
        let valid = state.is_live(desc.vert_module.as_raw(), ObjectKind::ShaderModule)
            && state.is_live(desc.frag_module.as_raw(), ObjectKind::ShaderModule)
            && state.is_live(desc.config.pipeline_layout.as_raw(), ObjectKind::PipelineLayout)
            && state.is_live(desc.config.render_pass.as_raw(), ObjectKind::RenderPass);
        if !valid {
            state.error("graphics pipeline references dead modules, layout or render pass".to_string());
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        Ok(vk::Pipeline::from_raw(state.alloc(ObjectKind::Pipeline)))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state().release(pipeline.as_raw(), ObjectKind::Pipeline);
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> VkResult<vk::RenderPass> {
        let mut state = self.state();
        if desc.attachments.is_empty() {
            state.error("render pass without attachments".to_string());
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        Ok(vk::RenderPass::from_raw(state.alloc(ObjectKind::RenderPass)))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state().release(render_pass.as_raw(), ObjectKind::RenderPass);
    }

    fn create_framebuffer(&self, render_pass: vk::RenderPass, attachments: &[vk::ImageView], _extent: vk::Extent2D) -> VkResult<vk::Framebuffer> {
        let mut state = self.state();
        let valid = state.is_live(render_pass.as_raw(), ObjectKind::RenderPass)
            && attachments
                .iter()
                .all(|view| state.is_live(view.as_raw(), ObjectKind::ImageView));
        if !valid {
            state.error("framebuffer references a dead render pass or view".to_string());
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        Ok(vk::Framebuffer::from_raw(state.alloc(ObjectKind::Framebuffer)))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state().release(framebuffer.as_raw(), ObjectKind::Framebuffer);
    }

    fn surface_capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        let state = self.state();
        let config = &state.config;
        let current_extent = config.current_extent.unwrap_or(vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        });
        Ok(vk::SurfaceCapabilitiesKHR {
            min_image_count: config.min_image_count,
            max_image_count: config.max_image_count,
            current_extent,
            min_image_extent: config.min_image_extent,
            max_image_extent: config.max_image_extent,
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        })
    }

    fn surface_formats(&self) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.state().config.surface_formats.clone())
    }

    fn surface_present_modes(&self) -> VkResult<Vec<vk::PresentModeKHR>> {
        Ok(self.state().config.present_modes.clone())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let mut state = self.state();
        if desc.extent.width == 0 || desc.extent.height == 0 {
            state.error("creating a zero-sized swapchain".to_string());
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        if desc.old_swapchain != vk::SwapchainKHR::null()
            && !state.is_live(desc.old_swapchain.as_raw(), ObjectKind::Swapchain)
        {
            state.error("old swapchain is not alive".to_string());
        }
        let raw = state.alloc(ObjectKind::Swapchain);
        let images = (0..desc.min_image_count)
            .map(|_| {
                state.next_handle += 1;
                vk::Image::from_raw(state.next_handle)
            })
            .collect::<Vec<_>>();
        state.swapchains.insert(
            raw,
            SwapchainState {
                acquired: vec![false; images.len()],
                images,
                next_image: 0,
            },
        );
        let swapchain = vk::SwapchainKHR::from_raw(raw);
        state.events.push(HeadlessEvent::CreateSwapchain {
            swapchain,
            old_swapchain: desc.old_swapchain,
            image_count: desc.min_image_count,
            width: desc.extent.width,
            height: desc.extent.height,
            present_mode: desc.present_mode,
            format: desc.surface_format.format,
        });
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state();
        if state.release(swapchain.as_raw(), ObjectKind::Swapchain) {
            state.swapchains.remove(&swapchain.as_raw());
            state.events.push(HeadlessEvent::DestroySwapchain(swapchain));
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.state()
            .swapchains
            .get(&swapchain.as_raw())
            .map(|s| s.images.clone())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
    }

    fn acquire_next_image(&self, swapchain: vk::SwapchainKHR, _timeout: u64, semaphore: vk::Semaphore) -> VkResult<(u32, bool)> {
        let mut state = self.state();
        if !state.swapchains.contains_key(&swapchain.as_raw()) {
            state.error(format!("acquiring from unknown swapchain {:#x}", swapchain.as_raw()));
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }

        let mut suboptimal = false;
        if let Some(result) = state.acquire_results.pop_front() {
            if result == vk::Result::SUBOPTIMAL_KHR {
                suboptimal = true;
            } else {
                state.events.push(HeadlessEvent::Acquire {
                    swapchain,
                    semaphore,
                    result: Err(result),
                });
                return Err(result);
            }
        }

        let scripted = state.acquire_order.pop_front();
        let (index, already_acquired) = {
            let Some(chain) = state.swapchains.get_mut(&swapchain.as_raw()) else {
                return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
            };
            let count = chain.images.len() as u32;
            let index = scripted.unwrap_or(chain.next_image) % count;
            chain.next_image = (index + 1) % count;
            let already = chain.acquired[index as usize];
            chain.acquired[index as usize] = true;
            (index, already)
        };
        if already_acquired {
            state.error(format!("image {index} acquired again before being presented"));
        }
        state.signal_semaphore(semaphore, "acquire");
        state.events.push(HeadlessEvent::Acquire {
            swapchain,
            semaphore,
            result: Ok(index),
        });
        Ok((index, suboptimal))
    }

    fn queue_present(&self, swapchain: vk::SwapchainKHR, image_index: u32, wait_semaphore: vk::Semaphore) -> VkResult<bool> {
        let mut state = self.state();
        let was_acquired = match state.swapchains.get_mut(&swapchain.as_raw()) {
            Some(chain) => chain
                .acquired
                .get_mut(image_index as usize)
                .map(|acquired| std::mem::replace(acquired, false)),
            None => None,
        };
        if was_acquired != Some(true) {
            state.error(format!("presenting image {image_index} that was not acquired"));
        }
        state.consume_semaphore(wait_semaphore, "present");

        let result = match state.present_results.pop_front() {
            None => Ok(false),
            Some(vk::Result::SUBOPTIMAL_KHR) => Ok(true),
            Some(error) => Err(error),
        };
        state.events.push(HeadlessEvent::Present {
            swapchain,
            image_index,
            wait_semaphore,
            result,
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_fence_blocks_once() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        let cb = device.allocate_command_buffers(1).unwrap()[0];
        device.begin_command_buffer(cb, true).unwrap();
        device.end_command_buffer(cb).unwrap();
        device
            .queue_submit(
                &SubmitDesc {
                    command_buffers: &[cb],
                    ..Default::default()
                },
                fence,
            )
            .unwrap();

        assert!(!device.fence_signaled(fence));
        device.wait_for_fence(fence, u64::MAX).unwrap();
        device.wait_for_fence(fence, u64::MAX).unwrap();
        let waits: Vec<_> = device
            .events()
            .into_iter()
            .filter_map(|e| match e {
                HeadlessEvent::WaitFence { blocked, .. } => Some(blocked),
                _ => None,
            })
            .collect();
        assert_eq!(waits, vec![true, false]);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_waiting_on_orphan_fence_is_device_lost() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        assert_eq!(device.wait_for_fence(fence, u64::MAX), Err(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(device.validation_errors().len(), 1);
    }

    #[test]
    fn test_semaphore_double_signal_is_reported() {
        let device = HeadlessDevice::new();
        let swapchain = device
            .create_swapchain(&SwapchainDesc {
                min_image_count: 3,
                surface_format: vk::SurfaceFormatKHR::default(),
                extent: vk::Extent2D { width: 8, height: 8 },
                present_mode: vk::PresentModeKHR::FIFO,
                pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                old_swapchain: vk::SwapchainKHR::null(),
            })
            .unwrap();
        let semaphore = device.create_semaphore().unwrap();
        assert_eq!(device.acquire_next_image(swapchain, u64::MAX, semaphore), Ok((0, false)));
        assert_eq!(device.acquire_next_image(swapchain, u64::MAX, semaphore), Ok((1, false)));
        assert_eq!(device.validation_errors().len(), 1);
    }

    #[test]
    fn test_scripted_acquire_and_present() {
        let device = HeadlessDevice::new();
        let swapchain = device
            .create_swapchain(&SwapchainDesc {
                min_image_count: 2,
                surface_format: vk::SurfaceFormatKHR::default(),
                extent: vk::Extent2D { width: 8, height: 8 },
                present_mode: vk::PresentModeKHR::FIFO,
                pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                old_swapchain: vk::SwapchainKHR::null(),
            })
            .unwrap();
        let semaphore = device.create_semaphore().unwrap();

        device.push_acquire_result(vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert_eq!(
            device.acquire_next_image(swapchain, u64::MAX, semaphore),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
        );

        device.queue_acquire_images(&[1]);
        device.push_acquire_result(vk::Result::SUBOPTIMAL_KHR);
        assert_eq!(device.acquire_next_image(swapchain, u64::MAX, semaphore), Ok((1, true)));

        device.push_present_result(vk::Result::SUBOPTIMAL_KHR);
        assert_eq!(device.queue_present(swapchain, 1, semaphore), Ok(true));
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_copy_runs_at_submit() {
        let device = HeadlessDevice::new();
        let make = |type_index| {
            let (buffer, req) = device.create_buffer(4, vk::BufferUsageFlags::TRANSFER_SRC).unwrap();
            let memory = device.allocate_memory(req.size, type_index).unwrap();
            device.bind_buffer_memory(buffer, memory).unwrap();
            (buffer, memory)
        };
        let (src, src_memory) = make(memory_types::HOST_COHERENT);
        let (dst, _) = make(memory_types::DEVICE_LOCAL);

        let ptr = device.map_memory(src_memory, 0, vk::WHOLE_SIZE).unwrap();
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), ptr, 4) };
        device.unmap_memory(src_memory);

        let cb = device.allocate_command_buffers(1).unwrap()[0];
        device.begin_command_buffer(cb, true).unwrap();
        device.cmd_copy_buffer(cb, src, dst, &[vk::BufferCopy { src_offset: 0, dst_offset: 0, size: 4 }]);
        device.end_command_buffer(cb).unwrap();
        assert_eq!(device.buffer_contents(dst), Some(vec![0, 0, 0, 0]));

        device
            .queue_submit(&SubmitDesc { command_buffers: &[cb], ..Default::default() }, vk::Fence::null())
            .unwrap();
        assert_eq!(device.buffer_contents(dst), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn test_non_coherent_ranges_must_cover_whole_atoms() {
        let device = HeadlessDevice::new();
        let memory = device.allocate_memory(224, memory_types::HOST_CACHED).unwrap();
        device.map_memory(memory, 0, vk::WHOLE_SIZE).unwrap();

        device.flush_memory(memory, 0, 128).unwrap();
        device.flush_memory(memory, 64, vk::WHOLE_SIZE).unwrap();
        device.invalidate_memory(memory, 192, 32).unwrap();
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());

        device.flush_memory(memory, 112, 112).unwrap();
        device.invalidate_memory(memory, 0, 100).unwrap();
        let errors = device.validation_errors();
        assert_eq!(errors.len(), 2, "{errors:?}");
        assert!(errors[0].contains("offset 112 not a multiple of nonCoherentAtomSize 64"));
        assert!(errors[1].contains("size 100"));
    }

    #[test]
    fn test_flush_outside_mapping_is_reported() {
        let device = HeadlessDevice::new();
        let memory = device.allocate_memory(256, memory_types::HOST_COHERENT).unwrap();
        device.map_memory(memory, 64, 64).unwrap();
        device.flush_memory(memory, 64, 64).unwrap();
        assert!(device.validation_errors().is_empty());
        device.flush_memory(memory, 0, 256).unwrap();
        assert_eq!(device.validation_errors().len(), 1);
    }

    #[test]
    fn test_device_local_memory_cannot_be_mapped() {
        let device = HeadlessDevice::new();
        let memory = device.allocate_memory(16, memory_types::DEVICE_LOCAL).unwrap();
        assert_eq!(
            device.map_memory(memory, 0, vk::WHOLE_SIZE),
            Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
        );
    }
}
