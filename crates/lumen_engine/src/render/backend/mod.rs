//! Backend seam between the render core and a GPU API
//!
//! [`GpuDevice`] is the raw command surface the core drives: memory, resources,
//! synchronization objects, command recording and presentation. Its vocabulary
//! is `ash::vk` handles plus the plain descriptor structs in this module, so the
//! swapchain, renderer, buffer and descriptor logic above it stays backend-free.
//!
//! Two implementations ship with the crate:
//! - [`vulkan::VulkanDevice`] talks to a real driver through ash
//! - [`headless::HeadlessDevice`] simulates one in software for tests

pub mod headless;
pub mod vulkan;

use ash::prelude::VkResult;
use ash::vk;

use super::pipeline::PipelineConfigInfo;

/// Device limits the core depends on
#[derive(Debug, Clone, Copy)]
pub struct DeviceLimits {
    /// Required alignment of dynamic/per-instance uniform buffer offsets
    pub min_uniform_buffer_offset_alignment: vk::DeviceSize,
    /// Granularity of flush/invalidate ranges on non-coherent memory
    pub non_coherent_atom_size: vk::DeviceSize,
    /// Largest push constant block
    pub max_push_constants_size: u32,
    /// Largest sampler anisotropy
    pub max_sampler_anisotropy: f32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: 256,
            non_coherent_atom_size: 64,
            max_push_constants_size: 128,
            max_sampler_anisotropy: 16.0,
        }
    }
}

/// 2D image creation parameters
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    /// Size in texels
    pub extent: vk::Extent2D,
    /// Texel format
    pub format: vk::Format,
    /// Memory tiling
    pub tiling: vk::ImageTiling,
    /// Usage flags
    pub usage: vk::ImageUsageFlags,
}

/// Sampler creation parameters
#[derive(Debug, Clone, Copy)]
pub struct SamplerDesc {
    /// Magnification filter
    pub mag_filter: vk::Filter,
    /// Minification filter
    pub min_filter: vk::Filter,
    /// Address mode on all axes
    pub address_mode: vk::SamplerAddressMode,
    /// Anisotropic filtering level, if enabled
    pub max_anisotropy: Option<f32>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: None,
        }
    }
}

/// Swapchain creation parameters
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    /// Number of images requested
    pub min_image_count: u32,
    /// Color format and color space
    pub surface_format: vk::SurfaceFormatKHR,
    /// Image size
    pub extent: vk::Extent2D,
    /// Presentation mode
    pub present_mode: vk::PresentModeKHR,
    /// Transform reported by the surface
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// Swapchain being replaced, or null
    pub old_swapchain: vk::SwapchainKHR,
}

/// Single-subpass render pass layout
#[derive(Debug, Clone, Default)]
pub struct RenderPassDesc {
    /// All attachments, indexed by the references below
    pub attachments: Vec<vk::AttachmentDescription>,
    /// Color attachments of the subpass
    pub color_attachments: Vec<vk::AttachmentReference>,
    /// Depth attachment of the subpass
    pub depth_attachment: Option<vk::AttachmentReference>,
    /// External dependencies
    pub dependencies: Vec<vk::SubpassDependency>,
}

/// Arguments of `vkCmdBeginRenderPass` with one color and one depth clear
#[derive(Debug, Clone, Copy)]
pub struct RenderPassBegin {
    /// Render pass to begin
    pub render_pass: vk::RenderPass,
    /// Target framebuffer
    pub framebuffer: vk::Framebuffer,
    /// Render area, anchored at the origin
    pub extent: vk::Extent2D,
    /// Clear value for attachment 0
    pub clear_color: [f32; 4],
    /// Depth clear value for attachment 1
    pub clear_depth: f32,
    /// Stencil clear value for attachment 1
    pub clear_stencil: u32,
}

/// One queue submission
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitDesc<'a> {
    /// Semaphores waited before execution
    pub wait_semaphores: &'a [vk::Semaphore],
    /// Stage at which each wait applies
    pub wait_stages: &'a [vk::PipelineStageFlags],
    /// Command buffers to execute
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Semaphores signaled on completion
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// One binding of a descriptor set layout
///
/// Equality and hashing cover every field, which is what the layout cache keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    /// Binding slot
    pub binding: u32,
    /// Descriptor type
    pub descriptor_type: vk::DescriptorType,
    /// Array size
    pub count: u32,
    /// Shader stages that read it
    pub stage_flags: vk::ShaderStageFlags,
}

impl DescriptorBinding {
    /// Single descriptor at `binding`
    pub fn new(binding: u32, descriptor_type: vk::DescriptorType, stage_flags: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            descriptor_type,
            count: 1,
            stage_flags,
        }
    }
}

/// Resource referenced by a descriptor write
#[derive(Debug, Clone, Copy)]
pub enum DescriptorResource {
    /// Uniform or storage buffer range
    Buffer(vk::DescriptorBufferInfo),
    /// Sampled image
    Image(vk::DescriptorImageInfo),
}

/// A single-descriptor write into a set
#[derive(Debug, Clone, Copy)]
pub struct DescriptorWrite {
    /// Destination set
    pub set: vk::DescriptorSet,
    /// Destination binding
    pub binding: u32,
    /// Descriptor type at that binding
    pub descriptor_type: vk::DescriptorType,
    /// What the descriptor points at
    pub resource: DescriptorResource,
}

/// Image layout transition recorded as a pipeline barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    /// Image being transitioned
    pub image: vk::Image,
    /// Aspect covered
    pub aspect: vk::ImageAspectFlags,
    /// Layout before
    pub old_layout: vk::ImageLayout,
    /// Layout after
    pub new_layout: vk::ImageLayout,
    /// Accesses made available
    pub src_access: vk::AccessFlags,
    /// Accesses made visible
    pub dst_access: vk::AccessFlags,
    /// Producing stage
    pub src_stage: vk::PipelineStageFlags,
    /// Consuming stage
    pub dst_stage: vk::PipelineStageFlags,
}

/// Graphics pipeline creation arguments
#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineDesc<'a> {
    /// Vertex stage module
    pub vert_module: vk::ShaderModule,
    /// Fragment stage module
    pub frag_module: vk::ShaderModule,
    /// Fixed-function state, layout and render pass
    pub config: &'a PipelineConfigInfo,
}

/// Raw GPU command surface
///
/// Methods mirror the Vulkan entry points they stand for. Results use ash's
/// [`VkResult`] so that status codes such as `ERROR_OUT_OF_DATE_KHR` reach the
/// core untouched; destroy calls accept null handles as no-ops.
pub trait GpuDevice: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;
    /// Limits of the selected physical device
    fn limits(&self) -> DeviceLimits;
    /// Memory types and heaps
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;
    /// Feature support of a format
    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties;
    /// Block until all queues are idle
    fn wait_idle(&self) -> VkResult<()>;
    /// Block until the graphics queue is idle
    fn queue_wait_idle(&self) -> VkResult<()>;

    // Memory
    /// Allocate device memory of the given type
    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> VkResult<vk::DeviceMemory>;
    /// Free device memory
    fn free_memory(&self, memory: vk::DeviceMemory);
    /// Map a range of host-visible memory
    fn map_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<*mut u8>;
    /// Unmap memory
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    /// Make host writes in a range visible to the device
    fn flush_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()>;
    /// Make device writes in a range visible to the host
    fn invalidate_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()>;

    // Buffers and images
    /// Create an unbound buffer and report its memory requirements
    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> VkResult<(vk::Buffer, vk::MemoryRequirements)>;
    /// Bind memory at offset 0
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()>;
    /// Destroy a buffer
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// Create an unbound 2D image and report its memory requirements
    fn create_image(&self, desc: &ImageDesc) -> VkResult<(vk::Image, vk::MemoryRequirements)>;
    /// Bind memory at offset 0
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()>;
    /// Destroy an image
    fn destroy_image(&self, image: vk::Image);
    /// Create a 2D view over one aspect
    fn create_image_view(&self, image: vk::Image, format: vk::Format, aspect: vk::ImageAspectFlags) -> VkResult<vk::ImageView>;
    /// Destroy an image view
    fn destroy_image_view(&self, view: vk::ImageView);
    /// Create a sampler
    fn create_sampler(&self, desc: &SamplerDesc) -> VkResult<vk::Sampler>;
    /// Destroy a sampler
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // Synchronization
    /// Create a binary semaphore
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    /// Create a fence, optionally already signaled
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    /// Destroy a fence
    fn destroy_fence(&self, fence: vk::Fence);
    /// Wait for a fence to signal
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()>;
    /// Return a fence to the unsignaled state
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    // Command buffers
    /// Allocate primary command buffers from the device's resettable pool
    fn allocate_command_buffers(&self, count: u32) -> VkResult<Vec<vk::CommandBuffer>>;
    /// Return command buffers to the pool
    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]);
    /// Begin recording
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, one_time_submit: bool) -> VkResult<()>;
    /// Finish recording
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    /// Submit to the graphics queue, signaling `fence` on completion
    fn queue_submit(&self, submit: &SubmitDesc<'_>, fence: vk::Fence) -> VkResult<()>;

    // Recording
    /// Begin a render pass with inline contents
    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin);
    /// End the current render pass
    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);
    /// Set dynamic viewport 0
    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: vk::Viewport);
    /// Set dynamic scissor 0
    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D);
    /// Bind a graphics pipeline
    fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline);
    /// Bind graphics descriptor sets
    fn cmd_bind_descriptor_sets(&self, command_buffer: vk::CommandBuffer, layout: vk::PipelineLayout, first_set: u32, sets: &[vk::DescriptorSet]);
    /// Update push constants
    fn cmd_push_constants(&self, command_buffer: vk::CommandBuffer, layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, offset: u32, data: &[u8]);
    /// Bind vertex buffers
    fn cmd_bind_vertex_buffers(&self, command_buffer: vk::CommandBuffer, first_binding: u32, buffers: &[vk::Buffer], offsets: &[vk::DeviceSize]);
    /// Bind an index buffer
    fn cmd_bind_index_buffer(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType);
    /// Non-indexed draw
    fn cmd_draw(&self, command_buffer: vk::CommandBuffer, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
    /// Indexed draw
    fn cmd_draw_indexed(&self, command_buffer: vk::CommandBuffer, index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32);
    /// Buffer to buffer copy
    fn cmd_copy_buffer(&self, command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]);
    /// Tightly packed buffer to color image copy
    fn cmd_copy_buffer_to_image(&self, command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Image, extent: vk::Extent2D);
    /// Image layout transition barrier
    fn cmd_image_barrier(&self, command_buffer: vk::CommandBuffer, barrier: &ImageBarrier);

    // Descriptors
    /// Create a descriptor set layout
    fn create_descriptor_set_layout(&self, bindings: &[DescriptorBinding]) -> VkResult<vk::DescriptorSetLayout>;
    /// Destroy a descriptor set layout
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    /// Create a descriptor pool
    fn create_descriptor_pool(&self, max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> VkResult<vk::DescriptorPool>;
    /// Destroy a pool and every set allocated from it
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    /// Return every set of a pool to it
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()>;
    /// Allocate one set
    fn allocate_descriptor_set(&self, pool: vk::DescriptorPool, layout: vk::DescriptorSetLayout) -> VkResult<vk::DescriptorSet>;
    /// Apply descriptor writes
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    // Pipelines
    /// Create a shader module from SPIR-V words
    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    /// Destroy a shader module
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    /// Create a pipeline layout
    fn create_pipeline_layout(&self, set_layouts: &[vk::DescriptorSetLayout], push_constant_ranges: &[vk::PushConstantRange]) -> VkResult<vk::PipelineLayout>;
    /// Destroy a pipeline layout
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    /// Create a graphics pipeline
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> VkResult<vk::Pipeline>;
    /// Destroy a pipeline
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    // Render passes and framebuffers
    /// Create a single-subpass render pass
    fn create_render_pass(&self, desc: &RenderPassDesc) -> VkResult<vk::RenderPass>;
    /// Destroy a render pass
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    /// Create a framebuffer
    fn create_framebuffer(&self, render_pass: vk::RenderPass, attachments: &[vk::ImageView], extent: vk::Extent2D) -> VkResult<vk::Framebuffer>;
    /// Destroy a framebuffer
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // Presentation
    /// Current surface capabilities
    fn surface_capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR>;
    /// Supported surface formats
    fn surface_formats(&self) -> VkResult<Vec<vk::SurfaceFormatKHR>>;
    /// Supported present modes
    fn surface_present_modes(&self) -> VkResult<Vec<vk::PresentModeKHR>>;
    /// Create a swapchain on the device's surface
    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR>;
    /// Destroy a swapchain
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// Presentable images of a swapchain
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    /// Acquire the next image; the flag is true when the swapchain is suboptimal
    fn acquire_next_image(&self, swapchain: vk::SwapchainKHR, timeout: u64, semaphore: vk::Semaphore) -> VkResult<(u32, bool)>;
    /// Present one image; `Ok(true)` means suboptimal
    fn queue_present(&self, swapchain: vk::SwapchainKHR, image_index: u32, wait_semaphore: vk::Semaphore) -> VkResult<bool>;
}
