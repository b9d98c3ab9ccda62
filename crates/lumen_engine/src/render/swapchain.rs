//! Presentable image chain and its synchronization
//!
//! A [`SwapChain`] owns everything tied to one surface configuration: the
//! images and their views, one depth attachment per image, the render pass,
//! one framebuffer per image and the semaphores and fences that pace frames.
//!
//! # Synchronization layout
//!
//! Two indices are in play every frame and they must not be confused:
//!
//! - the **frame slot** (`current_frame`, cycling through
//!   [`MAX_FRAMES_IN_FLIGHT`]) picks `image_available` and `in_flight`, because
//!   the acquire call needs a semaphore before it knows which image it returns
//! - the **image index** returned by acquisition picks `render_finished` and
//!   `images_in_flight`, because presentation of image `i` must wait for the
//!   most recent rendering into image `i`
//!
//! `images_in_flight[i]` remembers which slot fence last rendered into image
//! `i`; submitting to an image still in use by an older frame waits on it
//! first.
//!
//! The chain never rebuilds itself. Out-of-date and suboptimal results come
//! back as [`AcquireOutcome`] and [`PresentOutcome`] values and the
//! [`Renderer`](super::Renderer) decides what to do with them.

use std::sync::Arc;

use ash::vk;

use super::arena::{SwapchainKey, SwapchainRecord};
use super::backend::{ImageDesc, RenderPassDesc, SubmitDesc, SwapchainDesc};
use super::context::RenderContext;
use super::device::Device;
use super::error::{VulkanError, VulkanResult};
use crate::settings::keys;

/// Frames the CPU may record ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Result of [`SwapChain::acquire_next_image`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image is ready to be rendered into
    Acquired {
        /// Index of the acquired image
        image_index: u32,
        /// The chain still works but no longer matches the surface exactly
        suboptimal: bool,
    },
    /// The chain no longer matches the surface and must be rebuilt
    OutOfDate,
}

/// Result of [`SwapChain::submit_command_buffers`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented normally
    Presented,
    /// Presented, but the chain should be rebuilt
    Suboptimal,
    /// Not presented, the chain must be rebuilt
    OutOfDate,
}

impl PresentOutcome {
    /// Whether the chain should be rebuilt
    pub fn needs_rebuild(self) -> bool {
        !matches!(self, PresentOutcome::Presented)
    }
}

/// Preferred 8-bit BGRA sRGB format, else whatever the surface lists first
pub fn choose_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
}

/// Present mode from the vsync and preference settings
///
/// Vsync always yields FIFO. Otherwise the preferred mode wins when the
/// surface supports it, then MAILBOX, then IMMEDIATE; FIFO is the fallback
/// every surface supports.
pub fn choose_present_mode(available: &[vk::PresentModeKHR], vsync: bool, preferred: Option<vk::PresentModeKHR>) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    preferred
        .into_iter()
        .chain([vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE])
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Surface extent, or the window extent clamped to the surface limits
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, window_extent: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: window_extent.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: window_extent.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, bounded by the maximum when there is one
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Presentable images plus per-image and per-slot sync objects
pub struct SwapChain {
    device: Arc<Device>,
    key: SwapchainKey,
    swapchain: vk::SwapchainKHR,
    image_format: vk::Format,
    depth_format: vk::Format,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    image_available: Vec<vk::Semaphore>,
    render_finished: Vec<vk::Semaphore>,
    in_flight_fences: Vec<vk::Fence>,
    images_in_flight: Vec<vk::Fence>,
    current_frame: usize,
}

/// Handles created so far; registered and released as a unit on failure
struct Building {
    record: SwapchainRecord,
    depth_views: Vec<vk::ImageView>,
}

impl SwapChain {
    /// Build a chain for a window of `window_extent`
    pub fn new(ctx: &RenderContext, window_extent: vk::Extent2D) -> VulkanResult<Self> {
        Self::build(ctx, window_extent, None)
    }

    /// Build a replacement chain
    ///
    /// `previous` is only used to pass its handle as the retired swapchain and
    /// to continue its frame counter; the reference is dropped before
    /// returning.
    pub fn with_previous(ctx: &RenderContext, window_extent: vk::Extent2D, previous: Arc<SwapChain>) -> VulkanResult<Self> {
        Self::build(ctx, window_extent, Some(previous))
    }

    fn build(ctx: &RenderContext, window_extent: vk::Extent2D, previous: Option<Arc<SwapChain>>) -> VulkanResult<Self> {
        if window_extent.width == 0 || window_extent.height == 0 {
            return Err(VulkanError::invalid("cannot build a swapchain for a zero-sized window"));
        }

        let device = Arc::clone(&ctx.device);
        let raw = device.raw();

        let capabilities = raw.surface_capabilities()?;
        let formats = raw.surface_formats()?;
        let present_modes = raw.surface_present_modes()?;

        let surface_format = choose_surface_format(&formats).ok_or(VulkanError::NoSupportedFormat)?;
        let vsync = ctx.settings.get_bool(keys::VSYNC).unwrap_or(false);
        let preferred = ctx
            .settings
            .get_u32(keys::PREFERRED_PRESENT_MODE)
            .map(|raw_mode| vk::PresentModeKHR::from_raw(raw_mode as i32));
        let present_mode = choose_present_mode(&present_modes, vsync, preferred);
        let extent = choose_extent(&capabilities, window_extent);
        let image_count = choose_image_count(&capabilities);
        let depth_format = device.find_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;

        let old_swapchain = previous
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), |p| p.swapchain);
        let current_frame = previous.as_ref().map_or(0, |p| p.current_frame);

        let mut building = Building {
            record: SwapchainRecord::default(),
            depth_views: Vec::new(),
        };
        let result = Self::create_resources(
            &device,
            &mut building,
            SwapchainDesc {
                min_image_count: image_count,
                surface_format,
                extent,
                present_mode,
                pre_transform: capabilities.current_transform,
                old_swapchain,
            },
            depth_format,
        );
        // The predecessor is not needed past creation.
        drop(previous);

        let record = &building.record;
        let swapchain = record.swapchain;
        let render_pass = record.render_pass;
        let framebuffers = record.framebuffers.clone();
        let semaphores = record.semaphores.clone();
        let fences = record.fences.clone();

        let key = device.register_swapchain(building.record);
        if let Err(e) = result {
            log::error!("Swapchain creation failed: {e}");
            device.destroy_swapchain(key);
            return Err(e);
        }

        let images = framebuffers.len();
        log::info!(
            "Created swapchain: {} images, {}x{}, {:?}, {:?}, depth {:?}",
            images,
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            depth_format
        );

        Ok(Self {
            device,
            key,
            swapchain,
            image_format: surface_format.format,
            depth_format,
            present_mode,
            extent,
            render_pass,
            framebuffers,
            image_available: semaphores[..MAX_FRAMES_IN_FLIGHT].to_vec(),
            render_finished: semaphores[MAX_FRAMES_IN_FLIGHT..].to_vec(),
            in_flight_fences: fences,
            images_in_flight: vec![vk::Fence::null(); images],
            current_frame,
        })
    }

    fn create_resources(device: &Device, building: &mut Building, desc: SwapchainDesc, depth_format: vk::Format) -> VulkanResult<()> {
        let raw = device.raw();
        let record = &mut building.record;

        record.swapchain = raw.create_swapchain(&desc)?;
        let images = raw.swapchain_images(record.swapchain)?;

        for image in &images {
            let view = raw.create_image_view(*image, desc.surface_format.format, vk::ImageAspectFlags::COLOR)?;
            record.image_views.push(view);
        }

        for _ in &images {
            let depth = device.create_image(
                &ImageDesc {
                    extent: desc.extent,
                    format: depth_format,
                    tiling: vk::ImageTiling::OPTIMAL,
                    usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                },
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::ImageAspectFlags::DEPTH,
            )?;
            record.depth_images.push(depth.key);
            building.depth_views.push(depth.view);
        }

        record.render_pass = raw.create_render_pass(&render_pass_desc(desc.surface_format.format, depth_format))?;

        for (color, depth) in record.image_views.iter().zip(&building.depth_views) {
            let framebuffer = raw.create_framebuffer(record.render_pass, &[*color, *depth], desc.extent)?;
            record.framebuffers.push(framebuffer);
        }

        // image_available per slot first, then render_finished per image
        for _ in 0..MAX_FRAMES_IN_FLIGHT + images.len() {
            record.semaphores.push(raw.create_semaphore()?);
        }
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            record.fences.push(raw.create_fence(true)?);
        }
        Ok(())
    }

    /// Wait for the current slot's fence, then acquire the next image
    ///
    /// Blocks without a timeout until the GPU has finished the frame that last
    /// used this slot.
    pub fn acquire_next_image(&self) -> VulkanResult<AcquireOutcome> {
        let raw = self.device.raw();
        raw.wait_for_fence(self.in_flight_fences[self.current_frame], u64::MAX)?;

        match raw.acquire_next_image(
            self.swapchain,
            u64::MAX,
            self.image_available[self.current_frame],
        ) {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Submit recorded work for `image_index` and present it
    ///
    /// The frame slot advances on every path past the index check, including
    /// failed waits, submits and presents; the error is returned afterwards.
    pub fn submit_command_buffers(&mut self, command_buffers: &[vk::CommandBuffer], image_index: u32) -> VulkanResult<PresentOutcome> {
        let image = image_index as usize;
        if image >= self.images_in_flight.len() {
            return Err(VulkanError::invalid(format!(
                "image index {image_index} out of range for {} images",
                self.images_in_flight.len()
            )));
        }
        let result = self.submit_and_present(command_buffers, image_index);
        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;
        result
    }

    fn submit_and_present(&mut self, command_buffers: &[vk::CommandBuffer], image_index: u32) -> VulkanResult<PresentOutcome> {
        let image = image_index as usize;
        let raw = self.device.raw();

        if self.images_in_flight[image] != vk::Fence::null() {
            raw.wait_for_fence(self.images_in_flight[image], u64::MAX)?;
        }
        let fence = self.in_flight_fences[self.current_frame];
        let image_available = self.image_available[self.current_frame];

        raw.reset_fence(fence)?;
        let submitted = raw.queue_submit(
            &SubmitDesc {
                wait_semaphores: &[image_available],
                wait_stages: &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                command_buffers,
                signal_semaphores: &[self.render_finished[image]],
            },
            fence,
        );
        if let Err(e) = submitted {
            // The slot fence is reset; an empty batch signals it again and
            // consumes the acquire semaphore so the slot stays usable.
            let rearm = raw.queue_submit(
                &SubmitDesc {
                    wait_semaphores: &[image_available],
                    wait_stages: &[vk::PipelineStageFlags::ALL_COMMANDS],
                    ..SubmitDesc::default()
                },
                fence,
            );
            if let Err(rearm_error) = rearm {
                log::error!("Could not re-arm frame fence after failed submit: {rearm_error}");
            }
            return Err(e.into());
        }
        self.images_in_flight[image] = fence;

        match raw.queue_present(self.swapchain, image_index, self.render_finished[image]) {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether both chains render to the same color and depth formats
    pub fn compare_swap_formats(&self, other: &SwapChain) -> bool {
        self.image_format == other.image_format && self.depth_format == other.depth_format
    }

    /// Framebuffer of image `index`
    pub fn framebuffer(&self, index: usize) -> Option<vk::Framebuffer> {
        self.framebuffers.get(index).copied()
    }

    /// Render pass shared by all framebuffers
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Number of presentable images
    pub fn image_count(&self) -> usize {
        self.framebuffers.len()
    }

    /// Image size
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Width over height
    pub fn extent_aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height as f32
    }

    /// Color format
    pub fn image_format(&self) -> vk::Format {
        self.image_format
    }

    /// Depth attachment format
    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    /// Present mode in use
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Frame slot the next acquisition uses
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Raw swapchain handle
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }
}

impl Drop for SwapChain {
    fn drop(&mut self) {
        log::debug!("Destroying swapchain {:?}", self.swapchain);
        self.device.destroy_swapchain(self.key);
    }
}

fn render_pass_desc(color_format: vk::Format, depth_format: vk::Format) -> RenderPassDesc {
    let color = vk::AttachmentDescription {
        format: color_format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let depth = vk::AttachmentDescription {
        format: depth_format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::DONT_CARE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ..Default::default()
    };
    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;

    RenderPassDesc {
        attachments: vec![color, depth],
        color_attachments: vec![vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }],
        depth_attachment: Some(vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }),
        dependencies: vec![vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: stages,
            src_access_mask: vk::AccessFlags::empty(),
            dst_stage_mask: stages,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ..Default::default()
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backend::headless::{HeadlessDevice, HeadlessEvent, ObjectKind};
    use crate::render::backend::GpuDevice;
    use crate::settings::SettingValue;

    fn context() -> (RenderContext, HeadlessDevice) {
        let headless = HeadlessDevice::new();
        (RenderContext::with_defaults(Box::new(headless.clone())), headless)
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn capabilities(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: extent(u32::MAX, u32::MAX),
            min_image_extent: extent(64, 64),
            max_image_extent: extent(2048, 2048),
            ..Default::default()
        }
    }

    /// Record one empty frame into a fresh command buffer and submit it
    fn run_frame(device: &HeadlessDevice, chain: &mut SwapChain) -> (u32, PresentOutcome) {
        let AcquireOutcome::Acquired { image_index, .. } = chain.acquire_next_image().unwrap() else {
            panic!("expected an image");
        };
        let cb = device.allocate_command_buffers(1).unwrap()[0];
        device.begin_command_buffer(cb, false).unwrap();
        device.end_command_buffer(cb).unwrap();
        let outcome = chain.submit_command_buffers(&[cb], image_index).unwrap();
        (image_index, outcome)
    }

    #[test]
    fn test_surface_format_prefers_bgra_srgb() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[unorm, srgb]).unwrap().format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(choose_surface_format(&[unorm]).unwrap().format, vk::Format::B8G8R8A8_UNORM);
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn test_present_mode_selection() {
        use vk::PresentModeKHR as Mode;
        let all = [Mode::FIFO, Mode::MAILBOX, Mode::IMMEDIATE];

        assert_eq!(choose_present_mode(&all, true, Some(Mode::IMMEDIATE)), Mode::FIFO);
        assert_eq!(choose_present_mode(&all, false, Some(Mode::IMMEDIATE)), Mode::IMMEDIATE);
        assert_eq!(choose_present_mode(&all, false, None), Mode::MAILBOX);
        assert_eq!(choose_present_mode(&[Mode::FIFO, Mode::IMMEDIATE], false, Some(Mode::MAILBOX)), Mode::IMMEDIATE);
        assert_eq!(choose_present_mode(&[Mode::FIFO], false, Some(Mode::MAILBOX)), Mode::FIFO);
    }

    #[test]
    fn test_extent_and_image_count() {
        let caps = capabilities(2, 3);
        assert_eq!(choose_extent(&caps, extent(800, 600)), extent(800, 600));
        assert_eq!(choose_extent(&caps, extent(10, 9000)), extent(64, 2048));

        let fixed = vk::SurfaceCapabilitiesKHR {
            current_extent: extent(1280, 720),
            ..caps
        };
        assert_eq!(choose_extent(&fixed, extent(800, 600)), extent(1280, 720));

        assert_eq!(choose_image_count(&capabilities(2, 3)), 3);
        assert_eq!(choose_image_count(&capabilities(3, 3)), 3);
        assert_eq!(choose_image_count(&capabilities(2, 0)), 3);
    }

    #[test]
    fn test_new_builds_per_image_resources() {
        let (ctx, headless) = context();
        let chain = SwapChain::new(&ctx, extent(800, 600)).unwrap();

        assert_eq!(chain.image_count(), 3);
        assert_eq!(chain.extent(), extent(800, 600));
        assert_eq!(chain.image_format(), vk::Format::B8G8R8A8_SRGB);
        assert_eq!(chain.depth_format(), vk::Format::D32_SFLOAT);
        assert_eq!(chain.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(headless.live_count(ObjectKind::Framebuffer), 3);
        assert_eq!(headless.live_count(ObjectKind::RenderPass), 1);
        assert_eq!(headless.live_count(ObjectKind::Fence), MAX_FRAMES_IN_FLIGHT);
        assert_eq!(headless.live_count(ObjectKind::Semaphore), MAX_FRAMES_IN_FLIGHT + 3);
        assert_eq!(ctx.device.arena_stats().images, 3);
        assert!(headless.validation_errors().is_empty());
    }

    #[test]
    fn test_vsync_forces_fifo() {
        let (ctx, headless) = context();
        ctx.settings.set(keys::VSYNC, SettingValue::Bool(true));
        let chain = SwapChain::new(&ctx, extent(640, 480)).unwrap();
        assert_eq!(chain.present_mode(), vk::PresentModeKHR::FIFO);
        assert!(headless.events().iter().any(|e| matches!(
            e,
            HeadlessEvent::CreateSwapchain { present_mode: vk::PresentModeKHR::FIFO, .. }
        )));
    }

    #[test]
    fn test_zero_extent_is_rejected() {
        let (ctx, headless) = context();
        assert!(SwapChain::new(&ctx, extent(0, 600)).is_err());
        assert_eq!(headless.live_count(ObjectKind::Swapchain), 0);
    }

    #[test]
    fn test_frames_alternate_slots_without_validation_errors() {
        let (ctx, headless) = context();
        let mut chain = SwapChain::new(&ctx, extent(800, 600)).unwrap();

        for n in 1..=7 {
            let (_, outcome) = run_frame(&headless, &mut chain);
            assert_eq!(outcome, PresentOutcome::Presented);
            assert_eq!(chain.current_frame(), n % MAX_FRAMES_IN_FLIGHT);
        }
        assert!(headless.validation_errors().is_empty(), "{:?}", headless.validation_errors());
    }

    #[test]
    fn test_reused_image_waits_for_its_previous_frame() {
        let (ctx, headless) = context();
        let mut chain = SwapChain::new(&ctx, extent(800, 600)).unwrap();
        headless.queue_acquire_images(&[0, 0]);

        run_frame(&headless, &mut chain);
        let first_fence = chain.in_flight_fences[0];
        headless.clear_events();

        // Slot 1 renders into image 0 again while slot 0's work is pending.
        run_frame(&headless, &mut chain);
        assert!(headless.events().contains(&HeadlessEvent::WaitFence {
            fence: first_fence,
            blocked: true
        }));
        assert!(headless.validation_errors().is_empty());
    }

    #[test]
    fn test_semaphore_indexing() {
        let (ctx, headless) = context();
        let mut chain = SwapChain::new(&ctx, extent(800, 600)).unwrap();
        headless.queue_acquire_images(&[2]);

        let (image, _) = run_frame(&headless, &mut chain);
        assert_eq!(image, 2);
        let submit = headless
            .events()
            .into_iter()
            .find_map(|e| match e {
                HeadlessEvent::Submit {
                    wait_semaphores,
                    signal_semaphores,
                    ..
                } => Some((wait_semaphores, signal_semaphores)),
                _ => None,
            })
            .unwrap();
        assert_eq!(submit.0, vec![chain.image_available[0]]);
        assert_eq!(submit.1, vec![chain.render_finished[2]]);
    }

    #[test]
    fn test_out_of_date_is_an_outcome() {
        let (ctx, headless) = context();
        let mut chain = SwapChain::new(&ctx, extent(800, 600)).unwrap();

        headless.push_acquire_result(vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert_eq!(chain.acquire_next_image().unwrap(), AcquireOutcome::OutOfDate);

        headless.push_present_result(vk::Result::ERROR_OUT_OF_DATE_KHR);
        let (_, outcome) = run_frame(&headless, &mut chain);
        assert_eq!(outcome, PresentOutcome::OutOfDate);
        assert_eq!(chain.current_frame(), 1);

        headless.push_present_result(vk::Result::SUBOPTIMAL_KHR);
        assert_eq!(run_frame(&headless, &mut chain).1, PresentOutcome::Suboptimal);
    }

    #[test]
    fn test_present_failure_still_advances_slot() {
        let (ctx, headless) = context();
        let mut chain = SwapChain::new(&ctx, extent(800, 600)).unwrap();
        let AcquireOutcome::Acquired { image_index, .. } = chain.acquire_next_image().unwrap() else {
            panic!("expected an image");
        };
        let cb = headless.allocate_command_buffers(1).unwrap()[0];
        headless.begin_command_buffer(cb, false).unwrap();
        headless.end_command_buffer(cb).unwrap();

        headless.push_present_result(vk::Result::ERROR_DEVICE_LOST);
        assert!(chain.submit_command_buffers(&[cb], image_index).is_err());
        assert_eq!(chain.current_frame(), 1);
    }

    #[test]
    fn test_failed_submit_advances_slot_and_rearms_its_fence() {
        let (ctx, headless) = context();
        let mut chain = SwapChain::new(&ctx, extent(800, 600)).unwrap();
        let AcquireOutcome::Acquired { image_index, .. } = chain.acquire_next_image().unwrap() else {
            panic!("expected an image");
        };
        let cb = headless.allocate_command_buffers(1).unwrap()[0];
        headless.begin_command_buffer(cb, false).unwrap();
        headless.end_command_buffer(cb).unwrap();

        headless.push_submit_result(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(matches!(
            chain.submit_command_buffers(&[cb], image_index),
            Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
        ));
        assert_eq!(chain.current_frame(), 1);
        assert!(!headless
            .events()
            .iter()
            .any(|e| matches!(e, HeadlessEvent::Present { .. })));

        // Slot 1, then slot 0 again: its fence must complete instead of hanging.
        run_frame(&headless, &mut chain);
        let (_, outcome) = run_frame(&headless, &mut chain);
        assert_eq!(outcome, PresentOutcome::Presented);
        assert_eq!(chain.current_frame(), 1);
        assert!(headless.validation_errors().is_empty(), "{:?}", headless.validation_errors());
    }

    #[test]
    fn test_recreate_keeps_formats_and_frame_counter() {
        let (ctx, headless) = context();
        let mut old = SwapChain::new(&ctx, extent(800, 600)).unwrap();
        run_frame(&headless, &mut old);
        let old_handle = old.handle();
        ctx.device.wait_idle().unwrap();

        let old = Arc::new(old);
        let new = SwapChain::with_previous(&ctx, extent(1024, 768), Arc::clone(&old)).unwrap();
        assert!(old.compare_swap_formats(&new));
        assert_eq!(new.current_frame(), 1);
        assert_eq!(Arc::strong_count(&old), 1);
        assert!(headless.events().iter().any(|e| matches!(
            e,
            HeadlessEvent::CreateSwapchain { old_swapchain, width: 1024, .. } if *old_swapchain == old_handle
        )));

        drop(old);
        assert_eq!(headless.live_count(ObjectKind::Swapchain), 1);
    }

    #[test]
    fn test_depth_format_change_is_detected() {
        let (ctx, headless) = context();
        let old = Arc::new(SwapChain::new(&ctx, extent(800, 600)).unwrap());
        headless.set_depth_formats(vec![vk::Format::D24_UNORM_S8_UINT]);

        let new = SwapChain::with_previous(&ctx, extent(800, 600), Arc::clone(&old)).unwrap();
        assert_eq!(new.depth_format(), vk::Format::D24_UNORM_S8_UINT);
        assert!(!old.compare_swap_formats(&new));
    }

    #[test]
    fn test_drop_releases_everything() {
        let (ctx, headless) = context();
        let chain = SwapChain::new(&ctx, extent(800, 600)).unwrap();
        drop(chain);

        for kind in [
            ObjectKind::Swapchain,
            ObjectKind::Framebuffer,
            ObjectKind::RenderPass,
            ObjectKind::ImageView,
            ObjectKind::Image,
            ObjectKind::Memory,
            ObjectKind::Semaphore,
            ObjectKind::Fence,
        ] {
            assert_eq!(headless.live_count(kind), 0, "{kind:?} leaked");
        }
        assert_eq!(ctx.device.arena_stats(), Default::default());
    }
}
