//! Frame sequencing on top of a [`SwapChain`]
//!
//! ```text
//! Idle --begin_frame--> Recording --end_frame--> Idle
//! ```
//!
//! `begin_frame` hands out the command buffer of the current frame slot, or
//! `None` when the swapchain turned out to be stale and was rebuilt; the
//! caller skips that iteration. `end_frame` submits and presents, and rebuilds
//! the swapchain when presentation reports it out of date or suboptimal, or
//! when the window was resized. Neither case surfaces as an error.

use std::sync::Arc;

use ash::vk;

use super::backend::RenderPassBegin;
use super::context::RenderContext;
use super::error::{VulkanError, VulkanResult};
use super::swapchain::{AcquireOutcome, SwapChain, MAX_FRAMES_IN_FLIGHT};
use super::window::Window;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Idle,
    Recording,
}

/// Owns the swapchain and the per-slot command buffers
pub struct Renderer {
    ctx: RenderContext,
    swap_chain: Option<SwapChain>,
    command_buffers: Vec<vk::CommandBuffer>,
    current_image_index: u32,
    current_frame_index: usize,
    state: FrameState,
    clear_color: [f32; 4],
}

impl Renderer {
    /// Build the first swapchain and one command buffer per frame slot
    pub fn new(ctx: RenderContext, window: &mut dyn Window) -> VulkanResult<Self> {
        let mut renderer = Self {
            ctx,
            swap_chain: None,
            command_buffers: Vec::new(),
            current_image_index: 0,
            current_frame_index: 0,
            state: FrameState::Idle,
            clear_color: [0.01, 0.01, 0.01, 1.0],
        };
        renderer.recreate_swap_chain(window)?;
        renderer.command_buffers = renderer
            .ctx
            .device
            .allocate_command_buffers(MAX_FRAMES_IN_FLIGHT as u32)?;
        Ok(renderer)
    }

    /// Shared context
    pub fn context(&self) -> &RenderContext {
        &self.ctx
    }

    /// Current swapchain
    pub fn swap_chain(&self) -> Option<&SwapChain> {
        self.swap_chain.as_ref()
    }

    /// Render pass pipelines must be compatible with
    pub fn swap_chain_render_pass(&self) -> vk::RenderPass {
        self.swap_chain
            .as_ref()
            .map_or(vk::RenderPass::null(), SwapChain::render_pass)
    }

    /// Width over height of the swapchain images
    pub fn aspect_ratio(&self) -> f32 {
        self.swap_chain
            .as_ref()
            .map_or(1.0, SwapChain::extent_aspect_ratio)
    }

    /// Whether a frame is being recorded
    pub fn is_frame_in_progress(&self) -> bool {
        self.state == FrameState::Recording
    }

    /// Frame slot of the frame being recorded, or of the next one
    pub fn frame_index(&self) -> usize {
        self.current_frame_index
    }

    /// Command buffer being recorded, if any
    pub fn current_command_buffer(&self) -> Option<vk::CommandBuffer> {
        self.is_frame_in_progress()
            .then(|| self.command_buffers[self.current_frame_index])
    }

    /// Clear color of the swapchain render pass
    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    /// Acquire an image and start recording
    ///
    /// Returns `Ok(None)` when the swapchain had to be rebuilt; skip the frame.
    pub fn begin_frame(&mut self, window: &mut dyn Window) -> VulkanResult<Option<vk::CommandBuffer>> {
        if self.state == FrameState::Recording {
            return Err(VulkanError::invalid("begin_frame called while a frame is in progress"));
        }
        if self.swap_chain.is_none() {
            self.recreate_swap_chain(window)?;
        }

        let outcome = match &self.swap_chain {
            Some(chain) => chain.acquire_next_image()?,
            None => return Err(VulkanError::invalid("no swapchain")),
        };
        let image_index = match outcome {
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on acquire, rebuilding");
                self.ctx.stats.record_skipped();
                self.recreate_swap_chain(window)?;
                return Ok(None);
            }
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    log::debug!("Acquired image {image_index} from a suboptimal swapchain");
                }
                image_index
            }
        };

        let command_buffer = self.command_buffers[self.current_frame_index];
        self.ctx
            .device
            .raw()
            .begin_command_buffer(command_buffer, false)?;
        self.current_image_index = image_index;
        self.state = FrameState::Recording;
        Ok(Some(command_buffer))
    }

    /// Finish recording, submit and present
    pub fn end_frame(&mut self, window: &mut dyn Window) -> VulkanResult<()> {
        if self.state != FrameState::Recording {
            return Err(VulkanError::invalid("end_frame called without begin_frame"));
        }
        self.state = FrameState::Idle;

        let command_buffer = self.command_buffers[self.current_frame_index];
        self.ctx.device.raw().end_command_buffer(command_buffer)?;

        let submitted = match self.swap_chain.as_mut() {
            Some(chain) => chain.submit_command_buffers(&[command_buffer], self.current_image_index),
            None => Err(VulkanError::invalid("swapchain vanished mid-frame")),
        };
        self.current_frame_index = (self.current_frame_index + 1) % MAX_FRAMES_IN_FLIGHT;
        let outcome = submitted?;
        self.ctx.stats.record_submitted();

        if outcome.needs_rebuild() || window.was_resized() {
            log::debug!(
                "Rebuilding swapchain after present ({:?}, resized: {})",
                outcome,
                window.was_resized()
            );
            window.reset_resized_flag();
            self.recreate_swap_chain(window)?;
        }
        Ok(())
    }

    /// Begin the swapchain render pass and set viewport and scissor to its extent
    pub fn begin_swap_chain_render_pass(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        let chain = self.recording_chain(command_buffer)?;
        let framebuffer = chain
            .framebuffer(self.current_image_index as usize)
            .ok_or_else(|| VulkanError::invalid("acquired image has no framebuffer"))?;
        let extent = chain.extent();
        let raw = self.ctx.device.raw();

        raw.cmd_begin_render_pass(
            command_buffer,
            &RenderPassBegin {
                render_pass: chain.render_pass(),
                framebuffer,
                extent,
                clear_color: self.clear_color,
                clear_depth: 1.0,
                clear_stencil: 0,
            },
        );
        raw.cmd_set_viewport(
            command_buffer,
            vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        );
        raw.cmd_set_scissor(
            command_buffer,
            vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
        );
        Ok(())
    }

    /// End the swapchain render pass
    pub fn end_swap_chain_render_pass(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        self.recording_chain(command_buffer)?;
        self.ctx.device.raw().cmd_end_render_pass(command_buffer);
        Ok(())
    }

    fn recording_chain(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<&SwapChain> {
        if self.state != FrameState::Recording {
            return Err(VulkanError::invalid("render pass outside of a frame"));
        }
        if command_buffer != self.command_buffers[self.current_frame_index] {
            return Err(VulkanError::invalid("command buffer does not belong to the current frame"));
        }
        self.swap_chain
            .as_ref()
            .ok_or_else(|| VulkanError::invalid("no swapchain"))
    }

    fn recreate_swap_chain(&mut self, window: &mut dyn Window) -> VulkanResult<()> {
        let mut extent = window.extent();
        while extent.width == 0 || extent.height == 0 {
            window.wait_events();
            extent = window.extent();
        }
        self.ctx.device.wait_idle()?;

        let Some(old) = self.swap_chain.take() else {
            self.swap_chain = Some(SwapChain::new(&self.ctx, extent)?);
            return Ok(());
        };

        let old = Arc::new(old);
        let new = SwapChain::with_previous(&self.ctx, extent, Arc::clone(&old))?;
        let compatible = old.compare_swap_formats(&new);
        drop(old);
        self.swap_chain = Some(new);
        self.ctx.stats.record_swapchain_rebuild();

        if !compatible {
            log::error!("Swapchain color or depth format changed during rebuild");
            return Err(VulkanError::SwapchainFormatChanged);
        }
        log::debug!("Swapchain rebuilt at {}x{}", extent.width, extent.height);
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.device.wait_idle() {
            log::error!("wait_idle failed while dropping renderer: {e}");
        }
        self.ctx.device.free_command_buffers(&self.command_buffers);
        self.swap_chain = None;
    }
}
