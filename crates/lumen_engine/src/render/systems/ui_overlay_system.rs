//! Debug overlay
//!
//! The overlay is drawn last inside the swapchain render pass. Widget rendering
//! belongs to an [`OverlayBackend`]; the system only owns visibility and feeds
//! the backend the frame statistics.

use std::sync::Arc;

use ash::vk;

use crate::render::context::RenderContext;
use crate::render::error::VulkanResult;
use crate::render::frame::FrameInfo;
use crate::render::stats::{StatsSink, StatsSnapshot};

/// What a backend gets to draw each visible frame
#[derive(Debug, Clone, Copy)]
pub struct OverlayFrame {
    /// Command buffer inside the swapchain render pass
    pub command_buffer: vk::CommandBuffer,
    /// Seconds since the previous frame
    pub frame_time: f32,
    /// Current statistics
    pub stats: StatsSnapshot,
    /// Objects in the scene
    pub object_count: usize,
}

/// Renders overlay widgets
pub trait OverlayBackend {
    /// Draw one frame of the overlay
    fn draw(&mut self, frame: &OverlayFrame) -> VulkanResult<()>;
}

/// Overlay that reports statistics to the log instead of the screen
#[derive(Debug)]
pub struct StatsLogOverlay {
    interval: f32,
    elapsed: f32,
    reports: u64,
}

impl StatsLogOverlay {
    /// Log once every `interval` seconds
    pub fn new(interval: f32) -> Self {
        Self {
            interval,
            elapsed: 0.0,
            reports: 0,
        }
    }

    /// Number of log lines written so far
    pub fn reports(&self) -> u64 {
        self.reports
    }
}

impl Default for StatsLogOverlay {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl OverlayBackend for StatsLogOverlay {
    fn draw(&mut self, frame: &OverlayFrame) -> VulkanResult<()> {
        self.elapsed += frame.frame_time;
        if self.elapsed >= self.interval {
            self.elapsed = 0.0;
            self.reports += 1;
            log::info!(
                "{:.1} fps ({:.2} ms), {} submitted, {} skipped, {} swapchain rebuilds, {} objects",
                frame.stats.fps(),
                frame.stats.smoothed_frame_time * 1000.0,
                frame.stats.frames_submitted,
                frame.stats.frames_skipped,
                frame.stats.swapchain_rebuilds,
                frame.object_count
            );
        }
        Ok(())
    }
}

/// Visibility toggle around an [`OverlayBackend`]
pub struct UiOverlaySystem {
    backend: Box<dyn OverlayBackend>,
    stats: Arc<dyn StatsSink>,
    visible: bool,
}

impl UiOverlaySystem {
    /// Visible overlay reading the context's statistics
    pub fn new(ctx: &RenderContext, backend: Box<dyn OverlayBackend>) -> Self {
        Self {
            backend,
            stats: Arc::clone(&ctx.stats),
            visible: true,
        }
    }

    /// Show or hide
    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Flip visibility, returning the new state
    pub fn toggle(&mut self) -> bool {
        self.visible = !self.visible;
        log::debug!("Overlay {}", if self.visible { "shown" } else { "hidden" });
        self.visible
    }

    /// Whether the overlay is drawn
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Draw through the backend when visible
    pub fn render(&mut self, frame_info: &FrameInfo<'_>) -> VulkanResult<()> {
        if !self.visible {
            return Ok(());
        }
        self.backend.draw(&OverlayFrame {
            command_buffer: frame_info.command_buffer,
            frame_time: frame_info.frame_time,
            stats: self.stats.snapshot(),
            object_count: frame_info.game_objects.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backend::headless::HeadlessDevice;
    use crate::render::camera::Camera;
    use crate::render::game_object::GameObjectMap;
    use std::sync::Mutex;

    struct Recording(Arc<Mutex<Vec<OverlayFrame>>>);

    impl OverlayBackend for Recording {
        fn draw(&mut self, frame: &OverlayFrame) -> VulkanResult<()> {
            self.0.lock().unwrap().push(*frame);
            Ok(())
        }
    }

    fn render(system: &mut UiOverlaySystem, objects: &mut GameObjectMap, frame_time: f32) {
        let camera = Camera::new();
        system
            .render(&FrameInfo {
                frame_index: 0,
                frame_time,
                command_buffer: vk::CommandBuffer::null(),
                camera: &camera,
                global_descriptor_set: vk::DescriptorSet::null(),
                game_objects: objects,
            })
            .unwrap();
    }

    #[test]
    fn test_hidden_overlay_draws_nothing() {
        let ctx = RenderContext::with_defaults(Box::new(HeadlessDevice::new()));
        let frames = Arc::new(Mutex::new(Vec::new()));
        let mut system = UiOverlaySystem::new(&ctx, Box::new(Recording(Arc::clone(&frames))));
        let mut objects = GameObjectMap::new();
        objects.create();
        ctx.stats.record_submitted();

        render(&mut system, &mut objects, 0.016);
        assert!(!system.toggle());
        render(&mut system, &mut objects, 0.016);

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].object_count, 1);
        assert_eq!(frames[0].stats.frames_submitted, 1);
    }

    #[test]
    fn test_stats_log_overlay_reports_per_interval() {
        let ctx = RenderContext::with_defaults(Box::new(HeadlessDevice::new()));
        let mut overlay = StatsLogOverlay::new(0.5);
        let frame = OverlayFrame {
            command_buffer: vk::CommandBuffer::null(),
            frame_time: 0.2,
            stats: ctx.stats.snapshot(),
            object_count: 0,
        };
        for _ in 0..5 {
            overlay.draw(&frame).unwrap();
        }
        // 0.2 + 0.2 + 0.2 crosses once, then 0.2 + 0.2 does not
        assert_eq!(overlay.reports(), 1);
    }
}
