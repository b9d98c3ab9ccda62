//! Window collaborator
//!
//! The renderer only needs a handful of things from the platform window: its
//! framebuffer extent, a resize flag it can clear, a way to block on events
//! while minimized and a surface for a given instance. [`GlfwWindow`] provides
//! them over GLFW (behind the `glfw` feature), [`HeadlessWindow`] scripts them
//! for tests.

use std::collections::VecDeque;

use ash::vk::{self, Handle};

use super::error::{VulkanError, VulkanResult};

/// What the renderer asks of the platform window
pub trait Window {
    /// Current framebuffer size in pixels
    fn extent(&self) -> vk::Extent2D;

    /// Whether the framebuffer changed size since the flag was last cleared
    fn was_resized(&self) -> bool;

    /// Clear the resize flag
    fn reset_resized_flag(&mut self);

    /// Block until at least one platform event arrives
    fn wait_events(&mut self);

    /// Instance extensions needed to present to this window
    fn required_instance_extensions(&self) -> VulkanResult<Vec<String>>;

    /// Create a presentation surface for `instance`
    fn create_surface(&mut self, instance: vk::Instance) -> VulkanResult<vk::SurfaceKHR>;
}

/// Scriptable window for tests and offscreen runs
#[derive(Debug, Clone)]
pub struct HeadlessWindow {
    extent: vk::Extent2D,
    resized: bool,
    pending_extents: VecDeque<vk::Extent2D>,
    wait_count: usize,
}

impl HeadlessWindow {
    /// Window of the given size
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            resized: false,
            pending_extents: VecDeque::new(),
            wait_count: 0,
        }
    }

    /// Change size now and raise the resize flag
    pub fn resize(&mut self, width: u32, height: u32) {
        self.extent = vk::Extent2D { width, height };
        self.resized = true;
    }

    /// Sizes applied one per `wait_events` call, e.g. to restore a minimized window
    pub fn queue_extent(&mut self, width: u32, height: u32) {
        self.pending_extents.push_back(vk::Extent2D { width, height });
    }

    /// Number of `wait_events` calls so far
    pub fn wait_count(&self) -> usize {
        self.wait_count
    }
}

impl Window for HeadlessWindow {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn was_resized(&self) -> bool {
        self.resized
    }

    fn reset_resized_flag(&mut self) {
        self.resized = false;
    }

    fn wait_events(&mut self) {
        self.wait_count += 1;
        if let Some(extent) = self.pending_extents.pop_front() {
            self.extent = extent;
            self.resized = true;
        }
    }

    fn required_instance_extensions(&self) -> VulkanResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn create_surface(&mut self, _instance: vk::Instance) -> VulkanResult<vk::SurfaceKHR> {
        Ok(vk::SurfaceKHR::from_raw(1))
    }
}

#[cfg(feature = "glfw")]
pub use self::glfw_window::GlfwWindow;

#[cfg(feature = "glfw")]
mod glfw_window {
    use super::*;

    /// GLFW window configured for Vulkan (no client API)
    pub struct GlfwWindow {
        glfw: glfw::Glfw,
        window: glfw::PWindow,
        events: glfw::GlfwReceiver<(f64, glfw::WindowEvent)>,
        resized: bool,
    }

    impl GlfwWindow {
        /// Open a resizable window
        pub fn new(title: &str, width: u32, height: u32) -> VulkanResult<Self> {
            let mut glfw = glfw::init(glfw::fail_on_errors)
                .map_err(|e| VulkanError::Window(format!("GLFW initialization failed: {e:?}")))?;
            glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::NoApi));
            glfw.window_hint(glfw::WindowHint::Resizable(true));

            let (mut window, events) = glfw
                .create_window(width, height, title, glfw::WindowMode::Windowed)
                .ok_or_else(|| VulkanError::Window("window creation failed".to_string()))?;
            window.set_key_polling(true);
            window.set_close_polling(true);
            window.set_framebuffer_size_polling(true);

            log::info!("Opened window '{}' ({}x{})", title, width, height);
            Ok(Self {
                glfw,
                window,
                events,
                resized: false,
            })
        }

        /// Whether the user asked to close the window
        pub fn should_close(&self) -> bool {
            self.window.should_close()
        }

        /// Request the window to close
        pub fn set_should_close(&mut self, should_close: bool) {
            self.window.set_should_close(should_close);
        }

        /// Poll pending events, track resizes and hand the rest back
        pub fn poll_events(&mut self) -> Vec<glfw::WindowEvent> {
            self.glfw.poll_events();
            self.drain_events()
        }

        fn drain_events(&mut self) -> Vec<glfw::WindowEvent> {
            let mut out = Vec::new();
            for (_, event) in glfw::flush_messages(&self.events) {
                if let glfw::WindowEvent::FramebufferSize(..) = event {
                    self.resized = true;
                }
                out.push(event);
            }
            out
        }
    }

    impl Window for GlfwWindow {
        fn extent(&self) -> vk::Extent2D {
            let (width, height) = self.window.get_framebuffer_size();
            vk::Extent2D {
                width: width.max(0) as u32,
                height: height.max(0) as u32,
            }
        }

        fn was_resized(&self) -> bool {
            self.resized
        }

        fn reset_resized_flag(&mut self) {
            self.resized = false;
        }

        fn wait_events(&mut self) {
            self.glfw.wait_events();
            self.drain_events();
        }

        fn required_instance_extensions(&self) -> VulkanResult<Vec<String>> {
            self.glfw
                .get_required_instance_extensions()
                .ok_or_else(|| VulkanError::Window("Vulkan is not supported by GLFW".to_string()))
        }

        fn create_surface(&mut self, instance: vk::Instance) -> VulkanResult<vk::SurfaceKHR> {
            let mut surface = vk::SurfaceKHR::null();
            let result = self
                .window
                .create_window_surface(instance, std::ptr::null(), &mut surface);
            if result == vk::Result::SUCCESS {
                Ok(surface)
            } else {
                Err(VulkanError::Window(format!("surface creation failed: {result:?}")))
            }
        }
    }
}
