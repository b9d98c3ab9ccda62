//! # Lumen Engine
//!
//! A Vulkan rendering engine built around a frame-synchronized render loop.
//!
//! ## Features
//!
//! - **Frame Protocol**: acquire, record, submit and present with bounded frames in flight
//! - **Swapchain Lifecycle**: out-of-date and suboptimal surfaces are rebuilt transparently
//! - **GPU Resources**: alignment-aware buffers, images, textures and pooled descriptor sets
//! - **Render Systems**: mesh, point light and overlay systems fed by a shared [`render::FrameInfo`]
//! - **Backend Seam**: an ash backend for real GPUs and a headless backend for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lumen_engine::prelude::*;
//!
//! fn run(window: &mut dyn Window, ctx: RenderContext) -> VulkanResult<()> {
//!     let mut renderer = Renderer::new(ctx, window)?;
//!     loop {
//!         if let Some(command_buffer) = renderer.begin_frame(window)? {
//!             renderer.begin_swap_chain_render_pass(command_buffer)?;
//!             // record draws here
//!             renderer.end_swap_chain_render_pass(command_buffer)?;
//!             renderer.end_frame(window)?;
//!         }
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod foundation;
pub mod render;
pub mod settings;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        config::{Config, EngineConfig},
        foundation::{
            math::{Mat4, Vec3, Vec4},
            time::Timer,
        },
        render::{
            Buffer, Camera, Device, FrameInfo, FrameUniforms, GameObject, GameObjectMap,
            GlobalUbo, Model, Pipeline, PipelineConfigInfo, RenderContext, Renderer, SwapChain,
            VulkanError, VulkanResult, Window, MAX_FRAMES_IN_FLIGHT, MAX_LIGHTS,
        },
        settings::{SettingValue, Settings},
    };
}
