//! # Rendering
//!
//! Frame-synchronized rendering on top of a [`GpuDevice`](backend::GpuDevice).
//!
//! ## Frame flow
//!
//! ```text
//! Renderer::begin_frame   wait slot fence, acquire image, begin command buffer
//!   systems update        fill GlobalUbo, FrameUniforms::write
//!   begin render pass
//!   systems render        bind, push, draw
//!   end render pass
//! Renderer::end_frame     submit, present, rebuild the swapchain if needed
//! ```
//!
//! ## Ownership
//!
//! The [`Device`] outlives everything built on it. Buffers, images and
//! swapchains are registered in its arena and hold keys; anything left when the
//! device drops is destroyed in dependency order.

pub mod arena;
pub mod backend;
pub mod buffer;
pub mod camera;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod frame;
pub mod game_object;
pub mod image;
pub mod model;
pub mod pipeline;
pub mod renderer;
pub mod shader;
pub mod stats;
pub mod swapchain;
pub mod systems;
pub mod window;

#[cfg(test)]
mod frame_loop_tests;

pub use arena::{ArenaStats, BufferKey, ImageKey, SwapchainKey};
pub use buffer::{alignment, Buffer, MappedScope};
pub use camera::Camera;
pub use context::RenderContext;
pub use descriptors::{DescriptorAllocator, DescriptorBuilder, DescriptorLayoutCache, PoolSizes};
pub use device::Device;
pub use error::{VulkanError, VulkanResult};
pub use frame::{FrameInfo, FrameUniforms, GlobalUbo, PointLightUbo, MAX_LIGHTS};
pub use game_object::{GameObject, GameObjectId, GameObjectMap, PointLightComponent, TransformComponent};
pub use self::image::{Image, Texture};
pub use model::{Model, ModelData, Vertex};
pub use pipeline::{Pipeline, PipelineConfigInfo, SpecializationConstant};
pub use renderer::Renderer;
pub use shader::{MemoryShaderLoader, ShaderError, ShaderLoader, SpirvDirectoryLoader};
pub use stats::{FrameStats, StatsSink, StatsSnapshot};
pub use swapchain::{AcquireOutcome, PresentOutcome, SwapChain, MAX_FRAMES_IN_FLIGHT};
pub use window::{HeadlessWindow, Window};

#[cfg(feature = "glfw")]
pub use window::GlfwWindow;
