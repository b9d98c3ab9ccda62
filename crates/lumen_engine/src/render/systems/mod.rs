//! Render systems
//!
//! Each system owns its pipeline and pipeline layout and records draws into the
//! command buffer of a [`FrameInfo`](super::FrameInfo). Set 0 is always the
//! global uniform set of the current frame slot.

pub mod point_light_system;
pub mod simple_render_system;
pub mod ui_overlay_system;

pub use point_light_system::{PointLightPushConstants, PointLightSystem};
pub use simple_render_system::{SimplePushConstantData, SimpleRenderSystem};
pub use ui_overlay_system::{OverlayBackend, OverlayFrame, StatsLogOverlay, UiOverlaySystem};

use std::mem::size_of;

use ash::vk;

use super::device::Device;
use super::error::VulkanResult;

/// Layout with the global set and one push constant block of `P`
fn pipeline_layout_with_push<P>(device: &Device, global_set_layout: vk::DescriptorSetLayout) -> VulkanResult<vk::PipelineLayout> {
    let push_constant_range = vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        offset: 0,
        size: size_of::<P>() as u32,
    };
    Ok(device
        .raw()
        .create_pipeline_layout(&[global_set_layout], &[push_constant_range])?)
}
