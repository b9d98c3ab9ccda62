//! Graphics pipelines
//!
//! [`PipelineConfigInfo`] holds fixed-function state as plain values; the
//! backend turns it into create-info structures. Viewport and scissor are
//! always dynamic, so a pipeline survives swapchain rebuilds as long as the
//! render pass stays compatible.

use std::sync::Arc;

use ash::vk;

use super::backend::GraphicsPipelineDesc;
use super::device::Device;
use super::error::{VulkanError, VulkanResult};
use super::shader::ShaderLoader;

/// A `u32` specialization constant applied to both stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecializationConstant {
    /// `constant_id` in the shader
    pub id: u32,
    /// Value
    pub value: u32,
}

/// Fixed-function state, layout and render pass of a pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfigInfo {
    pub binding_descriptions: Vec<vk::VertexInputBindingDescription>,
    pub attribute_descriptions: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: vk::CompareOp,
    pub color_blend_attachment: vk::PipelineColorBlendAttachmentState,
    pub dynamic_states: Vec<vk::DynamicState>,
    pub specialization: Vec<SpecializationConstant>,
    /// Must be set before [`Pipeline::new`]
    pub pipeline_layout: vk::PipelineLayout,
    /// Must be set before [`Pipeline::new`]
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
}

impl Default for PipelineConfigInfo {
    fn default() -> Self {
        Self {
            binding_descriptions: Vec::new(),
            attribute_descriptions: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_test_enable: true,
            depth_write_enable: true,
            depth_compare_op: vk::CompareOp::LESS,
            color_blend_attachment: vk::PipelineColorBlendAttachmentState {
                blend_enable: vk::FALSE,
                src_color_blend_factor: vk::BlendFactor::ONE,
                dst_color_blend_factor: vk::BlendFactor::ZERO,
                color_blend_op: vk::BlendOp::ADD,
                src_alpha_blend_factor: vk::BlendFactor::ONE,
                dst_alpha_blend_factor: vk::BlendFactor::ZERO,
                alpha_blend_op: vk::BlendOp::ADD,
                color_write_mask: vk::ColorComponentFlags::RGBA,
            },
            dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            specialization: Vec::new(),
            pipeline_layout: vk::PipelineLayout::null(),
            render_pass: vk::RenderPass::null(),
            subpass: 0,
        }
    }
}

impl PipelineConfigInfo {
    /// Opaque triangle lists with depth testing
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Standard `src_alpha / one_minus_src_alpha` blending
    pub fn enable_alpha_blending(&mut self) {
        self.color_blend_attachment = vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::TRUE,
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ZERO,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        };
    }

    /// Map entries and data blob for the specialization constants
    pub fn specialization_data(&self) -> (Vec<vk::SpecializationMapEntry>, Vec<u8>) {
        let mut entries = Vec::with_capacity(self.specialization.len());
        let mut data = Vec::with_capacity(self.specialization.len() * 4);
        for constant in &self.specialization {
            entries.push(vk::SpecializationMapEntry {
                constant_id: constant.id,
                offset: data.len() as u32,
                size: std::mem::size_of::<u32>(),
            });
            data.extend_from_slice(&constant.value.to_ne_bytes());
        }
        (entries, data)
    }
}

/// Compiled graphics pipeline
pub struct Pipeline {
    device: Arc<Device>,
    pipeline: vk::Pipeline,
}

impl Pipeline {
    /// Load both stages through `loader` and build the pipeline
    ///
    /// The config must carry a pipeline layout and a render pass.
    pub fn new(device: &Arc<Device>, loader: &dyn ShaderLoader, vert: &str, frag: &str, config: &PipelineConfigInfo) -> VulkanResult<Self> {
        if config.pipeline_layout == vk::PipelineLayout::null() {
            return Err(VulkanError::invalid("cannot create pipeline: no pipeline layout in config"));
        }
        if config.render_pass == vk::RenderPass::null() {
            return Err(VulkanError::invalid("cannot create pipeline: no render pass in config"));
        }

        let vert_code = loader.load(vert)?;
        let frag_code = loader.load(frag)?;
        let raw = device.raw();

        let vert_module = raw.create_shader_module(&vert_code)?;
        let frag_module = match raw.create_shader_module(&frag_code) {
            Ok(module) => module,
            Err(e) => {
                raw.destroy_shader_module(vert_module);
                return Err(e.into());
            }
        };

        let result = raw.create_graphics_pipeline(&GraphicsPipelineDesc {
            vert_module,
            frag_module,
            config,
        });
        raw.destroy_shader_module(vert_module);
        raw.destroy_shader_module(frag_module);

        let pipeline = result?;
        log::debug!("Created pipeline {:?} from '{}' + '{}'", pipeline, vert, frag);
        Ok(Self {
            device: Arc::clone(device),
            pipeline,
        })
    }

    /// Bind for graphics
    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        self.device.raw().cmd_bind_pipeline(command_buffer, self.pipeline);
    }

    /// Raw handle
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.device.raw().destroy_pipeline(self.pipeline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backend::headless::{HeadlessDevice, ObjectKind, SPIRV_MAGIC};
    use crate::render::backend::RenderPassDesc;
    use crate::render::shader::{MemoryShaderLoader, ShaderError};

    fn setup() -> (Arc<Device>, HeadlessDevice, MemoryShaderLoader, PipelineConfigInfo) {
        let headless = HeadlessDevice::new();
        let device = Device::new(Box::new(headless.clone()));
        let loader = MemoryShaderLoader::new()
            .with("test.vert", vec![SPIRV_MAGIC, 0])
            .with("test.frag", vec![SPIRV_MAGIC, 1]);
        let mut config = PipelineConfigInfo::default_config();
        config.pipeline_layout = device.raw().create_pipeline_layout(&[], &[]).unwrap();
        config.render_pass = device
            .raw()
            .create_render_pass(&RenderPassDesc {
                attachments: vec![vk::AttachmentDescription::default()],
                ..Default::default()
            })
            .unwrap();
        (device, headless, loader, config)
    }

    #[test]
    fn test_create_and_drop() {
        let (device, headless, loader, config) = setup();
        let pipeline = Pipeline::new(&device, &loader, "test.vert", "test.frag", &config).unwrap();
        assert_eq!(headless.live_count(ObjectKind::Pipeline), 1);
        assert_eq!(headless.live_count(ObjectKind::ShaderModule), 0);
        drop(pipeline);
        assert_eq!(headless.live_count(ObjectKind::Pipeline), 0);
    }

    #[test]
    fn test_missing_layout_or_render_pass_is_rejected() {
        let (device, _, loader, config) = setup();
        let no_layout = PipelineConfigInfo {
            pipeline_layout: vk::PipelineLayout::null(),
            ..config.clone()
        };
        assert!(matches!(
            Pipeline::new(&device, &loader, "test.vert", "test.frag", &no_layout),
            Err(VulkanError::InvalidOperation { .. })
        ));
        let no_pass = PipelineConfigInfo {
            render_pass: vk::RenderPass::null(),
            ..config
        };
        assert!(matches!(
            Pipeline::new(&device, &loader, "test.vert", "test.frag", &no_pass),
            Err(VulkanError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_missing_shader_is_typed() {
        let (device, headless, loader, config) = setup();
        assert!(matches!(
            Pipeline::new(&device, &loader, "test.vert", "absent.frag", &config),
            Err(VulkanError::Shader(ShaderError::NotFound { .. }))
        ));
        assert_eq!(headless.live_count(ObjectKind::ShaderModule), 0);
    }

    #[test]
    fn test_alpha_blending_and_specialization() {
        let mut config = PipelineConfigInfo::default_config();
        assert_eq!(config.color_blend_attachment.blend_enable, vk::FALSE);
        config.enable_alpha_blending();
        assert_eq!(config.color_blend_attachment.blend_enable, vk::TRUE);
        assert_eq!(
            config.color_blend_attachment.dst_color_blend_factor,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA
        );

        config.specialization = vec![
            SpecializationConstant { id: 0, value: 10 },
            SpecializationConstant { id: 3, value: 7 },
        ];
        let (entries, data) = config.specialization_data();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].constant_id, 3);
        assert_eq!(entries[1].offset, 4);
        assert_eq!(data.len(), 8);
        assert_eq!(u32::from_ne_bytes([data[0], data[1], data[2], data[3]]), 10);
    }
}
