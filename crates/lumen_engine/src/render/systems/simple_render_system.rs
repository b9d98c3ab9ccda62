//! Lit mesh rendering

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};

use super::pipeline_layout_with_push;
use crate::foundation::math::{mat3_to_mat4, mat4_to_cols};
use crate::render::device::Device;
use crate::render::error::VulkanResult;
use crate::render::frame::FrameInfo;
use crate::render::model::Vertex;
use crate::render::pipeline::{Pipeline, PipelineConfigInfo};
use crate::render::shader::ShaderLoader;

/// Per-object push constants; the normal matrix is widened to a `mat4` for std140
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SimplePushConstantData {
    /// Object to world
    pub model_matrix: [[f32; 4]; 4],
    /// Inverse transpose of the model matrix
    pub normal_matrix: [[f32; 4]; 4],
}

/// Draws every game object that has a model
pub struct SimpleRenderSystem {
    device: Arc<Device>,
    pipeline: Pipeline,
    pipeline_layout: vk::PipelineLayout,
}

impl SimpleRenderSystem {
    /// Vertex shader name
    pub const VERT_SHADER: &'static str = "simple_shader.vert";
    /// Fragment shader name
    pub const FRAG_SHADER: &'static str = "simple_shader.frag";

    /// Build the layout and pipeline against `render_pass`
    pub fn new(device: &Arc<Device>, loader: &dyn ShaderLoader, render_pass: vk::RenderPass, global_set_layout: vk::DescriptorSetLayout) -> VulkanResult<Self> {
        let pipeline_layout = pipeline_layout_with_push::<SimplePushConstantData>(device, global_set_layout)?;

        let config = PipelineConfigInfo {
            binding_descriptions: Vertex::binding_descriptions(),
            attribute_descriptions: Vertex::attribute_descriptions(),
            pipeline_layout,
            render_pass,
            ..PipelineConfigInfo::default_config()
        };
        let pipeline = match Pipeline::new(device, loader, Self::VERT_SHADER, Self::FRAG_SHADER, &config) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                device.raw().destroy_pipeline_layout(pipeline_layout);
                return Err(e);
            }
        };

        Ok(Self {
            device: Arc::clone(device),
            pipeline,
            pipeline_layout,
        })
    }

    /// Record one draw per object with a model
    pub fn render_game_objects(&self, frame_info: &FrameInfo<'_>) {
        let raw = self.device.raw();
        let command_buffer = frame_info.command_buffer;

        self.pipeline.bind(command_buffer);
        raw.cmd_bind_descriptor_sets(
            command_buffer,
            self.pipeline_layout,
            0,
            &[frame_info.global_descriptor_set],
        );

        for object in frame_info.game_objects.iter() {
            let Some(model) = &object.model else {
                continue;
            };
            let push = SimplePushConstantData {
                model_matrix: mat4_to_cols(&object.transform.mat4()),
                normal_matrix: mat4_to_cols(&mat3_to_mat4(&object.transform.normal_matrix())),
            };
            raw.cmd_push_constants(
                command_buffer,
                self.pipeline_layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(&push),
            );
            model.bind(command_buffer);
            model.draw(command_buffer);
        }
    }

    /// Layout the pipeline was built with
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }
}

impl Drop for SimpleRenderSystem {
    fn drop(&mut self) {
        self.device.raw().destroy_pipeline_layout(self.pipeline_layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DescriptorPoolConfig;
    use crate::foundation::math::Vec3;
    use crate::render::backend::headless::{HeadlessDevice, HeadlessEvent, ObjectKind, SPIRV_MAGIC};
    use crate::render::camera::Camera;
    use crate::render::descriptors::{DescriptorAllocator, DescriptorLayoutCache};
    use crate::render::frame::FrameUniforms;
    use crate::render::game_object::GameObjectMap;
    use crate::render::model::{Model, ModelData};
    use crate::render::renderer::Renderer;
    use crate::render::shader::MemoryShaderLoader;
    use crate::render::window::HeadlessWindow;
    use crate::render::RenderContext;

    fn loader() -> MemoryShaderLoader {
        MemoryShaderLoader::new()
            .with(SimpleRenderSystem::VERT_SHADER, vec![SPIRV_MAGIC, 1])
            .with(SimpleRenderSystem::FRAG_SHADER, vec![SPIRV_MAGIC, 2])
    }

    #[test]
    fn test_draws_only_objects_with_models() {
        let headless = HeadlessDevice::new();
        let ctx = RenderContext::with_defaults(Box::new(headless.clone()));
        let device = Arc::clone(&ctx.device);
        let mut window = HeadlessWindow::new(320, 240);
        let mut renderer = Renderer::new(ctx, &mut window).unwrap();
        let mut cache = DescriptorLayoutCache::new(&device);
        let mut allocator = DescriptorAllocator::new(&device, &DescriptorPoolConfig::default());
        let uniforms = FrameUniforms::new(&device, &mut cache, &mut allocator).unwrap();
        let system = SimpleRenderSystem::new(&device, &loader(), renderer.swap_chain_render_pass(), uniforms.layout()).unwrap();

        let cube = Arc::new(Model::new(&device, &ModelData::cube([0.0; 3])).unwrap());
        let mut objects = GameObjectMap::new();
        for x in 0..2 {
            let id = objects.create();
            let object = objects.get_mut(id).unwrap();
            object.model = Some(Arc::clone(&cube));
            object.transform.translation = Vec3::new(x as f32, 0.0, 2.5);
        }
        objects.create_point_light(1.0, 0.1, Vec3::new(1.0, 1.0, 1.0));
        let camera = Camera::new();

        headless.clear_events();
        let command_buffer = renderer.begin_frame(&mut window).unwrap().unwrap();
        renderer.begin_swap_chain_render_pass(command_buffer).unwrap();
        let frame_index = renderer.frame_index();
        system.render_game_objects(&FrameInfo {
            frame_index,
            frame_time: 0.016,
            command_buffer,
            camera: &camera,
            global_descriptor_set: uniforms.descriptor_set(frame_index),
            game_objects: &mut objects,
        });
        renderer.end_swap_chain_render_pass(command_buffer).unwrap();
        renderer.end_frame(&mut window).unwrap();

        let events = headless.events();
        let draws = events
            .iter()
            .filter(|e| matches!(e, HeadlessEvent::DrawIndexed { index_count: 36, instance_count: 1 }))
            .count();
        let pushes = events
            .iter()
            .filter(|e| matches!(e, HeadlessEvent::PushConstants { data, .. } if data.len() == 128))
            .count();
        assert_eq!(draws, 2);
        assert_eq!(pushes, 2);
        assert!(events.contains(&HeadlessEvent::BindDescriptorSets {
            first_set: 0,
            sets: vec![uniforms.descriptor_set(frame_index)],
        }));
        assert!(headless.validation_errors().is_empty());

        drop(system);
        assert_eq!(headless.live_count(ObjectKind::PipelineLayout), 0);
        assert_eq!(headless.live_count(ObjectKind::Pipeline), 0);
    }

    #[test]
    fn test_failed_pipeline_releases_layout() {
        let headless = HeadlessDevice::new();
        let device = Device::new(Box::new(headless.clone()));
        let mut cache = DescriptorLayoutCache::new(&device);
        let set_layout = cache.create_descriptor_layout(&[]).unwrap();
        let result = SimpleRenderSystem::new(&device, &MemoryShaderLoader::new(), vk::RenderPass::null(), set_layout);
        assert!(result.is_err());
        assert_eq!(headless.live_count(ObjectKind::PipelineLayout), 0);
    }
}
