//! Point lights: uniform contribution and billboard rendering
//!
//! [`PointLightSystem::update`] runs before the render pass and fills the light
//! array of the frame's [`GlobalUbo`]. [`PointLightSystem::render`] draws one
//! camera-facing quad per light, back to front, with alpha blending.

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use nalgebra::Rotation3;

use super::pipeline_layout_with_push;
use crate::foundation::math::{vec4_from, Vec3};
use crate::render::device::Device;
use crate::render::error::{VulkanError, VulkanResult};
use crate::render::frame::{FrameInfo, GlobalUbo, PointLightUbo, MAX_LIGHTS};
use crate::render::pipeline::{Pipeline, PipelineConfigInfo, SpecializationConstant};
use crate::render::shader::ShaderLoader;

/// Radians per second the lights orbit the Y axis
const ORBIT_SPEED: f32 = 0.5;

/// Per-light push constants
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PointLightPushConstants {
    /// World-space position, w unused
    pub position: [f32; 4],
    /// Color, w is intensity
    pub color: [f32; 4],
    /// Billboard radius
    pub radius: f32,
    pub _pad: [f32; 3],
}

/// Updates and draws the scene's point lights
pub struct PointLightSystem {
    device: Arc<Device>,
    pipeline: Pipeline,
    pipeline_layout: vk::PipelineLayout,
}

impl PointLightSystem {
    /// Vertex shader name
    pub const VERT_SHADER: &'static str = "point_light.vert";
    /// Fragment shader name
    pub const FRAG_SHADER: &'static str = "point_light.frag";

    /// Build the blended billboard pipeline against `render_pass`
    pub fn new(device: &Arc<Device>, loader: &dyn ShaderLoader, render_pass: vk::RenderPass, global_set_layout: vk::DescriptorSetLayout) -> VulkanResult<Self> {
        let pipeline_layout = pipeline_layout_with_push::<PointLightPushConstants>(device, global_set_layout)?;

        // quad corners are generated in the vertex shader
        let mut config = PipelineConfigInfo {
            specialization: vec![SpecializationConstant {
                id: 0,
                value: MAX_LIGHTS as u32,
            }],
            pipeline_layout,
            render_pass,
            ..PipelineConfigInfo::default_config()
        };
        config.enable_alpha_blending();

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

    /// Orbit the lights and copy them into `ubo`
    ///
    /// Fails without touching `ubo` when the scene holds more than
    /// [`MAX_LIGHTS`] lights.
    pub fn update(&self, frame_info: &mut FrameInfo<'_>, ubo: &mut GlobalUbo) -> VulkanResult<()> {
        let count = frame_info
            .game_objects
            .iter()
            .filter(|object| object.point_light.is_some())
            .count();
        if count > MAX_LIGHTS {
            return Err(VulkanError::invalid(format!(
                "scene has {count} point lights, at most {MAX_LIGHTS} are supported"
            )));
        }

        let rotation = Rotation3::from_axis_angle(&Vec3::y_axis(), -ORBIT_SPEED * frame_info.frame_time);
        let mut index = 0;
        for object in frame_info.game_objects.iter_mut() {
            let Some(light) = object.point_light else {
                continue;
            };
            object.transform.translation = rotation * object.transform.translation;
            ubo.point_lights[index] = PointLightUbo {
                position: vec4_from(&object.transform.translation, 1.0),
                color: vec4_from(&object.color, light.light_intensity),
            };
            index += 1;
        }
        ubo.num_lights = index as i32;
        Ok(())
    }

    /// Draw the lights furthest from the camera first
    pub fn render(&self, frame_info: &FrameInfo<'_>) {
        let camera_position = frame_info.camera.position();
        let mut lights: Vec<_> = frame_info
            .game_objects
            .iter()
            .filter_map(|object| object.point_light.map(|light| (object, light)))
            .map(|(object, light)| {
                let distance = (camera_position - object.transform.translation).norm_squared();
                (distance, object, light)
            })
            .collect();
        lights.sort_by(|a, b| b.0.total_cmp(&a.0));

        let raw = self.device.raw();
        let command_buffer = frame_info.command_buffer;
        self.pipeline.bind(command_buffer);
        raw.cmd_bind_descriptor_sets(
            command_buffer,
            self.pipeline_layout,
            0,
            &[frame_info.global_descriptor_set],
        );

        for (_, object, light) in lights {
            let push = PointLightPushConstants {
                position: vec4_from(&object.transform.translation, 1.0),
                color: vec4_from(&object.color, light.light_intensity),
                radius: object.transform.scale.x,
                _pad: [0.0; 3],
            };
            raw.cmd_push_constants(
                command_buffer,
                self.pipeline_layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(&push),
            );
            raw.cmd_draw(command_buffer, 6, 1, 0, 0);
        }
    }
}

impl Drop for PointLightSystem {
    fn drop(&mut self) {
        self.device.raw().destroy_pipeline_layout(self.pipeline_layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DescriptorPoolConfig;
    use crate::render::backend::headless::{HeadlessDevice, HeadlessEvent, SPIRV_MAGIC};
    use crate::render::backend::RenderPassDesc;
    use crate::render::camera::Camera;
    use crate::render::descriptors::{DescriptorAllocator, DescriptorLayoutCache};
    use crate::render::frame::FrameUniforms;
    use crate::render::game_object::GameObjectMap;
    use crate::render::renderer::Renderer;
    use crate::render::shader::MemoryShaderLoader;
    use crate::render::window::HeadlessWindow;
    use crate::render::RenderContext;
    use approx::assert_relative_eq;

    fn loader() -> MemoryShaderLoader {
        MemoryShaderLoader::new()
            .with(PointLightSystem::VERT_SHADER, vec![SPIRV_MAGIC, 3])
            .with(PointLightSystem::FRAG_SHADER, vec![SPIRV_MAGIC, 4])
    }

    fn standalone() -> (Arc<Device>, PointLightSystem, DescriptorLayoutCache) {
        let device = Device::new(Box::new(HeadlessDevice::new()));
        let mut cache = DescriptorLayoutCache::new(&device);
        let set_layout = cache.create_descriptor_layout(&[]).unwrap();
        let render_pass = device
            .raw()
            .create_render_pass(&RenderPassDesc {
                attachments: vec![vk::AttachmentDescription::default()],
                ..Default::default()
            })
            .unwrap();
        let system = PointLightSystem::new(&device, &loader(), render_pass, set_layout).unwrap();
        (device, system, cache)
    }

    fn frame_info<'a>(camera: &'a Camera, objects: &'a mut GameObjectMap, frame_time: f32) -> FrameInfo<'a> {
        FrameInfo {
            frame_index: 0,
            frame_time,
            command_buffer: vk::CommandBuffer::null(),
            camera,
            global_descriptor_set: vk::DescriptorSet::null(),
            game_objects: objects,
        }
    }

    #[test]
    fn test_update_fills_ubo_and_orbits() {
        let (_device, system, _cache) = standalone();
        let camera = Camera::new();
        let mut objects = GameObjectMap::new();
        let light = objects.create_point_light(0.7, 0.1, Vec3::new(1.0, 0.5, 0.0));
        objects.get_mut(light).unwrap().transform.translation = Vec3::new(1.0, -1.0, 0.0);
        objects.create();

        let mut ubo = GlobalUbo::default();
        let quarter_turn = std::f32::consts::FRAC_PI_2 / ORBIT_SPEED;
        system
            .update(&mut frame_info(&camera, &mut objects, quarter_turn), &mut ubo)
            .unwrap();

        assert_eq!(ubo.num_lights, 1);
        assert_eq!(ubo.point_lights[0].color, [1.0, 0.5, 0.0, 0.7]);
        // a quarter turn takes +X to +Z
        let position = ubo.point_lights[0].position;
        assert_relative_eq!(position[0], 0.0, epsilon = 1e-5);
        assert_relative_eq!(position[1], -1.0, epsilon = 1e-5);
        assert_relative_eq!(position[2], 1.0, epsilon = 1e-5);
        assert_relative_eq!(objects.get(light).unwrap().transform.translation.z, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_update_rejects_too_many_lights() {
        let (_device, system, _cache) = standalone();
        let camera = Camera::new();
        let mut objects = GameObjectMap::new();
        for _ in 0..=MAX_LIGHTS {
            objects.create_point_light(1.0, 0.1, Vec3::new(1.0, 1.0, 1.0));
        }
        let mut ubo = GlobalUbo::default();
        let result = system.update(&mut frame_info(&camera, &mut objects, 0.0), &mut ubo);
        assert!(matches!(result, Err(VulkanError::InvalidOperation { .. })));
        assert_eq!(ubo.num_lights, 0);
    }

    #[test]
    fn test_render_draws_back_to_front() {
        let headless = HeadlessDevice::new();
        let ctx = RenderContext::with_defaults(Box::new(headless.clone()));
        let device = Arc::clone(&ctx.device);
        let mut window = HeadlessWindow::new(320, 240);
        let mut renderer = Renderer::new(ctx, &mut window).unwrap();
        let mut cache = DescriptorLayoutCache::new(&device);
        let mut allocator = DescriptorAllocator::new(&device, &DescriptorPoolConfig::default());
        let uniforms = FrameUniforms::new(&device, &mut cache, &mut allocator).unwrap();
        let system = PointLightSystem::new(&device, &loader(), renderer.swap_chain_render_pass(), uniforms.layout()).unwrap();

        let camera = Camera::new();
        let mut objects = GameObjectMap::new();
        for z in [1.0, 5.0, 3.0] {
            let id = objects.create_point_light(1.0, z, Vec3::new(1.0, 1.0, 1.0));
            objects.get_mut(id).unwrap().transform.translation = Vec3::new(0.0, 0.0, z);
        }

        headless.clear_events();
        let command_buffer = renderer.begin_frame(&mut window).unwrap().unwrap();
        renderer.begin_swap_chain_render_pass(command_buffer).unwrap();
        let frame_index = renderer.frame_index();
        system.render(&FrameInfo {
            frame_index,
            frame_time: 0.0,
            command_buffer,
            camera: &camera,
            global_descriptor_set: uniforms.descriptor_set(frame_index),
            game_objects: &mut objects,
        });
        renderer.end_swap_chain_render_pass(command_buffer).unwrap();
        renderer.end_frame(&mut window).unwrap();

        let radii: Vec<f32> = headless
            .events()
            .into_iter()
            .filter_map(|e| match e {
                HeadlessEvent::PushConstants { data, .. } => {
                    let push: PointLightPushConstants = bytemuck::pod_read_unaligned(&data);
                    Some(push.radius)
                }
                _ => None,
            })
            .collect();
        assert_eq!(radii, vec![5.0, 3.0, 1.0]);
        let quads = headless
            .events()
            .iter()
            .filter(|e| matches!(e, HeadlessEvent::Draw { vertex_count: 6, .. }))
            .count();
        assert_eq!(quads, 3);
        assert!(headless.validation_errors().is_empty());
    }
}
