//! Whole-frame scenarios against the headless backend

use std::sync::Arc;

use ash::vk;

use super::backend::headless::{HeadlessDevice, HeadlessEvent, SPIRV_MAGIC};
use super::systems::{PointLightSystem, SimpleRenderSystem, StatsLogOverlay, UiOverlaySystem};
use super::window::HeadlessWindow;
use super::*;
use crate::config::DescriptorPoolConfig;
use crate::foundation::math::Vec3;

struct Scene {
    headless: HeadlessDevice,
    window: HeadlessWindow,
    camera: Camera,
    objects: GameObjectMap,
    overlay: UiOverlaySystem,
    lights: PointLightSystem,
    meshes: SimpleRenderSystem,
    uniforms: FrameUniforms,
    _allocator: DescriptorAllocator,
    _cache: DescriptorLayoutCache,
    renderer: Renderer,
}

impl Scene {
    fn new() -> Self {
        let headless = HeadlessDevice::new();
        let ctx = RenderContext::with_defaults(Box::new(headless.clone()));
        let device = Arc::clone(&ctx.device);
        let mut window = HeadlessWindow::new(640, 480);
        let renderer = Renderer::new(ctx.clone(), &mut window).unwrap();

        let loader = MemoryShaderLoader::new()
            .with(SimpleRenderSystem::VERT_SHADER, vec![SPIRV_MAGIC])
            .with(SimpleRenderSystem::FRAG_SHADER, vec![SPIRV_MAGIC])
            .with(PointLightSystem::VERT_SHADER, vec![SPIRV_MAGIC])
            .with(PointLightSystem::FRAG_SHADER, vec![SPIRV_MAGIC]);
        let mut cache = DescriptorLayoutCache::new(&device);
        let mut allocator = DescriptorAllocator::new(&device, &DescriptorPoolConfig::default());
        let uniforms = FrameUniforms::new(&device, &mut cache, &mut allocator).unwrap();
        let render_pass = renderer.swap_chain_render_pass();
        let meshes = SimpleRenderSystem::new(&device, &loader, render_pass, uniforms.layout()).unwrap();
        let lights = PointLightSystem::new(&device, &loader, render_pass, uniforms.layout()).unwrap();
        let overlay = UiOverlaySystem::new(&ctx, Box::new(StatsLogOverlay::new(0.5)));

        let cube = Arc::new(Model::new(&device, &ModelData::cube([0.0; 3])).unwrap());
        let mut objects = GameObjectMap::new();
        let id = objects.create();
        if let Some(object) = objects.get_mut(id) {
            object.model = Some(cube);
            object.transform.translation = Vec3::new(0.0, 0.5, 2.5);
        }
        for i in 0..3 {
            let id = objects.create_point_light(0.2, 0.1, Vec3::new(1.0, 1.0, 1.0));
            if let Some(light) = objects.get_mut(id) {
                light.transform.translation = Vec3::new(i as f32 - 1.0, -1.0, 1.0);
            }
        }

        let mut camera = Camera::new();
        camera.set_view_target(Vec3::new(0.0, -1.0, -2.0), Vec3::new(0.0, 0.0, 2.5), Vec3::new(0.0, -1.0, 0.0));
        camera.set_perspective_projection(0.87, renderer.aspect_ratio(), 0.1, 100.0);

        Self {
            headless,
            window,
            camera,
            objects,
            overlay,
            lights,
            meshes,
            uniforms,
            _allocator: allocator,
            _cache: cache,
            renderer,
        }
    }

    /// Run one iteration of the application loop; false when the frame was skipped
    fn frame(&mut self) -> VulkanResult<bool> {
        let frame_time = 1.0 / 60.0;
        let Some(command_buffer) = self.renderer.begin_frame(&mut self.window)? else {
            return Ok(false);
        };
        let frame_index = self.renderer.frame_index();
        let mut frame_info = FrameInfo {
            frame_index,
            frame_time,
            command_buffer,
            camera: &self.camera,
            global_descriptor_set: self.uniforms.descriptor_set(frame_index),
            game_objects: &mut self.objects,
        };

        let mut ubo = GlobalUbo::default();
        ubo.set_camera(frame_info.camera);
        self.lights.update(&mut frame_info, &mut ubo)?;
        self.uniforms.write(frame_index, &ubo)?;

        self.renderer.begin_swap_chain_render_pass(command_buffer)?;
        self.meshes.render_game_objects(&frame_info);
        self.lights.render(&frame_info);
        self.overlay.render(&frame_info)?;
        self.renderer.end_swap_chain_render_pass(command_buffer)?;
        self.renderer.end_frame(&mut self.window)?;
        self.renderer.context().stats.record_frame_time(frame_time);
        Ok(true)
    }

    fn count(&self, predicate: impl Fn(&HeadlessEvent) -> bool) -> usize {
        self.headless.events().iter().filter(|e| predicate(e)).count()
    }
}

#[test]
fn test_steady_state_frames() {
    let mut scene = Scene::new();
    for n in 1..=7 {
        assert!(scene.frame().unwrap());
        assert_eq!(scene.renderer.frame_index(), n % MAX_FRAMES_IN_FLIGHT);
    }

    let stats = scene.renderer.context().stats.snapshot();
    assert_eq!(stats.frames_submitted, 7);
    assert_eq!(stats.frames_skipped, 0);
    assert_eq!(stats.swapchain_rebuilds, 0);
    assert_eq!(scene.count(|e| matches!(e, HeadlessEvent::Present { result: Ok(false), .. })), 7);
    assert_eq!(scene.count(|e| matches!(e, HeadlessEvent::Draw { vertex_count: 6, .. })), 7 * 3);
    assert!(scene.headless.validation_errors().is_empty(), "{:?}", scene.headless.validation_errors());
}

#[test]
fn test_slot_reuse_waits_for_its_fence() {
    let mut scene = Scene::new();
    for _ in 0..MAX_FRAMES_IN_FLIGHT {
        scene.frame().unwrap();
    }
    // neither slot has been reused yet, so nothing had to wait
    assert_eq!(scene.count(|e| matches!(e, HeadlessEvent::WaitFence { blocked: true, .. })), 0);

    scene.headless.clear_events();
    scene.frame().unwrap();
    let events = scene.headless.events();
    let blocked = events
        .iter()
        .position(|e| matches!(e, HeadlessEvent::WaitFence { blocked: true, .. }))
        .unwrap();
    let first_flush_or_submit = events
        .iter()
        .position(|e| matches!(e, HeadlessEvent::Submit { .. } | HeadlessEvent::BeginCommandBuffer(_)))
        .unwrap();
    // the uniform slot and command buffer are only touched after the wait
    assert!(blocked < first_flush_or_submit);
}

#[test]
fn test_out_of_date_acquire_skips_one_frame() {
    let mut scene = Scene::new();
    scene.frame().unwrap();
    let slot = scene.renderer.frame_index();

    scene.headless.push_acquire_result(vk::Result::ERROR_OUT_OF_DATE_KHR);
    assert!(!scene.frame().unwrap());
    assert_eq!(scene.renderer.frame_index(), slot);
    assert!(scene.frame().unwrap());

    let stats = scene.renderer.context().stats.snapshot();
    assert_eq!(stats.frames_skipped, 1);
    assert_eq!(stats.swapchain_rebuilds, 1);
    assert!(scene.headless.validation_errors().is_empty(), "{:?}", scene.headless.validation_errors());
}

#[test]
fn test_resize_rebuilds_and_keeps_drawing() {
    let mut scene = Scene::new();
    scene.frame().unwrap();
    scene.window.resize(800, 600);
    scene.frame().unwrap();

    assert_eq!(
        scene.renderer.swap_chain().map(SwapChain::extent),
        Some(vk::Extent2D { width: 800, height: 600 })
    );
    scene.headless.clear_events();
    for _ in 0..3 {
        assert!(scene.frame().unwrap());
    }
    assert_eq!(scene.count(|e| matches!(e, HeadlessEvent::DrawIndexed { .. })), 3);
    assert_eq!(scene.renderer.context().stats.snapshot().swapchain_rebuilds, 1);
    assert!(scene.headless.validation_errors().is_empty(), "{:?}", scene.headless.validation_errors());
}

#[test]
fn test_suboptimal_present_rebuilds_after_the_frame() {
    let mut scene = Scene::new();
    scene.headless.push_present_result(vk::Result::SUBOPTIMAL_KHR);
    assert!(scene.frame().unwrap());
    assert_eq!(scene.count(|e| matches!(e, HeadlessEvent::CreateSwapchain { .. })), 2);
    assert!(scene.frame().unwrap());
}

#[test]
fn test_too_many_lights_surfaces_and_frame_can_be_abandoned() {
    let mut scene = Scene::new();
    for _ in 0..MAX_LIGHTS {
        scene.objects.create_point_light(1.0, 0.1, Vec3::new(1.0, 0.0, 0.0));
    }
    assert!(matches!(scene.frame(), Err(VulkanError::InvalidOperation { .. })));
    // the frame stays open; a second begin is a state-machine violation
    assert!(scene.renderer.is_frame_in_progress());
    assert!(matches!(
        scene.renderer.begin_frame(&mut scene.window),
        Err(VulkanError::InvalidOperation { .. })
    ));
}

#[test]
fn test_teardown_leaves_no_live_objects() {
    let mut scene = Scene::new();
    for _ in 0..3 {
        scene.frame().unwrap();
    }
    let headless = scene.headless.clone();
    drop(scene);
    assert_eq!(headless.live_object_count(), 0);
    assert!(headless.validation_errors().is_empty(), "{:?}", headless.validation_errors());
}
