//! Lumen demo application
//!
//! A few cubes on a floor, circled by colored point lights. The statistics
//! overlay reports frame times to the log.
//!
//! Controls: WASD/QE move, arrow keys look, F1 toggles the overlay, Escape quits.
//! An optional TOML or RON config path may be passed as the first argument.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use glfw::{Action, Key, WindowEvent};
use lumen_engine::config::{Config, ConfigError, EngineConfig};
use lumen_engine::foundation::logging;
use lumen_engine::foundation::math::Vec3;
use lumen_engine::foundation::time::Timer;
use lumen_engine::render::backend::vulkan::VulkanDevice;
use lumen_engine::render::systems::{PointLightSystem, SimpleRenderSystem, StatsLogOverlay, UiOverlaySystem};
use lumen_engine::render::{
    Camera, DescriptorAllocator, DescriptorLayoutCache, Device, FrameInfo, FrameStats, FrameUniforms,
    GameObjectMap, GlfwWindow, GlobalUbo, Model, ModelData, RenderContext, Renderer,
    SpirvDirectoryLoader, VulkanError,
};
use lumen_engine::settings::{Settings, SettingsError};
use nalgebra::Rotation3;
use thiserror::Error;

const DEFAULT_CONFIG: &str = "lumen_demo.toml";

#[derive(Error, Debug)]
enum DemoError {
    #[error(transparent)]
    Render(#[from] VulkanError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Free-flying viewer driven by held keys
#[derive(Default)]
struct ViewerController {
    held: HashSet<Key>,
    position: Vec3,
    rotation: Vec3,
}

impl ViewerController {
    const MOVE_SPEED: f32 = 3.0;
    const LOOK_SPEED: f32 = 1.5;

    fn key(&mut self, key: Key, action: Action) {
        match action {
            Action::Press => {
                self.held.insert(key);
            }
            Action::Release => {
                self.held.remove(&key);
            }
            Action::Repeat => {}
        }
    }

    fn axis(&self, positive: Key, negative: Key) -> f32 {
        f32::from(u8::from(self.held.contains(&positive))) - f32::from(u8::from(self.held.contains(&negative)))
    }

    fn update(&mut self, dt: f32, camera: &mut Camera) {
        let look = Vec3::new(self.axis(Key::Up, Key::Down), self.axis(Key::Right, Key::Left), 0.0);
        if look.norm_squared() > f32::EPSILON {
            self.rotation += Self::LOOK_SPEED * dt * look.normalize();
        }
        self.rotation.x = self.rotation.x.clamp(-1.5, 1.5);
        self.rotation.y = self.rotation.y.rem_euclid(std::f32::consts::TAU);

        let yaw = self.rotation.y;
        let forward = Vec3::new(yaw.sin(), 0.0, yaw.cos());
        let right = Vec3::new(forward.z, 0.0, -forward.x);
        let up = Vec3::new(0.0, -1.0, 0.0);
        let movement = forward * self.axis(Key::W, Key::S)
            + right * self.axis(Key::D, Key::A)
            + up * self.axis(Key::E, Key::Q);
        if movement.norm_squared() > f32::EPSILON {
            self.position += Self::MOVE_SPEED * dt * movement.normalize();
        }

        camera.set_view_yxz(self.position, self.rotation);
    }
}

// Field order is drop order: GPU objects go before the renderer, the window last.
struct DemoApp {
    overlay: UiOverlaySystem,
    point_light_system: PointLightSystem,
    simple_render_system: SimpleRenderSystem,
    uniforms: FrameUniforms,
    _descriptor_allocator: DescriptorAllocator,
    _layout_cache: DescriptorLayoutCache,
    objects: GameObjectMap,
    camera: Camera,
    controller: ViewerController,
    timer: Timer,
    renderer: Renderer,
    window: GlfwWindow,
}

impl DemoApp {
    fn new(config: &EngineConfig) -> Result<Self, DemoError> {
        let mut window = GlfwWindow::new(&config.window.title, config.window.width, config.window.height)?;
        let raw = VulkanDevice::from_config(&mut window, config)?;

        let settings = Settings::with_defaults();
        if let Some(path) = config.settings_path.as_ref().filter(|path| path.exists()) {
            let loaded = settings.load_file(path)?;
            log::info!("Loaded {loaded} setting(s) from {}", path.display());
        }
        let ctx = RenderContext::new(Device::new(Box::new(raw)), Arc::new(settings), Arc::new(FrameStats::new()));
        let device = Arc::clone(&ctx.device);
        let mut renderer = Renderer::new(ctx.clone(), &mut window)?;
        renderer.set_clear_color([0.01, 0.01, 0.01, 1.0]);

        let loader = SpirvDirectoryLoader::new(config.shader_dirs.iter().cloned());
        let mut layout_cache = DescriptorLayoutCache::new(&device);
        let mut descriptor_allocator = DescriptorAllocator::new(&device, &config.descriptor_pools);
        let uniforms = FrameUniforms::new(&device, &mut layout_cache, &mut descriptor_allocator)?;

        let render_pass = renderer.swap_chain_render_pass();
        let simple_render_system = SimpleRenderSystem::new(&device, &loader, render_pass, uniforms.layout())?;
        let point_light_system = PointLightSystem::new(&device, &loader, render_pass, uniforms.layout())?;
        let overlay = UiOverlaySystem::new(&ctx, Box::new(StatsLogOverlay::default()));

        let objects = load_scene(&device)?;
        let controller = ViewerController {
            position: Vec3::new(0.0, -0.5, -3.0),
            ..ViewerController::default()
        };

        Ok(Self {
            overlay,
            point_light_system,
            simple_render_system,
            uniforms,
            _descriptor_allocator: descriptor_allocator,
            _layout_cache: layout_cache,
            objects,
            camera: Camera::new(),
            controller,
            timer: Timer::new(),
            renderer,
            window,
        })
    }

    fn run(&mut self) -> Result<(), DemoError> {
        log::info!("Entering main loop");
        while !self.window.should_close() {
            for event in self.window.poll_events() {
                match event {
                    WindowEvent::Key(Key::Escape, _, Action::Press, _) | WindowEvent::Close => {
                        self.window.set_should_close(true);
                    }
                    WindowEvent::Key(Key::F1, _, Action::Press, _) => {
                        self.overlay.toggle();
                    }
                    WindowEvent::Key(key, _, action, _) => self.controller.key(key, action),
                    _ => {}
                }
            }

            self.timer.update();
            let frame_time = self.timer.delta_time();
            self.controller.update(frame_time, &mut self.camera);
            self.camera
                .set_perspective_projection(50f32.to_radians(), self.renderer.aspect_ratio(), 0.1, 100.0);

            self.draw_frame(frame_time)?;
            self.renderer.context().stats.record_frame_time(frame_time);
        }
        log::info!("Exiting after {} frames", self.timer.frame_count());
        Ok(())
    }

    fn draw_frame(&mut self, frame_time: f32) -> Result<(), DemoError> {
        let Some(command_buffer) = self.renderer.begin_frame(&mut self.window)? else {
            return Ok(());
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
        self.point_light_system.update(&mut frame_info, &mut ubo)?;
        self.uniforms.write(frame_index, &ubo)?;

        self.renderer.begin_swap_chain_render_pass(command_buffer)?;
        self.simple_render_system.render_game_objects(&frame_info);
        self.point_light_system.render(&frame_info);
        self.overlay.render(&frame_info)?;
        self.renderer.end_swap_chain_render_pass(command_buffer)?;
        self.renderer.end_frame(&mut self.window)?;
        Ok(())
    }
}

/// Three cubes on a flattened-cube floor, six lights in a ring above them
fn load_scene(device: &Arc<Device>) -> Result<GameObjectMap, VulkanError> {
    let mut objects = GameObjectMap::new();
    let cube = Arc::new(Model::new(device, &ModelData::cube([0.0; 3]))?);

    for (x, scale) in [(-1.2, 0.4), (0.0, 0.5), (1.2, 0.3)] {
        let id = objects.create();
        if let Some(object) = objects.get_mut(id) {
            object.model = Some(Arc::clone(&cube));
            object.transform.translation = Vec3::new(x, 0.5 - scale, 0.0);
            object.transform.scale = Vec3::new(scale, scale, scale) * 2.0;
            object.transform.rotation.y = x;
        }
    }

    let floor = objects.create();
    if let Some(object) = objects.get_mut(floor) {
        object.model = Some(cube);
        object.transform.translation = Vec3::new(0.0, 0.55, 0.0);
        object.transform.scale = Vec3::new(6.0, 0.1, 6.0);
    }

    let colors = [
        Vec3::new(1.0, 0.1, 0.1),
        Vec3::new(0.1, 0.1, 1.0),
        Vec3::new(0.1, 1.0, 0.1),
        Vec3::new(1.0, 1.0, 0.1),
        Vec3::new(0.1, 1.0, 1.0),
        Vec3::new(1.0, 1.0, 1.0),
    ];
    for (i, color) in colors.iter().enumerate() {
        let id = objects.create_point_light(0.5, 0.1, *color);
        let angle = i as f32 * std::f32::consts::TAU / colors.len() as f32;
        let rotation = Rotation3::from_axis_angle(&Vec3::y_axis(), -angle);
        if let Some(light) = objects.get_mut(id) {
            light.transform.translation = rotation * Vec3::new(-1.0, -1.0, -1.0);
        }
    }

    log::info!("Scene loaded with {} objects", objects.len());
    Ok(objects)
}

fn load_config() -> Result<EngineConfig, DemoError> {
    let path = std::env::args().nth(1).or_else(|| Path::new(DEFAULT_CONFIG).exists().then(|| DEFAULT_CONFIG.to_string()));
    let mut config = match path {
        Some(path) => EngineConfig::load_from_file(&path)?,
        None => EngineConfig::default().with_application_name("Lumen Demo"),
    };
    if let Some(dir) = option_env!("LUMEN_SHADER_DIR") {
        config = config.with_shader_dir(dir);
    }
    config.validate()?;
    Ok(config)
}

fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            logging::init();
            log::error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init_with_level(&config.log_level);

    let result = DemoApp::new(&config).and_then(|mut app| app.run());
    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}
