//! Configuration system
//!
//! Startup configuration loaded from TOML or RON. Values that change while the
//! engine runs (vsync, present mode) live in [`crate::settings::Settings`] instead.

use std::path::PathBuf;

pub use serde::{Deserialize, Serialize};

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Values that parse but cannot be used
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Window creation parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Title bar text
    pub title: String,
    /// Initial client width in pixels
    pub width: u32,
    /// Initial client height in pixels
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Lumen".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Sizing policy for descriptor pools
///
/// Each pool holds `sets_per_pool` sets and, per descriptor type,
/// `ratio * sets_per_pool` descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorPoolConfig {
    /// Maximum descriptor sets one pool can hand out
    pub sets_per_pool: u32,
    /// Uniform buffer descriptors per set
    pub uniform_buffer_ratio: f32,
    /// Dynamic uniform buffer descriptors per set
    pub uniform_buffer_dynamic_ratio: f32,
    /// Storage buffer descriptors per set
    pub storage_buffer_ratio: f32,
    /// Combined image sampler descriptors per set
    pub combined_image_sampler_ratio: f32,
}

impl Default for DescriptorPoolConfig {
    fn default() -> Self {
        Self {
            sets_per_pool: 1000,
            uniform_buffer_ratio: 2.0,
            uniform_buffer_dynamic_ratio: 1.0,
            storage_buffer_ratio: 1.0,
            combined_image_sampler_ratio: 4.0,
        }
    }
}

/// Engine startup configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Application name reported to the Vulkan instance
    pub application_name: String,
    /// Window parameters
    pub window: WindowConfig,
    /// Enable the Khronos validation layer; `None` follows the build profile
    pub enable_validation: Option<bool>,
    /// Default `env_logger` filter
    pub log_level: String,
    /// Directories searched, in order, for compiled SPIR-V
    pub shader_dirs: Vec<PathBuf>,
    /// Descriptor pool sizing
    pub descriptor_pools: DescriptorPoolConfig,
    /// Optional key=value runtime settings file
    pub settings_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            application_name: "Lumen Application".to_string(),
            window: WindowConfig::default(),
            enable_validation: None,
            log_level: "info".to_string(),
            shader_dirs: vec![
                PathBuf::from("target/shaders"),
                PathBuf::from("shaders"),
            ],
            descriptor_pools: DescriptorPoolConfig::default(),
            settings_path: None,
        }
    }
}

impl Config for EngineConfig {}

impl EngineConfig {
    /// Set the application name
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the window size
    pub fn with_window_size(mut self, width: u32, height: u32) -> Self {
        self.window.width = width;
        self.window.height = height;
        self
    }

    /// Force validation layers on or off
    pub fn with_validation(mut self, enable: bool) -> Self {
        self.enable_validation = Some(enable);
        self
    }

    /// Prepend a shader search directory
    pub fn with_shader_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shader_dirs.insert(0, dir.into());
        self
    }

    /// Whether validation layers should be requested
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.width == 0 || self.window.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "window size must be non-zero, got {}x{}",
                self.window.width, self.window.height
            )));
        }
        if self.descriptor_pools.sets_per_pool == 0 {
            return Err(ConfigError::Invalid(
                "descriptor_pools.sets_per_pool must be at least 1".to_string(),
            ));
        }
        if self.shader_dirs.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one shader directory is required".to_string(),
            ));
        }
        Ok(())
    }
}
