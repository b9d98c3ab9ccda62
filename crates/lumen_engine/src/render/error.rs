//! Render error types

use ash::vk;
use thiserror::Error;

use super::shader::ShaderError;

/// Vulkan-specific error types
///
/// Out-of-date and suboptimal swapchains are not errors; they travel as
/// [`AcquireOutcome`](super::AcquireOutcome) and [`PresentOutcome`](super::PresentOutcome).
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// None of the candidate formats support the requested usage
    #[error("No supported format among candidates")]
    NoSupportedFormat,

    /// Host access to a buffer that is not mapped
    #[error("Buffer is not mapped")]
    NotMapped,

    /// Host access past the end of a mapping
    #[error("Access of {size} bytes at offset {offset} exceeds mapped range of {capacity} bytes")]
    OutOfBounds {
        /// Byte offset of the access
        offset: vk::DeviceSize,
        /// Bytes accessed
        size: vk::DeviceSize,
        /// Bytes available
        capacity: vk::DeviceSize,
    },

    /// A recreated swapchain changed its color or depth format
    #[error("Swap chain image or depth format has changed")]
    SwapchainFormatChanged,

    /// Descriptor set allocation failed even after moving to a fresh pool
    #[error("Descriptor set allocation failed: {0:?}")]
    DescriptorAllocation(vk::Result),

    /// Shader bytecode could not be supplied
    #[error(transparent)]
    Shader(#[from] ShaderError),

    /// Window or surface failure
    #[error("Window error: {0}")]
    Window(String),

    /// Texture decode failure
    #[error("Image error: {0}")]
    Image(String),
}

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        Self::Api(result)
    }
}

impl VulkanError {
    /// Shorthand for [`VulkanError::InvalidOperation`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            reason: reason.into(),
        }
    }
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;
