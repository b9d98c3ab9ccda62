//! Device images and sampled textures

use std::path::Path;
use std::sync::Arc;

use ash::vk;

use super::arena::ImageKey;
use super::backend::{ImageDesc, SamplerDesc};
use super::buffer::Buffer;
use super::device::Device;
use super::error::{VulkanError, VulkanResult};

/// 2D image with bound memory and a default view, registered in the device arena
pub struct Image {
    device: Arc<Device>,
    key: ImageKey,
    image: vk::Image,
    view: vk::ImageView,
    extent: vk::Extent2D,
    format: vk::Format,
}

impl Image {
    /// Create an image and its view over `aspect`
    pub fn new(device: &Arc<Device>, desc: &ImageDesc, properties: vk::MemoryPropertyFlags, aspect: vk::ImageAspectFlags) -> VulkanResult<Self> {
        let allocated = device.create_image(desc, properties, aspect)?;
        Ok(Self {
            device: Arc::clone(device),
            key: allocated.key,
            image: allocated.image,
            view: allocated.view,
            extent: desc.extent,
            format: desc.format,
        })
    }

    /// Image handle
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Default view
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Size in texels
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Texel format
    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.device.destroy_image(self.key);
    }
}

/// RGBA8 image in `SHADER_READ_ONLY_OPTIMAL` plus its sampler
pub struct Texture {
    device: Arc<Device>,
    image: Image,
    sampler: vk::Sampler,
}

impl Texture {
    /// Texel format of every texture
    pub const FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

    /// Upload tightly packed RGBA8 texels
    pub fn from_rgba8(device: &Arc<Device>, width: u32, height: u32, pixels: &[u8]) -> VulkanResult<Self> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(VulkanError::Image(format!(
                "{width}x{height} texture needs {expected} bytes, got {}",
                pixels.len()
            )));
        }

        let extent = vk::Extent2D { width, height };
        let staging = Buffer::staging_with_data(device, pixels)?;
        let image = Image::new(
            device,
            &ImageDesc {
                extent,
                format: Self::FORMAT,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            },
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::ImageAspectFlags::COLOR,
        )?;

        device.transition_image_layout(image.handle(), vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        device.copy_buffer_to_image(staging.handle(), image.handle(), extent)?;
        device.transition_image_layout(
            image.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        let sampler = device.raw().create_sampler(&SamplerDesc {
            max_anisotropy: Some(device.limits().max_sampler_anisotropy),
            ..SamplerDesc::default()
        })?;

        log::debug!("Created {width}x{height} texture");
        Ok(Self {
            device: Arc::clone(device),
            image,
            sampler,
        })
    }

    /// One-texel texture of a solid color
    pub fn solid_color(device: &Arc<Device>, rgba: [u8; 4]) -> VulkanResult<Self> {
        Self::from_rgba8(device, 1, 1, &rgba)
    }

    /// Decode an encoded image held in memory
    pub fn from_bytes(device: &Arc<Device>, bytes: &[u8]) -> VulkanResult<Self> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| VulkanError::Image(format!("Failed to decode image: {e}")))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();
        Self::from_rgba8(device, width, height, decoded.as_raw())
    }

    /// Load and decode an image file
    pub fn from_file(device: &Arc<Device>, path: impl AsRef<Path>) -> VulkanResult<Self> {
        let path = path.as_ref();
        let decoded = image::open(path)
            .map_err(|e| VulkanError::Image(format!("Failed to load {}: {e}", path.display())))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();
        log::info!("Loaded texture {}x{} from {:?}", width, height, path);
        Self::from_rgba8(device, width, height, decoded.as_raw())
    }

    /// Descriptor for a `COMBINED_IMAGE_SAMPLER` binding
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.image.view(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// Underlying image
    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Sampler handle
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.device.raw().destroy_sampler(self.sampler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::arena::ArenaStats;
    use crate::render::backend::headless::{HeadlessDevice, HeadlessEvent, ObjectKind};

    fn device() -> (Arc<Device>, HeadlessDevice) {
        let headless = HeadlessDevice::new();
        (Device::new(Box::new(headless.clone())), headless)
    }

    #[test]
    fn test_upload_transitions_to_shader_read() {
        let (device, headless) = device();
        let texture = Texture::from_rgba8(&device, 2, 2, &[255; 16]).unwrap();

        let layouts: Vec<_> = headless
            .events()
            .into_iter()
            .filter_map(|e| match e {
                HeadlessEvent::ImageBarrier(barrier) if barrier.image == texture.image().handle() => {
                    Some(barrier.new_layout)
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            layouts,
            vec![
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            ]
        );
        assert_eq!(texture.descriptor_info().image_view, texture.image().view());
        assert_eq!(texture.image().extent(), vk::Extent2D { width: 2, height: 2 });
        // staging buffer released once the copy finished
        assert_eq!(device.arena_stats().buffers, 0);

        drop(texture);
        assert_eq!(device.arena_stats(), ArenaStats::default());
        assert_eq!(headless.live_count(ObjectKind::Sampler), 0);
        assert!(headless.validation_errors().is_empty());
    }

    #[test]
    fn test_rejects_wrong_pixel_count() {
        let (device, _) = device();
        assert!(matches!(Texture::from_rgba8(&device, 2, 2, &[0; 12]), Err(VulkanError::Image(_))));
        assert!(matches!(Texture::from_rgba8(&device, 0, 1, &[]), Err(VulkanError::Image(_))));
    }

    #[test]
    fn test_from_file_decodes_png() {
        let (device, _) = device();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checker.png");
        image::RgbaImage::from_fn(3, 2, |x, y| image::Rgba([(x * 80) as u8, (y * 120) as u8, 0, 255]))
            .save(&path)
            .unwrap();

        let texture = Texture::from_file(&device, &path).unwrap();
        assert_eq!(texture.image().extent(), vk::Extent2D { width: 3, height: 2 });

        assert!(matches!(
            Texture::from_file(&device, dir.path().join("missing.png")),
            Err(VulkanError::Image(_))
        ));
    }
}
