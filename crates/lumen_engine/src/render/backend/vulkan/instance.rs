//! Instance creation and physical device selection

use std::collections::HashSet;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Entry, Instance};

use crate::render::error::{VulkanError, VulkanResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const ENGINE_NAME: &CStr = c"Lumen";

/// Entry, instance and the optional debug messenger
pub struct VulkanInstance {
    /// Loaded library entry points
    pub entry: Entry,
    /// Instance dispatch table
    pub instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Load the Vulkan library and create an instance with `extensions`
    ///
    /// Validation adds the Khronos layer and a messenger that forwards driver
    /// messages to `log`. When the layer is not installed validation is
    /// skipped with a warning.
    pub fn new(app_name: &str, extensions: &[String], enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e}")))?;

        let app_name = CString::new(app_name)
            .map_err(|_| VulkanError::InitializationFailed("application name contains a NUL byte".to_string()))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let validation = enable_validation && Self::has_validation_layer(&entry)?;
        if enable_validation && !validation {
            log::warn!("Validation requested but {} is not available", VALIDATION_LAYER.to_string_lossy());
        }

        let extension_names = extensions
            .iter()
            .map(|name| CString::new(name.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| VulkanError::InitializationFailed("extension name contains a NUL byte".to_string()))?;
        let mut extension_ptrs: Vec<*const c_char> = extension_names.iter().map(|name| name.as_ptr()).collect();
        let mut layer_ptrs: Vec<*const c_char> = Vec::new();
        if validation {
            extension_ptrs.push(DebugUtils::name().as_ptr());
            layer_ptrs.push(VALIDATION_LAYER.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);
        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(VulkanError::Api)?;

        let debug = if validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            match unsafe { debug_utils.create_debug_utils_messenger(&messenger_info, None) } {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(VulkanError::Api(e));
                }
            }
        } else {
            None
        };

        log::info!("Created Vulkan instance (validation: {validation})");
        Ok(Self { entry, instance, debug })
    }

    fn has_validation_layer(entry: &Entry) -> VulkanResult<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .map_err(VulkanError::Api)?;
        Ok(layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER))
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }
    vk::FALSE
}

/// The chosen GPU and its queue families
pub struct PhysicalDeviceInfo {
    /// Physical device handle
    pub device: vk::PhysicalDevice,
    /// Properties, including limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported features
    pub features: vk::PhysicalDeviceFeatures,
    /// Queue family used for graphics and transfers
    pub graphics_family: u32,
    /// Queue family used for presentation
    pub present_family: u32,
}

impl PhysicalDeviceInfo {
    /// First device with graphics and present queues and swapchain support,
    /// preferring discrete GPUs
    pub fn select(instance: &Instance, surface: vk::SurfaceKHR, surface_loader: &Surface) -> VulkanResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices() }.map_err(VulkanError::Api)?;

        let mut candidates = Vec::new();
        for device in devices {
            match Self::evaluate(instance, device, surface, surface_loader) {
                Ok(info) => candidates.push(info),
                Err(reason) => log::debug!("Skipping {}: {reason}", device_name(&unsafe {
                    instance.get_physical_device_properties(device)
                })),
            }
        }
        candidates.sort_by_key(|info| info.properties.device_type != vk::PhysicalDeviceType::DISCRETE_GPU);

        let info = candidates
            .into_iter()
            .next()
            .ok_or_else(|| VulkanError::InitializationFailed("No suitable GPU found".to_string()))?;
        log::info!("Selected GPU: {}", device_name(&info.properties));
        Ok(info)
    }

    fn evaluate(instance: &Instance, device: vk::PhysicalDevice, surface: vk::SurfaceKHR, surface_loader: &Surface) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics_family = None;
        let mut present_family = None;
        for (index, family) in queue_families.iter().enumerate() {
            let index = index as u32;
            if graphics_family.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                graphics_family = Some(index);
            }
            let present_support = unsafe {
                surface_loader.get_physical_device_surface_support(device, index, surface)
            }
            .map_err(VulkanError::Api)?;
            if present_family.is_none() && present_support {
                present_family = Some(index);
            }
            if graphics_family.is_some() && present_family.is_some() {
                break;
            }
        }
        let graphics_family = graphics_family
            .ok_or_else(|| VulkanError::InitializationFailed("no graphics queue family".to_string()))?;
        let present_family = present_family
            .ok_or_else(|| VulkanError::InitializationFailed("no present queue family".to_string()))?;

        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }.map_err(VulkanError::Api)?;
        let has_swapchain = extensions
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == SwapchainLoader::name());
        if !has_swapchain {
            return Err(VulkanError::InitializationFailed("swapchain extension not supported".to_string()));
        }

        let formats = unsafe { surface_loader.get_physical_device_surface_formats(device, surface) }.map_err(VulkanError::Api)?;
        let present_modes =
            unsafe { surface_loader.get_physical_device_surface_present_modes(device, surface) }.map_err(VulkanError::Api)?;
        if formats.is_empty() || present_modes.is_empty() {
            return Err(VulkanError::InitializationFailed("surface has no formats or present modes".to_string()));
        }
        if features.sampler_anisotropy == vk::FALSE {
            return Err(VulkanError::InitializationFailed("sampler anisotropy not supported".to_string()));
        }

        Ok(Self {
            device,
            properties,
            features,
            graphics_family,
            present_family,
        })
    }

    /// Distinct queue families to create queues for
    pub fn unique_families(&self) -> Vec<u32> {
        let families: HashSet<u32> = [self.graphics_family, self.present_family].into_iter().collect();
        let mut families: Vec<u32> = families.into_iter().collect();
        families.sort_unstable();
        families
    }
}

fn device_name(properties: &vk::PhysicalDeviceProperties) -> String {
    unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}
