//! Vulkan instance creation and adapter selection
//!
//! The factory owns the instance-level state (entry, instance, debug
//! messenger) until a [`crate::device::Device`] is created from it.

use std::ffi::{CStr, CString};

use ash::extensions::ext::DebugUtils;
use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::config::GraphicsConfig;
use crate::error::{GfxResult, GraphicsError};

/// Required device extensions beyond Vulkan 1.2 core
pub(crate) const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 2] = [
    ash::extensions::khr::Swapchain::name(),
    vk::KhrDynamicRenderingFn::name(),
];

/// Instance-level bootstrap: entry, instance, optional debug messenger
pub struct DeviceFactory {
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) debug_utils: Option<DebugUtils>,
    pub(crate) debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

/// Selected physical adapter and its queue family table
pub(crate) struct AdapterInfo {
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub graphics_family: u32,
    pub compute_family: u32,
    pub transfer_family: u32,
    pub supports_mesh_shading: bool,
}

impl DeviceFactory {
    /// Create the Vulkan instance.
    ///
    /// `display` supplies the platform surface extensions when the runtime
    /// will present to a window; headless use passes `None`.
    pub fn new(config: &GraphicsConfig, display: Option<RawDisplayHandle>) -> GfxResult<Self> {
        config.validate()?;

        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GraphicsError::InitializationFailed(format!("failed to load Vulkan: {e:?}")))?;

        let app_name = CString::new("render_engine").unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&app_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions: Vec<*const i8> = Vec::new();
        if let Some(display) = display {
            let surface_extensions = ash_window::enumerate_required_extensions(display)
                .map_err(GraphicsError::Api)?;
            extensions.extend_from_slice(surface_extensions);
        }
        if config.enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if config.enable_validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()]
        } else {
            vec![]
        };
        let layer_name_ptrs: Vec<*const i8> = layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(|e| GraphicsError::InitializationFailed(format!("vkCreateInstance failed: {e:?}")))?
        };

        let (debug_utils, debug_messenger) = if config.enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let messenger = Self::create_debug_messenger(&debug_utils)?;
            (Some(debug_utils), Some(messenger))
        } else {
            (None, None)
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
            debug_messenger,
        })
    }

    fn create_debug_messenger(debug_utils: &DebugUtils) -> GfxResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(GraphicsError::Api)
        }
    }

    /// Pick the physical adapter: discrete GPUs first, then anything that
    /// carries the required extensions and a graphics queue.
    pub(crate) fn select_adapter(&self) -> GfxResult<AdapterInfo> {
        let devices = unsafe {
            self.instance
                .enumerate_physical_devices()
                .map_err(GraphicsError::Api)?
        };

        let mut fallback: Option<AdapterInfo> = None;
        for device in devices {
            let Some(info) = self.evaluate_adapter(device) else {
                continue;
            };
            if info.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
                log_adapter(&info);
                return Ok(info);
            }
            if fallback.is_none() {
                fallback = Some(info);
            }
        }

        match fallback {
            Some(info) => {
                log_adapter(&info);
                Ok(info)
            }
            None => Err(GraphicsError::InitializationFailed(
                "no suitable GPU found".to_string(),
            )),
        }
    }

    fn evaluate_adapter(&self, device: vk::PhysicalDevice) -> Option<AdapterInfo> {
        let properties = unsafe { self.instance.get_physical_device_properties(device) };
        if vk::api_version_minor(properties.api_version) < 2
            && vk::api_version_major(properties.api_version) == 1
        {
            return None;
        }

        let extensions = unsafe {
            self.instance
                .enumerate_device_extension_properties(device)
                .ok()?
        };
        let has_extension = |name: &CStr| {
            extensions.iter().any(|ext| {
                let ext_name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
                ext_name == name
            })
        };
        if !REQUIRED_DEVICE_EXTENSIONS.iter().all(|&name| has_extension(name)) {
            return None;
        }
        let supports_mesh_shading = has_extension(vk::ExtMeshShaderFn::name());

        let families = unsafe {
            self.instance
                .get_physical_device_queue_family_properties(device)
        };

        let find_family = |required: vk::QueueFlags, excluded: vk::QueueFlags| {
            families.iter().enumerate().find_map(|(index, family)| {
                let flags = family.queue_flags;
                (flags.contains(required) && !flags.intersects(excluded)).then_some(index as u32)
            })
        };

        let graphics_family =
            find_family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, vk::QueueFlags::empty())?;
        // Dedicated families are preferred; both fall back to the graphics
        // family on hardware that exposes a single universal queue.
        let compute_family = find_family(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS)
            .unwrap_or(graphics_family);
        let transfer_family = find_family(
            vk::QueueFlags::TRANSFER,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        )
        .unwrap_or(graphics_family);

        Some(AdapterInfo {
            physical_device: device,
            properties,
            graphics_family,
            compute_family,
            transfer_family,
            supports_mesh_shading,
        })
    }
}

impl Drop for DeviceFactory {
    fn drop(&mut self) {
        unsafe {
            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger) {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn log_adapter(info: &AdapterInfo) {
    let name = unsafe { CStr::from_ptr(info.properties.device_name.as_ptr()) };
    log::info!(
        "Selected GPU: {} (graphics family {}, compute family {}, transfer family {})",
        name.to_string_lossy(),
        info.graphics_family,
        info.compute_family,
        info.transfer_family
    );
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}
