// Vulkan Instance - Connection to the loader
//
// Responsibilities:
// - Loading the Vulkan library
// - Layer / extension discovery
// - Instance creation (optionally with surface extensions for a window)
// - Validation messages routed into `log`

use anyhow::{Context, Result};
use ash::{vk, Entry};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;
use winit::raw_window_handle_05::RawDisplayHandle;

use crate::config::ApplicationConfig;

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// A layer as reported by the loader or a physical device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    pub name: String,
    pub description: String,
    pub spec_version: u32,
    pub implementation_version: u32,
}

impl From<&vk::LayerProperties> for LayerInfo {
    fn from(props: &vk::LayerProperties) -> Self {
        Self {
            name: fixed_str(&props.layer_name),
            description: fixed_str(&props.description),
            spec_version: props.spec_version,
            implementation_version: props.implementation_version,
        }
    }
}

/// An extension as reported by the loader or a physical device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionInfo {
    pub name: String,
    pub spec_version: u32,
}

impl From<&vk::ExtensionProperties> for ExtensionInfo {
    fn from(props: &vk::ExtensionProperties) -> Self {
        Self {
            name: fixed_str(&props.extension_name),
            spec_version: props.spec_version,
        }
    }
}

/// Read a NUL terminated name out of one of Vulkan's fixed size char arrays.
pub fn fixed_str(raw: &[c_char]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Vulkan instance wrapper with automatic cleanup
pub struct VulkanInstance {
    pub instance: ash::Instance,
    pub entry: Entry,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub validation: bool,
}

impl VulkanInstance {
    /// Create the instance.
    ///
    /// `display` is the window system's display handle. When given, the
    /// surface extensions that display needs are enabled so a surface can
    /// be created later; without it the instance can only be used for
    /// enumeration and off-screen work.
    pub fn new(
        app: &ApplicationConfig,
        enable_validation: bool,
        display: Option<RawDisplayHandle>,
    ) -> Result<Arc<Self>> {
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let validation = enable_validation && Self::validation_available(&entry);

        let instance = Self::create_instance(&entry, app, validation, display)?;

        let debug_utils = if validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        log::info!("Created Vulkan instance for '{}'", app.name);

        Ok(Arc::new(Self {
            instance,
            entry,
            debug_utils,
            validation,
        }))
    }

    fn validation_available(entry: &Entry) -> bool {
        match available_layers(entry) {
            Ok(layers) => {
                let wanted = VALIDATION_LAYER.to_string_lossy();
                if layers.iter().any(|l| l.name == wanted) {
                    true
                } else {
                    log::warn!("{} is not installed, running without validation", wanted);
                    false
                }
            }
            Err(e) => {
                log::warn!("Could not enumerate instance layers: {:#}", e);
                false
            }
        }
    }

    fn create_instance(
        entry: &Entry,
        app: &ApplicationConfig,
        validation: bool,
        display: Option<RawDisplayHandle>,
    ) -> Result<ash::Instance> {
        let app_name = CString::new(app.name.as_str())?;
        let engine_name = CString::new(app.engine_name.as_str())?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(app.api_version())
            .engine_name(&engine_name)
            .engine_version(app.engine_api_version())
            .api_version(vk::API_VERSION_1_0);

        let mut extensions: Vec<*const c_char> = Vec::new();
        if let Some(display) = display {
            let required = ash_window::enumerate_required_extensions(display)
                .context("Failed to query surface extensions for this display")?;
            extensions.extend_from_slice(required);
        }
        if validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    pub fn physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>> {
        let devices = unsafe { self.instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;
        log::info!("Found {} physical device(s)", devices.len());
        Ok(devices)
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        log::debug!("Destroying Vulkan instance");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Layers the loader can enable on an instance
pub fn available_layers(entry: &Entry) -> Result<Vec<LayerInfo>> {
    let layers = entry
        .enumerate_instance_layer_properties()
        .context("Failed to enumerate instance layers")?;
    Ok(layers.iter().map(LayerInfo::from).collect())
}

/// Instance level extensions provided by the loader and implicit layers
pub fn available_extensions(entry: &Entry) -> Result<Vec<ExtensionInfo>> {
    let extensions = entry
        .enumerate_instance_extension_properties(None)
        .context("Failed to enumerate instance extensions")?;
    Ok(extensions.iter().map(ExtensionInfo::from).collect())
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw<const N: usize>(s: &str) -> [c_char; N] {
        let mut out = [0 as c_char; N];
        for (dst, b) in out.iter_mut().zip(s.bytes()) {
            *dst = b as c_char;
        }
        out
    }

    #[test]
    fn fixed_str_stops_at_nul() {
        let name: [c_char; 16] = raw("VK_KHR_surface");
        assert_eq!(fixed_str(&name), "VK_KHR_surface");
        assert_eq!(fixed_str(&[0 as c_char; 4]), "");
    }

    #[test]
    fn layer_info_from_properties() {
        let props = vk::LayerProperties {
            layer_name: raw("VK_LAYER_KHRONOS_validation"),
            spec_version: vk::make_api_version(0, 1, 3, 0),
            implementation_version: 1,
            description: raw("Khronos Validation Layer"),
        };
        let info = LayerInfo::from(&props);
        assert_eq!(info.name, VALIDATION_LAYER.to_string_lossy());
        assert_eq!(info.description, "Khronos Validation Layer");
        assert_eq!(info.implementation_version, 1);
    }

    #[test]
    fn extension_info_from_properties() {
        let props = vk::ExtensionProperties {
            extension_name: raw("VK_KHR_swapchain"),
            spec_version: 70,
        };
        let info = ExtensionInfo::from(&props);
        assert_eq!(info.name, "VK_KHR_swapchain");
        assert_eq!(info.spec_version, 70);
    }

    // Minimal loader: one layer, one extension, nothing else
    unsafe extern "system" fn fake_layers(
        count: *mut u32,
        data: *mut vk::LayerProperties,
    ) -> vk::Result {
        if !data.is_null() {
            *data = vk::LayerProperties {
                layer_name: raw("VK_LAYER_KHRONOS_validation"),
                spec_version: vk::make_api_version(0, 1, 3, 0),
                implementation_version: 1,
                description: raw("Khronos Validation Layer"),
            };
        }
        *count = 1;
        vk::Result::SUCCESS
    }

    unsafe extern "system" fn fake_extensions(
        _layer: *const c_char,
        count: *mut u32,
        data: *mut vk::ExtensionProperties,
    ) -> vk::Result {
        if !data.is_null() {
            *data = vk::ExtensionProperties {
                extension_name: raw("VK_KHR_surface"),
                spec_version: 25,
            };
        }
        *count = 1;
        vk::Result::SUCCESS
    }

    unsafe extern "system" fn fake_proc_addr(
        _instance: vk::Instance,
        name: *const c_char,
    ) -> vk::PFN_vkVoidFunction {
        match CStr::from_ptr(name).to_bytes() {
            b"vkEnumerateInstanceLayerProperties" => Some(std::mem::transmute(
                fake_layers as vk::PFN_vkEnumerateInstanceLayerProperties,
            )),
            b"vkEnumerateInstanceExtensionProperties" => Some(std::mem::transmute(
                fake_extensions as vk::PFN_vkEnumerateInstanceExtensionProperties,
            )),
            _ => None,
        }
    }

    fn fake_entry() -> Entry {
        unsafe {
            Entry::from_static_fn(vk::StaticFn {
                get_instance_proc_addr: fake_proc_addr,
            })
        }
    }

    #[test]
    fn available_layers_reads_loader_list() {
        let layers = available_layers(&fake_entry()).unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].name, "VK_LAYER_KHRONOS_validation");
        assert_eq!(layers[0].description, "Khronos Validation Layer");
    }

    #[test]
    fn available_extensions_reads_loader_list() {
        let extensions = available_extensions(&fake_entry()).unwrap();
        assert_eq!(extensions.len(), 1);
        assert_eq!(extensions[0].name, "VK_KHR_surface");
        assert_eq!(extensions[0].spec_version, 25);
    }
}
