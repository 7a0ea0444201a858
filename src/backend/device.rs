// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device inspection (properties, features, memory, queues)
// - Physical device selection (configurable, index 0 by default)
// - Logical device + queue creation
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use std::ffi::CStr;
use std::sync::Arc;

use super::instance::{ExtensionInfo, LayerInfo, VulkanInstance};
use super::surface::Surface;
use crate::config::DeviceSelection;

/// Everything the driver tells us about one physical device
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub extensions: Vec<ExtensionInfo>,
    pub layers: Vec<LayerInfo>,
}

impl PhysicalDeviceInfo {
    pub fn query(instance: &ash::Instance, handle: vk::PhysicalDevice) -> Result<Self> {
        unsafe {
            let extensions = instance
                .enumerate_device_extension_properties(handle)
                .context("Failed to enumerate device extensions")?;
            let layers = instance
                .enumerate_device_layer_properties(handle)
                .context("Failed to enumerate device layers")?;

            Ok(Self {
                handle,
                properties: instance.get_physical_device_properties(handle),
                features: instance.get_physical_device_features(handle),
                memory_properties: instance.get_physical_device_memory_properties(handle),
                queue_families: instance.get_physical_device_queue_family_properties(handle),
                extensions: extensions.iter().map(ExtensionInfo::from).collect(),
                layers: layers.iter().map(LayerInfo::from).collect(),
            })
        }
    }

    pub fn name(&self) -> String {
        super::instance::fixed_str(&self.properties.device_name)
    }

    pub fn candidate(&self) -> DeviceCandidate {
        DeviceCandidate {
            device_type: self.properties.device_type,
            graphics_family: find_graphics_queue_family(&self.queue_families, |_| true),
        }
    }

    pub fn supports_extension(&self, name: &CStr) -> bool {
        let name = name.to_string_lossy();
        self.extensions.iter().any(|e| e.name == name)
    }
}

/// The part of a physical device that selection looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub device_type: vk::PhysicalDeviceType,
    pub graphics_family: Option<u32>,
}

/// Pick a device out of the enumeration order.
///
/// Devices without a graphics queue family are never returned.
pub fn select_device(candidates: &[DeviceCandidate], selection: DeviceSelection) -> Result<usize> {
    if candidates.is_empty() {
        anyhow::bail!("No Vulkan-capable GPU found");
    }

    match selection {
        DeviceSelection::Index(index) => {
            let candidate = candidates.get(index).with_context(|| {
                format!(
                    "Device index {} is out of range ({} device(s) present)",
                    index,
                    candidates.len()
                )
            })?;
            if candidate.graphics_family.is_none() {
                anyhow::bail!("Device {} has no graphics-capable queue family", index);
            }
            Ok(index)
        }
        DeviceSelection::Prefer(preferred) => {
            let mut best: Option<(usize, u32)> = None;
            for (index, candidate) in candidates.iter().enumerate() {
                if candidate.graphics_family.is_none() {
                    continue;
                }
                let score = device_score(candidate.device_type, preferred);
                // Strictly greater keeps the lower index on ties
                if best.map_or(true, |(_, best_score)| score > best_score) {
                    best = Some((index, score));
                }
            }
            best.map(|(index, _)| index)
                .ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
        }
    }
}

fn device_score(device_type: vk::PhysicalDeviceType, preferred: vk::PhysicalDeviceType) -> u32 {
    if device_type == preferred {
        return 1000;
    }
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 100,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 10,
        _ => 1,
    }
}

/// First queue family with graphics support that also passes `can_present`.
pub fn find_graphics_queue_family(
    families: &[vk::QueueFamilyProperties],
    mut can_present: impl FnMut(u32) -> bool,
) -> Option<u32> {
    families
        .iter()
        .enumerate()
        .filter(|(_, props)| props.queue_count > 0)
        .filter(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|(i, _)| i as u32)
        .find(|&i| can_present(i))
}

/// Graphics family to report for a surface, and whether it can present.
///
/// A presenting graphics family wins. Without one the first graphics family
/// is returned with `false`.
pub fn presentation_family(
    families: &[vk::QueueFamilyProperties],
    mut can_present: impl FnMut(u32) -> bool,
) -> Option<(u32, bool)> {
    if let Some(family) = find_graphics_queue_family(families, &mut can_present) {
        return Some((family, true));
    }
    find_graphics_queue_family(families, |_| true).map(|family| (family, false))
}

/// Optional features we turn on when the device has them
fn enabled_features(supported: &vk::PhysicalDeviceFeatures) -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures {
        shader_clip_distance: supported.shader_clip_distance,
        ..Default::default()
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Taken out and dropped before the device goes away
    allocator: Mutex<Option<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: Arc<VulkanInstance>,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Select a physical device and create the logical device on it.
    ///
    /// With a `surface` the queue family must be able to present to it and
    /// the swapchain extension is enabled.
    pub fn new(
        instance: Arc<VulkanInstance>,
        selection: DeviceSelection,
        surface: Option<&Surface>,
    ) -> Result<Arc<Self>> {
        // Step 1: Inspect every GPU
        let infos = instance
            .physical_devices()?
            .into_iter()
            .map(|pd| PhysicalDeviceInfo::query(&instance.instance, pd))
            .collect::<Result<Vec<_>>>()?;

        // Step 2: Pick one
        let candidates: Vec<_> = infos.iter().map(PhysicalDeviceInfo::candidate).collect();
        let index = select_device(&candidates, selection)?;
        let info = &infos[index];

        // Step 3: Pick a queue family (presentation support is per family)
        let graphics_queue_family = match surface {
            Some(surface) => {
                let mut support_error = None;
                let family = find_graphics_queue_family(&info.queue_families, |family| {
                    match surface.supports_queue_family(info.handle, family) {
                        Ok(supported) => supported,
                        Err(e) => {
                            support_error.get_or_insert(e);
                            false
                        }
                    }
                });
                if let Some(e) = support_error {
                    return Err(e);
                }
                family.context("GPU doesn't support presenting to this surface")?
            }
            None => find_graphics_queue_family(&info.queue_families, |_| true)
                .context("Selected GPU has no graphics queue family")?,
        };

        log::info!(
            "Selected GPU {}: {} (queue family {})",
            index,
            info.name(),
            graphics_queue_family
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(info.properties.api_version),
            vk::api_version_minor(info.properties.api_version),
            vk::api_version_patch(info.properties.api_version)
        );

        // Step 4: Create logical device
        let swapchain_ext = ash::extensions::khr::Swapchain::name();
        if surface.is_some() && !info.supports_extension(swapchain_ext) {
            anyhow::bail!("Selected GPU does not support {:?}", swapchain_ext);
        }
        let (device, graphics_queue) = Self::create_logical_device(
            &instance.instance,
            info,
            graphics_queue_family,
            surface.is_some(),
        )?;

        // Step 5: Create memory allocator
        let allocator = Self::create_allocator(&instance.instance, info.handle, &device)
            .map_err(|e| {
                unsafe { device.destroy_device(None) };
                e
            })?;

        Ok(Arc::new(Self {
            allocator: Mutex::new(Some(allocator)),
            device,
            physical_device: info.handle,
            instance,
            graphics_queue,
            graphics_queue_family,
            properties: info.properties,
            memory_properties: info.memory_properties,
        }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        info: &PhysicalDeviceInfo,
        graphics_queue_family: u32,
        enable_swapchain: bool,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let mut extensions = Vec::new();
        if enable_swapchain {
            extensions.push(ash::extensions::khr::Swapchain::name().as_ptr());
        }

        let features = enabled_features(&info.features);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(info.handle, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        log::info!("Created logical device");
        Ok((device, graphics_queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        Ok(allocator)
    }

    /// Lock the memory allocator
    pub fn allocator(&self) -> Result<parking_lot::MappedMutexGuard<'_, Allocator>> {
        MutexGuard::try_map(self.allocator.lock(), |a| a.as_mut())
            .map_err(|_| anyhow::anyhow!("Memory allocator already released"))
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("vkDeviceWaitIdle failed")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Allocator frees its memory blocks through the device
        drop(self.allocator.lock().take());

        unsafe {
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(device_type: vk::PhysicalDeviceType, graphics: bool) -> DeviceCandidate {
        DeviceCandidate {
            device_type,
            graphics_family: graphics.then_some(0),
        }
    }

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn empty_list_is_an_error() {
        assert!(select_device(&[], DeviceSelection::Index(0)).is_err());
        let prefer = DeviceSelection::Prefer(vk::PhysicalDeviceType::DISCRETE_GPU);
        assert!(select_device(&[], prefer).is_err());
    }

    #[test]
    fn index_selection_defaults_to_first() {
        let devices = [
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, true),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, true),
        ];
        assert_eq!(select_device(&devices, DeviceSelection::Index(0)).unwrap(), 0);
        assert_eq!(select_device(&devices, DeviceSelection::Index(1)).unwrap(), 1);
    }

    #[test]
    fn index_out_of_range_is_an_error() {
        let devices = [candidate(vk::PhysicalDeviceType::DISCRETE_GPU, true)];
        let err = select_device(&devices, DeviceSelection::Index(3)).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn index_without_graphics_is_an_error() {
        let devices = [candidate(vk::PhysicalDeviceType::CPU, false)];
        assert!(select_device(&devices, DeviceSelection::Index(0)).is_err());
    }

    #[test]
    fn preference_picks_matching_type() {
        let devices = [
            candidate(vk::PhysicalDeviceType::CPU, true),
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, true),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, true),
        ];
        let discrete = DeviceSelection::Prefer(vk::PhysicalDeviceType::DISCRETE_GPU);
        let integrated = DeviceSelection::Prefer(vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert_eq!(select_device(&devices, discrete).unwrap(), 2);
        assert_eq!(select_device(&devices, integrated).unwrap(), 1);
    }

    #[test]
    fn preference_falls_back_to_discrete_then_lower_index() {
        let devices = [
            candidate(vk::PhysicalDeviceType::VIRTUAL_GPU, true),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, true),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, true),
        ];
        let integrated = DeviceSelection::Prefer(vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert_eq!(select_device(&devices, integrated).unwrap(), 1);
    }

    #[test]
    fn preference_skips_devices_without_graphics() {
        let devices = [
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, false),
            candidate(vk::PhysicalDeviceType::CPU, true),
        ];
        let discrete = DeviceSelection::Prefer(vk::PhysicalDeviceType::DISCRETE_GPU);
        assert_eq!(select_device(&devices, discrete).unwrap(), 1);

        let none = [candidate(vk::PhysicalDeviceType::DISCRETE_GPU, false)];
        assert!(select_device(&none, discrete).is_err());
    }

    #[test]
    fn graphics_family_is_first_capable_one() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 2),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 16),
            family(vk::QueueFlags::GRAPHICS, 1),
        ];
        assert_eq!(find_graphics_queue_family(&families, |_| true), Some(1));
        assert_eq!(find_graphics_queue_family(&families, |i| i == 2), Some(2));
        assert_eq!(find_graphics_queue_family(&families, |_| false), None);
    }

    #[test]
    fn presentation_family_reports_missing_support() {
        let families = [
            family(vk::QueueFlags::COMPUTE, 4),
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::GRAPHICS, 1),
        ];
        assert_eq!(presentation_family(&families, |_| false), Some((1, false)));
        assert_eq!(presentation_family(&families, |i| i == 2), Some((2, true)));
        assert_eq!(presentation_family(&families, |_| true), Some((1, true)));
        assert_eq!(presentation_family(&families[..1], |_| true), None);
    }

    #[test]
    fn empty_families_are_ignored() {
        let families = [family(vk::QueueFlags::GRAPHICS, 0)];
        assert_eq!(find_graphics_queue_family(&families, |_| true), None);
    }

    #[test]
    fn only_supported_optional_features_are_enabled() {
        let supported = vk::PhysicalDeviceFeatures {
            shader_clip_distance: vk::TRUE,
            geometry_shader: vk::TRUE,
            ..Default::default()
        };
        let enabled = enabled_features(&supported);
        assert_eq!(enabled.shader_clip_distance, vk::TRUE);
        assert_eq!(enabled.geometry_shader, vk::FALSE);
        assert_eq!(enabled_features(&Default::default()).shader_clip_distance, vk::FALSE);
    }
}
