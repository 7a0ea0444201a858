// Surface - the window's presentable target
//
// Wraps VkSurfaceKHR creation through ash-window so the platform specific
// surface extension (Win32, Xlib, Xcb, Wayland, Metal) is chosen for us.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use winit::raw_window_handle_05::{HasRawDisplayHandle, HasRawWindowHandle};
use winit::window::Window;

use super::VulkanInstance;

/// What the surface supports on a given physical device
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

pub struct Surface {
    pub surface: vk::SurfaceKHR,
    pub loader: ash::extensions::khr::Surface,
    // Outlives the surface
    _instance: Arc<VulkanInstance>,
}

impl Surface {
    pub fn new(instance: Arc<VulkanInstance>, window: &Window) -> Result<Self> {
        let surface = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;

        let loader = ash::extensions::khr::Surface::new(&instance.entry, &instance.instance);

        log::info!("Created window surface");
        Ok(Self {
            surface,
            loader,
            _instance: instance,
        })
    }

    pub fn supports_queue_family(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<bool> {
        let supported = unsafe {
            self.loader.get_physical_device_surface_support(
                physical_device,
                queue_family,
                self.surface,
            )
        }
        .context("Failed to query surface support")?;
        Ok(supported)
    }

    pub fn support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .loader
                    .get_physical_device_surface_capabilities(physical_device, self.surface)
                    .context("Failed to query surface capabilities")?,
                formats: self
                    .loader
                    .get_physical_device_surface_formats(physical_device, self.surface)
                    .context("Failed to query surface formats")?,
                present_modes: self
                    .loader
                    .get_physical_device_surface_present_modes(physical_device, self.surface)
                    .context("Failed to query surface present modes")?,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        log::debug!("Destroying surface");
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
    }
}
