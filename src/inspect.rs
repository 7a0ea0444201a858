// =============================================================================
// INSPECTION COMMANDS - No window required
// =============================================================================
//
// `layers`, `devices`, `formats` and `probe` each build only as much of the
// Vulkan stack as they need, print a report, and tear it down again.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Write;
use std::sync::Arc;

use crate::backend::device::{select_device, PhysicalDeviceInfo};
use crate::backend::instance::{available_extensions, available_layers};
use crate::backend::probe::{self, image_format_properties};
use crate::backend::{VulkanDevice, VulkanInstance};
use crate::config::Config;
use crate::report;

/// Formats checked by the `formats` command
pub const CANDIDATE_FORMATS: [vk::Format; 32] = [
    vk::Format::R8_UNORM,
    vk::Format::R8_SNORM,
    vk::Format::R8_UINT,
    vk::Format::R8_SRGB,
    vk::Format::R8G8_UNORM,
    vk::Format::R8G8_UINT,
    vk::Format::R8G8B8_UNORM,
    vk::Format::B8G8R8_UNORM,
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::R8G8B8A8_SNORM,
    vk::Format::R8G8B8A8_UINT,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::A2B10G10R10_UNORM_PACK32,
    vk::Format::R5G6B5_UNORM_PACK16,
    vk::Format::R16_UNORM,
    vk::Format::R16_SFLOAT,
    vk::Format::R16G16_SFLOAT,
    vk::Format::R16G16B16A16_UNORM,
    vk::Format::R16G16B16A16_SFLOAT,
    vk::Format::R32_UINT,
    vk::Format::R32_SFLOAT,
    vk::Format::R32G32_SFLOAT,
    vk::Format::R32G32B32_SFLOAT,
    vk::Format::R32G32B32A32_SFLOAT,
    vk::Format::B10G11R11_UFLOAT_PACK32,
    vk::Format::E5B9G9R9_UFLOAT_PACK32,
    vk::Format::D16_UNORM,
    vk::Format::D32_SFLOAT,
    vk::Format::BC1_RGB_UNORM_BLOCK,
    vk::Format::ETC2_R8G8B8_UNORM_BLOCK,
];

/// Image types checked by the `formats` command, in report order
pub const CANDIDATE_IMAGE_TYPES: [vk::ImageType; 2] = [vk::ImageType::TYPE_2D, vk::ImageType::TYPE_3D];

/// Support of one format for one image type
#[derive(Debug, Clone)]
pub struct FormatSupport {
    pub format: vk::Format,
    pub image_type: vk::ImageType,
    /// `None` when LINEAR + COLOR_ATTACHMENT is unsupported for this combination
    pub properties: Option<vk::ImageFormatProperties>,
    pub format_properties: vk::FormatProperties,
}

fn create_instance(config: &Config) -> Result<Arc<VulkanInstance>> {
    VulkanInstance::new(&config.application, config.enable_validation(), None)
}

fn query_devices(instance: &VulkanInstance) -> Result<Vec<PhysicalDeviceInfo>> {
    instance
        .physical_devices()?
        .into_iter()
        .map(|pd| PhysicalDeviceInfo::query(&instance.instance, pd))
        .collect()
}

fn select(config: &Config, infos: &[PhysicalDeviceInfo]) -> Result<usize> {
    let candidates: Vec<_> = infos.iter().map(PhysicalDeviceInfo::candidate).collect();
    select_device(&candidates, config.device_selection())
}

/// List instance layers and extensions, then prove an instance can be made
pub fn layers<W: Write>(config: &Config, out: &mut W) -> Result<()> {
    let entry = unsafe { ash::Entry::load() }
        .context("Failed to load Vulkan library. Is Vulkan installed?")?;

    let layers = available_layers(&entry)?;
    let extensions = available_extensions(&entry)?;
    report::write_layers(out, &layers)?;
    report::write_extensions(out, "Instance extensions", &extensions)?;

    let instance = create_instance(config)?;
    writeln!(
        out,
        "Instance created and destroyed (validation {})",
        if instance.validation { "on" } else { "off" }
    )?;
    drop(instance);
    Ok(())
}

/// Report every physical device and mark the one that would be selected
pub fn devices<W: Write>(config: &Config, out: &mut W) -> Result<()> {
    let instance = create_instance(config)?;
    let infos = query_devices(&instance)?;

    let selected = match select(config, &infos) {
        Ok(index) => Some(index),
        Err(e) => {
            log::warn!("No device would be selected: {:#}", e);
            None
        }
    };

    writeln!(out, "{} physical device(s)", infos.len())?;
    for (index, info) in infos.iter().enumerate() {
        writeln!(out)?;
        report::write_device(out, index, info, selected == Some(index))?;
    }
    Ok(())
}

/// Query the candidate format table on the selected device
pub fn formats<W: Write>(config: &Config, out: &mut W) -> Result<()> {
    let instance = create_instance(config)?;
    let infos = query_devices(&instance)?;
    let info = &infos[select(config, &infos)?];

    let mut support = Vec::with_capacity(CANDIDATE_FORMATS.len() * CANDIDATE_IMAGE_TYPES.len());
    for image_type in CANDIDATE_IMAGE_TYPES {
        for format in CANDIDATE_FORMATS {
            let properties = image_format_properties(
                &instance.instance,
                info.handle,
                format,
                image_type,
                vk::ImageTiling::LINEAR,
                vk::ImageUsageFlags::COLOR_ATTACHMENT,
            )?;
            let format_properties = unsafe {
                instance
                    .instance
                    .get_physical_device_format_properties(info.handle, format)
            };
            support.push(FormatSupport {
                format,
                image_type,
                properties,
                format_properties,
            });
        }
    }

    report::write_format_support(out, &info.name(), &support)?;
    Ok(())
}

/// Create a headless device and walk buffers, images, memory and commands
pub fn probe<W: Write>(config: &Config, out: &mut W) -> Result<()> {
    let instance = create_instance(config)?;
    let device = VulkanDevice::new(instance, config.device_selection(), None)?;
    let name = crate::backend::instance::fixed_str(&device.properties.device_name);

    let findings = probe::run(&device, &name)?;
    report::write_probe(out, &findings)?;
    Ok(())
}
