// Report formatting for the inspection commands
//
// Everything here writes plain text to any `io::Write`, stdout in practice
// and a `Vec<u8>` in tests. Nothing in this module talks to the driver.

use ash::vk;
use std::io::{self, Write};

use crate::backend::device::PhysicalDeviceInfo;
use crate::backend::instance::{ExtensionInfo, LayerInfo};
use crate::backend::probe::{ProbeReport, ResourceMemory};
use crate::backend::surface::SurfaceSupport;
use crate::inspect::FormatSupport;

/// "major.minor.patch" of a packed Vulkan version
pub fn version_string(version: u32) -> String {
    format!(
        "{}.{}.{}",
        vk::api_version_major(version),
        vk::api_version_minor(version),
        vk::api_version_patch(version)
    )
}

pub fn device_type_name(device_type: vk::PhysicalDeviceType) -> &'static str {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => "discrete GPU",
        vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated GPU",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual GPU",
        vk::PhysicalDeviceType::CPU => "CPU",
        _ => "other",
    }
}

fn join_flags(names: Vec<&'static str>) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(" | ")
    }
}

pub fn queue_flag_names(flags: vk::QueueFlags) -> String {
    let known = [
        (vk::QueueFlags::GRAPHICS, "GRAPHICS"),
        (vk::QueueFlags::COMPUTE, "COMPUTE"),
        (vk::QueueFlags::TRANSFER, "TRANSFER"),
        (vk::QueueFlags::SPARSE_BINDING, "SPARSE_BINDING"),
        (vk::QueueFlags::PROTECTED, "PROTECTED"),
    ];
    join_flags(
        known
            .into_iter()
            .filter(|(flag, _)| flags.contains(*flag))
            .map(|(_, name)| name)
            .collect(),
    )
}

pub fn memory_property_names(flags: vk::MemoryPropertyFlags) -> String {
    let known = [
        (vk::MemoryPropertyFlags::DEVICE_LOCAL, "DEVICE_LOCAL"),
        (vk::MemoryPropertyFlags::HOST_VISIBLE, "HOST_VISIBLE"),
        (vk::MemoryPropertyFlags::HOST_COHERENT, "HOST_COHERENT"),
        (vk::MemoryPropertyFlags::HOST_CACHED, "HOST_CACHED"),
        (vk::MemoryPropertyFlags::LAZILY_ALLOCATED, "LAZILY_ALLOCATED"),
        (vk::MemoryPropertyFlags::PROTECTED, "PROTECTED"),
    ];
    join_flags(
        known
            .into_iter()
            .filter(|(flag, _)| flags.contains(*flag))
            .map(|(_, name)| name)
            .collect(),
    )
}

fn memory_heap_names(flags: vk::MemoryHeapFlags) -> String {
    let known = [
        (vk::MemoryHeapFlags::DEVICE_LOCAL, "DEVICE_LOCAL"),
        (vk::MemoryHeapFlags::MULTI_INSTANCE, "MULTI_INSTANCE"),
    ];
    join_flags(
        known
            .into_iter()
            .filter(|(flag, _)| flags.contains(*flag))
            .map(|(_, name)| name)
            .collect(),
    )
}

fn format_feature_names(flags: vk::FormatFeatureFlags) -> String {
    if flags.is_empty() {
        "none".to_string()
    } else {
        format!("{:?}", flags)
    }
}

macro_rules! feature_table {
    ($features:expr; $($name:ident),* $(,)?) => {
        [$((stringify!($name), $features.$name)),*]
    };
}

/// Names of the commonly relevant features the device reports as supported
pub fn enabled_feature_names(features: &vk::PhysicalDeviceFeatures) -> Vec<&'static str> {
    let table = feature_table!(features;
        robust_buffer_access,
        full_draw_index_uint32,
        image_cube_array,
        independent_blend,
        geometry_shader,
        tessellation_shader,
        sample_rate_shading,
        dual_src_blend,
        logic_op,
        multi_draw_indirect,
        depth_clamp,
        depth_bias_clamp,
        fill_mode_non_solid,
        wide_lines,
        large_points,
        multi_viewport,
        sampler_anisotropy,
        texture_compression_etc2,
        texture_compression_astc_ldr,
        texture_compression_bc,
        occlusion_query_precise,
        pipeline_statistics_query,
        vertex_pipeline_stores_and_atomics,
        fragment_stores_and_atomics,
        shader_image_gather_extended,
        shader_storage_image_extended_formats,
        shader_clip_distance,
        shader_cull_distance,
        shader_float64,
        shader_int64,
        shader_int16,
        sparse_binding,
    );
    table
        .into_iter()
        .filter(|(_, value)| *value == vk::TRUE)
        .map(|(name, _)| name)
        .collect()
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

pub fn write_layers<W: Write>(out: &mut W, layers: &[LayerInfo]) -> io::Result<()> {
    writeln!(out, "Instance layers ({}):", layers.len())?;
    for layer in layers {
        writeln!(
            out,
            "  {} (spec {}, impl {})",
            layer.name,
            version_string(layer.spec_version),
            layer.implementation_version
        )?;
        if !layer.description.is_empty() {
            writeln!(out, "      {}", layer.description)?;
        }
    }
    Ok(())
}

pub fn write_extensions<W: Write>(
    out: &mut W,
    title: &str,
    extensions: &[ExtensionInfo],
) -> io::Result<()> {
    writeln!(out, "{} ({}):", title, extensions.len())?;
    for extension in extensions {
        writeln!(out, "  {} v{}", extension.name, extension.spec_version)?;
    }
    Ok(())
}

pub fn write_device<W: Write>(
    out: &mut W,
    index: usize,
    info: &PhysicalDeviceInfo,
    selected: bool,
) -> io::Result<()> {
    let props = &info.properties;
    let marker = if selected { " [selected]" } else { "" };

    writeln!(out, "Device {}: {}{}", index, info.name(), marker)?;
    writeln!(out, "  Type:           {}", device_type_name(props.device_type))?;
    writeln!(out, "  API version:    {}", version_string(props.api_version))?;
    writeln!(
        out,
        "  Driver version: {} (0x{:08x})",
        version_string(props.driver_version),
        props.driver_version
    )?;
    writeln!(
        out,
        "  Vendor/device:  0x{:04x} / 0x{:04x}",
        props.vendor_id, props.device_id
    )?;

    let features = enabled_feature_names(&info.features);
    if features.is_empty() {
        writeln!(out, "  Features:       none of note")?;
    } else {
        writeln!(out, "  Features:       {}", features.join(", "))?;
    }

    let memory = &info.memory_properties;
    writeln!(out, "  Memory heaps ({}):", memory.memory_heap_count)?;
    for (i, heap) in memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .enumerate()
    {
        writeln!(
            out,
            "    [{}] {:.0} MiB  {}",
            i,
            mib(heap.size),
            memory_heap_names(heap.flags)
        )?;
    }
    writeln!(out, "  Memory types ({}):", memory.memory_type_count)?;
    for (i, ty) in memory
        .memory_types
        .iter()
        .take(memory.memory_type_count as usize)
        .enumerate()
    {
        writeln!(
            out,
            "    [{}] heap {}  {}",
            i,
            ty.heap_index,
            memory_property_names(ty.property_flags)
        )?;
    }

    writeln!(out, "  Queue families ({}):", info.queue_families.len())?;
    for (i, family) in info.queue_families.iter().enumerate() {
        writeln!(
            out,
            "    [{}] {} queue(s)  {}",
            i,
            family.queue_count,
            queue_flag_names(family.queue_flags)
        )?;
    }

    writeln!(out, "  Device extensions ({}):", info.extensions.len())?;
    for extension in &info.extensions {
        writeln!(out, "    {} v{}", extension.name, extension.spec_version)?;
    }
    writeln!(out, "  Device layers ({}):", info.layers.len())?;
    for layer in &info.layers {
        writeln!(out, "    {}", layer.name)?;
    }
    Ok(())
}

pub fn write_format_support<W: Write>(
    out: &mut W,
    device_name: &str,
    formats: &[FormatSupport],
) -> io::Result<()> {
    let supported = formats.iter().filter(|f| f.properties.is_some()).count();
    writeln!(
        out,
        "Image format support on {} (LINEAR tiling, COLOR_ATTACHMENT usage): {} of {} supported",
        device_name,
        supported,
        formats.len()
    )?;

    for support in formats {
        let Some(props) = &support.properties else {
            continue;
        };
        let extent = props.max_extent;
        writeln!(out, "{:?} {:?}", support.image_type, support.format)?;
        writeln!(
            out,
            "  max extent {}x{}x{}, {} mip level(s), {} array layer(s), max size {:.1} MiB",
            extent.width,
            extent.height,
            extent.depth,
            props.max_mip_levels,
            props.max_array_layers,
            mib(props.max_resource_size)
        )?;
        let features = &support.format_properties;
        writeln!(
            out,
            "  linear:  {}",
            format_feature_names(features.linear_tiling_features)
        )?;
        writeln!(
            out,
            "  optimal: {}",
            format_feature_names(features.optimal_tiling_features)
        )?;
        writeln!(
            out,
            "  buffer:  {}",
            format_feature_names(features.buffer_features)
        )?;
    }
    Ok(())
}

fn write_resource_memory<W: Write>(out: &mut W, memory: &ResourceMemory) -> io::Result<()> {
    writeln!(
        out,
        "  requirements: {} bytes, alignment {}, type bits 0b{:b}",
        memory.requirements.size,
        memory.requirements.alignment,
        memory.requirements.memory_type_bits
    )?;
    for (index, flags) in &memory.candidates {
        writeln!(
            out,
            "    candidate type [{}] {}",
            index,
            memory_property_names(*flags)
        )?;
    }
    writeln!(
        out,
        "  allocated {} bytes at offset {}",
        memory.allocation_size, memory.allocation_offset
    )
}

pub fn write_probe<W: Write>(out: &mut W, report: &ProbeReport) -> io::Result<()> {
    writeln!(
        out,
        "Resource probe on {} (queue family {})",
        report.device_name, report.queue_family
    )?;

    writeln!(
        out,
        "Buffer: {} bytes, TRANSFER_SRC | TRANSFER_DST{}",
        report.buffer_size,
        if report.buffer_zeroed { ", zeroed" } else { "" }
    )?;
    write_resource_memory(out, &report.buffer_memory)?;

    match &report.image_format_3d_linear {
        Some(props) => writeln!(
            out,
            "3D linear {:?}: max extent {}x{}x{}, {} mip level(s), max size {:.1} MiB",
            report.image_format,
            props.max_extent.width,
            props.max_extent.height,
            props.max_extent.depth,
            props.max_mip_levels,
            mib(props.max_resource_size)
        )?,
        None => writeln!(out, "3D linear {:?}: not supported", report.image_format)?,
    }

    writeln!(
        out,
        "Image: {}x{} {:?}, {} mip level(s), OPTIMAL, SAMPLED",
        report.image_extent.width,
        report.image_extent.height,
        report.image_format,
        report.image_mip_levels
    )?;
    write_resource_memory(out, &report.image_memory)?;

    writeln!(
        out,
        "Command buffers: {} primary, recorded and released",
        report.command_buffers
    )?;
    writeln!(out, "All probe resources destroyed")
}

pub fn write_surface<W: Write>(
    out: &mut W,
    queue_family: u32,
    present_supported: bool,
    support: &SurfaceSupport,
) -> io::Result<()> {
    writeln!(
        out,
        "Queue family {} can present: {}",
        queue_family,
        if present_supported { "yes" } else { "no" }
    )?;

    let caps = &support.capabilities;
    writeln!(out, "Surface capabilities:")?;
    writeln!(
        out,
        "  image count:   {} .. {}",
        caps.min_image_count,
        if caps.max_image_count == 0 {
            "unbounded".to_string()
        } else {
            caps.max_image_count.to_string()
        }
    )?;
    if caps.current_extent.width == u32::MAX {
        writeln!(out, "  current extent: decided by the swapchain")?;
    } else {
        writeln!(
            out,
            "  current extent: {}x{}",
            caps.current_extent.width, caps.current_extent.height
        )?;
    }
    writeln!(
        out,
        "  extent range:  {}x{} .. {}x{}",
        caps.min_image_extent.width,
        caps.min_image_extent.height,
        caps.max_image_extent.width,
        caps.max_image_extent.height
    )?;
    writeln!(out, "  array layers:  {}", caps.max_image_array_layers)?;
    writeln!(out, "  usage:         {:?}", caps.supported_usage_flags)?;
    writeln!(out, "  transform:     {:?}", caps.current_transform)?;

    let preferred = support.preferred_format();
    writeln!(out, "Surface formats ({}):", support.formats.len())?;
    for format in &support.formats {
        let marker = if preferred.map(|p| p.format) == Some(format.format) {
            " [preferred]"
        } else {
            ""
        };
        writeln!(
            out,
            "  {:?} {:?}{}",
            format.format, format.color_space, marker
        )?;
    }

    writeln!(out, "Present modes ({}):", support.present_modes.len())?;
    for mode in &support.present_modes {
        writeln!(out, "  {:?}", mode)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::c_char;

    fn render(write: impl FnOnce(&mut Vec<u8>) -> io::Result<()>) -> String {
        let mut buf = Vec::new();
        write(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn device_info(name: &str) -> PhysicalDeviceInfo {
        let mut properties = vk::PhysicalDeviceProperties {
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::make_api_version(0, 1, 3, 250),
            vendor_id: 0x10de,
            device_id: 0x2204,
            ..Default::default()
        };
        for (dst, b) in properties.device_name.iter_mut().zip(name.bytes()) {
            *dst = b as c_char;
        }

        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 1,
            memory_heap_count: 1,
            ..Default::default()
        };
        memory_properties.memory_heaps[0] = vk::MemoryHeap {
            size: 8 * 1024 * 1024 * 1024,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory_properties.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };

        PhysicalDeviceInfo {
            handle: vk::PhysicalDevice::null(),
            properties,
            features: vk::PhysicalDeviceFeatures {
                geometry_shader: vk::TRUE,
                sampler_anisotropy: vk::TRUE,
                ..Default::default()
            },
            memory_properties,
            queue_families: vec![vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                queue_count: 16,
                ..Default::default()
            }],
            extensions: vec![ExtensionInfo {
                name: "VK_KHR_swapchain".to_string(),
                spec_version: 70,
            }],
            layers: Vec::new(),
        }
    }

    #[test]
    fn versions_decode() {
        assert_eq!(version_string(vk::make_api_version(0, 1, 3, 250)), "1.3.250");
        assert_eq!(version_string(vk::API_VERSION_1_0), "1.0.0");
    }

    #[test]
    fn flag_names() {
        assert_eq!(
            queue_flag_names(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
            "GRAPHICS | TRANSFER"
        );
        assert_eq!(queue_flag_names(vk::QueueFlags::empty()), "none");
        assert_eq!(
            memory_property_names(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            ),
            "HOST_VISIBLE | HOST_COHERENT"
        );
        assert_eq!(memory_heap_names(vk::MemoryHeapFlags::empty()), "none");
    }

    #[test]
    fn device_type_names() {
        assert_eq!(
            device_type_name(vk::PhysicalDeviceType::INTEGRATED_GPU),
            "integrated GPU"
        );
        assert_eq!(device_type_name(vk::PhysicalDeviceType::OTHER), "other");
    }

    #[test]
    fn only_supported_features_are_named() {
        let features = vk::PhysicalDeviceFeatures {
            shader_float64: vk::TRUE,
            wide_lines: vk::TRUE,
            ..Default::default()
        };
        assert_eq!(enabled_feature_names(&features), vec!["wide_lines", "shader_float64"]);
        assert!(enabled_feature_names(&Default::default()).is_empty());
    }

    #[test]
    fn layer_report() {
        let layers = [LayerInfo {
            name: "VK_LAYER_KHRONOS_validation".to_string(),
            description: "Khronos Validation Layer".to_string(),
            spec_version: vk::make_api_version(0, 1, 3, 0),
            implementation_version: 1,
        }];
        let text = render(|out| write_layers(out, &layers));
        assert!(text.starts_with("Instance layers (1):"));
        assert!(text.contains("VK_LAYER_KHRONOS_validation (spec 1.3.0, impl 1)"));
        assert!(text.contains("Khronos Validation Layer"));
    }

    #[test]
    fn device_report_marks_selection() {
        let info = device_info("Test GPU");
        let text = render(|out| write_device(out, 0, &info, true));
        assert!(text.starts_with("Device 0: Test GPU [selected]"));
        assert!(text.contains("discrete GPU"));
        assert!(text.contains("API version:    1.3.250"));
        assert!(text.contains("0x10de / 0x2204"));
        assert!(text.contains("geometry_shader, sampler_anisotropy"));
        assert!(text.contains("[0] 8192 MiB  DEVICE_LOCAL"));
        assert!(text.contains("[0] heap 0  DEVICE_LOCAL"));
        assert!(text.contains("[0] 16 queue(s)  GRAPHICS | COMPUTE"));
        assert!(text.contains("VK_KHR_swapchain v70"));

        let text = render(|out| write_device(out, 1, &info, false));
        assert!(!text.contains("[selected]"));
    }

    #[test]
    fn format_report_skips_unsupported() {
        let formats = [
            FormatSupport {
                format: vk::Format::R8G8B8A8_UNORM,
                image_type: vk::ImageType::TYPE_2D,
                properties: Some(vk::ImageFormatProperties {
                    max_extent: vk::Extent3D {
                        width: 16384,
                        height: 16384,
                        depth: 1,
                    },
                    max_mip_levels: 15,
                    max_array_layers: 2048,
                    max_resource_size: 1024 * 1024 * 1024,
                    ..Default::default()
                }),
                format_properties: vk::FormatProperties::default(),
            },
            FormatSupport {
                format: vk::Format::BC1_RGB_UNORM_BLOCK,
                image_type: vk::ImageType::TYPE_3D,
                properties: None,
                format_properties: vk::FormatProperties::default(),
            },
        ];
        let text = render(|out| write_format_support(out, "Test GPU", &formats));
        assert!(text.contains("1 of 2 supported"));
        assert!(text.contains("TYPE_2D R8G8B8A8_UNORM"));
        assert!(text.contains("16384x16384x1, 15 mip level(s), 2048 array layer(s), max size 1024.0 MiB"));
        assert!(text.contains("linear:  none"));
        assert!(!text.contains("BC1_RGB_UNORM_BLOCK"));
    }

    #[test]
    fn probe_report() {
        let memory = ResourceMemory {
            requirements: vk::MemoryRequirements {
                size: 1024 * 1024,
                alignment: 256,
                memory_type_bits: 0b11,
            },
            candidates: vec![
                (0, vk::MemoryPropertyFlags::DEVICE_LOCAL),
                (1, vk::MemoryPropertyFlags::HOST_VISIBLE),
            ],
            allocation_offset: 0,
            allocation_size: 1024 * 1024,
        };
        let report = ProbeReport {
            device_name: "Test GPU".to_string(),
            queue_family: 0,
            buffer_size: 1024 * 1024,
            buffer_memory: memory.clone(),
            buffer_zeroed: true,
            image_format_3d_linear: None,
            image_format: vk::Format::R8G8B8A8_UNORM,
            image_extent: vk::Extent3D {
                width: 1024,
                height: 1024,
                depth: 1,
            },
            image_mip_levels: 10,
            image_memory: memory,
            command_buffers: 2,
        };
        let text = render(|out| write_probe(out, &report));
        assert!(text.contains("Buffer: 1048576 bytes, TRANSFER_SRC | TRANSFER_DST, zeroed"));
        assert!(text.contains("alignment 256, type bits 0b11"));
        assert!(text.contains("candidate type [1] HOST_VISIBLE"));
        assert!(text.contains("3D linear R8G8B8A8_UNORM: not supported"));
        assert!(text.contains("Image: 1024x1024 R8G8B8A8_UNORM, 10 mip level(s)"));
        assert!(text.contains("Command buffers: 2 primary"));
    }

    #[test]
    fn surface_report() {
        let support = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 0,
                current_extent: vk::Extent2D {
                    width: 800,
                    height: 600,
                },
                ..Default::default()
            },
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        };
        let text = render(|out| write_surface(out, 0, true, &support));
        assert!(text.contains("Queue family 0 can present: yes"));
        assert!(text.contains("image count:   2 .. unbounded"));
        assert!(text.contains("current extent: 800x600"));
        assert!(text.contains("B8G8R8A8_UNORM SRGB_NONLINEAR [preferred]"));
        assert!(!text.contains("B8G8R8A8_SRGB SRGB_NONLINEAR [preferred]"));
        assert!(text.contains("MAILBOX"));

        let text = render(|out| write_surface(out, 1, false, &support));
        assert!(text.contains("Queue family 1 can present: no"));
    }
}
