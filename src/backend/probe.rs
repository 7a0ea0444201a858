// Resource probe - buffers, images, memory and command buffers without a window
//
// Walks the resource creation path on a headless logical device and records
// what the driver reported along the way. Every resource is an RAII guard
// declared in creation order, so locals drop in reverse creation order even
// when a later step fails.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::command::{self, CommandPool};
use super::VulkanDevice;

pub const PROBE_BUFFER_SIZE: vk::DeviceSize = 1024 * 1024;
pub const PROBE_IMAGE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
pub const PROBE_IMAGE_EXTENT: vk::Extent3D = vk::Extent3D {
    width: 1024,
    height: 1024,
    depth: 1,
};
pub const PROBE_IMAGE_MIP_LEVELS: u32 = 10;
pub const PROBE_COMMAND_BUFFERS: u32 = 2;

/// Memory facts about one probed resource
#[derive(Debug, Clone)]
pub struct ResourceMemory {
    pub requirements: vk::MemoryRequirements,
    /// Memory types the resource may live in, with their property flags
    pub candidates: Vec<(u32, vk::MemoryPropertyFlags)>,
    pub allocation_offset: u64,
    pub allocation_size: u64,
}

/// What the probe saw
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub device_name: String,
    pub queue_family: u32,
    pub buffer_size: vk::DeviceSize,
    pub buffer_memory: ResourceMemory,
    pub buffer_zeroed: bool,
    pub image_format_3d_linear: Option<vk::ImageFormatProperties>,
    pub image_format: vk::Format,
    pub image_extent: vk::Extent3D,
    pub image_mip_levels: u32,
    pub image_memory: ResourceMemory,
    pub command_buffers: u32,
}

/// Every memory type allowed by `type_bits`, in index order
pub fn memory_type_candidates(
    type_bits: u32,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
) -> Vec<(u32, vk::MemoryPropertyFlags)> {
    let count = memory_properties
        .memory_type_count
        .min(vk::MAX_MEMORY_TYPES as u32);
    (0..count)
        .filter(|&i| type_bits & (1 << i) != 0)
        .map(|i| (i, memory_properties.memory_types[i as usize].property_flags))
        .collect()
}

/// First memory type allowed by `type_bits` that has all of `required`
pub fn find_memory_type(
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
) -> Option<u32> {
    memory_type_candidates(type_bits, memory_properties)
        .into_iter()
        .find(|(_, flags)| flags.contains(required))
        .map(|(i, _)| i)
}

/// Image format support, `None` when the combination is not supported at all
pub fn image_format_properties(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    format: vk::Format,
    image_type: vk::ImageType,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
) -> Result<Option<vk::ImageFormatProperties>> {
    let result = unsafe {
        instance.get_physical_device_image_format_properties(
            physical_device,
            format,
            image_type,
            tiling,
            usage,
            vk::ImageCreateFlags::empty(),
        )
    };
    match result {
        Ok(props) => Ok(Some(props)),
        Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to query image format {:?}", format)),
    }
}

struct ProbeBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl Drop for ProbeBuffer {
    fn drop(&mut self) {
        log::debug!("Destroying probe buffer");
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        free_allocation(&self.device, self.allocation.take());
    }
}

struct ProbeImage {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl Drop for ProbeImage {
    fn drop(&mut self) {
        log::debug!("Destroying probe image");
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
        }
        free_allocation(&self.device, self.allocation.take());
    }
}

/// Sub-allocated from gpu-allocator's blocks. Dedicated schemes chain
/// `VkMemoryDedicatedAllocateInfo`, which a 1.0 device without
/// VK_KHR_dedicated_allocation must not see.
fn allocation_desc(
    name: &str,
    requirements: vk::MemoryRequirements,
    location: MemoryLocation,
    linear: bool,
) -> AllocationCreateDesc<'_> {
    AllocationCreateDesc {
        name,
        requirements,
        location,
        linear,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    }
}

/// Moves `allocation` into the guard slot, then binds it. The guard owns the
/// memory even when the bind fails.
fn bind_allocation(
    slot: &mut Option<Allocation>,
    allocation: Allocation,
    bind: impl FnOnce(vk::DeviceMemory, vk::DeviceSize) -> ash::prelude::VkResult<()>,
) -> ash::prelude::VkResult<()> {
    let allocation = slot.insert(allocation);
    bind(unsafe { allocation.memory() }, allocation.offset())
}

fn free_allocation(device: &VulkanDevice, allocation: Option<Allocation>) {
    let Some(allocation) = allocation else {
        return;
    };
    match device.allocator() {
        Ok(mut allocator) => {
            if let Err(e) = allocator.free(allocation) {
                log::error!("Failed to free probe allocation: {}", e);
            }
        }
        Err(e) => log::error!("{:#}", e),
    }
}

/// Run the probe on `device`. Everything created here is gone when it returns.
pub fn run(device: &Arc<VulkanDevice>, device_name: &str) -> Result<ProbeReport> {
    log::info!("Probing resources on {}", device_name);
    device.wait_idle()?;

    // Step 1: Transfer buffer in host visible memory
    let (mut buffer, buffer_memory) = create_buffer(device)?;
    let buffer_zeroed = zero_buffer(&mut buffer)?;

    // Step 2: What a 3D linear image of the probe format could look like
    let image_format_3d_linear = image_format_properties(
        &device.instance.instance,
        device.physical_device,
        PROBE_IMAGE_FORMAT,
        vk::ImageType::TYPE_3D,
        vk::ImageTiling::LINEAR,
        vk::ImageUsageFlags::COLOR_ATTACHMENT,
    )?;

    // Step 3: Sampled image in device local memory, plus a view
    let (image, image_memory) = create_image(device)?;

    // Step 4: Queue and command buffers
    let queue = unsafe {
        device
            .device
            .get_device_queue(device.graphics_queue_family, 0)
    };
    log::debug!(
        "Queue {:?} from family {}",
        queue,
        device.graphics_queue_family
    );
    let pool = CommandPool::new(device.clone())?;
    let command_buffers = pool.allocate(PROBE_COMMAND_BUFFERS)?;
    for &cmd in &command_buffers {
        command::record_empty(&device.device, cmd)?;
    }
    log::info!("Recorded {} empty command buffers", command_buffers.len());

    let report = ProbeReport {
        device_name: device_name.to_string(),
        queue_family: device.graphics_queue_family,
        buffer_size: PROBE_BUFFER_SIZE,
        buffer_memory,
        buffer_zeroed,
        image_format_3d_linear,
        image_format: PROBE_IMAGE_FORMAT,
        image_extent: PROBE_IMAGE_EXTENT,
        image_mip_levels: PROBE_IMAGE_MIP_LEVELS,
        image_memory,
        command_buffers: command_buffers.len() as u32,
    };

    // Reverse creation order
    pool.free(&command_buffers);
    drop(pool);
    drop(image);
    drop(buffer);
    log::info!("Probe resources released");

    Ok(report)
}

fn create_buffer(device: &Arc<VulkanDevice>) -> Result<(ProbeBuffer, ResourceMemory)> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(PROBE_BUFFER_SIZE)
        .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
        .context("Failed to create buffer")?;
    let mut guard = ProbeBuffer {
        buffer,
        allocation: None,
        device: device.clone(),
    };

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
    let candidates = memory_type_candidates(requirements.memory_type_bits, &device.memory_properties);
    log::debug!(
        "Buffer needs {} bytes aligned to {}, {} candidate memory type(s)",
        requirements.size,
        requirements.alignment,
        candidates.len()
    );
    if find_memory_type(
        requirements.memory_type_bits,
        vk::MemoryPropertyFlags::HOST_VISIBLE,
        &device.memory_properties,
    )
    .is_none()
    {
        anyhow::bail!("No host visible memory type for the probe buffer");
    }

    let allocation = device
        .allocator()?
        .allocate(&allocation_desc(
            "probe buffer",
            requirements,
            MemoryLocation::CpuToGpu,
            true,
        ))
        .context("Failed to allocate buffer memory")?;

    let memory = ResourceMemory {
        requirements,
        candidates,
        allocation_offset: allocation.offset(),
        allocation_size: allocation.size(),
    };

    bind_allocation(&mut guard.allocation, allocation, |memory, offset| unsafe {
        device.device.bind_buffer_memory(buffer, memory, offset)
    })
    .context("Failed to bind buffer memory")?;

    Ok((guard, memory))
}

fn zero_buffer(buffer: &mut ProbeBuffer) -> Result<bool> {
    let allocation = buffer
        .allocation
        .as_mut()
        .context("Probe buffer has no memory")?;
    // gpu-allocator keeps host visible blocks persistently mapped
    match allocation.mapped_slice_mut() {
        Some(bytes) => {
            bytes.fill(0);
            Ok(true)
        }
        None => {
            log::warn!("Probe buffer memory is not mapped, skipping zero fill");
            Ok(false)
        }
    }
}

fn create_image(device: &Arc<VulkanDevice>) -> Result<(ProbeImage, ResourceMemory)> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(PROBE_IMAGE_FORMAT)
        .extent(PROBE_IMAGE_EXTENT)
        .mip_levels(PROBE_IMAGE_MIP_LEVELS)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::SAMPLED)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = unsafe { device.device.create_image(&image_info, None) }
        .context("Failed to create image")?;
    let mut guard = ProbeImage {
        image,
        view: vk::ImageView::null(),
        allocation: None,
        device: device.clone(),
    };

    let requirements = unsafe { device.device.get_image_memory_requirements(image) };
    let candidates = memory_type_candidates(requirements.memory_type_bits, &device.memory_properties);

    let allocation = device
        .allocator()?
        .allocate(&allocation_desc(
            "probe image",
            requirements,
            MemoryLocation::GpuOnly,
            false,
        ))
        .context("Failed to allocate image memory")?;

    let memory = ResourceMemory {
        requirements,
        candidates,
        allocation_offset: allocation.offset(),
        allocation_size: allocation.size(),
    };

    bind_allocation(&mut guard.allocation, allocation, |memory, offset| unsafe {
        device.device.bind_image_memory(image, memory, offset)
    })
    .context("Failed to bind image memory")?;

    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(PROBE_IMAGE_FORMAT)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: PROBE_IMAGE_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: 1,
        });
    guard.view = unsafe { device.device.create_image_view(&view_info, None) }
        .context("Failed to create image view")?;

    Ok((guard, memory))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (slot, &property_flags) in props.memory_types.iter_mut().zip(flags) {
            slot.property_flags = property_flags;
        }
        props
    }

    #[test]
    fn candidates_follow_type_bits() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);
        let candidates = memory_type_candidates(0b101, &props);
        assert_eq!(
            candidates,
            vec![
                (0, vk::MemoryPropertyFlags::DEVICE_LOCAL),
                (
                    2,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED
                ),
            ]
        );
    }

    #[test]
    fn bits_beyond_type_count_are_ignored() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert_eq!(memory_type_candidates(u32::MAX, &props).len(), 1);
        assert!(memory_type_candidates(0, &props).is_empty());
    }

    #[test]
    fn allocations_are_sub_allocated() {
        let requirements = vk::MemoryRequirements {
            size: PROBE_BUFFER_SIZE,
            alignment: 256,
            memory_type_bits: 0b11,
        };
        for (location, linear) in [(MemoryLocation::CpuToGpu, true), (MemoryLocation::GpuOnly, false)] {
            let desc = allocation_desc("resource", requirements, location, linear);
            assert_eq!(desc.allocation_scheme, AllocationScheme::GpuAllocatorManaged);
            assert_eq!(desc.location, location);
            assert_eq!(desc.linear, linear);
            assert_eq!(desc.requirements.size, PROBE_BUFFER_SIZE);
        }
    }

    #[test]
    fn failed_bind_leaves_allocation_in_guard() {
        let mut slot = None;
        let result = bind_allocation(&mut slot, Allocation::default(), |_, _| {
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        });
        assert_eq!(result, Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert!(slot.is_some());
    }

    #[test]
    fn bind_sees_allocation_memory_and_offset() {
        let mut slot = None;
        let mut seen = None;
        bind_allocation(&mut slot, Allocation::default(), |memory, offset| {
            seen = Some((memory, offset));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, Some((vk::DeviceMemory::null(), 0)));
        assert!(slot.is_some());
    }

    #[test]
    fn find_memory_type_needs_all_flags() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let coherent =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(0b111, coherent, &props), Some(2));
        assert_eq!(
            find_memory_type(0b111, vk::MemoryPropertyFlags::HOST_VISIBLE, &props),
            Some(1)
        );
        assert_eq!(find_memory_type(0b001, coherent, &props), None);
    }
}
