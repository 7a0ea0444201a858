// Command pool and recording
//
// Buffers are allocated from a pool tied to the graphics queue family.
// Destroying the pool frees every buffer allocated from it.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

pub struct CommandPool {
    pub pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self { pool, device })
    }

    /// Allocate `count` primary command buffers
    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }

    pub fn free(&self, buffers: &[vk::CommandBuffer]) {
        if buffers.is_empty() {
            return;
        }
        unsafe {
            self.device.device.free_command_buffers(self.pool, buffers);
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// Begin and immediately end a command buffer, recording nothing
pub fn record_empty(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::builder();
    unsafe {
        device
            .begin_command_buffer(cmd, &begin_info)
            .context("Failed to begin command buffer")?;
        device
            .end_command_buffer(cmd)
            .context("Failed to end command buffer")?;
    }
    Ok(())
}

/// Record a render pass whose only work is clearing its color attachment.
///
/// The buffer is recorded once and resubmitted every frame, so it must not
/// use ONE_TIME_SUBMIT.
pub fn record_clear_pass(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    clear_color: vk::ClearColorValue,
) -> Result<()> {
    let clear_values = [vk::ClearValue { color: clear_color }];

    let render_pass_begin = vk::RenderPassBeginInfo::builder()
        .render_pass(render_pass)
        .framebuffer(framebuffer)
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        })
        .clear_values(&clear_values);

    let begin_info = vk::CommandBufferBeginInfo::builder();

    unsafe {
        device
            .begin_command_buffer(cmd, &begin_info)
            .context("Failed to begin command buffer")?;
        device.cmd_begin_render_pass(cmd, &render_pass_begin, vk::SubpassContents::INLINE);
        device.cmd_end_render_pass(cmd);
        device
            .end_command_buffer(cmd)
            .context("Failed to end command buffer")?;
    }

    Ok(())
}
