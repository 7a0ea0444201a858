// Synchronization primitives
//
// Semaphores order GPU work (acquire -> render -> present), the fence lets
// the CPU know when the submitted frame is done.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::VulkanDevice;

/// Frame synchronization for the single frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl FrameSync {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Unsignaled: it is reset before every submit anyway
        let fence_info = vk::FenceCreateInfo::builder();

        let mut this = Self {
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight_fence: vk::Fence::null(),
            device,
        };

        unsafe {
            this.image_available = this
                .device
                .device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create semaphore")?;
            this.render_finished = this
                .device
                .device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create semaphore")?;
            this.in_flight_fence = this
                .device
                .device
                .create_fence(&fence_info, None)
                .context("Failed to create fence")?;
        }

        Ok(this)
    }

    pub fn reset_fence(&self) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[self.in_flight_fence]) }
            .context("Failed to reset fence")
    }

    pub fn wait_fence(&self, timeout: Duration) -> Result<()> {
        wait_for_fence(&self.device.device, self.in_flight_fence, timeout)
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        // Destroying a null handle is a no-op
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Fence wait timeouts are given in nanoseconds, saturating at `u64::MAX`
pub fn timeout_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

/// Block until `fence` is signaled. Running out of time is an error.
pub fn wait_for_fence(device: &ash::Device, fence: vk::Fence, timeout: Duration) -> Result<()> {
    match unsafe { device.wait_for_fences(&[fence], true, timeout_nanos(timeout)) } {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => {
            anyhow::bail!("GPU did not finish the frame within {:?}", timeout)
        }
        Err(e) => Err(e).context("Failed to wait for fence"),
    }
}
