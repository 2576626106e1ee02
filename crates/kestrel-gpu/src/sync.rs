//! Synchronization primitives.

use ash::vk;

use crate::error::Result;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    Ok(device.create_semaphore(&create_info, None)?)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    Ok(device.create_fence(&create_info, None)?)
}

/// Block until `fence` signals.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(
    feature = "profiling-tracy",
    tracing::instrument(level = "trace", skip_all)
)]
pub unsafe fn wait_for_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.wait_for_fences(&[fence], true, u64::MAX)?;
    Ok(())
}

/// Per-frame-slot synchronization.
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    /// Signaled when the acquired image is ready to be rendered to.
    pub image_available: vk::Semaphore,
    /// Signaled when the frame's submission finished; presentation waits on it.
    pub render_done: vk::Semaphore,
    /// Signaled when the frame's submission retired. Created signaled.
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create frame synchronization resources.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        Ok(Self {
            image_available: create_semaphore(device)?,
            render_done: create_semaphore(device)?,
            in_flight: create_fence(device, true)?,
        })
    }

    /// Destroy the fence, then both semaphores.
    ///
    /// # Safety
    /// The resources must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_fence(self.in_flight, None);
        device.destroy_semaphore(self.image_available, None);
        device.destroy_semaphore(self.render_done, None);
    }
}
