//! Synchronization primitives.
//!
//! [`Fence`] and [`Semaphore`] own exactly one native handle each and
//! destroy it when dropped. Ownership is unique and transfers by move.

use crate::error::Result;
use ash::vk;

/// Owned fence.
pub struct Fence {
    device: ash::Device,
    fence: vk::Fence,
}

impl Fence {
    /// Create a fence, optionally starting in the signaled state.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = device.create_fence(&create_info, None)?;

        Ok(Self {
            device: device.clone(),
            fence,
        })
    }

    /// Get the raw fence handle.
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Wait for the fence to be signaled.
    ///
    /// # Safety
    /// The fence must not be destroyed while waiting.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn wait(&self, timeout_ns: u64) -> Result<()> {
        self.device.wait_for_fences(&[self.fence], true, timeout_ns)?;
        Ok(())
    }

    /// Reset the fence to the unsignaled state.
    ///
    /// # Safety
    /// The fence must not be in use by a pending submission.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn reset(&self) -> Result<()> {
        self.device.reset_fences(&[self.fence])?;
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if self.fence != vk::Fence::null() {
            unsafe { self.device.destroy_fence(self.fence, None) };
        }
    }
}

/// Owned semaphore.
pub struct Semaphore {
    device: ash::Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a semaphore.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let semaphore = device.create_semaphore(&create_info, None)?;

        Ok(Self {
            device: device.clone(),
            semaphore,
        })
    }

    /// Get the raw semaphore handle.
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if self.semaphore != vk::Semaphore::null() {
            unsafe { self.device.destroy_semaphore(self.semaphore, None) };
        }
    }
}
