//! Image view and sampler wrappers.

use crate::error::Result;
use ash::vk;

/// Owned image view.
pub struct ImageView {
    device: ash::Device,
    view: vk::ImageView,
}

impl ImageView {
    /// Create an image view.
    ///
    /// # Safety
    /// The device must be valid and the create info must reference a live image.
    pub unsafe fn new(device: &ash::Device, create_info: &vk::ImageViewCreateInfo) -> Result<Self> {
        let view = device.create_image_view(create_info, None)?;

        Ok(Self {
            device: device.clone(),
            view,
        })
    }

    /// Adopt ownership of an existing image view handle.
    ///
    /// # Safety
    /// The view must have been created from this device and must not be
    /// owned by anything else.
    pub unsafe fn from_raw(device: &ash::Device, view: vk::ImageView) -> Self {
        Self {
            device: device.clone(),
            view,
        }
    }

    /// Get the raw image view handle.
    pub fn handle(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        if self.view != vk::ImageView::null() {
            unsafe { self.device.destroy_image_view(self.view, None) };
        }
    }
}

/// Owned sampler.
pub struct Sampler {
    device: ash::Device,
    sampler: vk::Sampler,
}

impl Sampler {
    /// Create a sampler.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, create_info: &vk::SamplerCreateInfo) -> Result<Self> {
        let sampler = device.create_sampler(create_info, None)?;

        Ok(Self {
            device: device.clone(),
            sampler,
        })
    }

    /// Get the raw sampler handle.
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if self.sampler != vk::Sampler::null() {
            unsafe { self.device.destroy_sampler(self.sampler, None) };
        }
    }
}
