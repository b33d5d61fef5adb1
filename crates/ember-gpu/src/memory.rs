//! GPU memory management.
//!
//! [`MemoryAllocator`] wraps the gpu-allocator backend. Buffers and images
//! it hands out share the backend through an [`Arc`] so they can free their
//! own backing memory when dropped, in any order, without a central free
//! call.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

struct AllocatorShared {
    device: ash::Device,
    allocator: Mutex<Option<Allocator>>,
}

/// GPU memory allocator.
pub struct MemoryAllocator {
    shared: Arc<AllocatorShared>,
}

impl MemoryAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            shared: Arc::new(AllocatorShared {
                device: device.clone(),
                allocator: Mutex::new(Some(allocator)),
            }),
        })
    }

    /// Allocate a buffer.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<AllocatedBuffer> {
        let device = &self.shared.device;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .create_buffer(&buffer_info, None)
                .map_err(GpuError::from)?
        };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let allocation = match self
            .shared
            .allocator
            .lock()
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))
            .and_then(|allocator| {
                allocator
                    .allocate(&AllocationCreateDesc {
                        name,
                        requirements,
                        location,
                        linear: true,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .map_err(|e| GpuError::AllocationFailed(e.to_string()))
            }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) =
            unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        {
            self.free_allocation(allocation);
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        Ok(AllocatedBuffer {
            shared: Arc::clone(&self.shared),
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Allocate an image together with a view onto it.
    ///
    /// The view info's image field is overridden with the freshly created
    /// image.
    pub fn create_image(
        &self,
        create_info: &vk::ImageCreateInfo,
        view_info: &vk::ImageViewCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<AllocatedImage> {
        let device = &self.shared.device;

        let image = unsafe {
            device
                .create_image(create_info, None)
                .map_err(GpuError::from)?
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let allocation = match self
            .shared
            .allocator
            .lock()
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))
            .and_then(|allocator| {
                allocator
                    .allocate(&AllocationCreateDesc {
                        name,
                        requirements,
                        location,
                        linear: false,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .map_err(|e| GpuError::AllocationFailed(e.to_string()))
            }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        if let Err(e) =
            unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
        {
            self.free_allocation(allocation);
            unsafe { device.destroy_image(image, None) };
            return Err(e.into());
        }

        let mut view_info = *view_info;
        view_info.image = image;

        let view = match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                self.free_allocation(allocation);
                unsafe { device.destroy_image(image, None) };
                return Err(e.into());
            }
        };

        Ok(AllocatedImage {
            shared: Arc::clone(&self.shared),
            image,
            view,
            allocation: Some(allocation),
            extent: create_info.extent,
            format: create_info.format,
        })
    }

    /// Shutdown the allocator, releasing all GPU memory.
    ///
    /// Must be called before the Vulkan device is destroyed. Remaining
    /// allocations are reported as leaks; wrappers dropped afterwards skip
    /// their free.
    pub fn shutdown(&self) {
        if let Some(allocator) = self.shared.allocator.lock().take() {
            tracing::debug!("Shutting down GPU memory allocator");
            drop(allocator);
        }
    }

    fn free_allocation(&self, allocation: Allocation) {
        if let Some(allocator) = self.shared.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                tracing::warn!("Failed to free allocation: {e}");
            }
        }
    }
}

/// Owned buffer with its backing allocation.
pub struct AllocatedBuffer {
    shared: Arc<AllocatorShared>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
}

impl AllocatedBuffer {
    /// Get the raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get the buffer size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Get the device address of this buffer.
    pub fn device_address(&self) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        unsafe { self.shared.device.get_buffer_device_address(&info) }
    }

    /// Map the buffer memory for CPU access.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr().cast::<u8>())
    }

    /// Write raw bytes to the buffer at the given offset (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(
                "Data range too large for buffer".to_string(),
            ));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }

    /// Write typed data to the buffer at the given offset (must be host-visible).
    pub fn write_slice<T: bytemuck::NoUninit>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }
}

impl Drop for AllocatedBuffer {
    fn drop(&mut self) {
        if self.buffer == vk::Buffer::null() {
            return;
        }
        if let Some(allocation) = self.allocation.take() {
            if let Some(allocator) = self.shared.allocator.lock().as_mut() {
                if let Err(e) = allocator.free(allocation) {
                    tracing::warn!("Failed to free buffer allocation: {e}");
                }
            }
        }
        unsafe { self.shared.device.destroy_buffer(self.buffer, None) };
    }
}

/// Owned image with its view and backing allocation.
///
/// The view is destroyed strictly before the image and its memory.
pub struct AllocatedImage {
    shared: Arc<AllocatorShared>,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    extent: vk::Extent3D,
    format: vk::Format,
}

impl AllocatedImage {
    /// Get the raw image handle.
    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// Get the raw image view handle.
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Get the image extent.
    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    /// Get the image format.
    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for AllocatedImage {
    fn drop(&mut self) {
        // View first; it references the image.
        if self.view != vk::ImageView::null() {
            unsafe { self.shared.device.destroy_image_view(self.view, None) };
        }
        if self.image == vk::Image::null() {
            return;
        }
        if let Some(allocation) = self.allocation.take() {
            if let Some(allocator) = self.shared.allocator.lock().as_mut() {
                if let Err(e) = allocator.free(allocation) {
                    tracing::warn!("Failed to free image allocation: {e}");
                }
            }
        }
        unsafe { self.shared.device.destroy_image(self.image, None) };
    }
}
