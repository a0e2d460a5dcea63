//! GPU memory: buffers and images backed by `gpu-allocator`.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;

use crate::error::{GpuError, Result};

/// Validate that `[offset, offset + len)` fits in `size` bytes.
pub fn check_range(size: u64, offset: u64, len: u64) -> Result<()> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
    if end > size {
        return Err(GpuError::InvalidState(format!(
            "Range {offset}..{end} exceeds buffer size {size}"
        )));
    }
    Ok(())
}

/// Allocator for every buffer and image the context hands out.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))
    }

    /// Allocate a buffer of `size` bytes.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        if size == 0 {
            return Err(GpuError::AllocationFailed(format!(
                "Buffer '{name}' has zero size"
            )));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.inner().and_then(|allocator| {
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
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let mut gpu_buffer = GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        };

        let bound = unsafe {
            let allocation = gpu_buffer.allocation.as_ref();
            match allocation {
                Some(a) => self.device.bind_buffer_memory(buffer, a.memory(), a.offset()),
                None => Ok(()),
            }
        };
        if let Err(e) = bound {
            self.free_buffer(&mut gpu_buffer)?;
            return Err(e.into());
        }

        Ok(gpu_buffer)
    }

    /// Release a buffer and its memory. Safe to call twice.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        if buffer.buffer != vk::Buffer::null() {
            unsafe { self.device.destroy_buffer(buffer.buffer, None) };
            buffer.buffer = vk::Buffer::null();
        }

        Ok(())
    }

    /// Allocate an image.
    ///
    /// `linear` must match the image tiling so the allocator keeps linear and
    /// optimal resources apart.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuImage> {
        let linear = create_info.tiling == vk::ImageTiling::LINEAR;
        let image = unsafe { self.device.create_image(create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.inner().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location,
                    linear,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let mut gpu_image = GpuImage {
            image,
            allocation: Some(allocation),
            format: create_info.format,
            extent: create_info.extent,
            mip_levels: create_info.mip_levels,
        };

        let bound = unsafe {
            match gpu_image.allocation.as_ref() {
                Some(a) => self.device.bind_image_memory(image, a.memory(), a.offset()),
                None => Ok(()),
            }
        };
        if let Err(e) = bound {
            self.free_image(&mut gpu_image)?;
            return Err(e.into());
        }

        Ok(gpu_image)
    }

    /// Release an image and its memory. Safe to call twice.
    pub fn free_image(&mut self, image: &mut GpuImage) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        if image.image != vk::Image::null() {
            unsafe { self.device.destroy_image(image.image, None) };
            image.image = vk::Image::null();
        }

        Ok(())
    }

    /// Drop the underlying allocator, returning all device memory.
    ///
    /// Must run before the device is destroyed. Outstanding allocations are
    /// reported as leaks.
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A buffer with its allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

impl GpuBuffer {
    /// Host pointer to the buffer memory, when host-visible.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr() as *mut u8)
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;
        check_range(self.size, offset, data.len() as u64)?;

        // SAFETY: the range was checked against the allocation size.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    /// Copy a slice of plain values into the start of the buffer.
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Copy `len` bytes starting at `offset` out of the buffer.
    pub fn read_bytes(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;
        check_range(self.size, offset, len)?;

        let mut out = vec![0u8; len as usize];
        // SAFETY: the range was checked against the allocation size.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(out)
    }
}

/// An image with its allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
}

impl GpuImage {
    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_inside_the_buffer_pass() {
        assert!(check_range(64, 0, 64).is_ok());
        assert!(check_range(64, 60, 4).is_ok());
        assert!(check_range(64, 64, 0).is_ok());
    }

    #[test]
    fn ranges_past_the_end_fail() {
        assert!(check_range(64, 61, 4).is_err());
        assert!(check_range(64, u64::MAX, 2).is_err());
    }
}
