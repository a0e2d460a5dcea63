//! Window surface handling.
//!
//! Wraps the `VK_KHR_surface` handle created from a window's raw handles and
//! the queries the device selector and swapchain manager need.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::error::{GpuError, Result};

/// Presentable surface for a window.
pub struct Surface {
    pub(crate) surface: vk::SurfaceKHR,
    pub(crate) loader: ash::khr::surface::Instance,
}

impl Surface {
    /// Create a surface for `window`.
    ///
    /// # Safety
    /// The instance must have been created with the extensions reported by
    /// `ash_window::enumerate_required_extensions` for this window, and the
    /// window must outlive the surface.
    pub unsafe fn from_window<W>(
        entry: &ash::Entry,
        instance: &ash::Instance,
        window: &W,
    ) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let surface = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        Ok(Self {
            surface,
            loader: ash::khr::surface::Instance::new(entry, instance),
        })
    }

    /// Raw surface handle.
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Whether `family` on `physical_device` can present to this surface.
    pub fn supports_present(
        &self,
        physical_device: vk::PhysicalDevice,
        family: u32,
    ) -> Result<bool> {
        let supported = unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, family, self.surface)?
        };
        Ok(supported)
    }

    /// Query capabilities, formats and present modes.
    pub fn support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        unsafe {
            let capabilities = self
                .loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)?;
            let formats = self
                .loader
                .get_physical_device_surface_formats(physical_device, self.surface)?;
            let present_modes = self
                .loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)?;

            Ok(SurfaceSupport {
                capabilities,
                formats,
                present_modes,
            })
        }
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// No swapchain created from this surface may still exist.
    pub(crate) unsafe fn destroy(&self) {
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}

/// Surface query result.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}
