//! SPIR-V shader modules.

use std::io::Cursor;
use std::path::Path;

use ash::vk;

use crate::error::{GpuError, Result};

/// Owned shader module.
pub struct ShaderModule {
    pub module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create a module from SPIR-V bytes.
    ///
    /// The bytes are only checked for word alignment; the driver rejects
    /// anything else.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn from_bytes(device: &ash::Device, bytes: &[u8]) -> Result<Self> {
        unsafe { Self::create(device, bytes, None) }
    }

    /// Read a SPIR-V file and create a module from it.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn from_path(device: &ash::Device, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| GpuError::ShaderModule {
            path: Some(path.to_path_buf()),
            reason: e.to_string(),
        })?;
        unsafe { Self::create(device, &bytes, Some(path)) }
    }

    unsafe fn create(device: &ash::Device, bytes: &[u8], path: Option<&Path>) -> Result<Self> {
        let fail = |reason: String| GpuError::ShaderModule {
            path: path.map(Path::to_path_buf),
            reason,
        };

        let code = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|e| fail(e.to_string()))?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { device.create_shader_module(&create_info, None) }
            .map_err(|e| fail(e.to_string()))?;

        if let Some(path) = path {
            tracing::debug!(path = %path.display(), words = code.len(), "Shader module loaded");
        }
        Ok(Self { module })
    }

    /// # Safety
    /// No pipeline creation using the module may be in progress.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_shader_module(self.module, None) };
    }
}
