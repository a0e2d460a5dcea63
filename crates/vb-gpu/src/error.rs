//! GPU error types.

use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

use crate::device::QueueRole;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be found or initialized.
    #[error("Failed to load Vulkan: {0}")]
    Loader(String),

    /// A required instance layer is not available.
    #[error("Required layer not available: {0}")]
    MissingLayer(String),

    /// A required instance extension is not available.
    #[error("Required instance extension not available: {0}")]
    MissingInstanceExtension(String),

    /// A required device extension is not available on the selected GPU.
    #[error("Required device extension not available: {0}")]
    MissingDeviceExtension(String),

    /// A required device feature is not supported by the selected GPU.
    #[error("Required device feature not supported: {0}")]
    MissingDeviceFeature(&'static str),

    /// No physical device was enumerated.
    #[error("No Vulkan capable GPU found")]
    NoSuitableDevice,

    /// No queue family satisfies a requested role.
    #[error("No queue family supports {0:?}")]
    MissingQueue(QueueRole),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// The surface reports no formats or no present modes.
    #[error("Surface exposes no usable format or present mode")]
    NoSurfaceFormat,

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Shader module creation failed.
    #[error("Shader module {path:?} rejected: {reason}")]
    ShaderModule {
        /// Source of the SPIR-V, when it came from a file.
        path: Option<PathBuf>,
        /// Loader or driver message.
        reason: String,
    },

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Image decoding failed.
    #[error("Image decoding failed: {0}")]
    ImageDecode(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
