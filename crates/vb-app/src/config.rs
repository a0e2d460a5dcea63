//! Application configuration.

use std::path::{Path, PathBuf};

use ash::vk;
use serde::Deserialize;
use thiserror::Error;
use vb_gpu::SwapchainConfig;
use vb_platform::WindowConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Physical device kinds, in config spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
}

impl DeviceKind {
    pub fn to_vk(self) -> vk::PhysicalDeviceType {
        match self {
            Self::Discrete => vk::PhysicalDeviceType::DISCRETE_GPU,
            Self::Integrated => vk::PhysicalDeviceType::INTEGRATED_GPU,
            Self::Virtual => vk::PhysicalDeviceType::VIRTUAL_GPU,
            Self::Cpu => vk::PhysicalDeviceType::CPU,
        }
    }
}

/// Present modes, in config spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentMode {
    Fifo,
    FifoRelaxed,
    Mailbox,
    Immediate,
}

impl PresentMode {
    pub fn to_vk(self) -> vk::PresentModeKHR {
        match self {
            Self::Fifo => vk::PresentModeKHR::FIFO,
            Self::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
            Self::Mailbox => vk::PresentModeKHR::MAILBOX,
            Self::Immediate => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

/// Swapchain formats, in config spelling. All use the sRGB nonlinear color space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceFormat {
    Bgra8Srgb,
    Rgba8Srgb,
    Bgra8Unorm,
    Rgba8Unorm,
}

impl SurfaceFormat {
    pub fn to_vk(self) -> vk::Format {
        match self {
            Self::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
            Self::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            Self::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            Self::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub window: WindowConfig,
    /// Wait for vertical blank (FIFO) instead of preferring MAILBOX.
    pub vsync: bool,
    /// Explicit present mode; overrides `vsync` when set.
    pub present_mode: Option<PresentMode>,
    pub surface_format: SurfaceFormat,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Device types in order of preference.
    pub preferred_devices: Vec<DeviceKind>,
    /// Ring size; 0 matches the swapchain image count.
    pub frames_in_flight: usize,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Used when `RUST_LOG` is not set.
    pub log_filter: String,
    pub screenshot_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            vsync: true,
            present_mode: None,
            surface_format: SurfaceFormat::Bgra8Srgb,
            validation: cfg!(debug_assertions),
            preferred_devices: vec![DeviceKind::Discrete, DeviceKind::Integrated],
            frames_in_flight: 0,
            target_fps: None,
            log_filter: "info".to_string(),
            screenshot_dir: PathBuf::from("."),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given window title.
    pub fn new(title: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.window.title = title.into();
        config
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.window.width = width;
        self.window.height = height;
        self
    }

    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_present_mode(mut self, mode: PresentMode) -> Self {
        self.present_mode = Some(mode);
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_screenshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.screenshot_dir = dir.into();
        self
    }

    /// Swapchain parameters derived from this config.
    pub fn swapchain_config(&self) -> SwapchainConfig {
        let config = SwapchainConfig::default()
            .with_vsync(self.vsync)
            .with_surface_format(
                self.surface_format.to_vk(),
                vk::ColorSpaceKHR::SRGB_NONLINEAR,
            )
            .with_extra_usage(vk::ImageUsageFlags::TRANSFER_SRC);
        match self.present_mode {
            Some(mode) => config.with_present_mode(mode.to_vk()),
            None => config,
        }
    }

    pub fn preferred_device_types(&self) -> Vec<vk::PhysicalDeviceType> {
        self.preferred_devices.iter().map(|kind| kind.to_vk()).collect()
    }

    /// Time budget per frame, if a target FPS is set.
    pub fn target_frame_time(&self) -> Option<std::time::Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| std::time::Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}
