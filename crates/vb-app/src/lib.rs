//! Application framework for vb.
//!
//! The runner owns the window, the GPU context, the swapchain and the frame
//! ring, and drives the present loop:
//! - Window creation and platform event translation
//! - Swapchain creation and recreation on resize or staleness
//! - Frame synchronization through a fixed ring of fences and semaphores
//! - Frame statistics and screenshot capture
//!
//! # Example
//!
//! ```no_run
//! use ash::vk;
//! use vb_app::{run_app, App, AppConfig, AppContext, FrameContext};
//!
//! struct Clear;
//!
//! impl App for Clear {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(Clear)
//!     }
//!
//!     fn render(
//!         &mut self,
//!         _ctx: &AppContext,
//!         _frame: &mut FrameContext,
//!     ) -> anyhow::Result<vk::ImageLayout> {
//!         Ok(vk::ImageLayout::UNDEFINED)
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<Clear>(AppConfig::new("clear"))
//! }
//! ```

mod app;
mod config;
mod context;
mod frame;
mod runner;
mod screenshot;
mod stats;

pub use app::{App, AppFlow};
pub use config::{AppConfig, ConfigError, DeviceKind, PresentMode, SurfaceFormat};
pub use context::AppContext;
pub use frame::{FrameBackend, FrameContext, FrameHooks, FrameLoop, FrameStatus};
pub use runner::{init_logging, run_app};
pub use screenshot::{capture_screenshot, screenshot_filename, unpack_rows, ScreenshotError};
pub use stats::FrameStats;

// Re-export commonly used types for convenience
pub use vb_gpu::{GpuContext, GpuContextBuilder};
pub use vb_platform::{KeyCode, PlatformEvent, WindowConfig};
