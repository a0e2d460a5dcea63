//! `App` trait definition.

use ash::vk;
use vb_gpu::GpuContext;
use vb_platform::PlatformEvent;

use crate::context::AppContext;
use crate::frame::{FrameContext, FrameHooks};

/// Whether the runner should keep going after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppFlow {
    #[default]
    Continue,
    Exit,
}

/// Trait for vb applications.
///
/// The runner owns the window, the GPU context, the swapchain and the frame
/// ring. An application only records commands and keeps whatever targets
/// depend on the swapchain size.
pub trait App: Sized {
    /// Initialize the application.
    ///
    /// Called once, after the window, GPU context and swapchain exist.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Called every frame before rendering with the delta time in seconds.
    #[allow(unused_variables)]
    fn update(&mut self, ctx: &AppContext, dt: f32) {}

    /// Record the frame.
    ///
    /// The command buffer is already begun and the swapchain image is in
    /// `UNDEFINED` layout. Return the layout the image was left in; the
    /// runner moves it to `PRESENT_SRC_KHR` and ends the buffer.
    fn render(
        &mut self,
        ctx: &AppContext,
        frame: &mut FrameContext,
    ) -> anyhow::Result<vk::ImageLayout>;

    /// Handle a platform event.
    #[allow(unused_variables)]
    fn on_event(&mut self, ctx: &AppContext, event: &PlatformEvent) -> AppFlow {
        AppFlow::Continue
    }

    /// The swapchain is being replaced and the device is idle.
    #[allow(unused_variables)]
    fn destroy_targets(&mut self, gpu: &GpuContext) {}

    /// The new swapchain is live at `extent`.
    #[allow(unused_variables)]
    fn create_targets(&mut self, gpu: &GpuContext, extent: vk::Extent2D) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release GPU resources. The device is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &AppContext) {}
}

impl<A: App> FrameHooks<AppContext> for A {
    fn render(
        &mut self,
        backend: &AppContext,
        frame: &mut FrameContext,
    ) -> anyhow::Result<vk::ImageLayout> {
        App::render(self, backend, frame)
    }

    fn destroy_targets(&mut self, resources: &GpuContext) {
        App::destroy_targets(self, resources);
    }

    fn create_targets(
        &mut self,
        resources: &GpuContext,
        extent: vk::Extent2D,
    ) -> anyhow::Result<()> {
        App::create_targets(self, resources, extent)
    }
}
