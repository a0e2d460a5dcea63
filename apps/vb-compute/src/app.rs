//! Windowed run: dispatch every frame and blit the result to the swapchain.

use anyhow::Context as _;
use ash::vk;
use tracing::{error, info};
use vb_app::{App, AppContext, AppFlow, FrameContext, KeyCode, PlatformEvent};
use vb_gpu::{blit_image, transition_image, GpuContext, Texture};

use crate::gradient::{create_target, GradientPass};
use crate::Args;

pub struct Gradient {
    pass: GradientPass,
    target: Option<Texture>,
    time: f32,
}

impl Gradient {
    fn rebuild_target(&mut self, gpu: &GpuContext, extent: vk::Extent2D) -> anyhow::Result<()> {
        let target = create_target(gpu, extent)?;
        self.pass.bind_target(gpu, &target);
        self.target = Some(target);
        Ok(())
    }
}

impl App for Gradient {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let args = Args::from_env();
        let pass = GradientPass::new(&ctx.gpu, &args.shader_dir)?;

        let mut app = Self {
            pass,
            target: None,
            time: 0.0,
        };
        if let Err(e) = app.rebuild_target(&ctx.gpu, ctx.extent()) {
            app.pass.destroy(&ctx.gpu);
            return Err(e);
        }

        info!("Press Escape to quit");
        Ok(app)
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        self.time += dt;
    }

    fn render(
        &mut self,
        ctx: &AppContext,
        frame: &mut FrameContext,
    ) -> anyhow::Result<vk::ImageLayout> {
        let target = self.target.as_ref().context("Storage image missing")?;
        let device = ctx.gpu.device();
        let cmd = frame.command_buffer;

        // SAFETY: the command buffer is recording and the target is the
        // image bound to the pass.
        unsafe {
            self.pass.record(device, cmd, target, self.time);
            transition_image(
                device,
                cmd,
                frame.swapchain_image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            blit_image(
                device,
                cmd,
                target.image.image,
                frame.swapchain_image,
                target.extent(),
                frame.extent,
            );
        }

        Ok(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
    }

    fn on_event(&mut self, _ctx: &AppContext, event: &PlatformEvent) -> AppFlow {
        match event {
            PlatformEvent::KeyDown {
                key: KeyCode::Escape,
                ..
            } => AppFlow::Exit,
            _ => AppFlow::Continue,
        }
    }

    fn destroy_targets(&mut self, gpu: &GpuContext) {
        if let Some(mut target) = self.target.take() {
            if let Err(e) = target.destroy(gpu) {
                error!("Failed to destroy storage image: {e}");
            }
        }
    }

    fn create_targets(&mut self, gpu: &GpuContext, extent: vk::Extent2D) -> anyhow::Result<()> {
        tracing::debug!("Recreating storage image at {}x{}", extent.width, extent.height);
        self.rebuild_target(gpu, extent)
    }

    fn cleanup(&mut self, ctx: &AppContext) {
        self.destroy_targets(&ctx.gpu);
        self.pass.destroy(&ctx.gpu);
    }
}
