//! Application context.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use ash::vk;
use vb_gpu::command::{begin_command_buffer, end_command_buffer, submit_command_buffers};
use vb_gpu::sync::{drain_semaphore, reset_fence, wait_for_fence};
use vb_gpu::transition::transition_image;
use vb_gpu::{Acquire, FrameRing, GpuContext, Swapchain, SwapchainManager};
use winit::window::Window;

use crate::config::AppConfig;
use crate::frame::{FrameBackend, FrameContext, FrameHooks};

/// Everything the runner owns on behalf of the application: window, GPU
/// context, swapchain and frame ring.
///
/// Dropping the context waits for the device, then destroys the frame ring
/// and the swapchain before the GPU context and finally the window.
pub struct AppContext {
    ring: FrameRing,
    swapchain: SwapchainManager,
    /// GPU context with device, queues and allocator.
    pub gpu: GpuContext,
    /// The window handle. Outlives the surface.
    pub window: Arc<Window>,
    /// Time of last frame (for delta time calculation).
    pub(crate) last_frame_time: Instant,
    screenshot_dir: PathBuf,
}

impl AppContext {
    /// Create the swapchain and frame ring for `window`.
    pub(crate) fn new(
        window: Arc<Window>,
        gpu: GpuContext,
        config: &AppConfig,
    ) -> anyhow::Result<Self> {
        let size = window.inner_size();
        let surface = gpu.surface().context("GPU context has no surface")?;

        let mut swapchain =
            SwapchainManager::new(gpu.instance(), gpu.device_arc(), config.swapchain_config());
        // SAFETY: surface, physical device and device share one instance.
        let image_count = unsafe {
            swapchain.create(
                surface,
                gpu.physical_device(),
                &gpu.swapchain_families(),
                size.width.max(1),
                size.height.max(1),
            )?
        }
        .image_count();

        let ring_size = if config.frames_in_flight == 0 {
            image_count
        } else {
            config.frames_in_flight
        };
        // SAFETY: device is valid.
        let ring = unsafe { FrameRing::new(gpu.device(), gpu.graphics_queue_family(), ring_size) };
        let ring = match ring {
            Ok(ring) => ring,
            Err(e) => {
                // SAFETY: nothing has been submitted yet.
                unsafe { swapchain.destroy() };
                return Err(e.into());
            }
        };
        tracing::info!("Frames in flight: {ring_size}");

        Ok(Self {
            ring,
            swapchain,
            gpu,
            window,
            last_frame_time: Instant::now(),
            screenshot_dir: config.screenshot_dir.clone(),
        })
    }

    pub fn swapchain_manager(&self) -> &SwapchainManager {
        &self.swapchain
    }

    /// The live swapchain.
    pub fn swapchain(&self) -> anyhow::Result<&Swapchain> {
        self.swapchain.current().context("Swapchain is not live")
    }

    /// Get the current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain
            .current()
            .map_or_else(vk::Extent2D::default, |swapchain| swapchain.extent)
    }

    pub fn width(&self) -> u32 {
        self.extent().width
    }

    pub fn height(&self) -> u32 {
        self.extent().height
    }

    /// Width over height, or 1.0 for an empty extent.
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        if extent.height == 0 {
            1.0
        } else {
            extent.width as f32 / extent.height as f32
        }
    }

    pub fn swapchain_format(&self) -> vk::Format {
        self.swapchain
            .current()
            .map_or(vk::Format::UNDEFINED, |swapchain| swapchain.format)
    }

    /// Number of frames in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.ring.len()
    }

    /// Directory screenshots are written to.
    pub fn screenshot_dir(&self) -> &Path {
        &self.screenshot_dir
    }

    fn present_queue(&self) -> vk::Queue {
        self.gpu
            .present_queue()
            .unwrap_or_else(|| self.gpu.graphics_queue())
    }
}

impl FrameBackend for AppContext {
    type Resources = GpuContext;

    fn ring_size(&self) -> usize {
        self.ring.len()
    }

    fn wait_slot(&mut self, slot: usize) -> anyhow::Result<()> {
        let fence = self.ring.slot(slot).in_flight;
        // SAFETY: the fence belongs to this device.
        unsafe { wait_for_fence(self.gpu.device(), fence, u64::MAX)? };
        Ok(())
    }

    fn acquire(&mut self, slot: usize) -> anyhow::Result<Acquire> {
        let semaphore = self.ring.slot(slot).image_available;
        // SAFETY: the slot fence has been waited on, so the semaphore has no
        // pending operation.
        let acquired = unsafe { self.swapchain.acquire_next_image(semaphore)? };
        Ok(acquired)
    }

    fn discard_acquire(&mut self, slot: usize) -> anyhow::Result<()> {
        let semaphore = self.ring.slot(slot).image_available;
        // SAFETY: the acquire that just returned signals this semaphore.
        unsafe { drain_semaphore(self.gpu.device(), self.gpu.graphics_queue(), semaphore)? };
        Ok(())
    }

    fn begin(&mut self, slot: usize, image_index: u32) -> anyhow::Result<FrameContext> {
        let frame_slot = *self.ring.slot(slot);
        let swapchain = self.swapchain()?;
        let image = *swapchain
            .images
            .get(image_index as usize)
            .context("Acquired image index out of range")?;
        let view = swapchain
            .views
            .get(image_index as usize)
            .copied()
            .context("Acquired image index has no view")?;
        let extent = swapchain.extent;

        let device = self.gpu.device();
        // SAFETY: the slot fence was waited on, so its command buffer is idle.
        unsafe {
            reset_fence(device, frame_slot.in_flight)?;
            device.reset_command_buffer(
                frame_slot.command_buffer,
                vk::CommandBufferResetFlags::empty(),
            )?;
            begin_command_buffer(
                device,
                frame_slot.command_buffer,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )?;
        }

        Ok(FrameContext::new(
            frame_slot.command_buffer,
            image_index,
            image,
            view,
            extent,
        ))
    }

    fn finish(
        &mut self,
        _slot: usize,
        frame: &FrameContext,
        layout: vk::ImageLayout,
    ) -> anyhow::Result<()> {
        let device = self.gpu.device();
        // SAFETY: the command buffer is recording and the image belongs to
        // the live swapchain.
        unsafe {
            transition_image(
                device,
                frame.command_buffer,
                frame.swapchain_image,
                layout,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
            end_command_buffer(device, frame.command_buffer)?;
        }
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> anyhow::Result<()> {
        let frame_slot = self.ring.slot(slot);
        // SAFETY: every handle comes from this device and the command buffer
        // has been ended.
        unsafe {
            submit_command_buffers(
                self.gpu.device(),
                self.gpu.graphics_queue(),
                &[frame_slot.command_buffer],
                &[frame_slot.image_available],
                &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                &[frame_slot.render_finished],
                frame_slot.in_flight,
            )?;
        }
        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> anyhow::Result<bool> {
        let wait = self.ring.slot(slot).render_finished;
        // SAFETY: the present queue was checked against the surface at
        // device creation.
        let stale = unsafe { self.swapchain.present(self.present_queue(), image_index, wait)? };
        Ok(stale)
    }

    fn recreate<H>(&mut self, hooks: &mut H) -> anyhow::Result<()>
    where
        H: FrameHooks<Self>,
    {
        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            tracing::debug!("Window has no area, keeping the current swapchain");
            return Ok(());
        }

        let gpu = &self.gpu;
        let surface = gpu.surface().context("GPU context has no surface")?;
        let families = gpu.swapchain_families();

        // SAFETY: surface, physical device and device share one instance.
        let extent = unsafe {
            self.swapchain.recreate(
                surface,
                gpu.physical_device(),
                &families,
                size.width,
                size.height,
                |_, _| hooks.destroy_targets(gpu),
            )?
        }
        .extent;

        hooks
            .create_targets(gpu, extent)
            .context("Failed to rebuild size-dependent targets")?;

        tracing::info!("Resized to {}x{}", extent.width, extent.height);
        Ok(())
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            tracing::error!("Failed to wait idle: {e}");
        }
        let device = self.gpu.device();
        // SAFETY: the device is idle.
        unsafe {
            self.ring.destroy(device);
            self.swapchain.destroy();
        }
    }
}
