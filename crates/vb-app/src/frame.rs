//! The present loop.
//!
//! [`FrameLoop`] drives one iteration per call to [`FrameLoop::draw`]:
//! wait on the slot fence, acquire, reset, record, submit, present, advance.
//! The Vulkan side sits behind [`FrameBackend`] so the protocol can be
//! exercised without a device.

use ash::vk;
use vb_gpu::sync::slot_for_frame;
use vb_gpu::Acquire;

/// Context for the frame being recorded.
pub struct FrameContext {
    /// Command buffer, already begun.
    pub command_buffer: vk::CommandBuffer,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    /// The swapchain image for this frame, in `UNDEFINED` layout.
    pub swapchain_image: vk::Image,
    pub swapchain_view: vk::ImageView,
    pub extent: vk::Extent2D,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Frames presented before this one.
    pub frame_number: u64,
}

impl FrameContext {
    pub fn new(
        command_buffer: vk::CommandBuffer,
        image_index: u32,
        swapchain_image: vk::Image,
        swapchain_view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            command_buffer,
            image_index,
            swapchain_image,
            swapchain_view,
            extent,
            dt: 0.0,
            frame_number: 0,
        }
    }
}

/// What a call to [`FrameLoop::draw`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// The swapchain was stale; nothing was drawn and it has been recreated.
    Skipped,
    Stopped,
}

/// GPU operations the present loop is built from.
///
/// `slot` is always `frame_counter % ring_size()`.
pub trait FrameBackend {
    /// State handed to the resize hooks while the swapchain is replaced.
    type Resources;

    fn ring_size(&self) -> usize;

    /// Block until the slot's previous submission has completed.
    fn wait_slot(&mut self, slot: usize) -> anyhow::Result<()>;

    /// Acquire the next image, signaling the slot's acquire semaphore.
    fn acquire(&mut self, slot: usize) -> anyhow::Result<Acquire>;

    /// Consume a pending signal on the slot's acquire semaphore.
    fn discard_acquire(&mut self, slot: usize) -> anyhow::Result<()>;

    /// Reset the slot fence and command buffer and begin recording.
    fn begin(&mut self, slot: usize, image_index: u32) -> anyhow::Result<FrameContext>;

    /// Move the image from `layout` to `PRESENT_SRC_KHR` and end recording.
    fn finish(
        &mut self,
        slot: usize,
        frame: &FrameContext,
        layout: vk::ImageLayout,
    ) -> anyhow::Result<()>;

    fn submit(&mut self, slot: usize) -> anyhow::Result<()>;

    /// Present `image_index`. Returns `true` when the swapchain went stale.
    fn present(&mut self, slot: usize, image_index: u32) -> anyhow::Result<bool>;

    /// Replace the swapchain, calling the target hooks around it.
    fn recreate<H>(&mut self, hooks: &mut H) -> anyhow::Result<()>
    where
        H: FrameHooks<Self>,
        Self: Sized;
}

/// Callbacks the present loop makes into the application.
pub trait FrameHooks<B: FrameBackend> {
    /// Record the frame and return the layout the swapchain image was left in.
    fn render(
        &mut self,
        backend: &B,
        frame: &mut FrameContext,
    ) -> anyhow::Result<vk::ImageLayout>;

    /// Size-dependent targets must go; the device is idle.
    #[allow(unused_variables)]
    fn destroy_targets(&mut self, resources: &B::Resources) {}

    /// Rebuild size-dependent targets for the new swapchain extent.
    #[allow(unused_variables)]
    fn create_targets(
        &mut self,
        resources: &B::Resources,
        extent: vk::Extent2D,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Frame counter plus the resize and stop flags.
#[derive(Debug, Default)]
pub struct FrameLoop {
    frame_counter: u64,
    resize_pending: bool,
    stopped: bool,
}

impl FrameLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames presented so far.
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    /// Recreate the swapchain before the next frame.
    pub fn request_resize(&mut self) {
        self.resize_pending = true;
    }

    pub fn resize_pending(&self) -> bool {
        self.resize_pending
    }

    /// Later calls to [`draw`](Self::draw) return without touching the GPU.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Run one iteration of the present loop.
    ///
    /// A render error leaves the slot's command buffer recording and its
    /// fence unsignaled; the caller is expected to shut down.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn draw<B, H>(
        &mut self,
        backend: &mut B,
        hooks: &mut H,
        dt: f32,
    ) -> anyhow::Result<FrameStatus>
    where
        B: FrameBackend,
        H: FrameHooks<B>,
    {
        if self.stopped {
            return Ok(FrameStatus::Stopped);
        }

        if self.resize_pending {
            backend.recreate(hooks)?;
            self.resize_pending = false;
        }

        let slot = slot_for_frame(self.frame_counter, backend.ring_size());

        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.wait_fence").entered();
            backend.wait_slot(slot)?;
        }

        let image_index = match backend.acquire(slot)? {
            Acquire::Image(index) => index,
            Acquire::Stale { semaphore_signaled } => {
                tracing::debug!(semaphore_signaled, "Swapchain stale on acquire, skipping frame");
                if semaphore_signaled {
                    backend.discard_acquire(slot)?;
                }
                backend.recreate(hooks)?;
                self.resize_pending = false;
                return Ok(FrameStatus::Skipped);
            }
        };

        let mut frame = backend.begin(slot, image_index)?;
        frame.dt = dt;
        frame.frame_number = self.frame_counter;

        let layout = {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.record").entered();
            hooks.render(backend, &mut frame)?
        };
        backend.finish(slot, &frame, layout)?;
        backend.submit(slot)?;

        let stale = backend.present(slot, image_index)?;
        self.frame_counter = self.frame_counter.wrapping_add(1);
        if stale {
            tracing::debug!("Swapchain stale on present");
            self.resize_pending = true;
        }

        Ok(FrameStatus::Presented)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Discard(usize),
        Begin(usize, u32),
        Finish(usize, vk::ImageLayout),
        Submit(usize),
        Present(usize, u32),
        Recreate,
    }

    /// Records every call; the "GPU" completes a submission immediately.
    struct MockBackend {
        ring: usize,
        image_count: u32,
        next_image: u32,
        extent: vk::Extent2D,
        format: vk::Format,
        fence_signaled: Vec<bool>,
        recording: Vec<bool>,
        acquire_script: VecDeque<Acquire>,
        present_stale: VecDeque<bool>,
        calls: Vec<Call>,
        recreations: usize,
    }

    impl MockBackend {
        fn new(ring: usize, image_count: u32, width: u32, height: u32) -> Self {
            Self {
                ring,
                image_count,
                next_image: 0,
                extent: vk::Extent2D { width, height },
                format: vk::Format::B8G8R8A8_SRGB,
                fence_signaled: vec![true; ring],
                recording: vec![false; ring],
                acquire_script: VecDeque::new(),
                present_stale: VecDeque::new(),
                calls: Vec::new(),
                recreations: 0,
            }
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| pred(c)).count()
        }
    }

    impl FrameBackend for MockBackend {
        type Resources = vk::Extent2D;

        fn ring_size(&self) -> usize {
            self.ring
        }

        fn wait_slot(&mut self, slot: usize) -> anyhow::Result<()> {
            // Submissions complete instantly, so the fence is always signaled here.
            assert!(self.fence_signaled[slot], "waited on a fence that can never signal");
            self.calls.push(Call::Wait(slot));
            Ok(())
        }

        fn acquire(&mut self, slot: usize) -> anyhow::Result<Acquire> {
            self.calls.push(Call::Acquire(slot));
            if let Some(scripted) = self.acquire_script.pop_front() {
                return Ok(scripted);
            }
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            Ok(Acquire::Image(index))
        }

        fn discard_acquire(&mut self, slot: usize) -> anyhow::Result<()> {
            self.calls.push(Call::Discard(slot));
            Ok(())
        }

        fn begin(&mut self, slot: usize, image_index: u32) -> anyhow::Result<FrameContext> {
            assert!(!self.recording[slot], "command buffer begun twice");
            assert_eq!(self.calls.last(), Some(&Call::Acquire(slot)));
            self.fence_signaled[slot] = false;
            self.recording[slot] = true;
            self.calls.push(Call::Begin(slot, image_index));
            Ok(FrameContext::new(
                vk::CommandBuffer::null(),
                image_index,
                vk::Image::null(),
                vk::ImageView::null(),
                self.extent,
            ))
        }

        fn finish(
            &mut self,
            slot: usize,
            _frame: &FrameContext,
            layout: vk::ImageLayout,
        ) -> anyhow::Result<()> {
            assert!(self.recording[slot], "ended a buffer that was not recording");
            self.recording[slot] = false;
            self.calls.push(Call::Finish(slot, layout));
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> anyhow::Result<()> {
            assert!(!self.recording[slot]);
            self.fence_signaled[slot] = true;
            self.calls.push(Call::Submit(slot));
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> anyhow::Result<bool> {
            self.calls.push(Call::Present(slot, image_index));
            Ok(self.present_stale.pop_front().unwrap_or(false))
        }

        fn recreate<H>(&mut self, hooks: &mut H) -> anyhow::Result<()>
        where
            H: FrameHooks<Self>,
        {
            self.calls.push(Call::Recreate);
            let extent = self.extent;
            hooks.destroy_targets(&extent);
            self.recreations += 1;
            hooks.create_targets(&extent, extent)
        }
    }

    #[derive(Default)]
    struct Hooks {
        rendered: Vec<u64>,
        destroyed: usize,
        created: Vec<vk::Extent2D>,
        layout: Option<vk::ImageLayout>,
    }

    impl FrameHooks<MockBackend> for Hooks {
        fn render(
            &mut self,
            _backend: &MockBackend,
            frame: &mut FrameContext,
        ) -> anyhow::Result<vk::ImageLayout> {
            self.rendered.push(frame.frame_number);
            Ok(self.layout.unwrap_or(vk::ImageLayout::UNDEFINED))
        }

        fn destroy_targets(&mut self, _resources: &vk::Extent2D) {
            self.destroyed += 1;
        }

        fn create_targets(
            &mut self,
            _resources: &vk::Extent2D,
            extent: vk::Extent2D,
        ) -> anyhow::Result<()> {
            self.created.push(extent);
            Ok(())
        }
    }

    #[test]
    fn ring_slot_is_waited_before_reuse() {
        let mut backend = MockBackend::new(2, 3, 640, 480);
        let mut hooks = Hooks::default();
        let mut frame_loop = FrameLoop::new();

        for _ in 0..3 {
            assert_eq!(
                frame_loop.draw(&mut backend, &mut hooks, 0.016).unwrap(),
                FrameStatus::Presented
            );
        }

        let waits: Vec<_> = backend
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Wait(slot) => Some(*slot),
                _ => None,
            })
            .collect();
        assert_eq!(waits, vec![0, 1, 0]);

        // Slot 0's second begin comes after its first submit and a fresh wait.
        let submit0 = backend.calls.iter().position(|c| *c == Call::Submit(0)).unwrap();
        let rebegin0 = backend
            .calls
            .iter()
            .rposition(|c| matches!(c, Call::Begin(0, _)))
            .unwrap();
        let rewait0 = backend.calls.iter().rposition(|c| *c == Call::Wait(0)).unwrap();
        assert!(submit0 < rewait0 && rewait0 < rebegin0);
    }

    #[test]
    fn single_frame_end_to_end() {
        let mut backend = MockBackend::new(2, 3, 800, 600);
        let mut hooks = Hooks::default();
        let mut frame_loop = FrameLoop::new();

        let status = frame_loop.draw(&mut backend, &mut hooks, 0.0).unwrap();
        assert_eq!(status, FrameStatus::Presented);
        assert_eq!(frame_loop.frame_counter(), 1);
        assert_eq!(
            backend.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Begin(0, 0),
                Call::Finish(0, vk::ImageLayout::UNDEFINED),
                Call::Submit(0),
                Call::Present(0, 0),
            ]
        );
        assert_eq!(hooks.rendered, vec![0]);
    }

    #[test]
    fn render_layout_reaches_finish() {
        let mut backend = MockBackend::new(1, 2, 800, 600);
        let mut hooks = Hooks {
            layout: Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            ..Hooks::default()
        };
        FrameLoop::new().draw(&mut backend, &mut hooks, 0.0).unwrap();
        assert!(backend
            .calls
            .contains(&Call::Finish(0, vk::ImageLayout::TRANSFER_DST_OPTIMAL)));
    }

    #[test]
    fn out_of_date_acquire_skips_then_recovers() {
        let mut backend = MockBackend::new(2, 3, 800, 600);
        backend.acquire_script.push_back(Acquire::Stale {
            semaphore_signaled: false,
        });
        let mut hooks = Hooks::default();
        let mut frame_loop = FrameLoop::new();

        let status = frame_loop.draw(&mut backend, &mut hooks, 0.0).unwrap();
        assert_eq!(status, FrameStatus::Skipped);
        assert_eq!(frame_loop.frame_counter(), 0);
        assert!(hooks.rendered.is_empty());
        assert_eq!(backend.recreations, 1);
        assert_eq!(backend.count(|c| matches!(c, Call::Discard(_))), 0);

        let status = frame_loop.draw(&mut backend, &mut hooks, 0.0).unwrap();
        assert_eq!(status, FrameStatus::Presented);
        assert_eq!(frame_loop.frame_counter(), 1);
        assert_eq!(hooks.rendered, vec![0]);
        assert_eq!(backend.recreations, 1);
    }

    #[test]
    fn suboptimal_acquire_drains_semaphore() {
        let mut backend = MockBackend::new(2, 3, 800, 600);
        backend.acquire_script.push_back(Acquire::Stale {
            semaphore_signaled: true,
        });
        let mut hooks = Hooks::default();
        let mut frame_loop = FrameLoop::new();

        let status = frame_loop.draw(&mut backend, &mut hooks, 0.0).unwrap();
        assert_eq!(status, FrameStatus::Skipped);
        let discard = backend.calls.iter().position(|c| *c == Call::Discard(0));
        let recreate = backend.calls.iter().position(|c| *c == Call::Recreate);
        assert!(discard.is_some());
        assert!(discard < recreate);
    }

    #[test]
    fn stale_present_recreates_before_next_frame() {
        let mut backend = MockBackend::new(2, 3, 800, 600);
        backend.present_stale.push_back(true);
        let mut hooks = Hooks::default();
        let mut frame_loop = FrameLoop::new();

        frame_loop.draw(&mut backend, &mut hooks, 0.0).unwrap();
        assert_eq!(frame_loop.frame_counter(), 1);
        assert!(frame_loop.resize_pending());
        assert_eq!(backend.recreations, 0);

        frame_loop.draw(&mut backend, &mut hooks, 0.0).unwrap();
        assert_eq!(backend.recreations, 1);
        assert!(!frame_loop.resize_pending());
        assert_eq!(backend.calls[6], Call::Recreate);
    }

    #[test]
    fn each_resize_request_rebuilds_targets_once() {
        let mut backend = MockBackend::new(2, 3, 800, 600);
        let mut hooks = Hooks::default();
        let mut frame_loop = FrameLoop::new();

        for _ in 0..2 {
            frame_loop.request_resize();
            frame_loop.draw(&mut backend, &mut hooks, 0.0).unwrap();
            assert_eq!(backend.image_count, 3);
            assert_eq!(backend.format, vk::Format::B8G8R8A8_SRGB);
        }

        assert_eq!(backend.recreations, 2);
        assert_eq!(hooks.destroyed, 2);
        assert_eq!(hooks.created, vec![backend.extent; 2]);
    }

    #[test]
    fn stopped_loop_never_waits() {
        let mut backend = MockBackend::new(2, 3, 800, 600);
        let mut hooks = Hooks::default();
        let mut frame_loop = FrameLoop::new();
        frame_loop.stop();

        let status = frame_loop.draw(&mut backend, &mut hooks, 0.0).unwrap();
        assert_eq!(status, FrameStatus::Stopped);
        assert!(backend.calls.is_empty());
    }

    #[test]
    fn counter_cycles_through_ring() {
        let mut backend = MockBackend::new(3, 3, 800, 600);
        let mut hooks = Hooks::default();
        let mut frame_loop = FrameLoop::new();
        for _ in 0..7 {
            frame_loop.draw(&mut backend, &mut hooks, 0.0).unwrap();
        }
        assert_eq!(frame_loop.frame_counter(), 7);
        assert_eq!(hooks.rendered, (0..7).collect::<Vec<_>>());
        let last_submit = backend
            .calls
            .iter()
            .rev()
            .find_map(|c| match c {
                Call::Submit(slot) => Some(*slot),
                _ => None,
            });
        assert_eq!(last_submit, Some(0));
    }
}
