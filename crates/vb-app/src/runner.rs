//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vb_gpu::GpuContextBuilder;
use vb_platform::{EventGate, EventQueue, PlatformError, PlatformEvent};
use winit::application::ApplicationHandler;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use crate::app::{App, AppFlow};
use crate::config::AppConfig;
use crate::context::AppContext;
use crate::frame::{FrameLoop, FrameStatus};
use crate::stats::FrameStats;

/// Install the fmt subscriber. `RUST_LOG` wins over `default_filter`.
///
/// A subscriber installed earlier is left in place.
pub fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Run an [`App`] with the given configuration.
///
/// Initializes logging, creates the window, GPU context and swapchain, and
/// runs the event loop until the application exits. Setup failures and
/// render errors end the loop and are returned.
pub fn run_app<A: App + 'static>(config: AppConfig) -> anyhow::Result<()> {
    init_logging(&config.log_filter);

    info!("{} starting...", config.window.title);

    let event_loop = EventLoop::new().map_err(|e| PlatformError::EventLoop(e.to_string()))?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        error: None,
    };

    event_loop
        .run_app(&mut runner)
        .map_err(|e| PlatformError::EventLoop(e.to_string()))?;

    match runner.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Implements winit's `ApplicationHandler` on top of [`AppState`].
struct AppRunner<A: App> {
    config: AppConfig,
    state: Option<AppState<A>>,
    error: Option<anyhow::Error>,
}

struct AppState<A: App> {
    app: A,
    ctx: AppContext,
    frame_loop: FrameLoop,
    events: EventQueue,
    gate: EventGate,
    stats: FrameStats,
    target_frame_time: Option<Duration>,
}

impl<A: App + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            self.push_event(event_loop, PlatformEvent::Restored);
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn suspended(&mut self, event_loop: &ActiveEventLoop) {
        self.push_event(event_loop, PlatformEvent::Suspended);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if matches!(event, WindowEvent::RedrawRequested) {
            self.redraw(event_loop);
        } else if let Some(event) = PlatformEvent::from_window_event(&event) {
            self.push_event(event_loop, event);
        }
    }

    fn device_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let Some(event) = PlatformEvent::from_device_event(&event) {
            self.push_event(event_loop, event);
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let Some(state) = &self.state else {
            return;
        };

        if state.gate.is_suspended() {
            // Nothing can be presented; sleep until the next event.
            event_loop.set_control_flow(ControlFlow::Wait);
        } else {
            event_loop.set_control_flow(ControlFlow::Poll);
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: App + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window = Arc::new(self.config.window.create_window(event_loop)?);

        let gpu = GpuContextBuilder::new()
            .app_name(&self.config.window.title)
            .validation(self.config.validation)
            .preferred_device_types(self.config.preferred_device_types())
            .build_with_window(window.as_ref())
            .context("Failed to create GPU context")?;

        let mut ctx = AppContext::new(window, gpu, &self.config)?;
        let app = A::init(&mut ctx)?;

        Ok(AppState {
            app,
            ctx,
            frame_loop: FrameLoop::new(),
            events: EventQueue::new(),
            gate: EventGate::new(),
            stats: FrameStats::new(),
            target_frame_time: self.config.target_frame_time(),
        })
    }

    fn push_event(&mut self, event_loop: &ActiveEventLoop, event: PlatformEvent) {
        if let Some(state) = &mut self.state {
            state.events.push(event);
        }
        self.pump_events(event_loop);
    }

    /// Drain pending events into the gate and the application.
    fn pump_events(&mut self, event_loop: &ActiveEventLoop) {
        let Some(state) = &mut self.state else {
            return;
        };

        while let Some(event) = state.events.poll() {
            state.gate.apply(&event);
            if state.app.on_event(&state.ctx, &event) == AppFlow::Exit {
                state.gate.apply(&PlatformEvent::Quit);
            }
        }

        if let Some((width, height)) = state.gate.take_resize() {
            tracing::debug!("Resize requested: {width}x{height}");
            state.frame_loop.request_resize();
        }

        if state.gate.should_quit() {
            info!("Quit requested");
            self.shutdown(event_loop);
        }
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(state) = &mut self.state else {
            return;
        };
        if state.gate.is_suspended() {
            return;
        }

        if let Err(e) = state.render_frame() {
            error!("Render error: {e:#}");
            self.error = Some(e);
            self.shutdown(event_loop);
        }
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            state.frame_loop.stop();
            state.cleanup();
        }
        event_loop.exit();
    }
}

impl<A: App> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<FrameStatus> {
        let frame_start = Instant::now();

        let dt = frame_start.duration_since(self.ctx.last_frame_time);
        self.ctx.last_frame_time = frame_start;

        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.update").entered();
            self.app.update(&self.ctx, dt.as_secs_f32());
        }

        let draw_start = Instant::now();
        let status = self
            .frame_loop
            .draw(&mut self.ctx, &mut self.app, dt.as_secs_f32())?;
        if status == FrameStatus::Presented {
            self.stats.record(dt, draw_start.elapsed());
        }

        // Frame pacing
        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                #[cfg(feature = "profiling-tracy")]
                let _span = tracing::trace_span!("frame.pacing").entered();
                thread::sleep(target - elapsed);
            }
        }

        Ok(status)
    }

    fn cleanup(&mut self) {
        self.stats.log_summary(self.frame_loop.frame_counter());

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
        }

        // The app releases its resources; the context follows on drop.
        self.app.cleanup(&self.ctx);

        info!("Cleanup complete");
    }
}
