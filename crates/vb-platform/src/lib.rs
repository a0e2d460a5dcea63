//! Platform boundary for vb.
//!
//! Translates winit events into the small [`PlatformEvent`] set the renderer
//! consumes, and folds them into the quit/resize/suspend state the frame
//! loop acts on.

use std::collections::VecDeque;

use serde::Deserialize;
use thiserror::Error;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, ElementState, KeyEvent, WindowEvent};
use winit::event_loop::ActiveEventLoop;
use winit::keyboard::PhysicalKey;
use winit::window::{Window, WindowAttributes};

pub use winit::keyboard::KeyCode;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Window creation failed: {0}")]
    WindowCreation(String),
    #[error("Event loop error: {0}")]
    EventLoop(String),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Window parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vb".to_string(),
            width: 1280,
            height: 720,
            resizable: true,
        }
    }
}

impl WindowConfig {
    pub fn attributes(&self) -> WindowAttributes {
        Window::default_attributes()
            .with_title(self.title.clone())
            .with_inner_size(PhysicalSize::new(self.width, self.height))
            .with_resizable(self.resizable)
    }

    /// Create the window on a running event loop.
    pub fn create_window(&self, event_loop: &ActiveEventLoop) -> Result<Window> {
        event_loop
            .create_window(self.attributes())
            .map_err(|e| PlatformError::WindowCreation(e.to_string()))
    }
}

/// Event the renderer cares about.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlatformEvent {
    Quit,
    Resized { width: u32, height: u32 },
    /// Hidden or occluded: nothing can be presented.
    Suspended,
    /// The window shrank to zero area.
    Minimized,
    /// Visible again. Presentation resumes only once the window has area.
    Restored,
    KeyDown { key: KeyCode, repeat: bool },
    KeyUp { key: KeyCode },
    MouseMotion { dx: f64, dy: f64 },
}

impl PlatformEvent {
    /// Translate a window event. Events with no counterpart yield `None`.
    pub fn from_window_event(event: &WindowEvent) -> Option<Self> {
        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => Some(Self::Quit),
            WindowEvent::Resized(size) => Some(Self::resized(size.width, size.height)),
            WindowEvent::Occluded(true) => Some(Self::Suspended),
            WindowEvent::Occluded(false) => Some(Self::Restored),
            WindowEvent::KeyboardInput { event, .. } => Self::from_key_event(event),
            _ => None,
        }
    }

    /// Translate a raw device event.
    pub fn from_device_event(event: &DeviceEvent) -> Option<Self> {
        match event {
            DeviceEvent::MouseMotion { delta: (dx, dy) } => Some(Self::MouseMotion {
                dx: *dx,
                dy: *dy,
            }),
            _ => None,
        }
    }

    fn from_key_event(event: &KeyEvent) -> Option<Self> {
        Self::key(event.physical_key, event.state, event.repeat)
    }

    /// Key transition for a physical key. Unidentified keys are dropped.
    pub fn key(key: PhysicalKey, state: ElementState, repeat: bool) -> Option<Self> {
        let PhysicalKey::Code(key) = key else {
            return None;
        };
        Some(match state {
            ElementState::Pressed => Self::KeyDown { key, repeat },
            ElementState::Released => Self::KeyUp { key },
        })
    }

    /// A zero-sized window is a minimized one.
    pub fn resized(width: u32, height: u32) -> Self {
        if width == 0 || height == 0 {
            Self::Minimized
        } else {
            Self::Resized { width, height }
        }
    }
}

/// Pending platform events, drained once per frame.
#[derive(Debug, Default)]
pub struct EventQueue {
    pending: VecDeque<PlatformEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: PlatformEvent) {
        self.pending.push_back(event);
    }

    /// Next pending event, oldest first.
    pub fn poll(&mut self) -> Option<PlatformEvent> {
        self.pending.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Quit, resize and suspend state accumulated from events.
///
/// A restore while the last known size is zero keeps the gate closed; the
/// next non-zero resize opens it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventGate {
    quit: bool,
    resize: Option<(u32, u32)>,
    suspended: bool,
    zero_sized: bool,
}

impl EventGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &PlatformEvent) {
        match *event {
            PlatformEvent::Quit => self.quit = true,
            PlatformEvent::Resized { width, height } => {
                self.resize = Some((width, height));
                self.suspended = false;
                self.zero_sized = false;
            }
            PlatformEvent::Suspended => self.suspend(),
            PlatformEvent::Minimized => {
                self.zero_sized = true;
                self.suspend();
            }
            PlatformEvent::Restored => {
                if self.zero_sized {
                    tracing::debug!("Restore ignored until the window has area");
                } else {
                    self.suspended = false;
                }
            }
            PlatformEvent::KeyDown { .. }
            | PlatformEvent::KeyUp { .. }
            | PlatformEvent::MouseMotion { .. } => {}
        }
    }

    fn suspend(&mut self) {
        if !self.suspended {
            tracing::debug!("Presentation suspended");
        }
        self.suspended = true;
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    /// While suspended the loop must block on events instead of drawing.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Latest requested size, cleared by the call.
    pub fn take_resize(&mut self) -> Option<(u32, u32)> {
        self.resize.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_request_quits() {
        assert_eq!(
            PlatformEvent::from_window_event(&WindowEvent::CloseRequested),
            Some(PlatformEvent::Quit)
        );
    }

    #[test]
    fn resize_translation() {
        let event = WindowEvent::Resized(PhysicalSize::new(800, 600));
        assert_eq!(
            PlatformEvent::from_window_event(&event),
            Some(PlatformEvent::Resized {
                width: 800,
                height: 600
            })
        );

        let minimized = WindowEvent::Resized(PhysicalSize::new(0, 0));
        assert_eq!(
            PlatformEvent::from_window_event(&minimized),
            Some(PlatformEvent::Minimized)
        );
        assert_eq!(PlatformEvent::resized(800, 0), PlatformEvent::Minimized);
    }

    #[test]
    fn occlusion_suspends_and_restores() {
        assert_eq!(
            PlatformEvent::from_window_event(&WindowEvent::Occluded(true)),
            Some(PlatformEvent::Suspended)
        );
        assert_eq!(
            PlatformEvent::from_window_event(&WindowEvent::Occluded(false)),
            Some(PlatformEvent::Restored)
        );
    }

    #[test]
    fn raw_mouse_motion() {
        let event = DeviceEvent::MouseMotion { delta: (3.0, -1.5) };
        assert_eq!(
            PlatformEvent::from_device_event(&event),
            Some(PlatformEvent::MouseMotion { dx: 3.0, dy: -1.5 })
        );
    }

    #[test]
    fn key_transitions() {
        let down = PlatformEvent::key(
            PhysicalKey::Code(KeyCode::KeyP),
            ElementState::Pressed,
            false,
        );
        assert_eq!(
            down,
            Some(PlatformEvent::KeyDown {
                key: KeyCode::KeyP,
                repeat: false
            })
        );

        let up = PlatformEvent::key(
            PhysicalKey::Code(KeyCode::Escape),
            ElementState::Released,
            false,
        );
        assert_eq!(up, Some(PlatformEvent::KeyUp { key: KeyCode::Escape }));
    }

    #[test]
    fn queue_is_fifo() {
        let mut queue = EventQueue::new();
        queue.push(PlatformEvent::Suspended);
        queue.push(PlatformEvent::Quit);
        assert_eq!(queue.poll(), Some(PlatformEvent::Suspended));
        assert_eq!(queue.poll(), Some(PlatformEvent::Quit));
        assert_eq!(queue.poll(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn gate_tracks_suspend_and_resize() {
        let mut gate = EventGate::new();
        gate.apply(&PlatformEvent::resized(0, 0));
        assert!(gate.is_suspended());
        assert_eq!(gate.take_resize(), None);

        gate.apply(&PlatformEvent::resized(1024, 768));
        assert!(!gate.is_suspended());
        assert_eq!(gate.take_resize(), Some((1024, 768)));
        assert_eq!(gate.take_resize(), None);

        gate.apply(&PlatformEvent::Suspended);
        gate.apply(&PlatformEvent::Restored);
        assert!(!gate.is_suspended());
        assert!(!gate.should_quit());

        gate.apply(&PlatformEvent::Quit);
        assert!(gate.should_quit());
    }

    #[test]
    fn restore_waits_for_nonzero_size() {
        let mut gate = EventGate::new();
        gate.apply(&PlatformEvent::resized(0, 0));
        gate.apply(&PlatformEvent::Restored);
        assert!(gate.is_suspended());

        // Occlusion cycles do not reopen a zero-sized window either.
        gate.apply(&PlatformEvent::Suspended);
        gate.apply(&PlatformEvent::Restored);
        assert!(gate.is_suspended());
        assert_eq!(gate.take_resize(), None);

        gate.apply(&PlatformEvent::resized(800, 600));
        assert!(!gate.is_suspended());
        assert_eq!(gate.take_resize(), Some((800, 600)));

        gate.apply(&PlatformEvent::Suspended);
        gate.apply(&PlatformEvent::Restored);
        assert!(!gate.is_suspended());
    }

    #[test]
    fn latest_resize_wins() {
        let mut gate = EventGate::new();
        gate.apply(&PlatformEvent::resized(640, 480));
        gate.apply(&PlatformEvent::resized(1920, 1080));
        assert_eq!(gate.take_resize(), Some((1920, 1080)));
    }
}
