//! Frame timing statistics.

use std::time::Duration;

/// Running frame timing, reported at shutdown.
#[derive(Debug, Clone)]
pub struct FrameStats {
    /// Last frame time in milliseconds.
    pub frame_time_ms: f32,
    /// Last instantaneous FPS.
    pub fps: f32,
    /// Time spent recording the last frame in milliseconds.
    pub draw_time_ms: f32,
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
    samples: u64,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            frame_time_ms: 0.0,
            fps: 0.0,
            draw_time_ms: 0.0,
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
            samples: 0,
        }
    }
}

impl FrameStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one frame. Zero-length frames update the times only.
    pub fn record(&mut self, dt: Duration, draw_time: Duration) {
        let dt_secs = dt.as_secs_f64();
        self.frame_time_ms = (dt_secs * 1000.0) as f32;
        self.draw_time_ms = (draw_time.as_secs_f64() * 1000.0) as f32;

        if dt_secs > 0.0 {
            let fps = 1.0 / dt_secs;
            self.fps = fps as f32;
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
            self.samples += 1;
        }
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn min_fps(&self) -> Option<f64> {
        (self.samples > 0).then_some(self.min_fps)
    }

    pub fn max_fps(&self) -> Option<f64> {
        (self.samples > 0).then_some(self.max_fps)
    }

    pub fn avg_fps(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.fps_sum / self.samples as f64)
    }

    /// Log min/max/avg FPS.
    pub fn log_summary(&self, frames: u64) {
        let Some(avg) = self.avg_fps() else {
            return;
        };
        tracing::info!("FPS Statistics:");
        tracing::info!("  Min: {:.1}", self.min_fps);
        tracing::info!("  Max: {:.1}", self.max_fps);
        tracing::info!("  Avg: {avg:.1}");
        tracing::info!("  Total frames: {frames}");
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn empty_stats_have_no_fps() {
        let stats = FrameStats::new();
        assert_eq!(stats.samples(), 0);
        assert_eq!(stats.min_fps(), None);
        assert_eq!(stats.avg_fps(), None);
    }

    #[test]
    fn tracks_min_max_avg() {
        let mut stats = FrameStats::new();
        stats.record(Duration::from_millis(10), Duration::from_millis(2));
        stats.record(Duration::from_millis(20), Duration::from_millis(4));
        stats.record(Duration::from_millis(40), Duration::from_millis(1));

        assert_relative_eq!(stats.max_fps().unwrap(), 100.0, epsilon = 1e-9);
        assert_relative_eq!(stats.min_fps().unwrap(), 25.0, epsilon = 1e-9);
        assert_relative_eq!(stats.avg_fps().unwrap(), 175.0 / 3.0, epsilon = 1e-9);
        assert_relative_eq!(stats.fps, 25.0, epsilon = 1e-4);
        assert_relative_eq!(stats.frame_time_ms, 40.0, epsilon = 1e-4);
        assert_relative_eq!(stats.draw_time_ms, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn zero_length_frame_is_not_sampled() {
        let mut stats = FrameStats::new();
        stats.record(Duration::ZERO, Duration::from_micros(500));
        assert_eq!(stats.samples(), 0);
        assert_relative_eq!(stats.draw_time_ms, 0.5, epsilon = 1e-4);
    }
}
