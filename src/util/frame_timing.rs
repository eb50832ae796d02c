//! Rolling frame-rate measurement for periodic debug logs.

use web_time::{Duration, Instant};

/// Frames between two periodic FPS reports.
pub const REPORT_INTERVAL: u64 = 120;

/// Frame timing with a smoothed FPS estimate and periodic reporting.
#[derive(Debug)]
pub struct FrameTiming {
    /// Last frame timestamp
    last_frame: Instant,
    /// Smoothed FPS using exponential moving average
    smoothed_fps: f32,
    /// Smoothing factor (lower = smoother, 0.0-1.0)
    smoothing: f32,
    /// Longest frame since the last report
    worst_frame: Duration,
    /// Frames ended since creation
    frames: u64,
}

impl Default for FrameTiming {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTiming {
    /// Create a new frame timer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_frame: Instant::now(),
            smoothed_fps: 60.0,
            smoothing: 0.05,
            worst_frame: Duration::ZERO,
            frames: 0,
        }
    }

    /// Call after each frame to update timing.
    pub fn end_frame(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_frame);
        self.last_frame = now;
        self.frames += 1;
        self.worst_frame = self.worst_frame.max(elapsed);

        let frame_time = elapsed.as_secs_f32();
        if frame_time > 0.0 {
            let instant_fps = 1.0 / frame_time;
            self.smoothed_fps = self.smoothed_fps * (1.0 - self.smoothing)
                + instant_fps * self.smoothing;
        }
    }

    /// Get the current FPS (smoothed)
    #[must_use]
    pub fn fps(&self) -> f32 {
        self.smoothed_fps
    }

    /// Frames ended so far.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Log FPS at debug level every [`REPORT_INTERVAL`] frames. Returns
    /// whether a report was written.
    pub fn report(&mut self) -> bool {
        if self.frames == 0 || self.frames % REPORT_INTERVAL != 0 {
            return false;
        }
        log::debug!(
            "frame {}: {:.1} fps (worst frame {:.2} ms)",
            self.frames,
            self.smoothed_fps,
            self.worst_frame.as_secs_f64() * 1000.0
        );
        self.worst_frame = Duration::ZERO;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_once_per_interval() {
        let mut timing = FrameTiming::new();
        let mut reports = 0;
        for _ in 0..(REPORT_INTERVAL * 2 + 5) {
            timing.end_frame();
            if timing.report() {
                reports += 1;
            }
        }
        assert_eq!(reports, 2);
        assert_eq!(timing.frames(), REPORT_INTERVAL * 2 + 5);
        assert!(timing.fps() > 0.0);
    }
}
