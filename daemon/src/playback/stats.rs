//! Video playback statistics tracking
//!
//! Periodic summary of the pacing decisions taken by the video renderer:
//! - Frame rate of the source
//! - Frames sent to the display and frames dropped
//! - Drop rate

use std::time::{Duration, Instant};

/// Interval between two statistics lines
pub const STATS_INTERVAL: Duration = Duration::from_secs(3);

/// Tracks video playback statistics
pub struct VideoStats {
    /// Frames composited and sent to the display
    pub(super) frames_rendered: u64,

    /// Frames dropped by the pacer (late or skipped by the stride)
    pub(super) frames_dropped: u64,

    /// Frame rate from stream metadata
    pub(super) detected_fps: f64,

    /// Last time stats were logged
    pub(super) last_stats_log: Instant,

    /// Log prefix
    tag: String,
}

impl VideoStats {
    /// Create new statistics tracker
    pub fn new(detected_fps: f64, tag: impl Into<String>) -> Self {
        Self {
            frames_rendered: 0,
            frames_dropped: 0,
            detected_fps,
            last_stats_log: Instant::now(),
            tag: tag.into(),
        }
    }

    /// Take the latest counters from the renderer
    pub fn update(&mut self, rendered: u64, dropped: u64) {
        self.frames_rendered = rendered;
        self.frames_dropped = dropped;
    }

    /// Get current drop rate as percentage
    pub fn drop_rate(&self) -> f64 {
        let total = self.frames_rendered + self.frames_dropped;
        if total == 0 {
            0.0
        } else {
            (self.frames_dropped as f64 / total as f64) * 100.0
        }
    }

    /// Log statistics if interval has elapsed
    pub fn maybe_log_stats(&mut self, interval: Duration) {
        if self.last_stats_log.elapsed() < interval {
            return;
        }

        log::info!(
            "Display {}: video stats ({:.2} fps): {} rendered, {} dropped of {} total ({:.1}% drop rate)",
            self.tag,
            self.detected_fps,
            self.frames_rendered,
            self.frames_dropped,
            self.frames_rendered + self.frames_dropped,
            self.drop_rate()
        );

        self.last_stats_log = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_rate() {
        let mut stats = VideoStats::new(30.0, "87ad:70db");
        assert_eq!(stats.drop_rate(), 0.0);

        stats.update(30, 10);
        assert!((stats.drop_rate() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_maybe_log_stats_resets_timer() {
        let mut stats = VideoStats::new(30.0, "87ad:70db");
        stats.last_stats_log = Instant::now() - Duration::from_secs(10);

        stats.maybe_log_stats(STATS_INTERVAL);
        assert!(stats.last_stats_log.elapsed() < STATS_INTERVAL);
    }
}
