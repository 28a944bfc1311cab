//! Video renderer: loop-time reconstruction, pacing and adaptive drop
//!
//! For every dequeued frame:
//!
//! 1. [`LoopState`] maps the source timestamp onto a presentation time that
//!    keeps increasing across loop boundaries.
//! 2. [`DropState`] activates a drop stride once more frames were dropped
//!    than accepted, capping the output at about 8 fps, and widens the late
//!    threshold accordingly.
//! 3. The pacer sleeps in 2 ms quanta until the frame is due, then either
//!    accepts it (compose + send) or drops it when it is too late. The first
//!    frame is always accepted and rebases the clock to zero.

use super::stats::{STATS_INTERVAL, VideoStats};
use crate::clock::Clock;
use crate::media::VideoFrame;
use crate::queue::{CancelToken, FrameQueue, PopResult};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

/// Pacing sleep quantum in seconds
pub const SLEEP_QUANTUM: f64 = 0.002;

/// Output rate targeted once the drop stride is active
pub const OVERLOAD_TARGET_FPS: f64 = 8.0;

/// Late threshold, in frame intervals
const LATE_FRAMES: f64 = 0.8;

/// Receives accepted frames (compositor + device).
pub trait FrameSink: Send {
    fn present(&mut self, frame: &VideoFrame) -> Result<()>;
}

/// Presentation-time reconstruction across loop boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopState {
    /// Starts at -1; the first frame wraps it to 0
    pub loop_index: i64,
    pub timestamp_old: f64,
    /// Largest timestamp of the current loop
    pub timestamp_max: f64,
    pub timestamp_base: f64,
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopState {
    pub fn new() -> Self {
        Self {
            loop_index: -1,
            timestamp_old: f64::MAX,
            timestamp_max: 0.0,
            timestamp_base: 0.0,
        }
    }

    /// Record a source timestamp and return its presentation time.
    pub fn observe(&mut self, timestamp: f64, frame_rate: f64) -> f64 {
        if timestamp < self.timestamp_old {
            self.loop_index += 1;
            if self.loop_index > 0 {
                let loops = self.loop_index as f64;
                self.timestamp_base = self.timestamp_max * loops + loops / frame_rate;
            }
            self.timestamp_max = timestamp;
        }

        self.timestamp_old = timestamp;
        self.timestamp_max = self.timestamp_max.max(timestamp);

        if self.loop_index > 0 {
            timestamp + self.timestamp_base
        } else {
            timestamp
        }
    }
}

/// Accept/drop bookkeeping and the overload stride.
#[derive(Debug, Clone, PartialEq)]
pub struct DropState {
    pub frames_accepted: u64,
    pub frames_dropped: u64,
    /// Frames skipped out of every `drop_stride + 1`; 0 while inactive
    pub drop_stride: u64,
    pub dropped_in_stride: u64,
    /// Frames later than this (seconds, negative) are dropped
    pub drop_threshold: f64,
    /// Set once the overload check fired; it never fires twice
    pub overloaded: bool,
}

impl DropState {
    pub fn new(frame_rate: f64) -> Self {
        Self {
            frames_accepted: 0,
            frames_dropped: 0,
            drop_stride: 0,
            dropped_in_stride: 0,
            drop_threshold: -LATE_FRAMES / frame_rate,
            overloaded: false,
        }
    }

    /// Frames decided so far.
    pub fn processed(&self) -> u64 {
        self.frames_accepted + self.frames_dropped
    }

    /// Activate the stride when drops outnumber accepts. Returns `true` on activation.
    pub fn check_overload(&mut self, frame_rate: f64) -> bool {
        if self.overloaded || self.drop_stride != 0 || self.frames_dropped <= self.frames_accepted {
            return false;
        }

        self.overloaded = true;
        self.drop_stride = (frame_rate / OVERLOAD_TARGET_FPS).floor().max(0.0) as u64;
        self.drop_threshold *= (self.drop_stride + 1) as f64;
        true
    }

    /// Whether the stride skips this frame; a skipped frame counts as dropped.
    pub fn skip_for_stride(&mut self) -> bool {
        if self.drop_stride == 0 {
            return false;
        }
        if self.dropped_in_stride >= self.drop_stride {
            self.dropped_in_stride = 0;
            return false;
        }
        self.dropped_in_stride += 1;
        self.frames_dropped += 1;
        true
    }
}

/// Pacing decision for one evaluation of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Wait,
    Accept,
    Drop,
}

/// Decide from `delta = frame_time - now`.
pub fn pace(delta: f64, drop_threshold: f64) -> Decision {
    if delta > SLEEP_QUANTUM {
        Decision::Wait
    } else if delta < drop_threshold {
        Decision::Drop
    } else {
        Decision::Accept
    }
}

pub struct VideoRenderer {
    queue: FrameQueue<Arc<VideoFrame>>,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    frame_rate: f64,
    timeout: Duration,
    tag: String,
}

impl VideoRenderer {
    pub fn new(
        queue: FrameQueue<Arc<VideoFrame>>,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
        frame_rate: f64,
        timeout: Duration,
    ) -> Self {
        Self {
            queue,
            clock,
            cancel,
            frame_rate,
            timeout,
            tag: String::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Consume the video queue until end of stream or cancellation.
    ///
    /// Returns the final drop bookkeeping. A sink failure cancels the session.
    pub fn run(self, sink: &mut dyn FrameSink) -> Result<DropState> {
        let result = self.render(sink);
        if let Err(e) = &result {
            log::error!("Display {}: video output failed: {:#}", self.tag, e);
            self.cancel.cancel();
        }
        log::debug!("Display {}: video renderer exited", self.tag);
        result
    }

    fn render(&self, sink: &mut dyn FrameSink) -> Result<DropState> {
        let fps = self.frame_rate;
        let quantum = Duration::from_secs_f64(SLEEP_QUANTUM);
        let mut loop_state = LoopState::new();
        let mut drops = DropState::new(fps);
        let mut stats = VideoStats::new(fps, self.tag.clone());
        let mut first_frame = true;

        loop {
            let frame = match self.queue.pop(self.timeout) {
                PopResult::Frame(frame) => frame,
                PopResult::Empty => {
                    log::debug!("Display {}: video queue is empty", self.tag);
                    continue;
                }
                PopResult::EndOfStream | PopResult::Cancelled => break,
            };

            let mut frame_time = loop_state.observe(frame.timestamp, fps);
            if frame_time == 0.0 && drops.processed() > 0 {
                frame_time = drops.processed() as f64 / fps;
            }

            if drops.check_overload(fps) {
                log::info!(
                    "Display {}: overloaded ({} dropped, {} accepted), skipping {} of every {} frames",
                    self.tag,
                    drops.frames_dropped,
                    drops.frames_accepted,
                    drops.drop_stride,
                    drops.drop_stride + 1
                );
            }

            if drops.skip_for_stride() {
                log::trace!(
                    "Display {}: skipped frame at {:.3}s (stride {})",
                    self.tag,
                    frame_time,
                    drops.drop_stride
                );
                continue;
            }

            loop {
                // The clock starts with the first accepted frame
                let delta = if first_frame {
                    0.0
                } else {
                    frame_time - self.clock.now()
                };
                match pace(delta, drops.drop_threshold) {
                    Decision::Wait => {
                        if !self.cancel.sleep(quantum) {
                            return Ok(drops);
                        }
                    }
                    Decision::Drop => {
                        drops.frames_dropped += 1;
                        log::debug!(
                            "Display {}: dropped frame (loop {}, pts {:.3}s, time {:.3}s, late {:.3}s)",
                            self.tag,
                            loop_state.loop_index,
                            frame.timestamp,
                            frame_time,
                            -delta
                        );
                        break;
                    }
                    Decision::Accept => {
                        if first_frame {
                            first_frame = false;
                            self.clock.reset();
                        }
                        drops.frames_accepted += 1;
                        sink.present(&frame).with_context(|| {
                            format!("Failed to present frame at {:.3}s", frame_time)
                        })?;
                        break;
                    }
                }
            }

            stats.update(drops.frames_accepted, drops.frames_dropped);
            stats.maybe_log_stats(STATS_INTERVAL);
        }

        Ok(drops)
    }
}
