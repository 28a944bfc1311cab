//! Real-time playback pipeline
//!
//! One session per display runs three workers connected by two bounded
//! queues:
//!
//! ```text
//! MediaSource -> LoopingDemuxer -> { audio queue, video queue }
//!                                      |              |
//!                               AudioRenderer   VideoRenderer -> FrameSink
//!                                (SampleClock)  (paced on the clock)
//! ```
//!
//! - `demuxer`: decodes or replays the media in an endless loop
//! - `audio`: writes PCM to the sink and drives the sample clock
//! - `video`: loop-time reconstruction, pacing and adaptive drop
//! - `stats`: periodic render statistics

pub mod audio;
pub mod demuxer;
pub mod stats;
pub mod video;

use std::time::Duration;

/// Queue put/get timeout for a stream: two frame intervals.
pub fn queue_timeout(frame_rate: f64) -> Duration {
    if frame_rate > 0.0 {
        Duration::from_secs_f64(2.0 / frame_rate)
    } else {
        Duration::from_millis(100)
    }
}
