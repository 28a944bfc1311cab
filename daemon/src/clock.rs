//! Presentation clocks
//!
//! Exactly one clock drives pacing per playback session:
//! - [`SampleClock`] when the media has an audio track (audio is the master)
//! - [`WallClock`] otherwise

use std::sync::Mutex;
use std::time::Instant;

/// Source of "now" for the video pacer, in seconds since the session start.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
    fn reset(&self);
}

#[derive(Debug, Default)]
struct SampleState {
    /// Per-channel samples handed to the audio sink
    consumed: u64,
    /// Output latency of the sink, in samples
    latency: u64,
}

/// Clock derived from the number of audio samples written to the sink.
#[derive(Debug)]
pub struct SampleClock {
    sample_rate: u32,
    state: Mutex<SampleState>,
}

impl SampleClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            state: Mutex::new(SampleState::default()),
        }
    }

    /// Account for `frames` per-channel samples written to the sink.
    pub fn advance(&self, frames: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.consumed += frames;
        }
    }

    /// Record the sink's output latency.
    pub fn set_latency(&self, seconds: f64) {
        let samples = (seconds.max(0.0) * self.sample_rate as f64).round() as u64;
        if let Ok(mut state) = self.state.lock() {
            state.latency = samples;
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Clock for SampleClock {
    fn now(&self) -> f64 {
        let Ok(state) = self.state.lock() else {
            return 0.0;
        };
        let played = state.consumed.saturating_sub(state.latency);
        played as f64 / self.sample_rate as f64
    }

    /// Sample time is zero-based at session start and has to stay aligned
    /// with what the sink actually played, so there is nothing to rebase.
    fn reset(&self) {}
}

/// Monotonic wall-time clock.
#[derive(Debug)]
pub struct WallClock {
    origin: Mutex<Instant>,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            origin: Mutex::new(Instant::now()),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for WallClock {
    fn now(&self) -> f64 {
        self.origin
            .lock()
            .map(|origin| origin.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    fn reset(&self) {
        if let Ok(mut origin) = self.origin.lock() {
            *origin = Instant::now();
        }
    }
}

/// The clock selected for one playback session.
#[derive(Debug)]
pub enum PlaybackClock {
    Sample(SampleClock),
    Wall(WallClock),
}

impl PlaybackClock {
    /// Audio-driven when the media has a sample rate, wall time otherwise.
    pub fn for_media(sample_rate: Option<u32>) -> Self {
        match sample_rate {
            Some(rate) => PlaybackClock::Sample(SampleClock::new(rate)),
            None => PlaybackClock::Wall(WallClock::new()),
        }
    }

    pub fn as_sample(&self) -> Option<&SampleClock> {
        match self {
            PlaybackClock::Sample(clock) => Some(clock),
            PlaybackClock::Wall(_) => None,
        }
    }
}

impl Clock for PlaybackClock {
    fn now(&self) -> f64 {
        match self {
            PlaybackClock::Sample(clock) => clock.now(),
            PlaybackClock::Wall(clock) => clock.now(),
        }
    }

    fn reset(&self) {
        match self {
            PlaybackClock::Sample(clock) => clock.reset(),
            PlaybackClock::Wall(clock) => clock.reset(),
        }
    }
}
