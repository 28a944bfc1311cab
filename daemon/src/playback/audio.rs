//! Audio renderer
//!
//! Converts decoded audio to interleaved S16 stereo, writes it to the output
//! sink and advances the session's [`SampleClock`](crate::clock::SampleClock)
//! by the number of per-channel samples written.

use crate::clock::PlaybackClock;
use crate::media::AudioFrame;
use crate::queue::{CancelToken, FrameQueue, PopResult};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

/// Channel count of the output format
pub const OUTPUT_CHANNELS: u16 = 2;

/// Audio output device.
pub trait AudioSink: Send {
    /// Write interleaved S16 stereo samples, blocking while the device is full.
    fn write(&mut self, samples: &[i16]) -> Result<()>;

    /// Output latency in seconds, if the device reports one.
    fn latency(&self) -> Option<f64>;
}

/// Convert interleaved float samples to interleaved S16 stereo.
///
/// Mono is duplicated to both channels; extra channels beyond the first two
/// are discarded.
pub fn to_s16_stereo(frame: &AudioFrame) -> Vec<i16> {
    let channels = frame.channels.max(1) as usize;
    let mut out = Vec::with_capacity(frame.frames() * OUTPUT_CHANNELS as usize);

    for chunk in frame.samples.chunks_exact(channels) {
        let left = chunk[0];
        let right = if channels > 1 { chunk[1] } else { chunk[0] };
        out.push(sample_to_s16(left));
        out.push(sample_to_s16(right));
    }
    out
}

fn sample_to_s16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

pub struct AudioRenderer {
    queue: FrameQueue<Arc<AudioFrame>>,
    clock: Arc<PlaybackClock>,
    cancel: CancelToken,
    timeout: Duration,
    tag: String,
}

impl AudioRenderer {
    pub fn new(
        queue: FrameQueue<Arc<AudioFrame>>,
        clock: Arc<PlaybackClock>,
        cancel: CancelToken,
        timeout: Duration,
    ) -> Self {
        Self {
            queue,
            clock,
            cancel,
            timeout,
            tag: String::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Consume the audio queue until end of stream or cancellation.
    ///
    /// A sink failure cancels the session.
    pub fn run(self, sink: &mut dyn AudioSink) -> Result<()> {
        let result = self.render(sink);
        if let Err(e) = &result {
            log::error!("Display {}: audio output failed: {:#}", self.tag, e);
            self.cancel.cancel();
        }
        log::debug!("Display {}: audio renderer exited", self.tag);
        result
    }

    fn render(&self, sink: &mut dyn AudioSink) -> Result<()> {
        let clock = self
            .clock
            .as_sample()
            .context("Audio playback requires a sample clock")?;
        let mut latency_measured = false;

        loop {
            let frame = match self.queue.pop(self.timeout) {
                PopResult::Frame(frame) => frame,
                PopResult::Empty => {
                    log::trace!("Display {}: audio queue is empty", self.tag);
                    continue;
                }
                PopResult::EndOfStream | PopResult::Cancelled => return Ok(()),
            };

            let samples = to_s16_stereo(&frame);
            sink.write(&samples).context("Failed to write audio")?;
            clock.advance((samples.len() / OUTPUT_CHANNELS as usize) as u64);

            if !latency_measured {
                latency_measured = true;
                let latency = sink.latency().unwrap_or(0.0);
                clock.set_latency(latency);
                log::info!(
                    "Display {}: audio output latency {:.1} ms",
                    self.tag,
                    latency * 1000.0
                );
            }
        }
    }
}
