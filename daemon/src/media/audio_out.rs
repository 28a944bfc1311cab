//! GStreamer audio output
//!
//! `appsrc ! audioconvert ! audioresample ! autoaudiosink`, fed with
//! interleaved S16 stereo. The appsrc blocks once a small amount of audio
//! is queued, which paces the audio renderer in real time.

use super::pipeline::initialize_gstreamer;
use crate::playback::audio::{AudioSink, OUTPUT_CHANNELS};
use anyhow::{Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

/// Audio queued inside appsrc before `write` blocks
const QUEUED_SECONDS: f64 = 0.05;

pub struct GstAudioSink {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    sample_rate: u32,
    /// Per-channel samples pushed so far, used for buffer timestamps
    position: u64,
}

impl GstAudioSink {
    pub fn open(sample_rate: u32) -> Result<Self> {
        initialize_gstreamer()?;

        let caps = gst::Caps::builder("audio/x-raw")
            .field("format", "S16LE")
            .field("layout", "interleaved")
            .field("rate", sample_rate as i32)
            .field("channels", OUTPUT_CHANNELS as i32)
            .build();

        let bytes_per_second = sample_rate as f64 * OUTPUT_CHANNELS as f64 * 2.0;
        let appsrc = gst_app::AppSrc::builder()
            .caps(&caps)
            .format(gst::Format::Time)
            .block(true)
            .max_bytes((bytes_per_second * QUEUED_SECONDS) as u64)
            .build();

        let pipeline = gst::Pipeline::new();
        let convert = gst::ElementFactory::make("audioconvert")
            .build()
            .context("Failed to create audioconvert")?;
        let resample = gst::ElementFactory::make("audioresample")
            .build()
            .context("Failed to create audioresample")?;
        let output = gst::ElementFactory::make("autoaudiosink")
            .build()
            .context("Failed to create autoaudiosink")?;

        pipeline
            .add_many([appsrc.upcast_ref(), &convert, &resample, &output])
            .context("Failed to assemble audio pipeline")?;
        gst::Element::link_many([appsrc.upcast_ref(), &convert, &resample, &output])
            .context("Failed to link audio pipeline")?;

        pipeline
            .set_state(gst::State::Playing)
            .context("Failed to start audio output")?;

        log::info!("Audio output opened at {} Hz", sample_rate);

        Ok(Self {
            pipeline,
            appsrc,
            sample_rate,
            position: 0,
        })
    }
}

impl AudioSink for GstAudioSink {
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        let frames = (samples.len() / OUTPUT_CHANNELS as usize) as u64;
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let mut buffer = gst::Buffer::from_mut_slice(bytes);
        {
            let buffer = buffer
                .get_mut()
                .context("Audio buffer is not writable")?;
            let rate = self.sample_rate as u64;
            buffer.set_pts(gst::ClockTime::from_nseconds(
                self.position * 1_000_000_000 / rate,
            ));
            buffer.set_duration(gst::ClockTime::from_nseconds(
                frames * 1_000_000_000 / rate,
            ));
        }
        self.position += frames;

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| anyhow::anyhow!("Audio output rejected buffer: {:?}", e))?;
        Ok(())
    }

    fn latency(&self) -> Option<f64> {
        let mut query = gst::query::Latency::new();
        if !self.pipeline.query(&mut query) {
            return None;
        }
        let (_live, min, _max) = query.result();
        Some(min.nseconds() as f64 / 1_000_000_000.0)
    }
}

impl Drop for GstAudioSink {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            log::warn!("Failed to stop audio output: {}", e);
        }
    }
}
