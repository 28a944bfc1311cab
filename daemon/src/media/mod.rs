//! Decoded media for the playback pipeline
//!
//! This module turns a background file into a sequence of decoded frames:
//!
//! - `pipeline`: GStreamer decode of video/audio containers (feature `video`)
//! - `audio_out`: GStreamer audio output sink (feature `video`)
//! - [`StillImageSource`]: still images decoded with the `image` crate,
//!   repeated at a fixed rate so overlays keep refreshing
//!
//! Sources are opened through a [`MediaOpener`]; reopening a source is how
//! the demuxer seeks back to the start of the media.

#[cfg(feature = "video")]
mod audio_out;
#[cfg(feature = "video")]
mod pipeline;

#[cfg(feature = "video")]
pub use audio_out::GstAudioSink;
#[cfg(feature = "video")]
pub use pipeline::GstMediaSource;

#[cfg(not(feature = "video"))]
pub use gst_stub::{GstAudioSink, GstMediaSource};

use image::RgbaImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Frame rate used for still-image backgrounds.
pub const STILL_FRAME_RATE: f64 = 2.0;

/// Fallback when the container does not advertise a frame rate.
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to open {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("No video stream in {0}")]
    NoVideoStream(PathBuf),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Video support not compiled in (build with --features video)")]
    Unsupported,
}

impl From<SourceError> for common::LcdError {
    fn from(e: SourceError) -> Self {
        common::LcdError::Source(e.to_string())
    }
}

impl SourceError {
    pub fn open(path: &Path, reason: impl ToString) -> Self {
        SourceError::Open {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Decoded RGBA picture with its presentation timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Seconds, relative to the start of the source
    pub timestamp: f64,
    /// Tightly packed RGBA8
    pub data: Vec<u8>,
}

impl VideoFrame {
    pub fn from_image(image: RgbaImage, timestamp: f64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            timestamp,
            data: image.into_raw(),
        }
    }

    /// Copy of the pixels as an image buffer.
    pub fn to_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.data.clone())
    }
}

/// Decoded interleaved PCM with its presentation timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Interleaved samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
    pub timestamp: f64,
}

impl AudioFrame {
    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

#[derive(Debug, Clone)]
pub enum MediaFrame {
    Audio(Arc<AudioFrame>),
    Video(Arc<VideoFrame>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoStreamInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Streams selected from a container: the first video and first audio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaInfo {
    pub video: VideoStreamInfo,
    pub audio: Option<AudioStreamInfo>,
}

/// An opened container producing decoded frames in container order.
///
/// Dropping the source closes it.
pub trait MediaSource: Send {
    fn info(&self) -> &MediaInfo;

    /// Next decoded frame, `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<MediaFrame>, SourceError>;
}

/// Opens media from the start.
pub trait MediaOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn MediaSource>, SourceError>;
}

/// Check if file is a still image by extension
pub fn is_still_image(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            matches!(
                e.to_lowercase().as_str(),
                "jpg" | "jpeg" | "png" | "bmp" | "webp"
            )
        })
        .unwrap_or(false)
}

/// A still image repeated as a one-frame video.
pub struct StillImageSource {
    frame: Arc<VideoFrame>,
    info: MediaInfo,
    emitted: bool,
}

impl StillImageSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let image = image::open(path)
            .map_err(|e| SourceError::open(path, e))?
            .to_rgba8();
        log::debug!(
            "Loaded still background {} ({}x{})",
            path.display(),
            image.width(),
            image.height()
        );
        Ok(Self::from_image(image))
    }

    pub fn from_image(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            frame: Arc::new(VideoFrame::from_image(image, 0.0)),
            info: MediaInfo {
                video: VideoStreamInfo {
                    width,
                    height,
                    frame_rate: STILL_FRAME_RATE,
                },
                audio: None,
            },
            emitted: false,
        }
    }
}

impl MediaSource for StillImageSource {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<MediaFrame>, SourceError> {
        if self.emitted {
            return Ok(None);
        }
        self.emitted = true;
        Ok(Some(MediaFrame::Video(Arc::clone(&self.frame))))
    }
}

/// Picks the decoder by file extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultOpener;

impl MediaOpener for DefaultOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn MediaSource>, SourceError> {
        if !path.exists() {
            return Err(SourceError::open(path, "file not found"));
        }

        if is_still_image(path) {
            Ok(Box::new(StillImageSource::open(path)?))
        } else {
            Ok(Box::new(GstMediaSource::open(path)?))
        }
    }
}

#[cfg(not(feature = "video"))]
mod gst_stub {
    use super::{MediaFrame, MediaInfo, MediaSource, SourceError};
    use crate::playback::audio::AudioSink;
    use std::path::Path;

    /// Stub source when video feature is disabled (never constructed)
    pub enum GstMediaSource {}

    impl GstMediaSource {
        pub fn open(_path: &Path) -> Result<Self, SourceError> {
            Err(SourceError::Unsupported)
        }
    }

    impl MediaSource for GstMediaSource {
        fn info(&self) -> &MediaInfo {
            match *self {}
        }

        fn next_frame(&mut self) -> Result<Option<MediaFrame>, SourceError> {
            match *self {}
        }
    }

    /// Stub audio sink when video feature is disabled (never constructed)
    pub enum GstAudioSink {}

    impl GstAudioSink {
        pub fn open(_sample_rate: u32) -> anyhow::Result<Self> {
            anyhow::bail!("Audio support not compiled in")
        }
    }

    impl AudioSink for GstAudioSink {
        fn write(&mut self, _samples: &[i16]) -> anyhow::Result<()> {
            match *self {}
        }

        fn latency(&self) -> Option<f64> {
            match *self {}
        }
    }
}
