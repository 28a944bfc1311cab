//! GStreamer pipeline setup for container backgrounds
//!
//! `uridecodebin` exposes one pad per elementary stream. The first video pad
//! is converted to RGBA and the first audio pad to interleaved F32; both end
//! in an `AppSink` whose callback forwards decoded frames through a bounded
//! channel. Additional streams are terminated in a `fakesink`.
//!
//! Sinks run with `sync=false`: pacing is done by the video renderer, the
//! channel only provides backpressure towards the decoder.

use super::{
    AudioFrame, AudioStreamInfo, DEFAULT_FRAME_RATE, MediaFrame, MediaInfo, MediaSource,
    SourceError, VideoFrame, VideoStreamInfo,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Decoded frames buffered between the streaming threads and the demuxer
const EVENT_CAPACITY: usize = 8;

const PREROLL_TIMEOUT_SECS: u64 = 10;

const BUS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Initialize GStreamer (idempotent, safe to call multiple times)
pub(super) fn initialize_gstreamer() -> Result<(), SourceError> {
    static GSTREAMER_INITIALIZED: OnceLock<Result<(), String>> = OnceLock::new();

    GSTREAMER_INITIALIZED
        .get_or_init(|| {
            gst::init().map_err(|e| e.to_string())?;
            log::info!("GStreamer initialized");
            Ok(())
        })
        .clone()
        .map_err(|e| SourceError::Decode(format!("Failed to initialize GStreamer: {}", e)))
}

/// Sinks linked so far, filled in from `pad-added`
#[derive(Default)]
struct Branches {
    video: Option<gst_app::AppSink>,
    audio: Option<gst_app::AppSink>,
}

/// Container decoded by GStreamer.
pub struct GstMediaSource {
    pipeline: gst::Pipeline,
    /// Taken on drop so that blocked streaming threads fail fast
    frames: Option<Receiver<MediaFrame>>,
    info: MediaInfo,
    path: PathBuf,
}

impl GstMediaSource {
    /// Open `path`, preroll it and start decoding.
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        initialize_gstreamer()?;

        let path = path
            .canonicalize()
            .map_err(|e| SourceError::open(path, e))?;
        let uri = gst::glib::filename_to_uri(&path, None).map_err(|e| SourceError::open(&path, e))?;

        log::info!("Creating GStreamer pipeline for: {}", path.display());

        let pipeline = gst::Pipeline::new();
        let decoder = gst::ElementFactory::make("uridecodebin")
            .property("uri", uri.as_str())
            .build()
            .map_err(|e| SourceError::open(&path, e))?;
        pipeline
            .add(&decoder)
            .map_err(|e| SourceError::open(&path, e))?;

        let (tx, rx) = bounded(EVENT_CAPACITY);
        let branches = Arc::new(Mutex::new(Branches::default()));

        let pipeline_weak = pipeline.downgrade();
        let pad_branches = Arc::clone(&branches);
        decoder.connect_pad_added(move |_, pad| {
            let Some(pipeline) = pipeline_weak.upgrade() else {
                return;
            };
            if let Err(e) = link_stream(&pipeline, pad, &pad_branches, &tx) {
                log::warn!("Failed to link decoded stream: {}", e);
            }
        });

        let mut source = Self {
            pipeline,
            frames: Some(rx),
            info: MediaInfo {
                video: VideoStreamInfo {
                    width: 0,
                    height: 0,
                    frame_rate: DEFAULT_FRAME_RATE,
                },
                audio: None,
            },
            path,
        };

        source.preroll()?;
        source.info = source.probe_streams(&branches)?;

        source
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| SourceError::open(&source.path, e))?;

        log::debug!("GStreamer pipeline playing: {:?}", source.info);
        Ok(source)
    }

    /// Bring the pipeline to PAUSED so every linked sink has negotiated caps.
    fn preroll(&self) -> Result<(), SourceError> {
        self.pipeline
            .set_state(gst::State::Paused)
            .map_err(|_| SourceError::open(&self.path, self.bus_error_or("state change failed")))?;

        let (result, _, _) = self
            .pipeline
            .state(gst::ClockTime::from_seconds(PREROLL_TIMEOUT_SECS));
        result.map_err(|_| SourceError::open(&self.path, self.bus_error_or("preroll failed")))?;
        Ok(())
    }

    fn probe_streams(&self, branches: &Mutex<Branches>) -> Result<MediaInfo, SourceError> {
        let branches = branches
            .lock()
            .map_err(|_| SourceError::Decode("stream table poisoned".to_string()))?;

        let video_sink = branches
            .video
            .as_ref()
            .ok_or_else(|| SourceError::NoVideoStream(self.path.clone()))?;
        let video_caps = negotiated_caps(video_sink)
            .ok_or_else(|| SourceError::open(&self.path, "video caps not negotiated"))?;
        let video_info = gst_video::VideoInfo::from_caps(&video_caps)
            .map_err(|e| SourceError::open(&self.path, e))?;

        let video = VideoStreamInfo {
            width: video_info.width(),
            height: video_info.height(),
            frame_rate: detect_fps(&video_info),
        };

        let audio = branches
            .audio
            .as_ref()
            .and_then(negotiated_caps)
            .and_then(|caps| audio_stream_info(&caps));

        Ok(MediaInfo { video, audio })
    }

    /// First error message on the bus, or `fallback`.
    fn bus_error_or(&self, fallback: &str) -> String {
        self.pipeline
            .bus()
            .and_then(|bus| bus.pop_filtered(&[gst::MessageType::Error]))
            .and_then(|msg| match msg.view() {
                gst::MessageView::Error(err) => Some(err.error().to_string()),
                _ => None,
            })
            .unwrap_or_else(|| fallback.to_string())
    }

    /// Returns `true` once the pipeline reached end of stream.
    fn poll_bus(&self) -> Result<bool, SourceError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(false);
        };

        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos]) {
            match msg.view() {
                gst::MessageView::Eos(..) => {
                    log::debug!("End of stream: {}", self.path.display());
                    return Ok(true);
                }
                gst::MessageView::Error(err) => {
                    return Err(SourceError::Decode(format!(
                        "{} ({})",
                        err.error(),
                        err.debug().map(|d| d.to_string()).unwrap_or_default()
                    )));
                }
                _ => {}
            }
        }
        Ok(false)
    }
}

impl MediaSource for GstMediaSource {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<MediaFrame>, SourceError> {
        loop {
            let Some(frames) = self.frames.as_ref() else {
                return Ok(None);
            };

            match frames.recv_timeout(BUS_POLL_INTERVAL) {
                Ok(frame) => return Ok(Some(frame)),
                // Sinks deliver synchronously, so an empty channel plus EOS
                // on the bus means every frame has been handed out
                Err(RecvTimeoutError::Timeout) => {
                    if self.poll_bus()? {
                        return Ok(None);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }
}

impl Drop for GstMediaSource {
    fn drop(&mut self) {
        self.frames.take();
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            log::warn!("Failed to stop pipeline for {}: {}", self.path.display(), e);
        }
    }
}

/// Link a freshly exposed decoder pad to a video, audio or discard branch.
fn link_stream(
    pipeline: &gst::Pipeline,
    pad: &gst::Pad,
    branches: &Mutex<Branches>,
    tx: &Sender<MediaFrame>,
) -> anyhow::Result<()> {
    let caps = pad.current_caps().unwrap_or_else(|| pad.query_caps(None));
    let media_type = caps
        .structure(0)
        .map(|s| s.name().to_string())
        .unwrap_or_default();

    let mut branches = branches
        .lock()
        .map_err(|_| anyhow::anyhow!("stream table poisoned"))?;

    let (elements, sink) = if media_type.starts_with("video/") && branches.video.is_none() {
        let sink = video_sink(tx.clone());
        let elements = vec![
            gst::ElementFactory::make("queue").build()?,
            gst::ElementFactory::make("videoconvert").build()?,
            sink.clone().upcast::<gst::Element>(),
        ];
        branches.video = Some(sink);
        log::debug!("Linked video stream: {}", caps);
        (elements, true)
    } else if media_type.starts_with("audio/") && branches.audio.is_none() {
        let sink = audio_sink(tx.clone());
        let elements = vec![
            gst::ElementFactory::make("queue").build()?,
            gst::ElementFactory::make("audioconvert").build()?,
            sink.clone().upcast::<gst::Element>(),
        ];
        branches.audio = Some(sink);
        log::debug!("Linked audio stream: {}", caps);
        (elements, true)
    } else {
        log::debug!("Ignoring extra stream: {}", media_type);
        let discard = gst::ElementFactory::make("fakesink")
            .property("sync", false)
            .build()?;
        (vec![discard], false)
    };

    pipeline.add_many(&elements)?;
    if sink {
        gst::Element::link_many(&elements)?;
    }
    for element in &elements {
        element.sync_state_with_parent()?;
    }

    let sink_pad = elements[0]
        .static_pad("sink")
        .ok_or_else(|| anyhow::anyhow!("branch has no sink pad"))?;
    pad.link(&sink_pad)?;
    Ok(())
}

fn video_sink(tx: Sender<MediaFrame>) -> gst_app::AppSink {
    let caps = gst_video::VideoCapsBuilder::new()
        .format(gst_video::VideoFormat::Rgba)
        .build();
    let sink = gst_app::AppSink::builder()
        .caps(&caps)
        .sync(false)
        .max_buffers(2)
        .build();

    sink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let frame = video_frame_from_sample(&sample).ok_or(gst::FlowError::Error)?;
                tx.send(MediaFrame::Video(Arc::new(frame)))
                    .map_err(|_| gst::FlowError::Flushing)?;
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );
    sink
}

fn audio_sink(tx: Sender<MediaFrame>) -> gst_app::AppSink {
    let caps = gst::Caps::builder("audio/x-raw")
        .field("format", "F32LE")
        .field("layout", "interleaved")
        .build();
    let sink = gst_app::AppSink::builder()
        .caps(&caps)
        .sync(false)
        .max_buffers(8)
        .build();

    sink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let frame = audio_frame_from_sample(&sample).ok_or(gst::FlowError::Error)?;
                tx.send(MediaFrame::Audio(Arc::new(frame)))
                    .map_err(|_| gst::FlowError::Flushing)?;
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );
    sink
}

fn negotiated_caps(sink: &gst_app::AppSink) -> Option<gst::Caps> {
    sink.static_pad("sink")?.current_caps()
}

/// Detect video FPS from negotiated caps
fn detect_fps(info: &gst_video::VideoInfo) -> f64 {
    let fps = info.fps();
    if fps.numer() > 0 && fps.denom() > 0 {
        let fps = fps.numer() as f64 / fps.denom() as f64;
        log::info!("Detected video FPS: {:.2}", fps);
        return fps;
    }

    log::warn!(
        "Could not detect video FPS, assuming {}fps",
        DEFAULT_FRAME_RATE
    );
    DEFAULT_FRAME_RATE
}

fn audio_stream_info(caps: &gst::CapsRef) -> Option<AudioStreamInfo> {
    let structure = caps.structure(0)?;
    let sample_rate = structure.get::<i32>("rate").ok()?;
    let channels = structure.get::<i32>("channels").ok()?;
    Some(AudioStreamInfo {
        sample_rate: u32::try_from(sample_rate).ok()?,
        channels: u16::try_from(channels).ok()?,
    })
}

fn pts_seconds(buffer: &gst::BufferRef) -> f64 {
    buffer
        .pts()
        .map(|pts| pts.nseconds() as f64 / 1_000_000_000.0)
        .unwrap_or(0.0)
}

fn video_frame_from_sample(sample: &gst::Sample) -> Option<VideoFrame> {
    let caps = sample.caps()?;
    let info = gst_video::VideoInfo::from_caps(caps).ok()?;
    let buffer = sample.buffer()?;
    let frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info).ok()?;

    let width = info.width();
    let height = info.height();
    let row = width as usize * 4;
    let stride = usize::try_from(*frame.plane_stride().first()?).ok()?;
    let plane = frame.plane_data(0).ok()?;

    // Drop row padding
    let mut data = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        data.extend_from_slice(plane.get(start..start + row)?);
    }

    Some(VideoFrame {
        width,
        height,
        timestamp: pts_seconds(buffer),
        data,
    })
}

fn audio_frame_from_sample(sample: &gst::Sample) -> Option<AudioFrame> {
    let stream = audio_stream_info(sample.caps()?)?;
    let buffer = sample.buffer()?;
    let map = buffer.map_readable().ok()?;

    let samples = map
        .as_slice()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    Some(AudioFrame {
        samples,
        channels: stream.channels,
        sample_rate: stream.sample_rate,
        timestamp: pts_seconds(buffer),
    })
}
