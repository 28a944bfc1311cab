//! End-to-end sessions driven with scripted media, an in-memory panel link
//! and an in-memory audio output.

use anyhow::Result;
use common::protocol::{BULK_MAGIC, REPORT_BLOCK_SIZE, REPORT_MAGIC};
use common::{LcdError, Protocol, ThemeConfig};
use daemon::canvas::{Canvas, CanvasSettings, Hardware};
use daemon::device::{KNOWN_DEVICES, KnownDevice, Link, TransportError};
use daemon::media::{
    AudioFrame, AudioStreamInfo, MediaFrame, MediaInfo, MediaOpener, MediaSource, SourceError,
    VideoFrame, VideoStreamInfo,
};
use daemon::playback::audio::AudioSink;
use daemon::sensors::SensorFormatter;
use daemon::theme::Theme;
use image::{ImageBuffer, Rgba, RgbaImage};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const FRAME_RATE: f64 = 30.0;
const SAMPLE_RATE: u32 = 48_000;

/// A short clip of solid frames, optionally interleaved with silence.
struct ScriptedSource {
    info: MediaInfo,
    frames: VecDeque<MediaFrame>,
}

impl ScriptedSource {
    fn new(video_frames: usize, with_audio: bool) -> Self {
        let mut frames = VecDeque::new();
        for i in 0..video_frames {
            let timestamp = i as f64 / FRAME_RATE;
            let image: RgbaImage = ImageBuffer::from_pixel(16, 16, Rgba([200, 40, 40, 255]));
            frames.push_back(MediaFrame::Video(Arc::new(VideoFrame::from_image(
                image, timestamp,
            ))));
            if with_audio {
                let per_frame = (SAMPLE_RATE as f64 / FRAME_RATE) as usize;
                frames.push_back(MediaFrame::Audio(Arc::new(AudioFrame {
                    samples: vec![0.0; per_frame],
                    channels: 1,
                    sample_rate: SAMPLE_RATE,
                    timestamp,
                })));
            }
        }

        Self {
            info: MediaInfo {
                video: VideoStreamInfo {
                    width: 16,
                    height: 16,
                    frame_rate: FRAME_RATE,
                },
                audio: with_audio.then_some(AudioStreamInfo {
                    sample_rate: SAMPLE_RATE,
                    channels: 1,
                }),
            },
            frames,
        }
    }
}

impl MediaSource for ScriptedSource {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<MediaFrame>, SourceError> {
        Ok(self.frames.pop_front())
    }
}

struct ScriptedOpener {
    video_frames: usize,
    with_audio: bool,
    opened: AtomicUsize,
}

impl ScriptedOpener {
    fn new(video_frames: usize, with_audio: bool) -> Arc<Self> {
        Arc::new(Self {
            video_frames,
            with_audio,
            opened: AtomicUsize::new(0),
        })
    }
}

impl MediaOpener for ScriptedOpener {
    fn open(&self, _path: &Path) -> Result<Box<dyn MediaSource>, SourceError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSource::new(
            self.video_frames,
            self.with_audio,
        )))
    }
}

struct MissingOpener;

impl MediaOpener for MissingOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn MediaSource>, SourceError> {
        Err(SourceError::open(path, "file not found"))
    }
}

/// Everything written to the panel, one entry per transfer.
type Transfers = Arc<Mutex<Vec<Vec<u8>>>>;

struct PanelLink {
    written: Transfers,
    replies: VecDeque<Vec<u8>>,
    /// Transfers this link accepts before the panel goes away
    fail_after: Option<usize>,
    accepted: usize,
}

impl Link for PanelLink {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if self.fail_after.is_some_and(|limit| self.accepted >= limit) {
            return Err(TransportError::Disconnected);
        }
        self.accepted += 1;
        self.written.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        match self.replies.pop_front() {
            Some(reply) => {
                let len = reply.len().min(buf.len());
                buf[..len].copy_from_slice(&reply[..len]);
                Ok(len)
            }
            None => Ok(0),
        }
    }
}

/// Writes block for the duration of the samples, like a real device.
struct PacedAudio {
    samples: Arc<AtomicUsize>,
}

impl AudioSink for PacedAudio {
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        self.samples.fetch_add(samples.len(), Ordering::SeqCst);
        thread::sleep(Duration::from_secs_f64(
            samples.len() as f64 / 2.0 / SAMPLE_RATE as f64,
        ));
        Ok(())
    }

    fn latency(&self) -> Option<f64> {
        Some(0.02)
    }
}

struct FakeHardware {
    written: Transfers,
    audio_samples: Arc<AtomicUsize>,
    audio_available: bool,
    fail_after: Option<usize>,
}

impl FakeHardware {
    fn new() -> Self {
        Self {
            written: Arc::new(Mutex::new(Vec::new())),
            audio_samples: Arc::new(AtomicUsize::new(0)),
            audio_available: true,
            fail_after: None,
        }
    }

    fn transfers(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }
}

impl Hardware for FakeHardware {
    fn open_link(&self, display: &KnownDevice) -> Result<Box<dyn Link>, TransportError> {
        let mut reply = display.protocol.magic().to_vec();
        reply.extend_from_slice(&1u32.to_le_bytes());
        reply.extend_from_slice(b"BP21940");
        Ok(Box::new(PanelLink {
            written: Arc::clone(&self.written),
            replies: VecDeque::from([reply]),
            fail_after: self.fail_after,
            accepted: 0,
        }))
    }

    fn open_audio(&self, _sample_rate: u32) -> Result<Box<dyn AudioSink>> {
        if !self.audio_available {
            anyhow::bail!("no audio device");
        }
        Ok(Box::new(PacedAudio {
            samples: Arc::clone(&self.audio_samples),
        }))
    }
}

struct NoSensors;

impl SensorFormatter for NoSensors {
    fn format(&self, _key: &str, _unit: bool, _cels: bool) -> (String, String) {
        ("None".to_string(), "None".to_string())
    }
}

fn display(protocol: Protocol) -> KnownDevice {
    *KNOWN_DEVICES
        .iter()
        .find(|d| d.protocol == protocol)
        .unwrap()
}

fn theme() -> Theme {
    theme_with_mask([0, 0, 0, 0])
}

fn theme_with_mask(rgba: [u8; 4]) -> Theme {
    Theme {
        config: ThemeConfig {
            background: PathBuf::from("/themes/clip.mp4"),
            mask: PathBuf::from("/themes/mask.png"),
            widgets: Vec::new(),
        },
        mask: Arc::new(ImageBuffer::from_pixel(16, 16, Rgba(rgba))),
        config_path: PathBuf::from("/themes/config.json"),
    }
}

/// Decode the JPEG carried by a bulk frame transfer.
fn decode_bulk_frame(transfer: &[u8]) -> image::RgbImage {
    image::load_from_memory(&transfer[56..]).unwrap().to_rgb8()
}

fn canvas(protocol: Protocol, opener: Arc<dyn MediaOpener>, hardware: Arc<FakeHardware>) -> Canvas {
    let settings = CanvasSettings {
        queue_capacity: 16,
        ..CanvasSettings::default()
    };
    Canvas::new(display(protocol), theme(), settings, Arc::new(NoSensors))
        .with_opener(opener)
        .with_hardware(hardware)
}

fn is_jpeg_frame(transfer: &[u8], header_len: usize) -> bool {
    transfer.len() > header_len + 2 && transfer[header_len..header_len + 2] == [0xFF, 0xD8]
}

#[test]
fn test_bulk_panel_receives_jpeg_frames() {
    let hardware = Arc::new(FakeHardware::new());
    let opener = ScriptedOpener::new(6, false);
    let mut canvas = canvas(Protocol::Bulk, opener.clone(), Arc::clone(&hardware));

    canvas.start().unwrap();
    assert!(canvas.is_running());
    thread::sleep(Duration::from_millis(600));
    canvas.stop().unwrap();
    assert!(!canvas.is_running());

    let transfers = hardware.transfers();
    assert_eq!(transfers[0].len(), 64, "probe comes first");
    assert_eq!(&transfers[0][..4], &BULK_MAGIC);

    let frames = &transfers[1..];
    assert!(frames.len() >= 3, "only {} frames sent", frames.len());
    for frame in frames {
        assert_eq!(&frame[..4], &BULK_MAGIC);
        assert_eq!(&frame[8..12], &16u32.to_le_bytes());
        assert_eq!(&frame[12..16], &16u32.to_le_bytes());
        assert!(is_jpeg_frame(frame, 56));
        let len = u32::from_le_bytes([frame[52], frame[53], frame[54], frame[55]]) as usize;
        assert_eq!(frame.len(), 56 + len);
    }

    // A short clip loops from memory without reopening the media
    assert_eq!(opener.opened.load(Ordering::SeqCst), 1);
}

#[test]
fn test_report_panel_receives_padded_reports() {
    let hardware = Arc::new(FakeHardware::new());
    let mut canvas = canvas(
        Protocol::Report,
        ScriptedOpener::new(3, false),
        Arc::clone(&hardware),
    );

    canvas.start().unwrap();
    thread::sleep(Duration::from_millis(300));
    canvas.stop().unwrap();

    let transfers = hardware.transfers();
    assert!(transfers.len() >= 2);
    for report in &transfers {
        assert_eq!(report.len(), REPORT_BLOCK_SIZE + 1);
        assert_eq!(report[0], 0x00);
    }

    // Every frame message starts a fresh report with the magic
    let frame_starts = transfers[1..]
        .iter()
        .filter(|r| r[1..5] == REPORT_MAGIC)
        .filter(|r| is_jpeg_frame(&r[1..], 20))
        .count();
    assert!(frame_starts >= 1);
}

#[test]
fn test_audio_drives_the_session() {
    let hardware = Arc::new(FakeHardware::new());
    let mut canvas = canvas(
        Protocol::Bulk,
        ScriptedOpener::new(10, true),
        Arc::clone(&hardware),
    );

    canvas.start().unwrap();
    thread::sleep(Duration::from_millis(500));
    canvas.stop().unwrap();

    assert!(hardware.audio_samples.load(Ordering::SeqCst) > 0);
    assert!(hardware.transfers().len() > 1);
}

#[test]
fn test_missing_audio_output_plays_silently() {
    let mut hardware = FakeHardware::new();
    hardware.audio_available = false;
    let hardware = Arc::new(hardware);
    let mut canvas = canvas(
        Protocol::Bulk,
        ScriptedOpener::new(6, true),
        Arc::clone(&hardware),
    );

    canvas.start().unwrap();
    thread::sleep(Duration::from_millis(400));
    canvas.stop().unwrap();

    assert_eq!(hardware.audio_samples.load(Ordering::SeqCst), 0);
    assert!(hardware.transfers().len() > 1);
}

#[test]
fn test_unopenable_background_fails_start() {
    let hardware = Arc::new(FakeHardware::new());
    let mut canvas = canvas(Protocol::Bulk, Arc::new(MissingOpener), Arc::clone(&hardware));

    let err = canvas.start().unwrap_err();
    assert!(matches!(err, LcdError::Source(_)));
    assert!(!canvas.is_running());
    assert!(hardware.transfers().is_empty());
}

#[test]
fn test_disconnect_ends_session_with_transport_error() {
    let mut hardware = FakeHardware::new();
    hardware.fail_after = Some(3);
    let hardware = Arc::new(hardware);
    let mut canvas = canvas(
        Protocol::Bulk,
        ScriptedOpener::new(6, false),
        Arc::clone(&hardware),
    );

    let err = canvas.paint().unwrap_err();
    assert!(matches!(err, LcdError::Transport(_)));
    assert_eq!(hardware.transfers().len(), 3);
}

#[test]
fn test_restart_reaps_session_that_ended_on_its_own() {
    let mut hardware = FakeHardware::new();
    hardware.fail_after = Some(3);
    let hardware = Arc::new(hardware);
    let mut canvas = canvas(
        Protocol::Bulk,
        ScriptedOpener::new(6, false),
        Arc::clone(&hardware),
    );

    canvas.start().unwrap();
    for _ in 0..100 {
        if !canvas.is_running() {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert!(!canvas.is_running());

    // The failed session is reaped and a fresh one comes up
    canvas.start().unwrap();
    thread::sleep(Duration::from_millis(300));
    assert!(matches!(canvas.stop(), Err(LcdError::Transport(_))));
    assert_eq!(hardware.transfers().len(), 6);
}

#[test]
fn test_restart_after_stop() {
    let hardware = Arc::new(FakeHardware::new());
    let opener = ScriptedOpener::new(4, false);
    let mut canvas = canvas(Protocol::Bulk, opener.clone(), Arc::clone(&hardware));

    canvas.start().unwrap();
    thread::sleep(Duration::from_millis(200));
    canvas.stop().unwrap();

    canvas.set_theme(theme());
    canvas.start().unwrap();
    thread::sleep(Duration::from_millis(200));
    canvas.stop().unwrap();

    assert_eq!(opener.opened.load(Ordering::SeqCst), 2);
    let probes = hardware
        .transfers()
        .iter()
        .filter(|t| t.len() == 64 && t[..4] == BULK_MAGIC)
        .count();
    assert_eq!(probes, 2);
}

#[test]
fn test_theme_swap_applies_to_running_session() {
    let hardware = Arc::new(FakeHardware::new());
    let mut canvas = canvas(
        Protocol::Bulk,
        ScriptedOpener::new(6, false),
        Arc::clone(&hardware),
    );

    canvas.start().unwrap();
    thread::sleep(Duration::from_millis(300));
    let before = hardware.transfers().len();
    let red = decode_bulk_frame(&hardware.transfers()[before - 1]);
    let pixel = red.get_pixel(8, 8).0;
    assert!(pixel[0] > 150 && pixel[2] < 100, "got {:?}", pixel);

    canvas.set_theme(theme_with_mask([0, 0, 255, 255]));
    thread::sleep(Duration::from_millis(300));
    assert!(canvas.is_running());
    canvas.stop().unwrap();

    let transfers = hardware.transfers();
    assert!(transfers.len() > before, "no frames after the swap");
    let blue = decode_bulk_frame(transfers.last().unwrap());
    let pixel = blue.get_pixel(8, 8).0;
    assert!(pixel[2] > 200 && pixel[0] < 60, "got {:?}", pixel);
}
