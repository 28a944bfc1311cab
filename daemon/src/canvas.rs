//! One playback session per panel
//!
//! A [`Canvas`] owns a demuxer thread and one audio and one video renderer
//! thread, connected by two bounded queues and sharing one cancellation
//! token. Accepted frames go through the [`ThemeCompositor`] and the
//! [`DeviceChannel`] from the video thread.

use crate::clock::{Clock, PlaybackClock};
use crate::compositor::ThemeCompositor;
use crate::config::Config;
use crate::device::{self, DeviceChannel, KnownDevice, Link, TransportError};
use crate::media::{DefaultOpener, GstAudioSink, MediaOpener, VideoFrame};
use crate::playback::audio::{AudioRenderer, AudioSink};
use crate::playback::demuxer::LoopingDemuxer;
use crate::playback::queue_timeout;
use crate::playback::video::{FrameSink, VideoRenderer};
use crate::queue::{CancelToken, FrameQueue};
use crate::sensors::SensorFormatter;
use crate::theme::Theme;
use anyhow::Result;
use common::LcdError;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Opens the hardware a canvas streams to.
pub trait Hardware: Send + Sync {
    fn open_link(&self, display: &KnownDevice) -> Result<Box<dyn Link>, TransportError>;

    fn open_audio(&self, sample_rate: u32) -> Result<Box<dyn AudioSink>>;
}

/// USB panels and the default audio output.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHardware;

impl Hardware for SystemHardware {
    fn open_link(&self, display: &KnownDevice) -> Result<Box<dyn Link>, TransportError> {
        device::open_link(display)
    }

    fn open_audio(&self, sample_rate: u32) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(GstAudioSink::open(sample_rate)?))
    }
}

/// Per-session tunables, taken from the daemon config.
#[derive(Debug, Clone, PartialEq)]
pub struct CanvasSettings {
    pub queue_capacity: usize,
    pub buffer_frame_limit: usize,
    pub jpeg_quality: u8,
    pub audio_enabled: bool,
    pub font_family: String,
}

impl Default for CanvasSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl CanvasSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue_capacity: config.playback.queue_capacity,
            buffer_frame_limit: config.playback.buffer_frame_limit,
            jpeg_quality: config.playback.jpeg_quality,
            audio_enabled: config.playback.audio_enabled,
            font_family: config.general.font_family.clone(),
        }
    }
}

/// Compositor and device, driven by the video renderer.
struct DisplaySink {
    theme: Arc<Mutex<Arc<Theme>>>,
    compositor: ThemeCompositor,
    channel: DeviceChannel,
}

impl FrameSink for DisplaySink {
    fn present(&mut self, frame: &VideoFrame) -> Result<()> {
        let theme = current_theme(&self.theme);
        let image = self.compositor.compose(frame, &theme)?;
        self.channel.send(&image)?;
        Ok(())
    }
}

fn current_theme(theme: &Mutex<Arc<Theme>>) -> Arc<Theme> {
    match theme.lock() {
        Ok(theme) => Arc::clone(&theme),
        Err(poisoned) => Arc::clone(&poisoned.into_inner()),
    }
}

struct Worker {
    name: &'static str,
    handle: JoinHandle<Result<(), LcdError>>,
}

struct Session {
    cancel: CancelToken,
    workers: Vec<Worker>,
}

pub struct Canvas {
    display: KnownDevice,
    theme: Arc<Mutex<Arc<Theme>>>,
    settings: CanvasSettings,
    formatter: Arc<dyn SensorFormatter>,
    opener: Arc<dyn MediaOpener>,
    hardware: Arc<dyn Hardware>,
    session: Option<Session>,
}

impl Canvas {
    pub fn new(
        display: KnownDevice,
        theme: Theme,
        settings: CanvasSettings,
        formatter: Arc<dyn SensorFormatter>,
    ) -> Self {
        Self {
            display,
            theme: Arc::new(Mutex::new(Arc::new(theme))),
            settings,
            formatter,
            opener: Arc::new(DefaultOpener),
            hardware: Arc::new(SystemHardware),
            session: None,
        }
    }

    pub fn with_opener(mut self, opener: Arc<dyn MediaOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_hardware(mut self, hardware: Arc<dyn Hardware>) -> Self {
        self.hardware = hardware;
        self
    }

    pub fn display(&self) -> &KnownDevice {
        &self.display
    }

    fn tag(&self) -> String {
        self.display.id.to_string()
    }

    /// Swap the theme. Mask and widgets apply from the next frame; a new
    /// background takes effect on the next start.
    pub fn set_theme(&self, theme: Theme) {
        let theme = Arc::new(theme);
        match self.theme.lock() {
            Ok(mut current) => *current = theme,
            Err(poisoned) => *poisoned.into_inner() = theme,
        }
        log::info!("Display {}: theme updated", self.tag());
    }

    /// Whether a session has been started and any of its threads is still alive.
    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.workers.iter().any(|w| !w.handle.is_finished()))
    }

    /// Open the media and the panel, then spawn the session threads.
    pub fn start(&mut self) -> Result<(), LcdError> {
        if self.is_running() {
            log::warn!("Display {}: already running", self.tag());
            return Ok(());
        }
        // Reap a finished session before starting over
        if self.session.is_some() {
            log_and_continue!(
                self.wait(),
                format!("reap finished session on display {}", self.tag())
            );
        }

        let tag = self.tag();
        let theme = current_theme(&self.theme);
        let background = theme.background().to_path_buf();

        let source = self.opener.open(&background)?;
        let info = *source.info();
        log::info!(
            "Display {}: background {}, {}x{} {:.2} fps",
            tag,
            background.display(),
            info.video.width,
            info.video.height,
            info.video.frame_rate
        );

        let mut audio_sink = None;
        if let Some(audio) = info.audio {
            log::info!(
                "Display {}: audio stream {} Hz, {} ch",
                tag,
                audio.sample_rate,
                audio.channels
            );
            if self.settings.audio_enabled {
                match self.hardware.open_audio(audio.sample_rate) {
                    Ok(sink) => audio_sink = Some(sink),
                    Err(e) => log::warn!(
                        "Display {}: audio output unavailable, playing without sound: {:#}",
                        tag,
                        e
                    ),
                }
            } else {
                log::info!("Display {}: audio disabled in config", tag);
            }
        }

        let link = self.hardware.open_link(&self.display)?;
        let channel = DeviceChannel::open(link, self.display.protocol, self.settings.jpeg_quality)?;
        log::info!(
            "Display {}: connected to {} ({})",
            tag,
            self.display.name,
            channel.handshake().ident_string()
        );

        // Without an audio output there is nothing to drive a sample clock
        let sample_rate = info
            .audio
            .filter(|_| audio_sink.is_some())
            .map(|audio| audio.sample_rate);
        let clock = Arc::new(PlaybackClock::for_media(sample_rate));
        let cancel = CancelToken::new();
        let timeout = queue_timeout(info.video.frame_rate);
        let video_queue = FrameQueue::new(self.settings.queue_capacity, cancel.clone());
        let audio_queue = audio_sink
            .as_ref()
            .map(|_| FrameQueue::new(self.settings.queue_capacity, cancel.clone()));

        let mut workers = Vec::new();

        let demuxer = LoopingDemuxer::new(
            Arc::clone(&self.opener),
            background,
            Some(source),
            video_queue.clone(),
            audio_queue.clone(),
            cancel.clone(),
            timeout,
            self.settings.buffer_frame_limit,
        )
        .with_tag(tag.clone());
        let spawned = spawn_worker("demux", &tag, move || {
            demuxer.run().map_err(LcdError::from)
        });
        workers.extend(self.collect_spawned(spawned, &cancel));

        if let (Some(mut sink), Some(queue)) = (audio_sink, audio_queue) {
            let renderer =
                AudioRenderer::new(queue, Arc::clone(&clock), cancel.clone(), timeout)
                    .with_tag(tag.clone());
            let spawned = spawn_worker("audio", &tag, move || {
                renderer
                    .run(sink.as_mut())
                    .map_err(|e| LcdError::Io(format!("{:#}", e)))
            });
            workers.extend(self.collect_spawned(spawned, &cancel));
        }

        let mut sink = DisplaySink {
            theme: Arc::clone(&self.theme),
            compositor: ThemeCompositor::new(
                Arc::clone(&self.formatter),
                self.settings.font_family.clone(),
            ),
            channel,
        };
        let video_clock: Arc<dyn Clock> = clock;
        let renderer = VideoRenderer::new(
            video_queue,
            video_clock,
            cancel.clone(),
            info.video.frame_rate,
            timeout,
        )
        .with_tag(tag.clone());
        let video_tag = tag.clone();
        let spawned = spawn_worker("video", &tag, move || {
            renderer
                .run(&mut sink)
                .map(|drops| {
                    log::info!(
                        "Display {}: {} frames accepted, {} dropped",
                        video_tag,
                        drops.frames_accepted,
                        drops.frames_dropped
                    );
                })
                .map_err(|e| LcdError::Transport(format!("{:#}", e)))
        });
        workers.extend(self.collect_spawned(spawned, &cancel));

        log::info!("Display {}: started", tag);
        self.session = Some(Session { cancel, workers });
        Ok(())
    }

    /// Cancel the whole session if a worker could not be spawned.
    fn collect_spawned(
        &self,
        spawned: std::io::Result<Worker>,
        cancel: &CancelToken,
    ) -> Option<Worker> {
        match spawned {
            Ok(worker) => Some(worker),
            Err(e) => {
                log::error!("Display {}: failed to spawn thread: {}", self.tag(), e);
                cancel.cancel();
                None
            }
        }
    }

    /// Start and block until the session ends.
    pub fn paint(&mut self) -> Result<(), LcdError> {
        self.start()?;
        self.wait()
    }

    /// Join the session threads, returning the first error any of them hit.
    pub fn wait(&mut self) -> Result<(), LcdError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        let mut first_error = None;
        for worker in session.workers {
            let result = worker
                .handle
                .join()
                .unwrap_or_else(|_| Err(LcdError::Io(format!("{} thread panicked", worker.name))));
            if let Err(e) = result {
                log::debug!("Display {}: {} thread failed: {}", self.tag(), worker.name, e);
                first_error.get_or_insert(e);
            }
        }

        log::info!("Display {}: stopped", self.tag());
        first_error.map_or(Ok(()), Err)
    }

    /// Cancel the session and wait for its threads.
    pub fn stop(&mut self) -> Result<(), LcdError> {
        if let Some(session) = &self.session {
            session.cancel.cancel();
        }
        self.wait()
    }
}

impl Drop for Canvas {
    fn drop(&mut self) {
        if self.session.is_some() {
            let _ = self.stop();
        }
    }
}

fn spawn_worker<F>(name: &'static str, tag: &str, f: F) -> std::io::Result<Worker>
where
    F: FnOnce() -> Result<(), LcdError> + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(format!("lcdc-{}-{}", name, tag))
        .spawn(f)?;
    Ok(Worker { name, handle })
}
