//! Looping demuxer
//!
//! The first pass decodes the media in container order and routes every
//! frame to its queue. While the pass stays under the buffering ceiling the
//! frames are also kept in memory; later loops then replay that buffer with
//! one cursor per queue instead of decoding again. Media that exceeds the
//! ceiling is re-opened from the start on every loop.

use crate::media::{AudioFrame, MediaFrame, MediaOpener, MediaSource, SourceError, VideoFrame};
use crate::queue::{CancelToken, FrameQueue, PushResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default ceiling of buffered video frames
pub const DEFAULT_BUFFER_FRAME_LIMIT: usize = 1024;

/// Frames kept from the first pass for replay.
#[derive(Default)]
struct LoopBuffer {
    video: Vec<Arc<VideoFrame>>,
    audio: Vec<Arc<AudioFrame>>,
}

/// Read position of one queue inside the loop buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayCursor {
    pub index: usize,
    /// Completed replays of the buffer
    pub passes: u64,
}

impl ReplayCursor {
    fn advance(&mut self, len: usize) {
        self.index += 1;
        if self.index >= len {
            self.index = 0;
            self.passes += 1;
        }
    }
}

pub struct LoopingDemuxer {
    opener: Arc<dyn MediaOpener>,
    path: PathBuf,
    /// Source opened by the session probe, used for the first pass
    source: Option<Box<dyn MediaSource>>,
    video_queue: FrameQueue<Arc<VideoFrame>>,
    /// `None` when the media has no audio or audio is disabled
    audio_queue: Option<FrameQueue<Arc<AudioFrame>>>,
    cancel: CancelToken,
    timeout: Duration,
    buffer_frame_limit: usize,
    tag: String,
}

impl LoopingDemuxer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opener: Arc<dyn MediaOpener>,
        path: PathBuf,
        source: Option<Box<dyn MediaSource>>,
        video_queue: FrameQueue<Arc<VideoFrame>>,
        audio_queue: Option<FrameQueue<Arc<AudioFrame>>>,
        cancel: CancelToken,
        timeout: Duration,
        buffer_frame_limit: usize,
    ) -> Self {
        Self {
            opener,
            path,
            source,
            video_queue,
            audio_queue,
            cancel,
            timeout,
            buffer_frame_limit,
            tag: String::new(),
        }
    }

    /// Prefix for log lines, usually the display id.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Run until cancelled or the media fails.
    ///
    /// Always leaves an end-of-stream sentinel in both queues. A failure
    /// also cancels the session.
    pub fn run(mut self) -> Result<(), SourceError> {
        let result = self.play();

        if let Err(e) = &result {
            log::error!("Display {}: demuxer stopped: {}", self.tag, e);
            self.cancel.cancel();
        }

        self.video_queue.close(self.timeout);
        if let Some(queue) = &self.audio_queue {
            queue.close(self.timeout);
        }
        log::debug!("Display {}: demuxer exited", self.tag);
        result
    }

    fn play(&mut self) -> Result<(), SourceError> {
        let mut buffer = Some(LoopBuffer::default());
        let mut loops = 0u64;

        loop {
            let mut source = match self.source.take() {
                Some(source) => source,
                None => self.opener.open(&self.path)?,
            };

            let decoded = self.decode_pass(source.as_mut(), &mut buffer)?;
            drop(source);

            let Some(video_frames) = decoded else {
                return Ok(());
            };
            if video_frames == 0 {
                return Err(SourceError::Decode(format!(
                    "no video frames decoded from {}",
                    self.path.display()
                )));
            }

            loops += 1;
            if let Some(buffer) = buffer.take() {
                log::info!(
                    "Display {}: buffered {} video and {} audio frames, replaying from memory",
                    self.tag,
                    buffer.video.len(),
                    buffer.audio.len()
                );
                return self.replay(buffer);
            }

            log::debug!(
                "Display {}: re-opening {} for loop {}",
                self.tag,
                self.path.display(),
                loops
            );
        }
    }

    /// Decode one full pass. Returns `None` if cancelled.
    fn decode_pass(
        &self,
        source: &mut dyn MediaSource,
        buffer: &mut Option<LoopBuffer>,
    ) -> Result<Option<usize>, SourceError> {
        let mut video_frames = 0;

        while let Some(frame) = source.next_frame()? {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            match frame {
                MediaFrame::Video(frame) => {
                    video_frames += 1;
                    if let Some(kept) = buffer {
                        if kept.video.len() >= self.buffer_frame_limit {
                            log::info!(
                                "Display {}: media exceeds {} buffered frames, decoding every loop",
                                self.tag,
                                self.buffer_frame_limit
                            );
                            *buffer = None;
                        } else {
                            kept.video.push(Arc::clone(&frame));
                        }
                    }
                    if !self.push(&self.video_queue, frame) {
                        return Ok(None);
                    }
                }
                MediaFrame::Audio(frame) => {
                    let Some(queue) = &self.audio_queue else {
                        continue;
                    };
                    if let Some(kept) = buffer {
                        kept.audio.push(Arc::clone(&frame));
                    }
                    if !self.push(queue, frame) {
                        return Ok(None);
                    }
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        Ok(Some(video_frames))
    }

    /// Blocking put, retried on timeout. Returns `false` if cancelled.
    fn push<T>(&self, queue: &FrameQueue<T>, mut frame: T) -> bool {
        loop {
            match queue.push(frame, self.timeout) {
                PushResult::Sent => return true,
                PushResult::TimedOut(back) => frame = back,
                PushResult::Cancelled => return false,
            }
        }
    }

    fn replay(&self, buffer: LoopBuffer) -> Result<(), SourceError> {
        let mut video_cursor = ReplayCursor::default();
        let mut audio_cursor = ReplayCursor::default();
        let mut reported_drift = 0u64;

        while !self.cancel.is_cancelled() {
            let mut pushed = fill(&self.video_queue, &buffer.video, &mut video_cursor);

            if let Some(queue) = &self.audio_queue
                && !buffer.audio.is_empty()
            {
                pushed += fill(queue, &buffer.audio, &mut audio_cursor);

                let drift = video_cursor.passes.abs_diff(audio_cursor.passes);
                if drift > 1 && drift > reported_drift {
                    log::debug!(
                        "Display {}: audio and video replay are {} loops apart ({} vs {})",
                        self.tag,
                        drift,
                        audio_cursor.passes,
                        video_cursor.passes
                    );
                    reported_drift = drift;
                }
            }

            if pushed == 0 && !self.cancel.sleep(self.timeout) {
                break;
            }
        }
        Ok(())
    }
}

/// Push buffered frames while the queue has room. Returns the count pushed.
fn fill<T>(queue: &FrameQueue<Arc<T>>, frames: &[Arc<T>], cursor: &mut ReplayCursor) -> usize {
    if frames.is_empty() {
        return 0;
    }

    let mut pushed = 0;
    for _ in 0..queue.free_slots() {
        if queue.try_push(Arc::clone(&frames[cursor.index])).is_err() {
            break;
        }
        cursor.advance(frames.len());
        pushed += 1;
    }
    pushed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioStreamInfo, MediaInfo, VideoStreamInfo};
    use crate::queue::PopResult;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory media: `video` frames at 10 fps, one audio frame per video frame.
    struct ScriptedSource {
        info: MediaInfo,
        frames: std::vec::IntoIter<MediaFrame>,
    }

    struct ScriptedOpener {
        video: usize,
        audio: bool,
        opens: AtomicUsize,
    }

    impl ScriptedOpener {
        fn new(video: usize, audio: bool) -> Arc<Self> {
            Arc::new(Self {
                video,
                audio,
                opens: AtomicUsize::new(0),
            })
        }
    }

    impl MediaOpener for ScriptedOpener {
        fn open(&self, _path: &Path) -> Result<Box<dyn MediaSource>, SourceError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let mut frames = Vec::new();
            for i in 0..self.video {
                let timestamp = i as f64 / 10.0;
                if self.audio {
                    frames.push(MediaFrame::Audio(Arc::new(AudioFrame {
                        samples: vec![0.0; 8],
                        channels: 2,
                        sample_rate: 40,
                        timestamp,
                    })));
                }
                frames.push(MediaFrame::Video(Arc::new(VideoFrame {
                    width: 1,
                    height: 1,
                    timestamp,
                    data: vec![i as u8, 0, 0, 255],
                })));
            }
            Ok(Box::new(ScriptedSource {
                info: MediaInfo {
                    video: VideoStreamInfo {
                        width: 1,
                        height: 1,
                        frame_rate: 10.0,
                    },
                    audio: self.audio.then_some(AudioStreamInfo {
                        sample_rate: 40,
                        channels: 2,
                    }),
                },
                frames: frames.into_iter(),
            }))
        }
    }

    impl MediaSource for ScriptedSource {
        fn info(&self) -> &MediaInfo {
            &self.info
        }

        fn next_frame(&mut self) -> Result<Option<MediaFrame>, SourceError> {
            Ok(self.frames.next())
        }
    }

    struct FailingOpener;

    impl MediaOpener for FailingOpener {
        fn open(&self, path: &Path) -> Result<Box<dyn MediaSource>, SourceError> {
            Err(SourceError::open(path, "corrupt container"))
        }
    }

    fn demuxer(
        opener: Arc<dyn MediaOpener>,
        cancel: &CancelToken,
        limit: usize,
        with_audio: bool,
    ) -> (
        LoopingDemuxer,
        FrameQueue<Arc<VideoFrame>>,
        Option<FrameQueue<Arc<AudioFrame>>>,
    ) {
        let video = FrameQueue::new(4, cancel.clone());
        let audio = with_audio.then(|| FrameQueue::new(4, cancel.clone()));
        let demuxer = LoopingDemuxer::new(
            opener,
            PathBuf::from("loop.mp4"),
            None,
            video.clone(),
            audio.clone(),
            cancel.clone(),
            Duration::from_millis(20),
            limit,
        );
        (demuxer, video, audio)
    }

    fn pop_video(queue: &FrameQueue<Arc<VideoFrame>>) -> f64 {
        match queue.pop(Duration::from_secs(2)) {
            PopResult::Frame(frame) => frame.timestamp,
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn test_replay_loops_buffered_frames_without_reopening() {
        let cancel = CancelToken::new();
        let opener = ScriptedOpener::new(3, false);
        let (demuxer, video, _) = demuxer(opener.clone(), &cancel, 16, false);
        let handle = std::thread::spawn(move || demuxer.run());

        let timestamps: Vec<f64> = (0..9).map(|_| pop_video(&video)).collect();
        assert_eq!(
            timestamps,
            vec![0.0, 0.1, 0.2, 0.0, 0.1, 0.2, 0.0, 0.1, 0.2]
        );

        cancel.cancel();
        assert!(handle.join().unwrap().is_ok());
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exceeding_ceiling_falls_back_to_redecode() {
        let cancel = CancelToken::new();
        let opener = ScriptedOpener::new(3, false);
        let (demuxer, video, _) = demuxer(opener.clone(), &cancel, 2, false);
        let handle = std::thread::spawn(move || demuxer.run());

        let timestamps: Vec<f64> = (0..9).map(|_| pop_video(&video)).collect();
        assert_eq!(
            timestamps,
            vec![0.0, 0.1, 0.2, 0.0, 0.1, 0.2, 0.0, 0.1, 0.2]
        );

        cancel.cancel();
        assert!(handle.join().unwrap().is_ok());
        assert!(opener.opens.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_audio_and_video_drain_independently() {
        let cancel = CancelToken::new();
        let opener = ScriptedOpener::new(2, true);
        let (demuxer, video, audio) = demuxer(opener, &cancel, 16, true);
        let audio = audio.unwrap();
        let handle = std::thread::spawn(move || demuxer.run());

        // Drain only audio for a while; video stays full but replay continues
        for _ in 0..12 {
            assert!(matches!(
                audio.pop(Duration::from_secs(2)),
                PopResult::Frame(_)
            ));
        }
        assert_eq!(pop_video(&video), 0.0);

        cancel.cancel();
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_open_failure_pushes_sentinels_and_cancels() {
        let cancel = CancelToken::new();
        let (demuxer, video, audio) = demuxer(Arc::new(FailingOpener), &cancel, 16, true);

        let result = demuxer.run();
        assert!(matches!(result, Err(SourceError::Open { .. })));
        assert!(cancel.is_cancelled());

        // Sentinels are queued even though the session is cancelled
        assert_eq!(video.len(), 1);
        assert_eq!(audio.unwrap().len(), 1);
    }

    #[test]
    fn test_empty_media_is_an_error() {
        let cancel = CancelToken::new();
        let (demuxer, _, _) = demuxer(ScriptedOpener::new(0, false), &cancel, 16, false);
        assert!(matches!(demuxer.run(), Err(SourceError::Decode(_))));
    }

    #[test]
    fn test_replay_cursor_wraps_and_counts_passes() {
        let mut cursor = ReplayCursor::default();
        for _ in 0..5 {
            cursor.advance(2);
        }
        assert_eq!(cursor, ReplayCursor { index: 1, passes: 2 });
    }
}
