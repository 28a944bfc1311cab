//! Bounded frame queues and session cancellation
//!
//! Workers block on queue operations with a timeout. Every blocking
//! operation also selects on the session's [`CancelToken`], so cancelling
//! wakes blocked producers and consumers right away.

use crossbeam_channel::{Receiver, Select, Sender, bounded, select};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared cancellation flag with a broadcast wake-up.
///
/// The wake-up is a zero-capacity channel whose only sender is dropped on
/// [`cancel`](Self::cancel); every receiver then becomes ready at once.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        if let Ok(mut trigger) = self.inner.trigger.lock() {
            trigger.take();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Receiver that becomes ready (disconnected) once cancelled.
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `false` if the token was cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        select! {
            recv(self.inner.signal) -> _ => false,
            default(duration) => !self.is_cancelled(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue slot: a frame or the end-of-stream sentinel.
#[derive(Debug)]
pub enum QueueItem<T> {
    Frame(T),
    EndOfStream,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushResult<T> {
    Sent,
    /// Queue stayed full for the whole timeout; the frame is handed back
    TimedOut(T),
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PopResult<T> {
    Frame(T),
    EndOfStream,
    /// Nothing arrived within the timeout
    Empty,
    Cancelled,
}

/// Fixed-capacity FIFO between the demuxer and one renderer.
pub struct FrameQueue<T> {
    tx: Sender<QueueItem<T>>,
    rx: Receiver<QueueItem<T>>,
    capacity: usize,
    cancel: CancelToken,
}

impl<T> Clone for FrameQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize, cancel: CancelToken) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            cancel,
        }
    }

    /// Blocking put with backpressure.
    pub fn push(&self, frame: T, timeout: Duration) -> PushResult<T> {
        if self.cancel.is_cancelled() {
            return PushResult::Cancelled;
        }

        let mut sel = Select::new();
        let send_index = sel.send(&self.tx);
        let cancel_index = sel.recv(self.cancel.signal());

        match sel.select_timeout(timeout) {
            Err(_) => PushResult::TimedOut(frame),
            Ok(op) if op.index() == send_index => {
                match op.send(&self.tx, QueueItem::Frame(frame)) {
                    Ok(()) => PushResult::Sent,
                    Err(_) => PushResult::Cancelled,
                }
            }
            Ok(op) => {
                debug_assert_eq!(op.index(), cancel_index);
                let _ = op.recv(self.cancel.signal());
                PushResult::Cancelled
            }
        }
    }

    /// Non-blocking put, handing the frame back if the queue is full.
    pub fn try_push(&self, frame: T) -> Result<(), T> {
        self.tx
            .try_send(QueueItem::Frame(frame))
            .map_err(|e| match e.into_inner() {
                QueueItem::Frame(frame) => frame,
                QueueItem::EndOfStream => unreachable!("only frames are pushed here"),
            })
    }

    /// Blocking get.
    pub fn pop(&self, timeout: Duration) -> PopResult<T> {
        if self.cancel.is_cancelled() {
            return PopResult::Cancelled;
        }

        select! {
            recv(self.rx) -> item => match item {
                Ok(QueueItem::Frame(frame)) => PopResult::Frame(frame),
                Ok(QueueItem::EndOfStream) | Err(_) => PopResult::EndOfStream,
            },
            recv(self.cancel.signal()) -> _ => PopResult::Cancelled,
            default(timeout) => PopResult::Empty,
        }
    }

    /// Push the end-of-stream sentinel, waiting at most `timeout` for room.
    ///
    /// Ignores cancellation; returns whether the sentinel was queued.
    pub fn close(&self, timeout: Duration) -> bool {
        self.tx
            .send_timeout(QueueItem::EndOfStream, timeout)
            .is_ok()
    }

    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.rx.len())
    }
}
