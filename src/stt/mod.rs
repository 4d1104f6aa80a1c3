//! Streaming speech-to-text adapters.
//!
//! A Transcriber is a long-lived duplex channel per session: PCM frames go
//! up, transcript hypotheses come back through an events sink the session
//! task drains. Two wire backends live behind the same trait; which one is
//! used is a configuration choice the orchestrator never sees.

mod realtime;
mod stream;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::UpstreamError;

pub use realtime::RealtimeTranscriber;
pub use stream::StreamTranscriber;

/// Bound on queued-but-unsent outbound frames per transcriber. At ~64 ms per
/// frame this is several seconds of audio; beyond it the connection is not
/// keeping up and old audio is worthless.
const FRAME_QUEUE_CAPACITY: usize = 64;

/// One transcript hypothesis from the upstream recognizer.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptFragment {
    pub text: String,
    /// Confidence in [0, 1]. Backends without confidence scores report 0.
    pub confidence: f32,
    /// Partials may be superseded; finals are terminal for their span.
    pub is_partial: bool,
    /// Epoch milliseconds
    pub timestamp: i64,
}

/// Events delivered through the sink passed to [`Transcriber::open`].
///
/// Adapter tasks never touch session state directly; the session task owns
/// the receiving end and folds these into its serialized loop.
#[derive(Debug)]
pub enum SttEvent {
    Fragment(TranscriptFragment),
    /// Transport or provider error. Followed by `Closed`.
    Error(String),
    /// The channel is gone; the handle is terminally closed.
    Closed,
}

pub type SttEventSink = mpsc::Sender<SttEvent>;

/// Parameters for opening a transcription channel.
#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub language: String,
    pub sample_rate: u32,
}

/// Factory for per-session transcription channels.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Whether the backend is configured at all. False means the capability
    /// is disabled and sessions run voice activity detection only.
    fn available(&self) -> bool;

    /// Open a channel. Fails with [`UpstreamError::Unavailable`] when the
    /// credential is missing and [`UpstreamError::Connect`] when the connect
    /// itself fails.
    async fn open(&self, request: TranscribeRequest, events: SttEventSink) -> Result<Box<dyn TranscriberHandle>, UpstreamError>;
}

/// An open transcription channel.
pub trait TranscriberHandle: Send + Sync {
    /// Queue one frame of samples for the upstream. Non-blocking: a closed
    /// channel or a full queue drops audio with a logged warning instead of
    /// stalling the session.
    fn push(&self, samples: &[i16]);

    /// Close the channel. Idempotent.
    fn close(&mut self);
}

/// Bounded drop-oldest queue between `push` (session task) and the backend's
/// writer task. Dropping the oldest frames under pressure keeps the freshest
/// audio flowing instead of blocking the session.
pub(crate) struct FrameQueue {
    frames: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl FrameQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self { frames: Mutex::new(VecDeque::new()), notify: Notify::new(), closed: AtomicBool::new(false) })
    }

    pub(crate) fn push(&self, frame: Vec<u8>) {
        if self.closed.load(Ordering::Acquire) {
            warn!("Transcriber channel closed, dropping frame ({} bytes)", frame.len());
            return;
        }

        {
            let mut frames = self.frames.lock();
            if frames.len() >= FRAME_QUEUE_CAPACITY {
                frames.pop_front();
                warn!("Transcriber outbound queue full, dropping oldest frame");
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
    }

    /// Next frame, waiting if the queue is empty. Returns `None` once the
    /// queue is closed and drained.
    pub(crate) async fn pop(&self) -> Option<Vec<u8>> {
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.frames.lock().pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Shared handle implementation for the WebSocket backends: samples are
/// LE-encoded onto the frame queue; closing tears the backend tasks down.
pub(crate) struct WsTranscriberHandle {
    queue: Arc<FrameQueue>,
    shutdown: CancellationToken,
}

impl WsTranscriberHandle {
    pub(crate) fn new(queue: Arc<FrameQueue>, shutdown: CancellationToken) -> Self {
        Self { queue, shutdown }
    }
}

impl TranscriberHandle for WsTranscriberHandle {
    fn push(&self, samples: &[i16]) {
        let bytes: Vec<u8> = samples.iter().flat_map(|&s| s.to_le_bytes()).collect();
        self.queue.push(bytes);
    }

    fn close(&mut self) {
        self.queue.close();
        self.shutdown.cancel();
    }
}

impl Drop for WsTranscriberHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_queue_delivers_in_order() {
        let queue = FrameQueue::new();
        queue.push(vec![1]);
        queue.push(vec![2]);
        assert_eq!(queue.pop().await, Some(vec![1]));
        assert_eq!(queue.pop().await, Some(vec![2]));
    }

    #[tokio::test]
    async fn frame_queue_drops_oldest_when_full() {
        let queue = FrameQueue::new();
        for i in 0..(FRAME_QUEUE_CAPACITY + 3) {
            queue.push(vec![i as u8]);
        }

        // The first three frames were evicted.
        assert_eq!(queue.pop().await, Some(vec![3]));
        let mut remaining = 1;
        while {
            let frames = queue.frames.lock();
            !frames.is_empty()
        } {
            queue.pop().await;
            remaining += 1;
        }
        assert_eq!(remaining, FRAME_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn frame_queue_close_drains_then_ends() {
        let queue = FrameQueue::new();
        queue.push(vec![7]);
        queue.close();
        queue.push(vec![8]); // dropped, channel closed
        assert_eq!(queue.pop().await, Some(vec![7]));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = FrameQueue::new();
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(vec![9]);
        assert_eq!(popper.await.unwrap(), Some(vec![9]));
    }
}
