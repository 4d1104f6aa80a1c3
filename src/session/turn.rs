//! Turn batching for the interruption controller.
//!
//! Final transcript fragments accumulate here until the inactivity timer (or
//! an explicit flush) drains them into a single user turn.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::stt::TranscriptFragment;

/// How long the user must stay quiet after a final fragment before the
/// buffered fragments become a turn.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_millis(2000);

/// One drained turn: the joined text plus the mean fragment confidence
/// (telemetry only).
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedTurn {
    pub text: String,
    pub confidence: f32,
    pub fragments: usize,
}

/// Ordered buffer of final transcript fragments for one session.
#[derive(Debug, Default)]
pub struct TurnBuffer {
    fragments: Vec<TranscriptFragment>,
}

impl TurnBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: TranscriptFragment) {
        self.fragments.push(fragment);
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
    }

    /// Drain the buffer into a single turn. Fragment texts are trimmed and
    /// joined with single spaces; an all-whitespace result yields `None`
    /// (the buffer is emptied either way).
    pub fn drain(&mut self) -> Option<BufferedTurn> {
        if self.fragments.is_empty() {
            return None;
        }

        let fragments = std::mem::take(&mut self.fragments);
        let count = fragments.len();
        let text = fragments.iter().map(|f| f.text.trim()).filter(|t| !t.is_empty()).collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            return None;
        }

        let confidence = fragments.iter().map(|f| f.confidence).sum::<f32>() / count as f32;
        Some(BufferedTurn { text, confidence, fragments: count })
    }
}

/// Handle to one live reply or synthesis task. The id lets the session task
/// tell a current completion from a cancelled task finishing late.
#[derive(Debug)]
pub struct TaskHandle {
    pub id: u64,
    pub cancel: CancellationToken,
    /// Epoch milliseconds at launch
    pub started_at: i64,
}

impl TaskHandle {
    pub fn new(id: u64) -> Self {
        Self { id, cancel: CancellationToken::new(), started_at: Utc::now().timestamp_millis() }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
