//! Typed errors for the upstream service adapters.

use thiserror::Error;

/// Failure surfaced by a Transcriber, Responder or Synthesizer adapter.
///
/// The variants carry the distinctions the error policies need: a missing
/// capability is handled differently from a connect failure, which is handled
/// differently from a mid-stream error or a deliberate cancellation.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The capability is not configured (typically a missing credential).
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// Establishing the upstream connection failed.
    #[error("upstream connect failed: {0}")]
    Connect(String),

    /// The upstream spoke something we could not understand.
    #[error("upstream protocol error: {0}")]
    Protocol(String),

    /// An in-flight request failed.
    #[error("upstream request failed: {0}")]
    Request(String),

    /// The request was cancelled on our side (barge-in or teardown).
    #[error("cancelled")]
    Cancelled,
}

impl UpstreamError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpstreamError::Cancelled)
    }
}
