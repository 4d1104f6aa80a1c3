//! Voice activity tracking module.
//!
//! Debounces per-frame voice/silence classifications into start/stop
//! transcription decisions.

mod tracker;

pub use tracker::{SILENCE_TIMEOUT, VadDecision, VoiceActivityTracker};
