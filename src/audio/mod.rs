//! Audio analysis module.
//!
//! Provides the pure per-frame volume and voice/silence analysis feeding the
//! voice activity tracker.

mod analyzer;

pub use analyzer::{AnalysisResult, AudioFrame, SAMPLE_RATE, VOICE_VOLUME_THRESHOLD, analyze};
