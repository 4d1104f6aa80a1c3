//! Text-to-speech module.
//!
//! Provides speech synthesis over a streaming HTTP speech service.

mod synthesizer;

pub use synthesizer::{HttpSynthesizer, Synthesizer};
