//! Frame-level audio analysis.
//!
//! Pure transform from a PCM frame to a volume estimate and a voice/silence
//! classification. No state, no I/O; the debouncing lives in the voice
//! activity tracker.

use serde::Serialize;

/// Volume above which a frame counts as voice. Fixed; calibration is out of scope.
pub const VOICE_VOLUME_THRESHOLD: u8 = 5;

/// The fixed audio profile: PCM s16le, mono, 16 kHz.
pub const SAMPLE_RATE: u32 = 16_000;

/// Full-scale value of signed 16-bit audio.
const FULL_SCALE: f64 = 32768.0;

/// One frame of PCM audio from a session.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Wall-clock arrival time, epoch milliseconds
    pub timestamp: i64,
    /// Signed 16-bit PCM samples (interleaved if multi-channel)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
}

/// Result of analyzing a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// RMS volume scaled to 0-100
    pub volume: u8,
    /// Whether the frame is classified as voice
    pub voice_active: bool,
}

/// Analyze one frame: RMS volume on a 0-100 scale and a voice classification.
///
/// An empty frame yields volume 0 and is never voice.
pub fn analyze(frame: &AudioFrame) -> AnalysisResult {
    if frame.samples.is_empty() {
        return AnalysisResult { volume: 0, voice_active: false };
    }

    let sum_squares: f64 = frame.samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    let rms = (sum_squares / frame.samples.len() as f64).sqrt();
    let volume = ((rms / FULL_SCALE) * 100.0).round().clamp(0.0, 100.0) as u8;

    AnalysisResult { volume, voice_active: volume > VOICE_VOLUME_THRESHOLD }
}
