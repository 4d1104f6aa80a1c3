//! Debounced voice activity state machine.
//!
//! Consumes one `(now, voice_active)` observation per audio frame and decides
//! when transcription should start and stop. The frame-count and debounce
//! thresholds suppress rapid start/stop oscillation that would otherwise
//! exceed upstream concurrency limits.
//!
//! The tracker performs no I/O and arms no timers itself: it hands out
//! decisions carrying a generation number, and the session task owns the
//! actual sleep. Re-arming or cancelling bumps the generation, so a timer
//! that fired but was not yet delivered is ignored on receipt.

use std::time::{Duration, Instant};

use tracing::{debug, info};

/// Consecutive voice frames required before transcription starts.
const SPEECH_FRAMES_TO_START: u32 = 3;

/// Consecutive silence frames required before the silence timer is armed.
const SILENCE_FRAMES_TO_ARM: u32 = 5;

/// Minimum gap between two transcription starts.
const START_DEBOUNCE: Duration = Duration::from_millis(2000);

/// How long silence must persist before transcription stops.
pub const SILENCE_TIMEOUT: Duration = Duration::from_millis(4000);

/// Control decision emitted to the session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// Open a transcriber for this session.
    StartTranscription,
    /// Arm a one-shot silence timer; deliver `generation` back on expiry.
    ArmSilenceTimer { generation: u64, delay: Duration },
    /// Fresh voice arrived while the silence timer was pending.
    CancelSilenceTimer,
}

/// Per-session voice activity tracker.
#[derive(Debug)]
pub struct VoiceActivityTracker {
    /// Currently inside a voice run
    active: bool,
    /// A transcriber is (being) opened for the current speech run
    transcription_started: bool,
    last_voice_at: Option<Instant>,
    last_transcription_start: Option<Instant>,
    voice_frames: u32,
    silence_frames: u32,
    /// Generation of the pending silence timer, if one is armed
    pending_silence_timer: Option<u64>,
    timer_generation: u64,
}

impl VoiceActivityTracker {
    pub fn new() -> Self {
        Self {
            active: false,
            transcription_started: false,
            last_voice_at: None,
            last_transcription_start: None,
            voice_frames: 0,
            silence_frames: 0,
            pending_silence_timer: None,
            timer_generation: 0,
        }
    }

    /// Feed one frame classification. The voice and silence counters are
    /// mutually exclusive: incrementing one resets the other.
    pub fn on_frame(&mut self, now: Instant, voice_active: bool) -> Option<VadDecision> {
        if voice_active {
            self.voice_frames += 1;
            self.silence_frames = 0;
            self.last_voice_at = Some(now);

            if !self.active {
                self.active = true;
                debug!("Speech run started (frame count {})", self.voice_frames);
            }

            if self.pending_silence_timer.take().is_some() {
                // Voice resumed before the silence timeout; invalidate the timer.
                self.timer_generation += 1;
                return Some(VadDecision::CancelSilenceTimer);
            }

            if !self.transcription_started && self.voice_frames >= SPEECH_FRAMES_TO_START && self.debounce_elapsed(now) {
                self.transcription_started = true;
                self.last_transcription_start = Some(now);
                info!("🎤 Speech detected, starting transcription");
                return Some(VadDecision::StartTranscription);
            }
        } else {
            self.silence_frames += 1;
            self.voice_frames = 0;

            if self.active {
                self.active = false;
                if let Some(started) = self.last_voice_at {
                    debug!("Speech run ended ({:.1}s)", now.duration_since(started).as_secs_f32());
                }
            }

            if self.transcription_started && self.silence_frames >= SILENCE_FRAMES_TO_ARM && self.pending_silence_timer.is_none() {
                self.timer_generation += 1;
                self.pending_silence_timer = Some(self.timer_generation);
                debug!("Silence sustained, arming {}ms stop timer", SILENCE_TIMEOUT.as_millis());
                return Some(VadDecision::ArmSilenceTimer { generation: self.timer_generation, delay: SILENCE_TIMEOUT });
            }
        }

        None
    }

    /// Deliver a fired silence timer. Returns true when transcription should
    /// stop; a stale generation (re-armed or cancelled since) is a no-op.
    pub fn on_silence_timeout(&mut self, generation: u64) -> bool {
        if self.pending_silence_timer != Some(generation) {
            return false;
        }

        self.pending_silence_timer = None;
        self.transcription_started = false;
        info!("🎤 Silence timeout, stopping transcription");
        true
    }

    /// The transcriber went away underneath us (upstream error or close).
    /// Clears `transcription_started` so the next speech run can open a fresh
    /// channel, and invalidates any pending silence timer.
    pub fn on_transcriber_gone(&mut self) {
        self.transcription_started = false;
        if self.pending_silence_timer.take().is_some() {
            self.timer_generation += 1;
        }
    }

    /// Full reset, used when processing (re)starts.
    pub fn reset(&mut self) {
        let generation = self.timer_generation + 1;
        *self = Self::new();
        // Preserve monotonicity so in-flight timers from before the reset stay stale.
        self.timer_generation = generation;
    }

    pub fn is_transcribing(&self) -> bool {
        self.transcription_started
    }

    fn debounce_elapsed(&self, now: Instant) -> bool {
        match self.last_transcription_start {
            Some(last) => now.duration_since(last) > START_DEBOUNCE,
            None => true,
        }
    }

    #[cfg(test)]
    fn counters(&self) -> (u32, u32) {
        (self.voice_frames, self.silence_frames)
    }
}

impl Default for VoiceActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}
