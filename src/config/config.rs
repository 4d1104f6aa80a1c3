//! Application configuration and CLI argument parsing.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Which upstream transcription backend to wire behind the Transcriber trait.
/// The orchestrator only sees the abstract interface; this is purely a
/// configuration concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SttBackend {
    /// Persistent WebSocket carrying raw binary PCM frames, JSON hypotheses back
    #[default]
    Stream,
    /// WebSocket carrying base64-encoded PCM with server-side VAD events
    Realtime,
}

impl std::fmt::Display for SttBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SttBackend::Stream => write!(f, "stream"),
            SttBackend::Realtime => write!(f, "realtime"),
        }
    }
}

/// Voice gateway application configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "voice-gateway")]
#[command(author, version, about = "A real-time conversational voice gateway", long_about = None)]
pub struct AppConfig {
    /// Port for the WebSocket transport and HTTP surface
    #[arg(long, short = 'p', env = "PORT", default_value = "3000")]
    pub port: u16,

    /// Transcription backend wired behind the Transcriber interface
    #[arg(long, value_enum, env = "STT_BACKEND", default_value = "stream")]
    pub stt_backend: SttBackend,

    /// Streaming speech-to-text service URL
    #[arg(long, env = "STT_URL", default_value = "ws://localhost:8080/v1/listen")]
    pub stt_url: String,

    /// Speech-to-text API key. Absent disables transcription (audio is still
    /// processed for voice activity detection).
    #[arg(long, env = "STT_API_KEY")]
    pub stt_api_key: Option<String>,

    /// OpenAI-compatible LLM API URL
    #[arg(long, short = 'u', env = "LLM_URL", default_value = "http://localhost:11434/v1")]
    pub llm_url: String,

    /// LLM API key. Absent makes the responder return a canned fallback reply.
    #[arg(long, env = "LLM_API_KEY")]
    pub llm_api_key: Option<String>,

    /// LLM model name
    #[arg(long, short = 'm', env = "LLM_MODEL", default_value = "gemma3:1b")]
    pub llm_model: String,

    /// Text-to-speech service URL
    #[arg(long, env = "TTS_URL", default_value = "http://localhost:8880/v1/audio/speech")]
    pub tts_url: String,

    /// Text-to-speech API key. Absent disables synthesis; clients see
    /// `tts-unavailable` instead of audio.
    #[arg(long, env = "TTS_API_KEY")]
    pub tts_api_key: Option<String>,

    /// TTS voice name
    #[arg(long, default_value = "af_bella")]
    pub tts_voice: String,

    /// Default language tag for new sessions (overridable per session)
    #[arg(long, default_value = "en-US")]
    pub default_language: String,

    /// System prompt for the LLM
    #[arg(
        long,
        short = 's',
        default_value = "You are a helpful voice assistant. Keep responses brief and concise, maximum 2-3 short sentences. Be conversational and natural for speech output. Never use emojis, markdown formatting, bullet points, numbered lists, or special characters. Use plain spoken language only."
    )]
    pub system_prompt: String,

    /// LLM temperature (0.0-2.0)
    #[arg(long, default_value = "0.7", value_parser = parse_temperature)]
    pub temperature: f32,

    /// Number of recent conversation turns included in the LLM prompt
    #[arg(long, default_value = "10")]
    pub max_history: usize,

    /// Minimum confidence for a final transcript fragment to be buffered
    /// (0.0 admits everything, including zero-confidence results some
    /// providers return for valid hypotheses)
    #[arg(long, default_value = "0.0")]
    pub min_confidence: f32,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

impl AppConfig {
    /// Parse configuration from command line arguments and environment.
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Port must be non-zero");
        }

        if !(0.0..=1.0).contains(&self.min_confidence) {
            anyhow::bail!("Minimum confidence must be between 0.0 and 1.0");
        }

        if self.max_history == 0 {
            anyhow::bail!("Prompt history window must be at least 1 turn");
        }

        if !self.stt_url.starts_with("ws://") && !self.stt_url.starts_with("wss://") {
            anyhow::bail!("STT URL must be a ws:// or wss:// endpoint: {}", self.stt_url);
        }

        Ok(())
    }

    /// Log the current configuration. Credentials are summarized, never printed.
    pub fn log_config(&self) {
        info!("Configuration:");
        info!("  Port: {}", self.port);
        info!("  STT backend: {} ({})", self.stt_backend, self.stt_url);
        info!("  STT credentials: {}", present(&self.stt_api_key));
        info!("  LLM URL: {}", self.llm_url);
        info!("  LLM model: {}", self.llm_model);
        info!("  LLM credentials: {}", present(&self.llm_api_key));
        info!("  TTS URL: {}", self.tts_url);
        info!("  TTS voice: {}", self.tts_voice);
        info!("  TTS credentials: {}", present(&self.tts_api_key));
        info!("  Default language: {}", self.default_language);
        info!("  System prompt: {}...", &self.system_prompt.chars().take(50).collect::<String>());
        info!("  Temperature: {}", self.temperature);
        info!("  Prompt history window: {} turns", self.max_history);
        info!("  Minimum transcript confidence: {}", self.min_confidence);
    }
}

fn present(credential: &Option<String>) -> &'static str {
    if credential.is_some() { "present" } else { "absent" }
}

/// Parse and validate temperature value (0.0-2.0).
fn parse_temperature(s: &str) -> Result<f32, String> {
    let value: f32 = s.parse().map_err(|_| format!("'{}' is not a valid float", s))?;
    if (0.0..=2.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("temperature must be between 0.0 and 2.0, got {}", value))
    }
}
