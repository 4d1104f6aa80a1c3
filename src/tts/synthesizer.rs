//! Text-to-speech synthesis over a streaming HTTP service.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::UpstreamError;

/// Turns reply text into one buffer of audio bytes.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Whether synthesis is configured at all. Absent credentials make this
    /// false and the session reports `tts-unavailable` instead of audio.
    fn available(&self) -> bool;

    /// Synthesize `text`, accumulating the streamed response into a single
    /// buffer. A tripped cancel token discards any partial audio.
    async fn synthesize(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<u8>, UpstreamError>;
}

/// Synthesizer backed by an HTTP speech endpoint that streams audio bytes.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    voice: String,
}

impl HttpSynthesizer {
    pub fn new(config: &AppConfig) -> Self {
        if config.tts_api_key.is_some() {
            info!("TTS configured at {} (voice: {})", config.tts_url, config.tts_voice);
        } else {
            info!("TTS credentials absent, synthesis disabled");
        }

        Self {
            client: reqwest::Client::new(),
            url: config.tts_url.clone(),
            api_key: config.tts_api_key.clone(),
            voice: config.tts_voice.clone(),
        }
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    fn available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn synthesize(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<u8>, UpstreamError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| UpstreamError::Unavailable("synthesis credentials not configured".to_string()))?;

        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        debug!("Synthesizing {} chars", text.len());

        let request = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .json(&serde_json::json!({
                "input": text,
                "voice": self.voice,
                "response_format": "pcm",
            }))
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
            result = request => result.map_err(|e| UpstreamError::Request(e.to_string()))?,
        };

        let response = response.error_for_status().map_err(|e| UpstreamError::Request(e.to_string()))?;

        let mut stream = response.bytes_stream();
        let mut audio = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => audio.extend_from_slice(&bytes),
                    Some(Err(e)) => return Err(UpstreamError::Request(e.to_string())),
                    None => break,
                },
            }
        }

        info!("🎵 Generated speech ({} bytes)", audio.len());
        Ok(audio)
    }
}
