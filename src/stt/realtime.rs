//! Realtime transcription backend.
//!
//! Speaks to a speech service whose WebSocket protocol carries base64-encoded
//! PCM inside JSON envelopes and runs voice activity detection server-side.
//! Completed transcriptions map to final fragments, incremental deltas to
//! partials; the provider reports no confidence, so fragments carry 0.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::UpstreamError;

use super::{FrameQueue, SttEvent, SttEventSink, TranscribeRequest, Transcriber, TranscriberHandle, TranscriptFragment, WsTranscriberHandle};

/// Client -> server messages.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ClientMessage {
    /// Configure the session once after connect.
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// One chunk of base64-encoded PCM.
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend { audio: String },
}

#[derive(Debug, Serialize)]
struct SessionConfig {
    input_audio_format: String,
    language: String,
}

/// Server -> client events we care about; everything else is ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta { delta: String },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted { transcript: String },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    #[serde(rename = "error")]
    Error { error: ErrorDetail },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

/// Transcriber backend over the base64-PCM realtime protocol.
pub struct RealtimeTranscriber {
    url: String,
    api_key: Option<String>,
}

impl RealtimeTranscriber {
    pub fn new(url: String, api_key: Option<String>) -> Self {
        Self { url, api_key }
    }
}

#[async_trait]
impl Transcriber for RealtimeTranscriber {
    fn available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn open(&self, request: TranscribeRequest, events: SttEventSink) -> Result<Box<dyn TranscriberHandle>, UpstreamError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| UpstreamError::Unavailable("transcription credentials not configured".to_string()))?;

        let mut connect_request = self.url.as_str().into_client_request().map_err(|e| UpstreamError::Connect(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e| UpstreamError::Connect(e.to_string()))?;
        connect_request.headers_mut().insert("Authorization", auth);

        let (ws, _) = connect_async(connect_request).await.map_err(|e| UpstreamError::Connect(e.to_string()))?;
        info!("Realtime transcription session opened ({})", request.language);

        let (mut ws_sender, mut ws_receiver) = ws.split();

        // Pre-configure the session so per-frame messages carry no overhead.
        let configure = ClientMessage::SessionUpdate {
            session: SessionConfig { input_audio_format: "pcm16".to_string(), language: request.language.clone() },
        };
        let payload = serde_json::to_string(&configure).map_err(|e| UpstreamError::Protocol(e.to_string()))?;
        ws_sender
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        let queue = FrameQueue::new();
        let shutdown = CancellationToken::new();

        // Writer: frame queue -> base64 append messages.
        let writer_queue = queue.clone();
        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    frame = writer_queue.pop() => match frame {
                        Some(bytes) => {
                            let append = ClientMessage::AudioAppend { audio: BASE64.encode(&bytes) };
                            let Ok(payload) = serde_json::to_string(&append) else { continue };
                            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        // Reader: server events -> events sink.
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_shutdown.cancelled() => return,
                    message = ws_receiver.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(fragment) = parse_server_event(text.as_str()) {
                                if events.send(SttEvent::Fragment(fragment)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Realtime transcription session closed by upstream");
                            let _ = events.send(SttEvent::Closed).await;
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Realtime transcription error: {}", e);
                            let _ = events.send(SttEvent::Error(e.to_string())).await;
                            let _ = events.send(SttEvent::Closed).await;
                            return;
                        }
                    },
                }
            }
        });

        Ok(Box::new(WsTranscriberHandle::new(queue, shutdown)))
    }
}

/// Map one server event to zero or one fragments. Speech markers and unknown
/// events are logged, not forwarded; server-side VAD is advisory here because
/// the session runs its own tracker.
fn parse_server_event(text: &str) -> Option<TranscriptFragment> {
    let event: ServerEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!("Unparseable realtime event: {}", e);
            return None;
        }
    };

    match event {
        ServerEvent::TranscriptionDelta { delta } => {
            let delta = delta.trim();
            if delta.is_empty() {
                return None;
            }
            Some(TranscriptFragment { text: delta.to_string(), confidence: 0.0, is_partial: true, timestamp: Utc::now().timestamp_millis() })
        }
        ServerEvent::TranscriptionCompleted { transcript } => {
            let transcript = transcript.trim();
            if transcript.is_empty() {
                return None;
            }
            Some(TranscriptFragment {
                text: transcript.to_string(),
                confidence: 0.0,
                is_partial: false,
                timestamp: Utc::now().timestamp_millis(),
            })
        }
        ServerEvent::SpeechStarted => {
            debug!("Upstream VAD: speech started");
            None
        }
        ServerEvent::SpeechStopped => {
            debug!("Upstream VAD: speech stopped");
            None
        }
        ServerEvent::Error { error } => {
            warn!("Realtime transcription provider error: {}", error.message);
            None
        }
        ServerEvent::Other => None,
    }
}
