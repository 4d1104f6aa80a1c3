//! Binary-stream transcription backend.
//!
//! Speaks to a streaming speech service over a persistent WebSocket: raw
//! little-endian PCM frames go up as binary messages, JSON hypothesis
//! messages come back. Interim hypotheses map to partial fragments, final
//! ones to finals.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::UpstreamError;

use super::{FrameQueue, SttEvent, SttEventSink, TranscribeRequest, Transcriber, TranscriberHandle, TranscriptFragment, WsTranscriberHandle};

/// Hypothesis message framing used by the streaming service.
#[derive(Debug, Deserialize)]
struct HypothesisMessage {
    #[serde(default)]
    is_final: bool,
    channel: Option<ChannelPayload>,
}

#[derive(Debug, Deserialize)]
struct ChannelPayload {
    alternatives: Vec<AlternativePayload>,
}

#[derive(Debug, Deserialize)]
struct AlternativePayload {
    transcript: String,
    #[serde(default)]
    confidence: f32,
}

/// Transcriber backend over the binary-PCM streaming protocol.
pub struct StreamTranscriber {
    url: String,
    api_key: Option<String>,
}

impl StreamTranscriber {
    pub fn new(url: String, api_key: Option<String>) -> Self {
        Self { url, api_key }
    }

    fn connect_url(&self, request: &TranscribeRequest) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}language={}&sample_rate={}&channels=1&encoding=linear16&interim_results=true",
            self.url, separator, request.language, request.sample_rate
        )
    }
}

#[async_trait]
impl Transcriber for StreamTranscriber {
    fn available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn open(&self, request: TranscribeRequest, events: SttEventSink) -> Result<Box<dyn TranscriberHandle>, UpstreamError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| UpstreamError::Unavailable("transcription credentials not configured".to_string()))?;

        let mut connect_request = self
            .connect_url(&request)
            .into_client_request()
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Token {}", api_key)).map_err(|e| UpstreamError::Connect(e.to_string()))?;
        connect_request.headers_mut().insert("Authorization", auth);

        let (ws, _) = connect_async(connect_request).await.map_err(|e| UpstreamError::Connect(e.to_string()))?;
        info!("Transcription stream opened ({})", request.language);

        let (mut ws_sender, mut ws_receiver) = ws.split();
        let queue = FrameQueue::new();
        let shutdown = CancellationToken::new();

        // Writer: frame queue -> binary WebSocket messages.
        let writer_queue = queue.clone();
        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    frame = writer_queue.pop() => match frame {
                        Some(bytes) => {
                            if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        // Reader: JSON hypotheses -> events sink. A deliberate close cancels
        // the token first, so no Closed event is reported for it.
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_shutdown.cancelled() => return,
                    message = ws_receiver.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(fragment) = parse_hypothesis(text.as_str()) {
                                if events.send(SttEvent::Fragment(fragment)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Transcription stream closed by upstream");
                            let _ = events.send(SttEvent::Closed).await;
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Transcription stream error: {}", e);
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

/// Map one hypothesis message to a fragment. Messages without a usable
/// alternative (keepalives, empty hypotheses) yield nothing.
fn parse_hypothesis(text: &str) -> Option<TranscriptFragment> {
    let message: HypothesisMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("Unparseable hypothesis message: {}", e);
            return None;
        }
    };

    let alternative = message.channel?.alternatives.into_iter().next()?;
    let transcript = alternative.transcript.trim();
    if transcript.is_empty() {
        return None;
    }

    Some(TranscriptFragment {
        text: transcript.to_string(),
        confidence: alternative.confidence.clamp(0.0, 1.0),
        is_partial: !message.is_final,
        timestamp: Utc::now().timestamp_millis(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_final_hypothesis() {
        let raw = r#"{"is_final":true,"channel":{"alternatives":[{"transcript":"hello world","confidence":0.92}]}}"#;
        let fragment = parse_hypothesis(raw).unwrap();
        assert_eq!(fragment.text, "hello world");
        assert!((fragment.confidence - 0.92).abs() < 1e-6);
        assert!(!fragment.is_partial);
    }

    #[test]
    fn interim_hypothesis_is_partial() {
        let raw = r#"{"channel":{"alternatives":[{"transcript":"hel","confidence":0.4}]}}"#;
        let fragment = parse_hypothesis(raw).unwrap();
        assert!(fragment.is_partial);
    }

    #[test]
    fn empty_and_missing_hypotheses_are_skipped() {
        assert!(parse_hypothesis(r#"{"channel":{"alternatives":[{"transcript":"  "}]}}"#).is_none());
        assert!(parse_hypothesis(r#"{"channel":{"alternatives":[]}}"#).is_none());
        assert!(parse_hypothesis(r#"{"type":"keepalive"}"#).is_none());
        assert!(parse_hypothesis("not json").is_none());
    }

    #[test]
    fn missing_credentials_fail_open() {
        let transcriber = StreamTranscriber::new("ws://localhost:8080/v1/listen".to_string(), None);
        let (sink, _rx) = tokio::sync::mpsc::channel(4);
        let request = TranscribeRequest { language: "en-US".to_string(), sample_rate: 16000 };
        let result = futures_util::future::FutureExt::now_or_never(transcriber.open(request, sink)).unwrap();
        assert!(matches!(result, Err(UpstreamError::Unavailable(_))));
    }

    #[test]
    fn connect_url_appends_query() {
        let transcriber = StreamTranscriber::new("ws://host/v1/listen".to_string(), Some("k".to_string()));
        let request = TranscribeRequest { language: "en-US".to_string(), sample_rate: 16000 };
        let url = transcriber.connect_url(&request);
        assert!(url.starts_with("ws://host/v1/listen?"));
        assert!(url.contains("language=en-US"));
        assert!(url.contains("sample_rate=16000"));
    }
}
