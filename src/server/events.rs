//! Wire events for the client transport.
//!
//! Every WebSocket frame is a JSON object with an `event` name and its
//! payload fields inline; payload fields are camelCase. Binary audio going
//! to the client rides inside JSON as base64.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize, Serializer};

use crate::conversation::Turn;

/// Events the client sends to the gateway.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    StartSession {
        user_id: String,
        #[serde(default)]
        language_code: Option<String>,
    },
    StartProcessing {
        session_id: String,
    },
    StopProcessing {
        #[serde(default)]
        session_id: Option<String>,
    },
    AudioData {
        session_id: String,
        samples: Vec<i16>,
        #[serde(default)]
        sample_rate: Option<u32>,
        #[serde(default)]
        channels: Option<u16>,
    },
    GetConversationHistory {
        #[serde(default)]
        limit: Option<usize>,
    },
    ClearConversation,
    GetConversationStats,
}

/// Events the gateway sends to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Ready,
    SessionCreated {
        session_id: String,
        message: String,
    },
    ProcessingStarted {
        message: String,
    },
    ProcessingStopped {
        message: String,
    },
    TranscriptionResult {
        transcript: String,
        confidence: f32,
        is_partial: bool,
        timestamp: i64,
    },
    AiResponse {
        response: String,
        transcript: String,
        timestamp: i64,
        confidence: f32,
        buffered_transcripts: bool,
    },
    AiResponseError {
        message: String,
        timestamp: i64,
    },
    AiInterrupted {
        timestamp: i64,
        interrupted_at: i64,
    },
    TtsAudio {
        #[serde(serialize_with = "as_base64")]
        audio_data: Vec<u8>,
        text: String,
        timestamp: i64,
    },
    TtsError {
        message: String,
        timestamp: i64,
    },
    TtsUnavailable {
        message: String,
        timestamp: i64,
    },
    TranscriptionError {
        message: String,
    },
    ConversationHistory {
        history: Vec<Turn>,
        user_id: String,
        timestamp: i64,
    },
    ConversationCleared {
        user_id: String,
        timestamp: i64,
    },
    ConversationStats {
        conversation_count: usize,
        total_turns: usize,
        timestamp: i64,
    },
    ConversationError {
        message: String,
    },
    Error {
        message: String,
    },
}

fn as_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes))
}
