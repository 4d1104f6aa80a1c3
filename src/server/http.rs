//! HTTP surface: the static demo page and the health/status endpoints.
//!
//! Handlers are thin — each reads the registry and returns JSON.

use axum::Json;
use axum::extract::State;
use axum::response::Html;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};

use super::state::AppState;

/// `GET /` — the embedded demo client page.
pub async fn index() -> Html<&'static str> {
    Html(include_str!("../../static/index.html"))
}

/// `GET /health-check` (aliased as `/health`).
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "activeSessions": state.registry.active_sessions(),
        "activeTranscriptions": state.registry.active_transcriptions(),
        "uptime": state.registry.uptime_seconds(),
        "timestamp": Utc::now().timestamp_millis(),
    }))
}

/// `GET /status`.
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "message": "Voice gateway running",
        "activeSessions": state.registry.active_sessions(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    id: String,
    user_id: String,
    is_processing: bool,
    has_transcription: bool,
    /// Milliseconds since the session was created
    duration: u64,
    language_code: String,
}

/// `GET /sessions`.
pub async fn sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    let summaries = state
        .registry
        .snapshot()
        .into_iter()
        .map(|info| SessionSummary {
            id: info.id.clone(),
            user_id: info.user_id.clone(),
            is_processing: info.is_processing(),
            has_transcription: info.is_transcribing(),
            duration: info.created_at.elapsed().as_millis() as u64,
            language_code: info.language.clone(),
        })
        .collect();
    Json(summaries)
}
