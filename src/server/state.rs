//! Shared application state for the transport layer.

use std::sync::Arc;

use crate::config::{AppConfig, SttBackend};
use crate::conversation::ConversationStore;
use crate::llm::build_responder;
use crate::session::{SessionDeps, SessionRegistry};
use crate::stt::{RealtimeTranscriber, StreamTranscriber, Transcriber};
use crate::tts::HttpSynthesizer;

/// Application state shared across all handlers and connections.
pub type AppState = Arc<GatewayState>;

/// Everything the transport needs: the session registry, the conversation
/// store, and the upstream adapters wired per configuration.
pub struct GatewayState {
    pub registry: SessionRegistry,
    pub store: Arc<ConversationStore>,
    pub deps: SessionDeps,
    pub default_language: String,
}

impl GatewayState {
    /// Wire the upstream adapters the configuration calls for and assemble
    /// the process-wide state.
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let store = Arc::new(ConversationStore::new());

        let transcriber: Arc<dyn Transcriber> = match config.stt_backend {
            SttBackend::Stream => Arc::new(StreamTranscriber::new(config.stt_url.clone(), config.stt_api_key.clone())),
            SttBackend::Realtime => Arc::new(RealtimeTranscriber::new(config.stt_url.clone(), config.stt_api_key.clone())),
        };
        let responder = build_responder(config)?;
        let synthesizer = Arc::new(HttpSynthesizer::new(config));

        let deps = SessionDeps {
            transcriber,
            responder,
            synthesizer,
            store: store.clone(),
            max_history: config.max_history,
            min_confidence: config.min_confidence,
        };

        Ok(Self { registry: SessionRegistry::new(), store, deps, default_language: config.default_language.clone() })
    }
}
