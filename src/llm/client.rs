//! Reply generation using RIG against an OpenAI-compatible provider.

use async_trait::async_trait;
use rig::agent::Agent;
use rig::client::CompletionClient;
use rig::completion::Chat;
use rig::message::Message;
use rig::providers::openai;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::conversation::{Role, Turn};
use crate::error::UpstreamError;

/// Fallback reply returned when no LLM credential is configured.
const CANNED_REPLY: &str = "I heard you, but I am not connected to a language model right now.";

/// Produces one assistant reply for a user turn, given a recent conversation
/// window. The prompt is the fixed system preamble plus the window plus the
/// current user text; history lives in the conversation store, not here.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, user_text: &str, history: &[Turn], cancel: &CancellationToken) -> Result<String, UpstreamError>;
}

/// Responder backed by a RIG agent.
pub struct RigResponder {
    agent: Agent<openai::CompletionModel>, // RIG agent with OpenAI-compatible backend
}

impl RigResponder {
    /// Create a responder from configuration.
    ///
    /// # Errors
    /// Returns an error if the provider client cannot be constructed.
    pub fn new(config: &AppConfig, api_key: &str) -> anyhow::Result<Self> {
        info!("Connecting to LLM at {}", config.llm_url);
        info!("Using model: {}", config.llm_model);

        let client = openai::Client::builder()
            .api_key(api_key)
            .base_url(&config.llm_url)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create LLM client: {}", e))?
            .completions_api();

        let agent = client
            .agent(&config.llm_model)
            .preamble(&config.system_prompt)
            .temperature(config.temperature as f64)
            .build();

        Ok(Self { agent })
    }
}

#[async_trait]
impl Responder for RigResponder {
    async fn respond(&self, user_text: &str, history: &[Turn], cancel: &CancellationToken) -> Result<String, UpstreamError> {
        debug!("User: {}", user_text);

        let history: Vec<Message> = history
            .iter()
            .map(|turn| match turn.role {
                Role::User => Message::user(&turn.content),
                Role::Assistant => Message::assistant(&turn.content),
            })
            .collect();

        // A tripped token abandons the request; a provider success arriving
        // after that is dropped with the future, never observed.
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
            result = self.agent.chat(user_text, history) => {
                result.map_err(|e| UpstreamError::Request(e.to_string()))?
            }
        };

        debug!("Assistant: {}", response);
        Ok(response)
    }
}

/// Responder used when no LLM credential is configured: always answers with
/// a canned line so the rest of the pipeline stays exercisable.
pub struct CannedResponder;

#[async_trait]
impl Responder for CannedResponder {
    async fn respond(&self, _user_text: &str, _history: &[Turn], cancel: &CancellationToken) -> Result<String, UpstreamError> {
        if cancel.is_cancelled() {
            return Err(UpstreamError::Cancelled);
        }
        Ok(CANNED_REPLY.to_string())
    }
}

/// Build the responder the configuration calls for.
pub fn build_responder(config: &AppConfig) -> anyhow::Result<std::sync::Arc<dyn Responder>> {
    match &config.llm_api_key {
        Some(api_key) => Ok(std::sync::Arc::new(RigResponder::new(config, api_key)?)),
        None => {
            info!("LLM credentials absent, replies will use a canned fallback");
            Ok(std::sync::Arc::new(CannedResponder))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn canned_responder_answers_without_credentials() {
        let cancel = CancellationToken::new();
        let reply = CannedResponder.respond("hello", &[], &cancel).await.unwrap();
        assert_eq!(reply, CANNED_REPLY);
    }

    #[tokio::test]
    async fn canned_responder_honors_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = CannedResponder.respond("hello", &[], &cancel).await;
        assert!(matches!(result, Err(UpstreamError::Cancelled)));
    }
}
