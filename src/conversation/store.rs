//! Process-wide conversation history store.
//!
//! Maps user ids to ordered turn logs. Sessions hold only the user id; the
//! store synchronizes internally and outlives any individual session.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

/// Default window for history queries; prompt assembly uses the configured
/// `max_history` instead.
pub const HISTORY_QUERY_WINDOW: usize = 20;

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One user utterance or assistant reply.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// Epoch milliseconds
    pub timestamp: i64,
}

#[derive(Debug)]
struct Conversation {
    turns: Vec<Turn>,
    #[allow(dead_code)]
    created_at: i64,
    #[allow(dead_code)]
    updated_at: i64,
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub conversation_count: usize,
    pub total_turns: usize,
}

/// Thread-safe map from user id to conversation. Append-only except for
/// `clear`, which removes a user's conversation entirely.
#[derive(Debug, Default)]
pub struct ConversationStore {
    inner: RwLock<HashMap<String, Conversation>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn, lazily creating the conversation.
    pub fn append(&self, user_id: &str, role: Role, content: &str) {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.inner.write();
        let conversation = inner
            .entry(user_id.to_string())
            .or_insert_with(|| Conversation { turns: Vec::new(), created_at: now, updated_at: now });
        conversation.turns.push(Turn { role, content: content.to_string(), timestamp: now });
        conversation.updated_at = now;
        debug!("Conversation for {} now has {} turns", user_id, conversation.turns.len());
    }

    /// Last `n` turns for a user in arrival order. Unknown users get an empty
    /// window.
    pub fn window(&self, user_id: &str, n: usize) -> Vec<Turn> {
        let inner = self.inner.read();
        match inner.get(user_id) {
            Some(conversation) => {
                let skip = conversation.turns.len().saturating_sub(n);
                conversation.turns[skip..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Remove a user's conversation. Returns whether one existed.
    pub fn clear(&self, user_id: &str) -> bool {
        self.inner.write().remove(user_id).is_some()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            conversation_count: inner.len(),
            total_turns: inner.values().map(|c| c.turns.len()).sum(),
        }
    }
}
