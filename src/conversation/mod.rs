//! Conversation history module.
//!
//! Process-wide store of per-user turn logs used for prompt assembly and the
//! history/stats operations on the transport.

mod store;

pub use store::{ConversationStore, HISTORY_QUERY_WINDOW, Role, StoreStats, Turn};
