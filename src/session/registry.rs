//! Process-wide session registry.
//!
//! Maps session ids to their command channels and observable metadata. The
//! registry is created at server start and drained at shutdown; destructive
//! operations go through the orchestrator (a removed entry's task is told to
//! shut down by whoever removed it).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::orchestrator::SessionCommand;

/// Metadata readable outside the session task (HTTP surface, logging).
/// The flags are written by the session task and read concurrently.
#[derive(Debug)]
pub struct SessionInfo {
    pub id: String,
    pub user_id: String,
    pub language: String,
    pub created_at: Instant,
    processing: AtomicBool,
    transcribing: AtomicBool,
}

impl SessionInfo {
    pub fn new(id: String, user_id: String, language: String) -> Self {
        Self { id, user_id, language, created_at: Instant::now(), processing: AtomicBool::new(false), transcribing: AtomicBool::new(false) }
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Relaxed)
    }

    pub fn set_processing(&self, value: bool) {
        self.processing.store(value, Ordering::Relaxed);
    }

    pub fn is_transcribing(&self) -> bool {
        self.transcribing.load(Ordering::Relaxed)
    }

    pub fn set_transcribing(&self, value: bool) {
        self.transcribing.store(value, Ordering::Relaxed);
    }
}

struct SessionEntry {
    info: Arc<SessionInfo>,
    commands: mpsc::Sender<SessionCommand>,
}

/// Registry of live sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    started_at: Instant,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { sessions: RwLock::new(HashMap::new()), started_at: Instant::now() }
    }

    pub fn insert(&self, info: Arc<SessionInfo>, commands: mpsc::Sender<SessionCommand>) {
        self.sessions.write().insert(info.id.clone(), SessionEntry { info, commands });
    }

    pub fn commands(&self, session_id: &str) -> Option<mpsc::Sender<SessionCommand>> {
        self.sessions.read().get(session_id).map(|entry| entry.commands.clone())
    }

    pub fn info(&self, session_id: &str) -> Option<Arc<SessionInfo>> {
        self.sessions.read().get(session_id).map(|entry| entry.info.clone())
    }

    /// Remove a session, returning its command channel so the caller can tell
    /// the task to shut down.
    pub fn remove(&self, session_id: &str) -> Option<mpsc::Sender<SessionCommand>> {
        self.sessions.write().remove(session_id).map(|entry| entry.commands)
    }

    /// Remove every session, returning the command channels. Used at process
    /// shutdown to drain the registry.
    pub fn drain(&self) -> Vec<mpsc::Sender<SessionCommand>> {
        self.sessions.write().drain().map(|(_, entry)| entry.commands).collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<SessionInfo>> {
        self.sessions.read().values().map(|entry| entry.info.clone()).collect()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn active_transcriptions(&self) -> usize {
        self.sessions.read().values().filter(|entry| entry.info.is_transcribing()).count()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> (Arc<SessionInfo>, mpsc::Sender<SessionCommand>, mpsc::Receiver<SessionCommand>) {
        let info = Arc::new(SessionInfo::new(id.to_string(), "u1".to_string(), "en-US".to_string()));
        let (tx, rx) = mpsc::channel(4);
        (info, tx, rx)
    }

    #[test]
    fn insert_lookup_remove() {
        let registry = SessionRegistry::new();
        let (info, tx, _rx) = entry("s1");
        registry.insert(info, tx);

        assert_eq!(registry.active_sessions(), 1);
        assert!(registry.commands("s1").is_some());
        assert!(registry.info("s1").is_some());
        assert!(registry.commands("missing").is_none());

        assert!(registry.remove("s1").is_some());
        assert!(registry.remove("s1").is_none());
        assert_eq!(registry.active_sessions(), 0);
    }

    #[test]
    fn transcription_count_follows_flags() {
        let registry = SessionRegistry::new();
        let (a, tx_a, _rx_a) = entry("a");
        let (b, tx_b, _rx_b) = entry("b");
        registry.insert(a.clone(), tx_a);
        registry.insert(b, tx_b);

        assert_eq!(registry.active_transcriptions(), 0);
        a.set_transcribing(true);
        assert_eq!(registry.active_transcriptions(), 1);
    }

    #[test]
    fn drain_empties_the_registry() {
        let registry = SessionRegistry::new();
        let (a, tx_a, _rx_a) = entry("a");
        let (b, tx_b, _rx_b) = entry("b");
        registry.insert(a, tx_a);
        registry.insert(b, tx_b);

        assert_eq!(registry.drain().len(), 2);
        assert_eq!(registry.active_sessions(), 0);
    }
}
