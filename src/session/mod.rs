//! Per-session orchestration.
//!
//! The orchestrator task coordinates voice activity, transcription, turn
//! batching, reply generation, synthesis and barge-in for one session; the
//! registry tracks live sessions process-wide.

mod orchestrator;
mod registry;
mod turn;

pub use orchestrator::{SessionCommand, SessionDeps, SessionOrchestrator};
pub use registry::{SessionInfo, SessionRegistry};
