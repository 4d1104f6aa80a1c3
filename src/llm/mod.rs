//! LLM client module for reply generation.
//!
//! Uses RIG against an OpenAI-compatible completion endpoint.

mod client;

pub use client::{CannedResponder, Responder, RigResponder, build_responder};
