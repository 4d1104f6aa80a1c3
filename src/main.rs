//! Voice Gateway - a real-time conversational voice server.
//!
//! Accepts PCM audio from browser clients over a WebSocket event channel,
//! detects speech, streams it to an external transcription service, batches
//! transcripts into user turns, generates replies through an external LLM
//! and synthesizes them back to the client, with barge-in support throughout.

mod audio;
mod config;
mod conversation;
mod error;
mod llm;
mod server;
mod session;
mod stt;
mod tts;
mod vad;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::LocalTime;

use config::AppConfig;
use server::GatewayState;
use session::SessionCommand;

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("🛑 Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("🛑 Received SIGTERM, shutting down...");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments and environment
    let config = AppConfig::from_args();

    // Respect RUST_LOG env var, fallback to verbose flag, default to info
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| if config.verbose { EnvFilter::try_new("debug") } else { EnvFilter::try_new("info") })
        .unwrap();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(LocalTime::new(time::macros::format_description!("[hour]:[minute]:[second]")))
        .init();

    info!("🎤 Voice Gateway v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("❌ Configuration error: {}", e);
        std::process::exit(1);
    }

    // Wire upstream adapters and process-wide state
    let state: server::AppState = Arc::new(GatewayState::new(&config)?);
    config.log_config();

    let router = server::router(state.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await.context("Failed to bind listen port")?;
    info!("Listening on http://0.0.0.0:{}", config.port);

    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await.context("Server error")?;

    // Drain the registry: every live session is told to shut down, which
    // flushes its buffers and closes its upstream channels.
    for commands in state.registry.drain() {
        let _ = commands.send(SessionCommand::Shutdown).await;
    }

    info!("✅ Voice gateway stopped");
    Ok(())
}
