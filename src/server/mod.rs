//! Transport layer: WebSocket event channel and HTTP surface.

pub mod events;
mod http;
mod state;
mod ws;

use axum::Router;
use axum::routing::get;

pub use state::{AppState, GatewayState};

/// Build the full router: demo page, health/status endpoints and the
/// WebSocket upgrade.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(http::index))
        .route("/health-check", get(http::health))
        .route("/health", get(http::health))
        .route("/status", get(http::status))
        .route("/sessions", get(http::sessions))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}
