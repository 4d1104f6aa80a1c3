//! WebSocket transport to the browser client.
//!
//! `GET /ws` upgrades to a bidirectional event channel carrying JSON text
//! frames. The handler splits the socket: an egress task drains the outbound
//! event channel shared by every session this connection creates, while the
//! ingest loop parses client events and dispatches them. Sessions created by
//! a connection are torn down when it goes away.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio::{AudioFrame, SAMPLE_RATE};
use crate::conversation::HISTORY_QUERY_WINDOW;
use crate::session::{SessionCommand, SessionOrchestrator};

use super::events::{ClientEvent, ServerEvent};
use super::state::AppState;

/// Outbound events buffered per connection before the egress task writes them.
const OUTBOUND_CAPACITY: usize = 256;

/// `GET /ws` — upgrade to the event channel.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_CAPACITY);

    // Egress: serialized events -> text frames. Ends when every sender
    // (connection and session tasks) is gone, or when the peer drops.
    let egress = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Failed to serialize outbound event: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    info!("Client connected");
    let mut connection = Connection { state, outbound: outbound_tx, sessions: Vec::new(), current: None };
    connection.emit(ServerEvent::Ready).await;

    // Ingest runs inline so teardown is guaranteed on any exit path.
    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => connection.on_text(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket receive error: {}", e);
                break;
            }
        }
    }

    connection.teardown().await;
    info!("Client disconnected");
    drop(connection);
    // The peer is gone; anything still queued has nowhere to go.
    egress.abort();
}

/// Session scope for the conversation operations.
struct CurrentSession {
    id: String,
    user_id: String,
}

/// Per-connection dispatch state.
struct Connection {
    state: AppState,
    outbound: mpsc::Sender<ServerEvent>,
    /// Sessions created by this connection, destroyed on disconnect
    sessions: Vec<String>,
    /// Most recently created session
    current: Option<CurrentSession>,
}

impl Connection {
    async fn on_text(&mut self, text: &str) {
        let event = match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                debug!("Malformed client message: {}", e);
                self.emit(ServerEvent::Error { message: format!("Malformed message: {}", e) }).await;
                return;
            }
        };
        self.dispatch(event).await;
    }

    async fn dispatch(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::StartSession { user_id, language_code } => {
                let language = language_code.unwrap_or_else(|| self.state.default_language.clone());
                let (info, commands) = SessionOrchestrator::spawn(&user_id, &language, self.state.deps.clone(), self.outbound.clone());
                self.state.registry.insert(info.clone(), commands);
                self.sessions.push(info.id.clone());
                self.current = Some(CurrentSession { id: info.id.clone(), user_id });
                self.emit(ServerEvent::SessionCreated { session_id: info.id.clone(), message: "Session created".to_string() }).await;
            }

            ClientEvent::StartProcessing { session_id } => {
                self.forward(&session_id, SessionCommand::StartProcessing).await;
            }

            ClientEvent::StopProcessing { session_id } => {
                let target = session_id.or_else(|| self.current.as_ref().map(|current| current.id.clone()));
                match target {
                    Some(id) => self.forward(&id, SessionCommand::StopProcessing).await,
                    None => self.emit(ServerEvent::Error { message: "No session to stop".to_string() }).await,
                }
            }

            ClientEvent::AudioData { session_id, samples, sample_rate, channels } => {
                let frame = AudioFrame {
                    timestamp: Utc::now().timestamp_millis(),
                    samples,
                    sample_rate: sample_rate.unwrap_or(SAMPLE_RATE),
                    channels: channels.unwrap_or(1),
                };
                self.forward(&session_id, SessionCommand::Frame(frame)).await;
            }

            ClientEvent::GetConversationHistory { limit } => match &self.current {
                Some(current) => {
                    let history = self.state.store.window(&current.user_id, limit.unwrap_or(HISTORY_QUERY_WINDOW));
                    self.emit(ServerEvent::ConversationHistory {
                        history,
                        user_id: current.user_id.clone(),
                        timestamp: Utc::now().timestamp_millis(),
                    })
                    .await;
                }
                None => self.no_session().await,
            },

            ClientEvent::ClearConversation => match &self.current {
                Some(current) => {
                    let user_id = current.user_id.clone();
                    self.state.store.clear(&user_id);
                    info!("Conversation cleared for {}", user_id);
                    self.emit(ServerEvent::ConversationCleared { user_id, timestamp: Utc::now().timestamp_millis() }).await;
                }
                None => self.no_session().await,
            },

            ClientEvent::GetConversationStats => {
                let stats = self.state.store.stats();
                self.emit(ServerEvent::ConversationStats {
                    conversation_count: stats.conversation_count,
                    total_turns: stats.total_turns,
                    timestamp: Utc::now().timestamp_millis(),
                })
                .await;
            }
        }
    }

    /// Route a command to a session, reporting unknown ids to the client.
    async fn forward(&self, session_id: &str, command: SessionCommand) {
        match self.state.registry.commands(session_id) {
            Some(commands) => {
                if commands.send(command).await.is_err() {
                    self.emit(ServerEvent::Error { message: format!("Session is gone: {}", session_id) }).await;
                }
            }
            None => {
                self.emit(ServerEvent::Error { message: format!("Unknown session: {}", session_id) }).await;
            }
        }
    }

    async fn no_session(&self) {
        self.emit(ServerEvent::ConversationError { message: "No active session".to_string() }).await;
    }

    async fn emit(&self, event: ServerEvent) {
        let _ = self.outbound.send(event).await;
    }

    /// Destroy every session this connection created.
    async fn teardown(&mut self) {
        for id in self.sessions.drain(..) {
            if let Some(commands) = self.state.registry.remove(&id) {
                debug!("Destroying session {} on disconnect", id);
                let _ = commands.send(SessionCommand::Shutdown).await;
            }
        }
        self.current = None;
    }
}
