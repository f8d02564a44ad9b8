//! WebSocket connection lifecycle — client protocol loop and turn driving.
//!
//! Each connection runs one logical task: a writer task drains the event
//! channel to the socket in emission order, while the read loop parses
//! client messages and, once an utterance completes, polls the turn future
//! from the same `select!`. The session travels into the turn future and
//! comes back when it resolves, so at most one turn is ever in flight and
//! a second utterance is rejected promptly without touching it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use voxloop_core::error::VoxloopError;
use voxloop_core::protocol::{ClientMessage, StreamEvent};
use voxloop_core::session::Session;
use voxloop_pipeline::EventSink;

use crate::state::{GatewayState, SessionEntry};

/// A turn in flight: resolves with the session it borrowed.
type TurnFuture = Pin<Box<dyn Future<Output = Session> + Send>>;

/// Per-connection protocol state.
struct Connection {
    conn_id: String,
    /// Present while idle; moves into the turn future while one runs.
    session: Option<Session>,
    /// Captured PCM for the utterance currently being recorded.
    audio_buf: Vec<u8>,
}

impl Connection {
    fn initialized(&self, turn: &Option<TurnFuture>) -> bool {
        self.session.is_some() || turn.is_some()
    }
}

/// Handle a new client WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New client connection");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<StreamEvent>();

    // Writer task: serialize events to the socket in emission order.
    let writer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let msg = match serde_json::to_string(&event) {
                Ok(msg) => msg,
                Err(e) => {
                    error!(%e, "Failed to serialize event");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection {
        conn_id: conn_id.clone(),
        session: None,
        audio_buf: Vec::new(),
    };
    let mut turn: Option<TurnFuture> = None;

    loop {
        tokio::select! {
            // Poll the in-flight turn alongside the read loop so client
            // messages are still answered while it runs.
            session = async { turn.as_mut().expect("guarded by turn.is_some()").await }, if turn.is_some() => {
                conn.session = Some(session);
                turn = None;
            }

            incoming = ws_rx.next() => {
                let Some(incoming) = incoming else { break };
                match incoming {
                    Ok(Message::Text(text)) => {
                        handle_client_message(&state, &mut conn, &mut turn, text.as_str(), &event_tx).await;
                    }
                    Ok(Message::Binary(data)) => {
                        // Raw PCM frames are accepted as unencoded audio.
                        if conn.initialized(&turn) {
                            conn.audio_buf.extend_from_slice(&data);
                        } else {
                            protocol_error(&event_tx, "audio before init");
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!(conn_id = %conn.conn_id, "Client requested close");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(conn_id = %conn.conn_id, %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    // Dropping an in-flight turn future tears down its remote stage
    // connections.
    drop(turn);
    writer.abort();
    state.registry.remove(&conn_id).await;
    info!(conn_id = %conn_id, "Client connection closed");
}

fn protocol_error(events: &EventSink, message: &str) {
    let err = VoxloopError::Protocol(message.to_string());
    let _ = events.send(StreamEvent::error(err.to_string()));
}

async fn handle_client_message(
    state: &Arc<GatewayState>,
    conn: &mut Connection,
    turn: &mut Option<TurnFuture>,
    text: &str,
    events: &EventSink,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(conn_id = %conn.conn_id, %e, "Unparseable client message");
            protocol_error(events, "malformed message");
            return;
        }
    };

    match message {
        ClientMessage::Init => {
            if conn.initialized(turn) {
                protocol_error(events, "session already initialized");
                return;
            }
            let session = Session::new();
            state
                .registry
                .insert(
                    conn.conn_id.clone(),
                    SessionEntry {
                        session_id: session.id.clone(),
                        event_tx: events.clone(),
                    },
                )
                .await;
            info!(conn_id = %conn.conn_id, session_id = %session.id, "Session created");
            conn.session = Some(session);
            let _ = events.send(StreamEvent::ready());
        }

        ClientMessage::Audio { data } => {
            if !conn.initialized(turn) {
                protocol_error(events, "audio before init");
                return;
            }
            match base64::engine::general_purpose::STANDARD.decode(&data) {
                Ok(bytes) => conn.audio_buf.extend_from_slice(&bytes),
                Err(_) => protocol_error(events, "invalid base64 audio payload"),
            }
        }

        ClientMessage::AudioEnd => {
            if !conn.initialized(turn) {
                protocol_error(events, "audio_end before init");
                return;
            }
            if turn.is_some() {
                // One turn per session; the rejected utterance is discarded.
                conn.audio_buf.clear();
                protocol_error(events, "a turn is already in flight");
                return;
            }
            if conn.audio_buf.is_empty() {
                protocol_error(events, "no audio captured");
                return;
            }

            let audio = std::mem::take(&mut conn.audio_buf);
            let mut session = conn.session.take().expect("idle session present");
            let orchestrator = state.orchestrator.clone();
            let events = events.clone();
            debug!(conn_id = %conn.conn_id, bytes = audio.len(), "Utterance complete, starting turn");

            *turn = Some(Box::pin(async move {
                orchestrator.run_turn(&mut session, audio, &events).await;
                session
            }));
        }
    }
}
