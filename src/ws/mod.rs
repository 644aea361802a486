//! Device channel: `/ws` upgrade, per-connection read loop and dispatch.
//!
//! Each upgraded socket gets a hub-registered connection, one writer task
//! draining the outbound queue, and a heartbeat loop. Inbound frames are
//! decoded here and routed to the flow that is legal in the current state;
//! `ping`/`pong` are answered in place and never count as activity for the
//! heartbeat.

pub mod auth;
pub mod connection;
pub mod enroll;
pub mod heartbeat;
pub mod session;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::protocol::{self, Frame, Inbound, ERR_BAD_REQUEST};
use crate::state::AppState;
use self::connection::Connection;

const MAX_WS_MESSAGE_BYTES: usize = 32 * 1024;

/// WebSocket upgrade handler. The channel is trusted for framing only;
/// identity is established exclusively by the authentication flow.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one device connection from upgrade to close.
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let conn = state.hub.register(tx).await;
    tracing::info!("New connection {}", conn.id);

    // Single writer per channel: everything outbound goes through the queue.
    // A write error tears the connection down via the shutdown token.
    let writer_shutdown = conn.shutdown_token();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() {
                writer_shutdown.cancel();
                break;
            }
            if closing {
                break;
            }
        }
    });

    heartbeat::spawn(state.clone(), conn.clone());

    let shutdown = conn.shutdown_token();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > MAX_WS_MESSAGE_BYTES {
                        conn.send_error(ERR_BAD_REQUEST, "Message too large");
                        break;
                    }
                    handle_text(&state, &conn, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Ping(data))) => {
                    conn.queue(Message::Pong(data));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::error!("WebSocket error on connection {}: {}", conn.id, err);
                    break;
                }
                None => break,
            }
        }
    }

    state.hub.close_connection(&conn).await;
}

/// Decode one text frame and route it.
pub async fn handle_text(state: &AppState, conn: &Arc<Connection>, text: &str) {
    let inbound = match protocol::decode(text) {
        Ok(inbound) => inbound,
        Err(err) => {
            conn.send_error(ERR_BAD_REQUEST, err.to_string());
            return;
        }
    };
    let frame = match inbound {
        Inbound::Command(frame) => frame,
        Inbound::Error(err) => {
            tracing::warn!(
                "Client error frame on connection {}: code {} ({:?})",
                conn.id,
                err.e,
                err.info
            );
            return;
        }
    };
    tracing::debug!("Received '{}' on connection {}", frame.c, conn.id);

    // Liveness frames are answered in place and do not reset silence.
    match frame.c.as_str() {
        "ping" => {
            conn.send(&Frame::command("pong"));
            return;
        }
        "pong" => {
            conn.state.write().await.pongs_received += 1;
            return;
        }
        _ => {}
    }

    let bound_device = {
        let mut s = conn.state.write().await;
        s.latest_message_at = Instant::now();
        s.device_id
    };
    if let Some(device_id) = bound_device {
        if let Err(err) = state.db.update_device_last_seen(device_id, Utc::now()).await {
            tracing::warn!("Failed to update last_seen for device {}: {}", device_id, err);
        }
    }

    dispatch(state, conn, frame).await;
}

/// Route a command to the flow responsible for it. Unknown commands are a
/// bad request and leave the state untouched.
pub async fn dispatch(state: &AppState, conn: &Arc<Connection>, frame: Frame) {
    match frame.c.as_str() {
        "reg_start" => enroll::handle_reg_start(state, conn).await,
        "auth_start" => auth::handle_auth_start(state, conn, &frame).await,
        "auth_validate" => auth::handle_auth_validate(state, conn, &frame).await,
        "session_vote" => session::handle_session_vote(state, conn, &frame).await,
        other => {
            conn.send_error(ERR_BAD_REQUEST, format!("Invalid command '{}'", other));
        }
    }
}
