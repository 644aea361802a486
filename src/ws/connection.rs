//! Per-client connection object.
//!
//! A connection owns an outbound queue drained by a single writer task, so
//! `send` never blocks and may be called while holding either the hub lock
//! or the connection lock. All mutable per-connection state lives behind one
//! read/write lock; the connection phase and its flow data are a single
//! tagged enum, so a phase/flow mismatch cannot be represented.

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::protocol::{ErrorFrame, Frame};

pub type ConnectionId = u64;

/// Wallclock bound on the authentication flow; `auth_validate` past this
/// deadline resets the connection to NONE.
pub const AUTH_FLOW_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection phase with the flow data legal in that phase.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Idle,
    Registering {
        pin: u16,
    },
    Authenticating {
        started_at: Instant,
        timeout: Duration,
        target_device_id: i64,
        nonce: String,
    },
    Authenticated,
    InSession {
        session_id: i64,
        started_at: DateTime<Utc>,
    },
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "NONE",
            Phase::Registering { .. } => "REGISTERING",
            Phase::Authenticating { .. } => "AUTHENTICATING",
            Phase::Authenticated => "AUTHENTICATED",
            Phase::InSession { .. } => "IN_SESSION",
        }
    }
}

/// Mutable connection state, guarded by the connection lock.
#[derive(Debug)]
pub struct ConnState {
    pub phase: Phase,
    /// Set once the device has authenticated on this connection.
    pub device_id: Option<i64>,
    /// Last non-protocol frame; heartbeat silence is measured against this.
    pub latest_message_at: Instant,
    pub pings_sent: u32,
    pub pongs_received: u32,
    pub latest_ping_at: Option<Instant>,
}

pub struct Connection {
    pub id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    pub state: RwLock<ConnState>,
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
    heartbeat: CancellationToken,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(id: ConnectionId, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            connected_at: Utc::now(),
            state: RwLock::new(ConnState {
                phase: Phase::Idle,
                device_id: None,
                latest_message_at: Instant::now(),
                pings_sent: 0,
                pongs_received: 0,
                latest_ping_at: None,
            }),
            outbound,
            shutdown: CancellationToken::new(),
            heartbeat: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Serialize and queue a command frame. Failures mean the writer is
    /// already gone; the connection is tearing down either way.
    pub fn send(&self, frame: &Frame) {
        self.queue_json(frame);
    }

    pub fn send_error(&self, code: i32, info: impl Into<String>) {
        self.queue_json(&ErrorFrame::new(code, info));
    }

    /// Queue a raw websocket message (pong replies carry the peer's payload).
    pub(crate) fn queue(&self, msg: Message) {
        let _ = self.outbound.send(msg);
    }

    fn queue_json<T: serde::Serialize>(&self, msg: &T) {
        match serde_json::to_string(msg) {
            Ok(json) => {
                let _ = self.outbound.send(Message::Text(json.into()));
            }
            Err(e) => {
                tracing::error!("Failed to serialize outbound frame: {}", e);
            }
        }
    }

    /// Token cancelled when the connection should stop reading.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Token cancelled when the heartbeat loop should stop.
    pub fn heartbeat_token(&self) -> CancellationToken {
        self.heartbeat.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Start tearing the connection down. Returns true exactly once; the
    /// caller that wins is responsible for removing the connection from the
    /// hub. Stops the heartbeat, queues a close frame for the peer and
    /// cancels the read loop.
    pub fn begin_close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.heartbeat.cancel();
        let _ = self.outbound.send(Message::Close(None));
        self.shutdown.cancel();
        true
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected_at", &self.connected_at)
            .field("closed", &self.closed)
            .finish()
    }
}
