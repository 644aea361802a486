//! Voting session coordinator.
//!
//! Sessions are started and stopped by admin HTTP calls, never by the device
//! itself. The coordinator owns two in-memory indices (user-id → session-id,
//! device-id → session-id) that enforce at most one live session per user
//! and per device. The store is not transactional across the start steps, so
//! partial failures are compensated: a session row without a reachable
//! device channel is deleted again.

use std::collections::HashMap;

use serde_json::json;
use tokio::sync::Mutex;

use crate::db::models::VotingSession;
use crate::db::{Database, DbError};
use crate::hub::Hub;
use crate::protocol::Frame;
use crate::ws::connection::Phase;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("device is not connected")]
    DeviceNotConnected,
    #[error("user already has a live session")]
    UserBusy,
    #[error("device already has a live session")]
    DeviceBusy,
    #[error("no session with id {0}")]
    NotFound(i64),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Placeholder index value while a start is in flight.
const RESERVED: i64 = 0;

#[derive(Default)]
struct LiveSessions {
    by_user: HashMap<i64, i64>,
    by_device: HashMap<i64, i64>,
}

#[derive(Default)]
pub struct SessionCoordinator {
    live: Mutex<LiveSessions>,
}

impl SessionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session_for_user(&self, user_id: i64) -> Option<i64> {
        self.live
            .lock()
            .await
            .by_user
            .get(&user_id)
            .copied()
            .filter(|id| *id != RESERVED)
    }

    pub async fn session_for_device(&self, device_id: i64) -> Option<i64> {
        self.live
            .lock()
            .await
            .by_device
            .get(&device_id)
            .copied()
            .filter(|id| *id != RESERVED)
    }

    /// Start a voting session on a connected device. Both index slots are
    /// reserved up front so two admins cannot race the same user or device.
    pub async fn start(
        &self,
        db: &Database,
        hub: &Hub,
        user_id: i64,
        device_id: i64,
        question_text: &str,
    ) -> Result<VotingSession, SessionError> {
        {
            let mut live = self.live.lock().await;
            if live.by_user.contains_key(&user_id) {
                return Err(SessionError::UserBusy);
            }
            if live.by_device.contains_key(&device_id) {
                return Err(SessionError::DeviceBusy);
            }
            live.by_user.insert(user_id, RESERVED);
            live.by_device.insert(device_id, RESERVED);
        }

        match self
            .start_inner(db, hub, user_id, device_id, question_text)
            .await
        {
            Ok(session) => {
                let mut live = self.live.lock().await;
                live.by_user.insert(user_id, session.id);
                live.by_device.insert(device_id, session.id);
                Ok(session)
            }
            Err(err) => {
                let mut live = self.live.lock().await;
                live.by_user.remove(&user_id);
                live.by_device.remove(&device_id);
                Err(err)
            }
        }
    }

    async fn start_inner(
        &self,
        db: &Database,
        hub: &Hub,
        user_id: i64,
        device_id: i64,
        question_text: &str,
    ) -> Result<VotingSession, SessionError> {
        let question = db.find_or_create_question(question_text).await?;

        let conn = hub
            .connection_for_device(device_id)
            .await
            .ok_or(SessionError::DeviceNotConnected)?;

        let session = db
            .create_voting_session(user_id, question.id, device_id)
            .await?;

        let transitioned = {
            let mut state = conn.state.write().await;
            if conn.is_closed()
                || state.phase != Phase::Authenticated
                || state.device_id != Some(device_id)
            {
                false
            } else {
                state.phase = Phase::InSession {
                    session_id: session.id,
                    started_at: session.started_at,
                };
                true
            }
        };
        if !transitioned {
            // The channel went away between lookup and transition.
            db.delete_voting_session(session.id).await?;
            if conn.is_closed() {
                hub.unbind_device(device_id, conn.id).await;
            }
            return Err(SessionError::DeviceNotConnected);
        }

        if let Err(err) = db.set_device_active_session(device_id, Some(session.id)).await {
            let mut state = conn.state.write().await;
            state.phase = Phase::Authenticated;
            drop(state);
            db.delete_voting_session(session.id).await?;
            return Err(err.into());
        }

        conn.send(&Frame::with_data(
            "session_start",
            json!({ "text": question.text }),
        ));
        tracing::info!(
            "Started session {} on device {} for user {}",
            session.id,
            device_id,
            user_id
        );
        Ok(session)
    }

    /// Stop a session. The persisted row is sealed even when the device has
    /// already disconnected; only a still-open channel gets `session_stop`.
    pub async fn stop(
        &self,
        db: &Database,
        hub: &Hub,
        session_id: i64,
    ) -> Result<VotingSession, SessionError> {
        let sealed = db
            .stop_session(session_id)
            .await?
            .ok_or(SessionError::NotFound(session_id))?;

        if let Some(conn) = hub.connection_for_device(sealed.device_id).await {
            let mut state = conn.state.write().await;
            let live_id = match &state.phase {
                Phase::InSession { session_id, .. } => Some(*session_id),
                _ => None,
            };
            if live_id == Some(session_id) {
                state.phase = Phase::Authenticated;
                drop(state);
                conn.send(&Frame::command("session_stop"));
            }
        }

        let mut live = self.live.lock().await;
        if live.by_user.get(&sealed.user_id) == Some(&session_id) {
            live.by_user.remove(&sealed.user_id);
        }
        if live.by_device.get(&sealed.device_id) == Some(&session_id) {
            live.by_device.remove(&sealed.device_id);
        }

        tracing::info!("Stopped session {}", session_id);
        Ok(sealed)
    }
}
