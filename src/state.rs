//! Shared application state, handed to every handler and background task.

use std::sync::Arc;

use chrono::Utc;
use rand::rngs::OsRng;
use rand::TryRngCore;

use crate::config::Config;
use crate::db::models::{Device, VotingSession};
use crate::db::{Database, DbError};
use crate::hub::{EnrollError, Hub};
use crate::sessions::{SessionCoordinator, SessionError};

pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub hub: Hub,
    pub sessions: SessionCoordinator,
}

impl AppState {
    pub fn new(config: Config, db: Database) -> Arc<Self> {
        Arc::new(Self {
            config,
            db,
            hub: Hub::new(),
            sessions: SessionCoordinator::new(),
        })
    }

    /// Complete a pending enrollment. With a device id this is a relink:
    /// the existing row keeps its identity and gets a fresh secret.
    pub async fn complete_enrollment(
        &self,
        pin: u16,
        existing_device_id: Option<i64>,
    ) -> Result<Device, EnrollError> {
        let existing = match existing_device_id {
            None => None,
            Some(id) => Some(
                self.db
                    .find_device_by_id(id)
                    .await?
                    .ok_or(EnrollError::DeviceNotFound(id))?,
            ),
        };
        self.hub.complete_enrollment(&self.db, pin, existing).await
    }

    pub async fn start_session(
        &self,
        user_id: i64,
        device_id: i64,
        question_text: &str,
    ) -> Result<VotingSession, SessionError> {
        self.sessions
            .start(&self.db, &self.hub, user_id, device_id, question_text)
            .await
    }

    pub async fn stop_session(&self, session_id: i64) -> Result<VotingSession, SessionError> {
        self.sessions.stop(&self.db, &self.hub, session_id).await
    }

    /// Issue an admin auth session for a user, with the configured lifetime.
    /// The login dance that decides *which* user lives outside this service;
    /// this is the handover point it calls into.
    pub async fn issue_auth_session(&self, user_id: i64) -> Result<String, AuthIssueError> {
        let mut bytes = [0u8; 32];
        OsRng.try_fill_bytes(&mut bytes).map_err(|e| {
            tracing::error!("Auth session token generation failed: {}", e);
            AuthIssueError::TokenGeneration
        })?;
        let token = hex::encode(bytes);

        let lifetime = chrono::Duration::from_std(self.config.auth.session_duration)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        self.db
            .create_auth_session(&token, user_id, Utc::now() + lifetime)
            .await?;
        Ok(token)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthIssueError {
    #[error("could not generate a session token")]
    TokenGeneration,
    #[error(transparent)]
    Db(#[from] DbError),
}
