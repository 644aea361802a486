//! The narrow store interface used by the connection core and the admin
//! surface. Every mutation is a single SQL statement so concurrent votes
//! from unrelated connections never race in application code.

use chrono::{DateTime, Utc};

use super::models::{AuthSession, Device, Question, User, VotingSession};
use super::{Database, DbError, DbResult};

impl Database {
    // ----- devices -----

    pub async fn find_device_by_id(&self, id: i64) -> DbResult<Option<Device>> {
        let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(device)
    }

    pub async fn find_device_by_room(&self, room: &str) -> DbResult<Option<Device>> {
        let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE room = ?")
            .bind(room)
            .fetch_optional(self.pool())
            .await?;
        Ok(device)
    }

    /// Insert a fresh device row carrying the given secret.
    pub async fn create_device(&self, token: &str) -> DbResult<Device> {
        let device = sqlx::query_as::<_, Device>(
            "INSERT INTO devices (token, registered_at) VALUES (?, ?) RETURNING *",
        )
        .bind(token)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await?;
        Ok(device)
    }

    /// Rotate the device secret (relink).
    pub async fn rotate_device_token(&self, id: i64, token: &str) -> DbResult<()> {
        sqlx::query("UPDATE devices SET token = ? WHERE id = ?")
            .bind(token)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn update_device_last_seen(&self, id: i64, at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE devices SET last_seen = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn update_device_latest_login(&self, id: i64, at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE devices SET latest_login = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_device_active_session(
        &self,
        id: i64,
        session_id: Option<i64>,
    ) -> DbResult<()> {
        sqlx::query("UPDATE devices SET active_session_id = ? WHERE id = ?")
            .bind(session_id)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Delete a device row. Returns how many rows went away.
    pub async fn delete_device_by_id(&self, id: i64) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM devices WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Devices for the admin list view. `leased` filters on whether a live
    /// session is attached.
    pub async fn list_devices(
        &self,
        limit: i64,
        offset: i64,
        leased: Option<bool>,
    ) -> DbResult<Vec<Device>> {
        let query = match leased {
            None => "SELECT * FROM devices ORDER BY id LIMIT ? OFFSET ?",
            Some(true) => {
                "SELECT * FROM devices WHERE active_session_id IS NOT NULL ORDER BY id LIMIT ? OFFSET ?"
            }
            Some(false) => {
                "SELECT * FROM devices WHERE active_session_id IS NULL ORDER BY id LIMIT ? OFFSET ?"
            }
        };
        let devices = sqlx::query_as::<_, Device>(query)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.pool())
            .await?;
        Ok(devices)
    }

    // ----- questions -----

    /// Find a question by exact text, creating it on first use. The insert
    /// is a single conflict-tolerant statement so concurrent callers with
    /// the same text converge on one row.
    pub async fn find_or_create_question(&self, text: &str) -> DbResult<Question> {
        sqlx::query("INSERT INTO questions (text) VALUES (?) ON CONFLICT(text) DO NOTHING")
            .bind(text)
            .execute(self.pool())
            .await?;
        let question = sqlx::query_as::<_, Question>("SELECT * FROM questions WHERE text = ?")
            .bind(text)
            .fetch_one(self.pool())
            .await?;
        Ok(question)
    }

    pub async fn find_question_by_id(&self, id: i64) -> DbResult<Option<Question>> {
        let question = sqlx::query_as::<_, Question>("SELECT * FROM questions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(question)
    }

    // ----- voting sessions -----

    pub async fn create_voting_session(
        &self,
        user_id: i64,
        question_id: i64,
        device_id: i64,
    ) -> DbResult<VotingSession> {
        let session = sqlx::query_as::<_, VotingSession>(
            "INSERT INTO voting_sessions (user_id, question_id, device_id, started_at) \
             VALUES (?, ?, ?, ?) RETURNING *",
        )
        .bind(user_id)
        .bind(question_id)
        .bind(device_id)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await?;
        Ok(session)
    }

    pub async fn delete_voting_session(&self, id: i64) -> DbResult<()> {
        sqlx::query("DELETE FROM voting_sessions WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn find_session_by_id(&self, id: i64) -> DbResult<Option<VotingSession>> {
        let session = sqlx::query_as::<_, VotingSession>("SELECT * FROM voting_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(session)
    }

    pub async fn list_sessions_for_user(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<VotingSession>> {
        let sessions = sqlx::query_as::<_, VotingSession>(
            "SELECT * FROM voting_sessions WHERE user_id = ? ORDER BY started_at DESC \
             LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;
        Ok(sessions)
    }

    /// Atomically count one vote. The column set is closed: only votes 1..=5
    /// map to a statement, everything else is rejected before the store is
    /// touched. The same statement stamps `first_answer_time` once and
    /// `last_answer_time` always.
    pub async fn update_session_vote(&self, session_id: i64, vote: u8) -> DbResult<()> {
        let query = match vote {
            1 => "UPDATE voting_sessions SET a1_count = a1_count + 1, first_answer_time = COALESCE(first_answer_time, ?1), last_answer_time = ?1 WHERE id = ?2",
            2 => "UPDATE voting_sessions SET a2_count = a2_count + 1, first_answer_time = COALESCE(first_answer_time, ?1), last_answer_time = ?1 WHERE id = ?2",
            3 => "UPDATE voting_sessions SET a3_count = a3_count + 1, first_answer_time = COALESCE(first_answer_time, ?1), last_answer_time = ?1 WHERE id = ?2",
            4 => "UPDATE voting_sessions SET a4_count = a4_count + 1, first_answer_time = COALESCE(first_answer_time, ?1), last_answer_time = ?1 WHERE id = ?2",
            5 => "UPDATE voting_sessions SET a5_count = a5_count + 1, first_answer_time = COALESCE(first_answer_time, ?1), last_answer_time = ?1 WHERE id = ?2",
            other => return Err(DbError::VoteOutOfRange(other)),
        };
        sqlx::query(query)
            .bind(Utc::now())
            .bind(session_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Seal a session: stamp `stopped_at` and detach it from its device.
    /// Returns the sealed row.
    pub async fn stop_session(&self, id: i64) -> DbResult<Option<VotingSession>> {
        let session = sqlx::query_as::<_, VotingSession>(
            "UPDATE voting_sessions SET stopped_at = COALESCE(stopped_at, ?) WHERE id = ? RETURNING *",
        )
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        sqlx::query("UPDATE devices SET active_session_id = NULL WHERE active_session_id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(session)
    }

    // ----- users and auth sessions -----

    pub async fn create_user(&self, email: &str, name: &str, role: i64) -> DbResult<User> {
        let user = sqlx::query_as::<_, User>(
            "INSERT INTO users (email, name, role) VALUES (?, ?, ?) RETURNING *",
        )
        .bind(email)
        .bind(name)
        .bind(role)
        .fetch_one(self.pool())
        .await?;
        Ok(user)
    }

    pub async fn find_user_by_id(&self, id: i64) -> DbResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(user)
    }

    pub async fn create_auth_session(
        &self,
        token: &str,
        user_id: i64,
        expires_at: DateTime<Utc>,
    ) -> DbResult<AuthSession> {
        let session = sqlx::query_as::<_, AuthSession>(
            "INSERT INTO auth_sessions (token, user_id, expires_at) VALUES (?, ?, ?) RETURNING *",
        )
        .bind(token)
        .bind(user_id)
        .bind(expires_at)
        .fetch_one(self.pool())
        .await?;
        Ok(session)
    }

    pub async fn find_auth_session(&self, token: &str) -> DbResult<Option<AuthSession>> {
        let session =
            sqlx::query_as::<_, AuthSession>("SELECT * FROM auth_sessions WHERE token = ?")
                .bind(token)
                .fetch_optional(self.pool())
                .await?;
        Ok(session)
    }
}
