//! Row types for the classpulse schema.

use chrono::{DateTime, Utc};

/// A physical classroom voting unit. `token` is the server-issued device
/// secret: hex-encoded random bytes, rotated on relink, never sent to the
/// admin surface.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub token: String,
    pub room: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub latest_login: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub active_session_id: Option<i64>,
}

/// A human user of the admin surface. Role 1 is admin.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub role: i64,
}

pub const ROLE_ADMIN: i64 = 1;

/// The credential a logged-in admin presents on HTTP requests.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuthSession {
    pub token: String,
    pub user_id: i64,
    pub expires_at: DateTime<Utc>,
}

/// A question, deduplicated by exact text.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Question {
    pub id: i64,
    pub text: String,
}

/// A live or sealed voting interval on one device, accumulating the five
/// vote counters.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VotingSession {
    pub id: i64,
    pub user_id: i64,
    pub question_id: i64,
    pub device_id: i64,
    pub started_at: DateTime<Utc>,
    pub first_answer_time: Option<DateTime<Utc>>,
    pub last_answer_time: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub a1_count: i64,
    pub a2_count: i64,
    pub a3_count: i64,
    pub a4_count: i64,
    pub a5_count: i64,
}

impl VotingSession {
    /// The five counters as a fixed array, clamped to the 16-bit range the
    /// devices report against.
    pub fn votes(&self) -> [u16; 5] {
        [
            clamp_u16(self.a1_count),
            clamp_u16(self.a2_count),
            clamp_u16(self.a3_count),
            clamp_u16(self.a4_count),
            clamp_u16(self.a5_count),
        ]
    }
}

fn clamp_u16(count: i64) -> u16 {
    count.clamp(0, u16::MAX as i64) as u16
}
