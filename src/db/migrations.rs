/// Inline SQL migrations for the classpulse schema.
///
/// Simple inline statements rather than sqlx migration files; the schema is
/// small and self-contained. Every statement must be idempotent.
pub const MIGRATIONS: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL DEFAULT '',
    role INTEGER NOT NULL DEFAULT 0
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS auth_sessions (
    token TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id),
    expires_at TEXT NOT NULL
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token TEXT NOT NULL,
    room TEXT UNIQUE,
    registered_at TEXT NOT NULL,
    latest_login TEXT,
    last_seen TEXT,
    active_session_id INTEGER
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS questions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    text TEXT NOT NULL UNIQUE
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS voting_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    question_id INTEGER NOT NULL,
    device_id INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    first_answer_time TEXT,
    last_answer_time TEXT,
    stopped_at TEXT,
    a1_count INTEGER NOT NULL DEFAULT 0,
    a2_count INTEGER NOT NULL DEFAULT 0,
    a3_count INTEGER NOT NULL DEFAULT 0,
    a4_count INTEGER NOT NULL DEFAULT 0,
    a5_count INTEGER NOT NULL DEFAULT 0
);
"#,
    r#"
CREATE INDEX IF NOT EXISTS idx_voting_sessions_user ON voting_sessions(user_id);
"#,
    r#"
CREATE INDEX IF NOT EXISTS idx_voting_sessions_device ON voting_sessions(device_id);
"#,
];
