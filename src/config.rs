//! Environment-based configuration.
//!
//! Values are read once at startup (after `dotenvy` has loaded any `.env`
//! file). Malformed individual values fall back to their defaults; a config
//! that is structurally unusable (bad port, unknown log level) is a startup
//! error.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub heartbeat: HeartbeatConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Heartbeat timing for device connections.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Tick period of the heartbeat loop.
    pub check_interval: Duration,
    /// Idle time before the first ping is sent.
    pub delay: Duration,
    /// Minimum spacing between pings.
    pub interval: Duration,
    /// Idle time after which the connection is forcibly closed.
    pub kill_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Lifetime applied to newly issued admin auth sessions.
    pub session_duration: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid server port: {0}")]
    InvalidPort(String),
    #[error("invalid log level: {0} (must be one of: error, warn, info, debug, trace)")]
    InvalidLogLevel(String),
}

const VALID_LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let cfg = Self {
            server: ServerConfig {
                host: get_env("SERVER_HOST", "localhost"),
                port: get_env_port("SERVER_PORT")?,
            },
            logging: LoggingConfig {
                level: get_env("LOG_LEVEL", "info"),
            },
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", "sqlite:classpulse.db"),
            },
            heartbeat: HeartbeatConfig {
                check_interval: get_env_seconds("HEARTBEAT_CHECK_INTERVAL", 2),
                delay: get_env_seconds("HEARTBEAT_DELAY", 30),
                interval: get_env_seconds("HEARTBEAT_INTERVAL", 10),
                kill_delay: get_env_seconds("HEARTBEAT_KILL_DELAY", 60),
            },
            auth: AuthConfig {
                session_duration: get_env_seconds("AUTH_SESSION_DURATION", 24 * 60 * 60),
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }
        Ok(())
    }

    /// The address to bind, in `host:port` form.
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "localhost".to_string(),
                port: 8080,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite:classpulse.db".to_string(),
            },
            heartbeat: HeartbeatConfig::default(),
            auth: AuthConfig {
                session_duration: Duration::from_secs(24 * 60 * 60),
            },
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(2),
            delay: Duration::from_secs(30),
            interval: Duration::from_secs(10),
            kill_delay: Duration::from_secs(60),
        }
    }
}

fn get_env(key: &str, fallback: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => fallback.to_string(),
    }
}

/// Duration keys are plain integer seconds.
fn get_env_seconds(key: &str, fallback_secs: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(fallback_secs);
    Duration::from_secs(secs)
}

fn get_env_port(key: &str) -> Result<u16, ConfigError> {
    let raw = get_env(key, "8080");
    match raw.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort(raw)),
    }
}
