//! Wire codec for the device channel.
//!
//! Every frame on the channel is a compact JSON object. Commands look like
//! `{"c": "auth_start", "d": {"id": 3}}` where `d` is optional, errors look
//! like `{"e": 3, "info": "Invalid signature."}`. Numeric payload fields are
//! deliberately left as raw JSON values here; the flow handlers validate
//! integrality and range before trusting them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Internal server error.
pub const ERR_INTERNAL: i32 = -1;
/// Bad request, or a command that is illegal in the current state.
pub const ERR_BAD_REQUEST: i32 = 0;
/// Heartbeat missed, the server is closing the connection.
pub const ERR_HEARTBEAT: i32 = 1;
/// Invalid authentication data.
pub const ERR_AUTH: i32 = 3;
/// Kicked: replaced by a newer connection, or the device was deleted.
pub const ERR_KICKED: i32 = 4;

/// A command frame. `d` is omitted on the wire when empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub c: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
}

impl Frame {
    pub fn command(c: &str) -> Self {
        Self {
            c: c.to_string(),
            d: None,
        }
    }

    pub fn with_data(c: &str, d: Value) -> Self {
        Self {
            c: c.to_string(),
            d: Some(d),
        }
    }

    /// Look up a field of `d`, treating a missing `d` as an empty object.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.d.as_ref().and_then(|d| d.get(key))
    }
}

/// An error frame. `e` is always serialized so code 0 stays visible.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorFrame {
    pub e: i32,
    pub info: Option<String>,
}

impl ErrorFrame {
    pub fn new(e: i32, info: impl Into<String>) -> Self {
        Self {
            e,
            info: Some(info.into()),
        }
    }
}

/// A decoded inbound frame: either a command or a client-reported error.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Command(Frame),
    Error(ErrorFrame),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("a command ('c') or error code ('e') is required")]
    MissingCommand,
    #[error("a command ('c') must not be empty")]
    EmptyCommand,
    #[error("data ('d') must be an object")]
    InvalidData,
}

#[derive(Deserialize)]
struct RawFrame {
    c: Option<String>,
    e: Option<i32>,
    info: Option<String>,
    d: Option<Value>,
}

/// Decode a single text frame. Missing `d` is equivalent to an empty object;
/// a frame with neither `c` nor `e`, or an empty `c`, is rejected.
pub fn decode(text: &str) -> Result<Inbound, DecodeError> {
    let raw: RawFrame = serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))?;

    if let Some(c) = raw.c {
        if c.is_empty() {
            return Err(DecodeError::EmptyCommand);
        }
        if let Some(d) = &raw.d {
            if !d.is_object() {
                return Err(DecodeError::InvalidData);
            }
        }
        return Ok(Inbound::Command(Frame { c, d: raw.d }));
    }

    if let Some(e) = raw.e {
        return Ok(Inbound::Error(ErrorFrame { e, info: raw.info }));
    }

    Err(DecodeError::MissingCommand)
}

/// Interpret a JSON value as an integer, accepting whole-valued floats the
/// way JSON numbers arrive from loosely typed clients. Anything fractional,
/// out of i64 range or non-numeric is rejected.
pub fn as_integer(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    if let Some(f) = value.as_f64() {
        if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
            return Some(f as i64);
        }
    }
    None
}
