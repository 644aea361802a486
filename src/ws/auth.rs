//! Device authentication flow (`auth_start` / `auth_validate`).
//!
//! Challenge/response over the device secret: the server hands out a
//! single-use nonce, the device answers with hex(HMAC_SHA256(secret, nonce)).
//! The comparison is constant-time. A successful validation publishes the
//! connection in the hub's device index, kicking any previous holder.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::TryRngCore;
use serde_json::json;
use sha2::Sha256;

use super::connection::{Connection, Phase, AUTH_FLOW_TIMEOUT};
use crate::protocol::{self, Frame, ERR_AUTH, ERR_BAD_REQUEST, ERR_INTERNAL};
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

const NONCE_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const NONCE_LEN: usize = 128;

/// 128 characters drawn uniformly from [a-zA-Z0-9] out of the OS entropy
/// source. 248 is the largest multiple of 62 that fits a byte; rejecting the
/// tail keeps each character uniform.
fn generate_nonce() -> Result<String, rand::rand_core::OsError> {
    let mut nonce = String::with_capacity(NONCE_LEN);
    let mut byte = [0u8; 1];
    while nonce.len() < NONCE_LEN {
        OsRng.try_fill_bytes(&mut byte)?;
        if byte[0] < 248 {
            nonce.push(NONCE_CHARSET[(byte[0] % 62) as usize] as char);
        }
    }
    Ok(nonce)
}

async fn reset_to_idle(conn: &Arc<Connection>) {
    let mut state = conn.state.write().await;
    state.phase = Phase::Idle;
}

pub async fn handle_auth_start(state: &AppState, conn: &Arc<Connection>, frame: &Frame) {
    {
        let s = conn.state.read().await;
        if s.phase != Phase::Idle {
            conn.send_error(
                ERR_BAD_REQUEST,
                format!(
                    "Can not start authentication in state {}, only NONE is allowed",
                    s.phase.name()
                ),
            );
            return;
        }
    }

    let Some(raw_id) = frame.field("id") else {
        conn.send_error(ERR_BAD_REQUEST, "No data field 'id'");
        return;
    };
    let target_id = match protocol::as_integer(raw_id) {
        Some(id) if id >= 0 => id,
        _ => {
            conn.send_error(ERR_BAD_REQUEST, "invalid id: must be a non-negative integer");
            return;
        }
    };

    let device = match state.db.find_device_by_id(target_id).await {
        Ok(Some(device)) => device,
        Ok(None) => {
            conn.send_error(ERR_AUTH, "Unknown device.");
            return;
        }
        Err(err) => {
            tracing::error!("Device lookup failed during auth_start: {}", err);
            conn.send_error(ERR_INTERNAL, "Could not look up device");
            return;
        }
    };

    let nonce = match generate_nonce() {
        Ok(nonce) => nonce,
        Err(err) => {
            tracing::error!("Nonce generation failed: {}", err);
            conn.send_error(ERR_INTERNAL, "Could not generate nonce");
            return;
        }
    };

    {
        let mut s = conn.state.write().await;
        if s.phase != Phase::Idle {
            conn.send_error(
                ERR_BAD_REQUEST,
                format!(
                    "Can not start authentication in state {}, only NONE is allowed",
                    s.phase.name()
                ),
            );
            return;
        }
        s.phase = Phase::Authenticating {
            started_at: std::time::Instant::now(),
            timeout: AUTH_FLOW_TIMEOUT,
            target_device_id: device.id,
            nonce: nonce.clone(),
        };
    }
    tracing::info!("Started authentication for device {}", device.id);

    conn.send(&Frame::with_data("auth_nonce", json!({ "nonce": nonce })));
}

pub async fn handle_auth_validate(state: &AppState, conn: &Arc<Connection>, frame: &Frame) {
    let (started_at, timeout, target_device_id, nonce) = {
        let s = conn.state.read().await;
        match &s.phase {
            Phase::Authenticating {
                started_at,
                timeout,
                target_device_id,
                nonce,
            } => (*started_at, *timeout, *target_device_id, nonce.clone()),
            other => {
                conn.send_error(
                    ERR_BAD_REQUEST,
                    format!(
                        "Can not validate authentication in state {}, only AUTHENTICATING is allowed",
                        other.name()
                    ),
                );
                return;
            }
        }
    };

    let Some(raw_signature) = frame.field("signature") else {
        conn.send_error(ERR_BAD_REQUEST, "No data field 'signature'");
        return;
    };
    let Some(signature) = raw_signature.as_str() else {
        conn.send_error(ERR_BAD_REQUEST, "invalid signature: must be a string");
        return;
    };

    if started_at.elapsed() > timeout {
        reset_to_idle(conn).await;
        conn.send_error(ERR_AUTH, "Authentication timed out.");
        return;
    }

    let device = match state.db.find_device_by_id(target_device_id).await {
        Ok(Some(device)) => device,
        Ok(None) => {
            reset_to_idle(conn).await;
            conn.send_error(ERR_AUTH, "Unknown device.");
            return;
        }
        Err(err) => {
            tracing::error!(
                "Could not retrieve device {} from database: {}",
                target_device_id,
                err
            );
            reset_to_idle(conn).await;
            conn.send_error(
                ERR_INTERNAL,
                format!("Could not retrieve device {} from database", target_device_id),
            );
            return;
        }
    };

    let decoded_signature = match hex::decode(signature) {
        Ok(bytes) => bytes,
        Err(_) => {
            reset_to_idle(conn).await;
            conn.send_error(ERR_AUTH, "Invalid signature encoding.");
            return;
        }
    };

    let mut mac = match HmacSha256::new_from_slice(device.token.as_bytes()) {
        Ok(mac) => mac,
        Err(err) => {
            tracing::error!("HMAC init failed: {}", err);
            reset_to_idle(conn).await;
            conn.send_error(ERR_INTERNAL, "Signature verification failed");
            return;
        }
    };
    mac.update(nonce.as_bytes());
    if mac.verify_slice(&decoded_signature).is_err() {
        reset_to_idle(conn).await;
        conn.send_error(ERR_AUTH, "Invalid signature.");
        tracing::info!("Auth fail for device {}, invalid signature", device.id);
        return;
    }

    state.hub.bind_device(conn, device.id).await;
    if let Err(err) = state
        .db
        .update_device_latest_login(device.id, chrono::Utc::now())
        .await
    {
        tracing::warn!("Failed to update latest_login for device {}: {}", device.id, err);
    }

    conn.send(&Frame::command("auth_ok"));
    tracing::info!("Device {} authenticated successfully", device.id);
}

/// Compute the signature a device would send for the given secret and nonce.
/// Shared with the test suite; devices implement the same derivation.
pub fn sign_nonce(secret: &str, nonce: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(nonce.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_length_and_charset() {
        let nonce = generate_nonce().unwrap();
        assert_eq!(nonce.len(), NONCE_LEN);
        assert!(nonce.bytes().all(|b| NONCE_CHARSET.contains(&b)));
    }

    #[test]
    fn test_nonces_are_unique() {
        assert_ne!(generate_nonce().unwrap(), generate_nonce().unwrap());
    }

    #[test]
    fn test_sign_nonce_matches_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let signature = sign_nonce("key", "The quick brown fox jumps over the lazy dog");
        assert_eq!(
            signature,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }
}
