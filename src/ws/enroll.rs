//! Device enrollment flow (`reg_start`).
//!
//! The device asks for a pin, shows it on its display, and an admin claims
//! the pin out-of-band via the HTTP surface. The enrollment itself completes
//! in `Hub::complete_enrollment`.

use std::sync::Arc;

use serde_json::json;

use super::connection::Connection;
use crate::hub::RegistrationError;
use crate::protocol::{Frame, ERR_BAD_REQUEST, ERR_INTERNAL};
use crate::state::AppState;

pub async fn handle_reg_start(state: &AppState, conn: &Arc<Connection>) {
    match state.hub.begin_registration(conn).await {
        Ok(pin) => {
            conn.send(&Frame::with_data("reg_pin", json!({ "pin": pin })));
            tracing::info!(
                "Started registration for connection {} with pin {}",
                conn.id,
                pin
            );
        }
        Err(err @ RegistrationError::InvalidState(_)) => {
            conn.send_error(ERR_BAD_REQUEST, err.to_string());
        }
        Err(err @ RegistrationError::PinSpaceExhausted) => {
            tracing::error!("Pin draw failed for connection {}: {}", conn.id, err);
            conn.send_error(ERR_INTERNAL, err.to_string());
        }
    }
}
