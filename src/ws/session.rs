//! Voting flow (`session_vote`).
//!
//! Legal only while a session is live on this connection. A valid vote is a
//! single atomic counter update on the session row; the device gets no reply
//! on success, the persisted tally is authoritative.

use std::sync::Arc;

use super::connection::{Connection, Phase};
use crate::protocol::{self, Frame, ERR_BAD_REQUEST, ERR_INTERNAL};
use crate::state::AppState;

pub async fn handle_session_vote(state: &AppState, conn: &Arc<Connection>, frame: &Frame) {
    let session_id = {
        let s = conn.state.read().await;
        match &s.phase {
            Phase::InSession { session_id, .. } => *session_id,
            other => {
                conn.send_error(
                    ERR_BAD_REQUEST,
                    format!(
                        "Can not vote in state {}, only IN_SESSION is allowed",
                        other.name()
                    ),
                );
                return;
            }
        }
    };

    let Some(raw_vote) = frame.field("vote") else {
        conn.send_error(ERR_BAD_REQUEST, "No data field 'vote'");
        return;
    };
    let vote = match protocol::as_integer(raw_vote) {
        Some(vote) if (1..=5).contains(&vote) => vote as u8,
        _ => {
            conn.send_error(
                ERR_BAD_REQUEST,
                "Invalid vote: must be an integer between 1 and 5 (inclusive)",
            );
            return;
        }
    };

    if let Err(err) = state.db.update_session_vote(session_id, vote).await {
        tracing::error!("Vote update failed for session {}: {}", session_id, err);
        conn.send_error(ERR_INTERNAL, "Could not record vote");
    }
}
