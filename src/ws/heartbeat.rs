//! Cancellable heartbeat loop, one per connection.
//!
//! Silence is measured against the last non-protocol frame. Once silence
//! passes the configured delay the loop pings at the configured spacing;
//! once it passes the kill delay the connection gets error 1 and is closed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use super::connection::Connection;
use crate::protocol::{Frame, ERR_HEARTBEAT};
use crate::state::AppState;

pub fn spawn(state: Arc<AppState>, conn: Arc<Connection>) -> JoinHandle<()> {
    let cfg = state.config.heartbeat.clone();
    let cancel = conn.heartbeat_token();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let mut s = conn.state.write().await;
            let silence = now.duration_since(s.latest_message_at);
            let ping_age = s
                .latest_ping_at
                .map(|at| now.duration_since(at))
                .unwrap_or(Duration::MAX);

            if silence >= cfg.kill_delay {
                let pings = s.pings_sent;
                let pongs = s.pongs_received;
                drop(s);

                conn.send_error(ERR_HEARTBEAT, "Heartbeat missed");
                let rate = if pings == 0 {
                    100.0
                } else {
                    pongs as f32 / pings as f32 * 100.0
                };
                tracing::info!(
                    "Disconnected {}, heartbeat missed. {:.2}% response rate ({}/{})",
                    conn.id,
                    rate,
                    pongs,
                    pings
                );
                state.hub.close_connection(&conn).await;
                return;
            } else if silence >= cfg.delay && ping_age >= cfg.interval {
                s.pings_sent += 1;
                s.latest_ping_at = Some(now);
                drop(s);

                conn.send(&Frame::command("ping"));
                tracing::debug!("Sent heartbeat ping to {}", conn.id);
            }
        }
    })
}
