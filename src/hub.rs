//! Process-wide connection registry.
//!
//! The hub owns three indices: connection-id → connection, device-id →
//! connection-id (only for authenticated connections) and pending
//! registration pin → connection-id. All index mutations happen under the
//! hub lock. Lock order is hub before connection, never the reverse;
//! replacement kicks are delivered after the hub lock is released so the
//! victim's own close can re-enter the hub.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use rand::rngs::OsRng;
use rand::{Rng, TryRngCore};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use crate::db::models::Device;
use crate::db::{Database, DbError};
use crate::protocol::{Frame, ERR_KICKED};
use crate::ws::connection::{Connection, ConnectionId, Phase};

/// Entropy of a device secret, in raw bytes (hex-encoded on issue).
pub const DEVICE_SECRET_BYTES: usize = 128;

/// How many pins are drawn before giving up on a colliding pin space.
const PIN_DRAW_ATTEMPTS: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("can not start registration in state {0}, only NONE is allowed")]
    InvalidState(&'static str),
    #[error("could not allocate a free registration pin")]
    PinSpaceExhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum EnrollError {
    #[error("no pending enrollment for this pin")]
    PinNotFound,
    #[error("no device with id {0}")]
    DeviceNotFound(i64),
    #[error("the enrolling connection is gone")]
    ConnectionGone,
    #[error("could not generate a device secret")]
    SecretGeneration,
    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Default)]
struct HubInner {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    connected_devices: HashMap<i64, ConnectionId>,
    pending_pins: HashMap<u16, ConnectionId>,
    next_id: ConnectionId,
}

#[derive(Default)]
pub struct Hub {
    inner: Mutex<HubInner>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly upgraded channel, assigning the next connection id.
    pub async fn register(&self, outbound: mpsc::UnboundedSender<Message>) -> Arc<Connection> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;
        let conn = Arc::new(Connection::new(id, outbound));
        inner.connections.insert(id, conn.clone());
        conn
    }

    /// Move an idle connection into REGISTERING under a freshly drawn pin.
    /// Pins must be unique among pending registrations; collisions are
    /// retried a bounded number of times.
    pub async fn begin_registration(
        &self,
        conn: &Arc<Connection>,
    ) -> Result<u16, RegistrationError> {
        let mut inner = self.inner.lock().await;
        let mut state = conn.state.write().await;
        if state.phase != Phase::Idle {
            return Err(RegistrationError::InvalidState(state.phase.name()));
        }

        let mut drawn = None;
        for _ in 0..PIN_DRAW_ATTEMPTS {
            let pin: u16 = rand::rng().random_range(1000..=9999);
            if !inner.pending_pins.contains_key(&pin) {
                drawn = Some(pin);
                break;
            }
        }
        let pin = drawn.ok_or(RegistrationError::PinSpaceExhausted)?;

        inner.pending_pins.insert(pin, conn.id);
        state.phase = Phase::Registering { pin };
        Ok(pin)
    }

    /// Complete a pending enrollment out-of-band. With `existing` the device
    /// secret is rotated in place (relink), otherwise a fresh device row is
    /// created. The hub lock is held across the store write so a second
    /// caller with the same pin cannot double-register.
    pub async fn complete_enrollment(
        &self,
        db: &Database,
        pin: u16,
        existing: Option<Device>,
    ) -> Result<Device, EnrollError> {
        let mut inner = self.inner.lock().await;

        let conn_id = *inner.pending_pins.get(&pin).ok_or(EnrollError::PinNotFound)?;
        let Some(conn) = inner.connections.get(&conn_id).cloned() else {
            inner.pending_pins.remove(&pin);
            return Err(EnrollError::ConnectionGone);
        };
        {
            let state = conn.state.read().await;
            if state.phase != (Phase::Registering { pin }) {
                inner.pending_pins.remove(&pin);
                return Err(EnrollError::ConnectionGone);
            }
        }

        let secret = generate_device_secret().map_err(|e| {
            tracing::error!("Device secret generation failed: {}", e);
            EnrollError::SecretGeneration
        })?;

        let device = match existing {
            None => db.create_device(&secret).await?,
            Some(mut device) => {
                db.rotate_device_token(device.id, &secret).await?;
                device.token = secret;
                device
            }
        };

        {
            let mut state = conn.state.write().await;
            state.phase = Phase::Idle;
        }
        inner.pending_pins.remove(&pin);
        conn.send(&Frame::with_data(
            "reg_ok",
            json!({ "id": device.id, "token": device.token }),
        ));

        // A relink rotates the secret, so any connection still authenticated
        // under the old secret loses its claim to the device.
        let victim = inner
            .connected_devices
            .get(&device.id)
            .and_then(|id| inner.connections.get(id))
            .cloned();
        drop(inner);
        if let Some(victim) = victim {
            victim.send_error(ERR_KICKED, "Device relinked. Credentials were rotated.");
            self.close_connection(&victim).await;
        }

        tracing::info!("Registered device {} via pin {}", device.id, pin);
        Ok(device)
    }

    /// Publish an authenticated connection as the live connection for a
    /// device, kicking any previous holder.
    pub async fn bind_device(&self, conn: &Arc<Connection>, device_id: i64) {
        let mut inner = self.inner.lock().await;
        {
            let mut state = conn.state.write().await;
            state.phase = Phase::Authenticated;
            state.device_id = Some(device_id);
        }
        let victim = match inner.connected_devices.insert(device_id, conn.id) {
            Some(old_id) if old_id != conn.id => inner.connections.get(&old_id).cloned(),
            _ => None,
        };
        drop(inner);

        if let Some(victim) = victim {
            victim.send_error(
                ERR_KICKED,
                "Logged in at other place. Only one connection allowed per device.",
            );
            self.close_connection(&victim).await;
        }
    }

    /// Drop the device mapping, but only if it still points at `conn_id`.
    pub async fn unbind_device(&self, device_id: i64, conn_id: ConnectionId) {
        let mut inner = self.inner.lock().await;
        if inner.connected_devices.get(&device_id) == Some(&conn_id) {
            inner.connected_devices.remove(&device_id);
        }
    }

    /// Forcibly close the live connection of a device, delivering the given
    /// error first. No-op when the device is not connected.
    pub async fn kick(&self, device_id: i64, code: i32, info: &str) -> bool {
        let conn = {
            let inner = self.inner.lock().await;
            inner
                .connected_devices
                .get(&device_id)
                .and_then(|id| inner.connections.get(id))
                .cloned()
        };
        match conn {
            Some(conn) => {
                conn.send_error(code, info);
                self.close_connection(&conn).await;
                true
            }
            None => false,
        }
    }

    /// The live connection for a device, if any. The returned handle stays
    /// valid past the hub lock; callers re-check connection state before
    /// acting on it.
    pub async fn connection_for_device(&self, device_id: i64) -> Option<Arc<Connection>> {
        let inner = self.inner.lock().await;
        inner
            .connected_devices
            .get(&device_id)
            .and_then(|id| inner.connections.get(id))
            .cloned()
    }

    /// Tear a connection down and remove it from every index. Idempotent:
    /// only the first caller performs the removal.
    pub async fn close_connection(&self, conn: &Arc<Connection>) {
        if !conn.begin_close() {
            return;
        }
        let mut inner = self.inner.lock().await;
        inner.connections.remove(&conn.id);

        let state = conn.state.read().await;
        if let Some(device_id) = state.device_id {
            if inner.connected_devices.get(&device_id) == Some(&conn.id) {
                inner.connected_devices.remove(&device_id);
            }
            tracing::info!("Closed connection {}, device {}", conn.id, device_id);
        } else {
            tracing::info!("Closed connection {}", conn.id);
        }
        if let Phase::Registering { pin } = state.phase {
            inner.pending_pins.remove(&pin);
        }
    }

    // ----- index inspection (admin surface and tests) -----

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    pub async fn device_connection(&self, device_id: i64) -> Option<ConnectionId> {
        self.inner.lock().await.connected_devices.get(&device_id).copied()
    }

    pub async fn pin_connection(&self, pin: u16) -> Option<ConnectionId> {
        self.inner.lock().await.pending_pins.get(&pin).copied()
    }

    pub async fn pending_pin_count(&self) -> usize {
        self.inner.lock().await.pending_pins.len()
    }
}

fn generate_device_secret() -> Result<String, rand::rand_core::OsError> {
    let mut bytes = [0u8; DEVICE_SECRET_BYTES];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(hex::encode(bytes))
}
