//! End-to-end scenarios for the device connection core, driven through the
//! library API with channel-backed connections.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use classpulse::config::Config;
use classpulse::db::Database;
use classpulse::protocol::{decode, Inbound, ERR_AUTH, ERR_BAD_REQUEST, ERR_HEARTBEAT, ERR_KICKED};
use classpulse::state::AppState;
use classpulse::ws::auth::sign_nonce;
use classpulse::ws::connection::{Connection, Phase};
use classpulse::ws::{self, heartbeat};

type Outbox = mpsc::UnboundedReceiver<Message>;

async fn test_state() -> Arc<AppState> {
    let db = Database::in_memory().await.unwrap();
    AppState::new(Config::default(), db)
}

async fn connect(state: &AppState) -> (Arc<Connection>, Outbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = state.hub.register(tx).await;
    (conn, rx)
}

async fn recv(rx: &mut Outbox) -> Message {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for an outbound message")
        .expect("outbound channel closed")
}

async fn recv_frame(rx: &mut Outbox) -> Inbound {
    match recv(rx).await {
        Message::Text(text) => decode(text.as_str()).expect("undecodable outbound frame"),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

async fn send(state: &AppState, conn: &Arc<Connection>, raw: &str) {
    ws::handle_text(state, conn, raw).await;
}

/// Run the full enrollment + auth dance, returning the authenticated
/// connection alongside the device id and secret.
async fn authed_device(state: &AppState) -> (Arc<Connection>, Outbox, i64, String) {
    let (conn, mut rx) = connect(state).await;
    send(state, &conn, r#"{"c":"reg_start"}"#).await;
    let pin = match recv_frame(&mut rx).await {
        Inbound::Command(frame) => {
            assert_eq!(frame.c, "reg_pin");
            frame.field("pin").and_then(|v| v.as_u64()).unwrap() as u16
        }
        other => panic!("expected reg_pin, got {:?}", other),
    };
    let device = state.complete_enrollment(pin, None).await.unwrap();
    match recv_frame(&mut rx).await {
        Inbound::Command(frame) => assert_eq!(frame.c, "reg_ok"),
        other => panic!("expected reg_ok, got {:?}", other),
    }

    send(
        state,
        &conn,
        &format!(r#"{{"c":"auth_start","d":{{"id":{}}}}}"#, device.id),
    )
    .await;
    let nonce = match recv_frame(&mut rx).await {
        Inbound::Command(frame) => {
            assert_eq!(frame.c, "auth_nonce");
            frame.field("nonce").and_then(|v| v.as_str()).unwrap().to_string()
        }
        other => panic!("expected auth_nonce, got {:?}", other),
    };
    let signature = sign_nonce(&device.token, &nonce);
    send(
        state,
        &conn,
        &format!(r#"{{"c":"auth_validate","d":{{"signature":"{}"}}}}"#, signature),
    )
    .await;
    match recv_frame(&mut rx).await {
        Inbound::Command(frame) => assert_eq!(frame.c, "auth_ok"),
        other => panic!("expected auth_ok, got {:?}", other),
    }

    (conn, rx, device.id, device.token)
}

#[tokio::test]
async fn test_enrollment_flow() {
    let state = test_state().await;
    let (conn, mut rx) = connect(&state).await;

    send(&state, &conn, r#"{"c":"reg_start"}"#).await;
    let pin = match recv_frame(&mut rx).await {
        Inbound::Command(frame) => {
            assert_eq!(frame.c, "reg_pin");
            frame.field("pin").and_then(|v| v.as_u64()).unwrap() as u16
        }
        other => panic!("expected reg_pin, got {:?}", other),
    };
    assert!((1000..=9999).contains(&pin));
    assert_eq!(state.hub.pin_connection(pin).await, Some(conn.id));

    // Admin claims the pin out-of-band.
    let device = state.complete_enrollment(pin, None).await.unwrap();
    assert_eq!(device.token.len(), 256);

    match recv_frame(&mut rx).await {
        Inbound::Command(frame) => {
            assert_eq!(frame.c, "reg_ok");
            assert_eq!(frame.field("id").and_then(|v| v.as_i64()), Some(device.id));
            assert_eq!(
                frame.field("token").and_then(|v| v.as_str()),
                Some(device.token.as_str())
            );
        }
        other => panic!("expected reg_ok, got {:?}", other),
    }

    // Back to NONE, pin released.
    assert_eq!(conn.state.read().await.phase, Phase::Idle);
    assert_eq!(state.hub.pin_connection(pin).await, None);

    // The pin is single-use.
    assert!(state.complete_enrollment(pin, None).await.is_err());
}

#[tokio::test]
async fn test_auth_success_publishes_device() {
    let state = test_state().await;
    let (conn, _rx, device_id, _secret) = authed_device(&state).await;

    assert_eq!(state.hub.device_connection(device_id).await, Some(conn.id));

    // Hub invariant: the referenced connection is authenticated and bound
    // to the same device id.
    let s = conn.state.read().await;
    assert_eq!(s.phase, Phase::Authenticated);
    assert_eq!(s.device_id, Some(device_id));
    drop(s);

    let stored = state.db.find_device_by_id(device_id).await.unwrap().unwrap();
    assert!(stored.latest_login.is_some());
}

#[tokio::test]
async fn test_auth_wrong_signature_resets_to_none() {
    let state = test_state().await;
    let (conn, mut rx) = connect(&state).await;
    let device = state.db.create_device("super-secret").await.unwrap();

    send(
        &state,
        &conn,
        &format!(r#"{{"c":"auth_start","d":{{"id":{}}}}}"#, device.id),
    )
    .await;
    match recv_frame(&mut rx).await {
        Inbound::Command(frame) => assert_eq!(frame.c, "auth_nonce"),
        other => panic!("expected auth_nonce, got {:?}", other),
    }

    // A syntactically valid signature over the wrong secret.
    let bad_signature = sign_nonce("not-the-secret", "not-the-nonce");
    send(
        &state,
        &conn,
        &format!(r#"{{"c":"auth_validate","d":{{"signature":"{}"}}}}"#, bad_signature),
    )
    .await;
    match recv_frame(&mut rx).await {
        Inbound::Error(err) => {
            assert_eq!(err.e, ERR_AUTH);
            assert_eq!(err.info.as_deref(), Some("Invalid signature."));
        }
        other => panic!("expected auth error, got {:?}", other),
    }

    assert_eq!(conn.state.read().await.phase, Phase::Idle);
    assert_eq!(state.hub.device_connection(device.id).await, None);

    // Bad hex gets the same error class.
    send(
        &state,
        &conn,
        &format!(r#"{{"c":"auth_start","d":{{"id":{}}}}}"#, device.id),
    )
    .await;
    let _ = recv_frame(&mut rx).await;
    send(
        &state,
        &conn,
        r#"{"c":"auth_validate","d":{"signature":"zz-not-hex"}}"#,
    )
    .await;
    match recv_frame(&mut rx).await {
        Inbound::Error(err) => {
            assert_eq!(err.e, ERR_AUTH);
            assert_eq!(err.info.as_deref(), Some("Invalid signature encoding."));
        }
        other => panic!("expected auth error, got {:?}", other),
    }
    assert_eq!(conn.state.read().await.phase, Phase::Idle);
}

#[tokio::test]
async fn test_auth_flow_deadline() {
    let state = test_state().await;
    let (conn, mut rx) = connect(&state).await;
    let device = state.db.create_device("secret").await.unwrap();

    let Some(started_at) = std::time::Instant::now().checked_sub(Duration::from_secs(31)) else {
        return; // host clock too young to backdate, nothing to test
    };
    conn.state.write().await.phase = Phase::Authenticating {
        started_at,
        timeout: Duration::from_secs(30),
        target_device_id: device.id,
        nonce: "stale-nonce".to_string(),
    };

    let signature = sign_nonce(&device.token, "stale-nonce");
    send(
        &state,
        &conn,
        &format!(r#"{{"c":"auth_validate","d":{{"signature":"{}"}}}}"#, signature),
    )
    .await;
    match recv_frame(&mut rx).await {
        Inbound::Error(err) => {
            assert_eq!(err.e, ERR_AUTH);
            assert_eq!(err.info.as_deref(), Some("Authentication timed out."));
        }
        other => panic!("expected timeout error, got {:?}", other),
    }
    assert_eq!(conn.state.read().await.phase, Phase::Idle);
}

#[tokio::test]
async fn test_auth_replacement_kicks_older_connection() {
    let state = test_state().await;
    let (old_conn, mut old_rx, device_id, secret) = authed_device(&state).await;

    // A second physical connection authenticates for the same device.
    let (new_conn, mut new_rx) = connect(&state).await;
    send(
        &state,
        &new_conn,
        &format!(r#"{{"c":"auth_start","d":{{"id":{}}}}}"#, device_id),
    )
    .await;
    let nonce = match recv_frame(&mut new_rx).await {
        Inbound::Command(frame) => frame
            .field("nonce")
            .and_then(|v| v.as_str())
            .unwrap()
            .to_string(),
        other => panic!("expected auth_nonce, got {:?}", other),
    };
    send(
        &state,
        &new_conn,
        &format!(
            r#"{{"c":"auth_validate","d":{{"signature":"{}"}}}}"#,
            sign_nonce(&secret, &nonce)
        ),
    )
    .await;
    match recv_frame(&mut new_rx).await {
        Inbound::Command(frame) => assert_eq!(frame.c, "auth_ok"),
        other => panic!("expected auth_ok, got {:?}", other),
    }

    // The older holder is kicked with error 4 and fully closed.
    match recv_frame(&mut old_rx).await {
        Inbound::Error(err) => {
            assert_eq!(err.e, ERR_KICKED);
            assert!(err.info.unwrap().starts_with("Logged in at other place."));
        }
        other => panic!("expected kick, got {:?}", other),
    }
    assert!(matches!(recv(&mut old_rx).await, Message::Close(_)));
    assert!(old_conn.is_closed());

    assert_eq!(state.hub.device_connection(device_id).await, Some(new_conn.id));
    assert_eq!(state.hub.connection_count().await, 1);
}

#[tokio::test]
async fn test_vote_tally() {
    let state = test_state().await;
    let (conn, mut rx, device_id, _secret) = authed_device(&state).await;
    let user = state.db.create_user("teacher@example.com", "T", 0).await.unwrap();

    let session = state
        .start_session(user.id, device_id, "How was class?")
        .await
        .unwrap();
    match recv_frame(&mut rx).await {
        Inbound::Command(frame) => {
            assert_eq!(frame.c, "session_start");
            assert_eq!(
                frame.field("text").and_then(|v| v.as_str()),
                Some("How was class?")
            );
        }
        other => panic!("expected session_start, got {:?}", other),
    }
    assert!(matches!(
        conn.state.read().await.phase,
        Phase::InSession { .. }
    ));

    for _ in 0..3 {
        send(&state, &conn, r#"{"c":"session_vote","d":{"vote":3}}"#).await;
    }
    send(&state, &conn, r#"{"c":"session_vote","d":{"vote":5}}"#).await;

    // An out-of-range vote is rejected without touching the tally.
    send(&state, &conn, r#"{"c":"session_vote","d":{"vote":6}}"#).await;
    match recv_frame(&mut rx).await {
        Inbound::Error(err) => assert_eq!(err.e, ERR_BAD_REQUEST),
        other => panic!("expected vote error, got {:?}", other),
    }

    let stored = state.db.find_session_by_id(session.id).await.unwrap().unwrap();
    assert_eq!(stored.votes(), [0, 0, 3, 0, 1]);
    assert!(stored.first_answer_time.is_some());
    assert!(stored.last_answer_time.is_some());

    // Stop delivers session_stop and returns the connection to AUTHENTICATED.
    let sealed = state.stop_session(session.id).await.unwrap();
    assert!(sealed.stopped_at.is_some());
    match recv_frame(&mut rx).await {
        Inbound::Command(frame) => assert_eq!(frame.c, "session_stop"),
        other => panic!("expected session_stop, got {:?}", other),
    }
    assert_eq!(conn.state.read().await.phase, Phase::Authenticated);
}

#[tokio::test]
async fn test_one_live_session_per_user_and_device() {
    let state = test_state().await;
    let (_conn_a, _rx_a, device_a, _) = authed_device(&state).await;
    let (_conn_b, _rx_b, device_b, _) = authed_device(&state).await;
    let user_1 = state.db.create_user("u1@example.com", "u1", 0).await.unwrap();
    let user_2 = state.db.create_user("u2@example.com", "u2", 0).await.unwrap();

    let session = state.start_session(user_1.id, device_a, "q").await.unwrap();
    assert_eq!(
        state.sessions.session_for_device(device_a).await,
        Some(session.id)
    );

    // Same user, different device: refused.
    assert!(state.start_session(user_1.id, device_b, "q").await.is_err());
    // Different user, same device: refused.
    assert!(state.start_session(user_2.id, device_a, "q").await.is_err());
    // Different user and device: fine.
    state.start_session(user_2.id, device_b, "q").await.unwrap();

    // After stopping, the slots free up.
    state.stop_session(session.id).await.unwrap();
    state.start_session(user_1.id, device_a, "q").await.unwrap();
}

#[tokio::test]
async fn test_start_session_requires_connected_device() {
    let state = test_state().await;
    let user = state.db.create_user("t@example.com", "t", 0).await.unwrap();
    let device = state.db.create_device("secret").await.unwrap();

    let err = state.start_session(user.id, device.id, "q").await.unwrap_err();
    assert!(err.to_string().contains("not connected"));

    // The failed start must not leave a live-session reservation behind.
    assert_eq!(state.sessions.session_for_user(user.id).await, None);
}

#[tokio::test]
async fn test_stop_after_disconnect_seals_session() {
    let state = test_state().await;
    let (conn, _rx, device_id, _secret) = authed_device(&state).await;
    let user = state.db.create_user("t@example.com", "t", 0).await.unwrap();

    let session = state.start_session(user.id, device_id, "q").await.unwrap();

    // Abrupt transport close.
    state.hub.close_connection(&conn).await;
    assert_eq!(state.hub.device_connection(device_id).await, None);

    // Stopping afterwards is not an error; the row is sealed regardless.
    let sealed = state.stop_session(session.id).await.unwrap();
    assert!(sealed.stopped_at.is_some());

    let device = state.db.find_device_by_id(device_id).await.unwrap().unwrap();
    assert!(device.active_session_id.is_none());
}

#[tokio::test]
async fn test_device_delete_kicks_live_connection() {
    let state = test_state().await;
    let (conn, mut rx, device_id, _secret) = authed_device(&state).await;

    assert!(state.hub.kick(device_id, ERR_KICKED, "Device deleted.").await);
    match recv_frame(&mut rx).await {
        Inbound::Error(err) => {
            assert_eq!(err.e, ERR_KICKED);
            assert_eq!(err.info.as_deref(), Some("Device deleted."));
        }
        other => panic!("expected kick, got {:?}", other),
    }
    assert!(conn.is_closed());
    assert_eq!(state.hub.device_connection(device_id).await, None);
}

#[tokio::test]
async fn test_state_errors_do_not_change_state() {
    let state = test_state().await;
    let (conn, mut rx) = connect(&state).await;

    // Commands that are illegal in NONE all answer with error 0.
    for raw in [
        r#"{"c":"auth_validate","d":{"signature":"00"}}"#,
        r#"{"c":"session_vote","d":{"vote":3}}"#,
        r#"{"c":"bogus_command"}"#,
        r#"{"d":{}}"#,
        r#"{"c":""}"#,
    ] {
        send(&state, &conn, raw).await;
        match recv_frame(&mut rx).await {
            Inbound::Error(err) => assert_eq!(err.e, ERR_BAD_REQUEST),
            other => panic!("expected error for {}, got {:?}", raw, other),
        }
        assert_eq!(conn.state.read().await.phase, Phase::Idle);
    }

    // A client ping gets a pong without affecting state.
    send(&state, &conn, r#"{"c":"ping"}"#).await;
    match recv_frame(&mut rx).await {
        Inbound::Command(frame) => assert_eq!(frame.c, "pong"),
        other => panic!("expected pong, got {:?}", other),
    }
}

#[tokio::test]
async fn test_issue_auth_session_honors_configured_lifetime() {
    let state = test_state().await;
    let user = state.db.create_user("admin@example.com", "A", 1).await.unwrap();

    let token = state.issue_auth_session(user.id).await.unwrap();
    assert_eq!(token.len(), 64);

    let session = state.db.find_auth_session(&token).await.unwrap().unwrap();
    assert_eq!(session.user_id, user.id);
    assert!(session.expires_at > chrono::Utc::now());
    // Default lifetime is 24h; the expiry must not exceed it.
    assert!(session.expires_at <= chrono::Utc::now() + chrono::Duration::hours(25));
}

#[tokio::test]
async fn test_heartbeat_kill_removes_connection() {
    let mut config = Config::default();
    config.heartbeat.check_interval = Duration::from_millis(25);
    config.heartbeat.delay = Duration::from_millis(50);
    config.heartbeat.interval = Duration::from_millis(50);
    config.heartbeat.kill_delay = Duration::from_millis(150);

    let db = Database::in_memory().await.unwrap();
    let state = AppState::new(config, db);
    let (conn, mut rx) = connect(&state).await;
    heartbeat::spawn(state.clone(), conn.clone());

    // Silent client: first a ping, then error 1, then the close frame.
    match recv_frame(&mut rx).await {
        Inbound::Command(frame) => assert_eq!(frame.c, "ping"),
        other => panic!("expected heartbeat ping, got {:?}", other),
    }
    loop {
        match recv_frame(&mut rx).await {
            Inbound::Command(frame) if frame.c == "ping" => continue,
            Inbound::Error(err) => {
                assert_eq!(err.e, ERR_HEARTBEAT);
                break;
            }
            other => panic!("expected ping or heartbeat error, got {:?}", other),
        }
    }
    assert!(matches!(recv(&mut rx).await, Message::Close(_)));

    assert!(conn.is_closed());
    assert_eq!(state.hub.connection_count().await, 0);
}

#[tokio::test]
async fn test_pong_does_not_reset_heartbeat_silence() {
    let state = test_state().await;
    let (conn, _rx) = connect(&state).await;

    let before = conn.state.read().await.latest_message_at;
    send(&state, &conn, r#"{"c":"pong"}"#).await;
    let s = conn.state.read().await;
    assert_eq!(s.latest_message_at, before);
    assert_eq!(s.pongs_received, 1);
    drop(s);

    // A real command does reset silence.
    tokio::time::sleep(Duration::from_millis(5)).await;
    send(&state, &conn, r#"{"c":"reg_start"}"#).await;
    assert!(conn.state.read().await.latest_message_at > before);
}
