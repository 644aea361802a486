//! Admin HTTP surface.
//!
//! Everything an admin does to devices and sessions crosses into the
//! connection core through these endpoints: claiming enrollment pins,
//! relinking, deleting devices (which kicks the live connection), and
//! starting/stopping voting sessions on a specific device's channel.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::{self, AuthedUser};
use crate::db::models::{Device, VotingSession, ROLE_ADMIN};
use crate::db::DbError;
use crate::hub::EnrollError;
use crate::protocol::ERR_KICKED;
use crate::sessions::SessionError;
use crate::state::AppState;

const MAX_PAGE_SIZE: i64 = 20;

/// Structured JSON error body for API errors.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("forbidden")]
    Forbidden,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        tracing::error!("Database error in admin handler: {}", err);
        ApiError::Internal
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::DeviceNotConnected => {
                ApiError::Unavailable("Device currently unavailable".to_string())
            }
            SessionError::UserBusy | SessionError::DeviceBusy => {
                ApiError::Conflict("Can not have more than 1 session".to_string())
            }
            SessionError::NotFound(id) => ApiError::NotFound(format!("No session with id: {}", id)),
            SessionError::Db(db) => db.into(),
        }
    }
}

impl From<EnrollError> for ApiError {
    fn from(err: EnrollError) -> Self {
        match err {
            EnrollError::PinNotFound => ApiError::NotFound("Invalid pin".to_string()),
            EnrollError::DeviceNotFound(id) => {
                ApiError::NotFound(format!("No device with id of {}", id))
            }
            EnrollError::ConnectionGone => {
                ApiError::Unavailable("The enrolling device disconnected".to_string())
            }
            EnrollError::SecretGeneration => ApiError::Internal,
            EnrollError::Db(db) => db.into(),
        }
    }
}

fn ensure_admin(user: &AuthedUser) -> Result<(), ApiError> {
    if user.0.role == ROLE_ADMIN {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

// ----- payloads -----

#[derive(Debug, Serialize)]
pub struct DeviceInfo {
    pub id: i64,
    pub room: Option<String>,
    pub registration_date: DateTime<Utc>,
    pub latest_login: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub active_session_id: Option<i64>,
}

impl From<&Device> for DeviceInfo {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id,
            room: device.room.clone(),
            registration_date: device.registered_at,
            latest_login: device.latest_login,
            last_seen: device.last_seen,
            active_session_id: device.active_session_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub id: i64,
    pub user_id: i64,
    pub question_id: i64,
    pub question: String,
    pub device_id: i64,
    pub date: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub first_answer_time: Option<DateTime<Utc>>,
    pub last_answer_time: Option<DateTime<Utc>>,
    pub votes: [u16; 5],
}

async fn session_info(state: &AppState, session: &VotingSession) -> Result<SessionInfo, ApiError> {
    let question = state
        .db
        .find_question_by_id(session.question_id)
        .await?
        .map(|q| q.text)
        .unwrap_or_default();
    Ok(SessionInfo {
        id: session.id,
        user_id: session.user_id,
        question_id: session.question_id,
        question,
        device_id: session.device_id,
        date: session.started_at,
        stopped_at: session.stopped_at,
        first_answer_time: session.first_answer_time,
        last_answer_time: session.last_answer_time,
        votes: session.votes(),
    })
}

#[derive(Debug, Deserialize)]
struct PageParams {
    limit: Option<i64>,
    offset: Option<i64>,
    leased: Option<bool>,
}

fn clamp_page(params: &PageParams) -> (i64, i64) {
    let limit = params.limit.unwrap_or(MAX_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = params.offset.unwrap_or(0).max(0);
    (limit, offset)
}

#[derive(Debug, Deserialize)]
struct IdentifierParams {
    #[serde(rename = "type")]
    id_type: Option<String>,
}

// ----- device endpoints -----

async fn list_devices(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthedUser>,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<DeviceInfo>>, ApiError> {
    ensure_admin(&user)?;
    let (limit, offset) = clamp_page(&params);
    let devices = state.db.list_devices(limit, offset, params.leased).await?;
    Ok(Json(devices.iter().map(DeviceInfo::from).collect()))
}

/// Look a device up by id, or by room with `?type=room`.
async fn find_device(
    state: &AppState,
    identifier: &str,
    params: &IdentifierParams,
) -> Result<Device, ApiError> {
    let id_type = params.id_type.as_deref().unwrap_or("id");
    let device = match id_type {
        "id" => {
            let id: i64 = identifier.parse().map_err(|_| {
                ApiError::BadRequest("Invalid device ID, expected positive integer".to_string())
            })?;
            state.db.find_device_by_id(id).await?
        }
        "room" => state.db.find_device_by_room(identifier).await?,
        other => {
            return Err(ApiError::BadRequest(format!(
                "Invalid identifier type '{}'",
                other
            )))
        }
    };
    device.ok_or_else(|| {
        ApiError::NotFound(format!("No device with {} of '{}'", id_type, identifier))
    })
}

async fn get_device(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthedUser>,
    Path(identifier): Path<String>,
    Query(params): Query<IdentifierParams>,
) -> Result<Json<DeviceInfo>, ApiError> {
    ensure_admin(&user)?;
    let device = find_device(&state, &identifier, &params).await?;
    Ok(Json(DeviceInfo::from(&device)))
}

/// Delete a device. A live connection is kicked (error 4) before the row
/// goes away.
async fn delete_device(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthedUser>,
    Path(identifier): Path<String>,
    Query(params): Query<IdentifierParams>,
) -> Result<StatusCode, ApiError> {
    ensure_admin(&user)?;
    let device = find_device(&state, &identifier, &params).await?;

    state.hub.kick(device.id, ERR_KICKED, "Device deleted.").await;
    state.db.delete_device_by_id(device.id).await?;
    tracing::info!("Deleted device {}", device.id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    pin: u16,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    device_id: i64,
}

async fn register_device(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthedUser>,
    Json(body): Json<RegisterBody>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    ensure_admin(&user)?;
    let device = state.complete_enrollment(body.pin, None).await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            device_id: device.id,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct RelinkBody {
    pin: u16,
    device_id: i64,
}

async fn relink_device(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthedUser>,
    Json(body): Json<RelinkBody>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    ensure_admin(&user)?;
    let device = state
        .complete_enrollment(body.pin, Some(body.device_id))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            device_id: device.id,
        }),
    ))
}

// ----- session endpoints -----

#[derive(Debug, Deserialize)]
struct PostSessionBody {
    device_id: i64,
    question: String,
}

async fn post_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthedUser>,
    Json(body): Json<PostSessionBody>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = state
        .start_session(user.0.id, body.device_id, &body.question)
        .await?;
    Ok(Json(session_info(&state, &session).await?))
}

async fn stop_own_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session_id = state
        .sessions
        .session_for_user(user.0.id)
        .await
        .ok_or_else(|| ApiError::NotFound("No current session".to_string()))?;
    let session = state.stop_session(session_id).await?;
    Ok(Json(session_info(&state, &session).await?))
}

async fn stop_session_by_id(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthedUser>,
    Path(id): Path<i64>,
) -> Result<Json<SessionInfo>, ApiError> {
    ensure_admin(&user)?;
    let session = state.stop_session(id).await?;
    Ok(Json(session_info(&state, &session).await?))
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthedUser>,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<SessionInfo>>, ApiError> {
    let (limit, offset) = clamp_page(&params);
    let sessions = state
        .db
        .list_sessions_for_user(user.0.id, limit, offset)
        .await?;
    let mut infos = Vec::with_capacity(sessions.len());
    for session in &sessions {
        infos.push(session_info(&state, session).await?);
    }
    Ok(Json(infos))
}

async fn get_current_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session_id = state
        .sessions
        .session_for_user(user.0.id)
        .await
        .ok_or_else(|| ApiError::NotFound("No current session".to_string()))?;
    let session = state
        .db
        .find_session_by_id(session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No session with id: {}", session_id)))?;
    Ok(Json(session_info(&state, &session).await?))
}

async fn get_session_by_id(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthedUser>,
    Path(id): Path<i64>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = state
        .db
        .find_session_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No session with id: {}", id)))?;
    if session.user_id != user.0.id && user.0.role != ROLE_ADMIN {
        return Err(ApiError::Forbidden);
    }
    Ok(Json(session_info(&state, &session).await?))
}

/// The full router: the public device channel plus the cookie-guarded admin
/// surface.
pub fn router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/device", get(list_devices))
        .route("/device/register", post(register_device))
        .route("/device/relink", post(relink_device))
        .route("/device/{id}", get(get_device).delete(delete_device))
        .route("/session", get(list_sessions).post(post_session))
        .route("/session/current", get(get_current_session))
        .route("/session/stop", post(stop_own_session))
        .route("/session/{id}", get(get_session_by_id))
        .route("/session/{id}/stop", post(stop_session_by_id))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/ws", get(crate::ws::ws_handler))
        .merge(admin)
        .with_state(state)
}
