//! Admin authentication middleware.
//!
//! Admin requests carry an `auth_session_token` cookie pointing at a stored
//! auth session. The middleware resolves it to the owning user and stashes
//! the user in request extensions; handlers decide role requirements
//! themselves. Session issuance (the OAuth login dance) lives outside this
//! service.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use std::sync::Arc;

use crate::api::ErrorBody;
use crate::db::models::User;
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "auth_session_token";

/// The authenticated user, available to handlers behind `require_auth`.
#[derive(Debug, Clone)]
pub struct AuthedUser(pub User);

fn unauthorized(msg: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            error: msg.to_string(),
        }),
    )
        .into_response()
}

/// Pull the session token out of the Cookie header.
fn session_token(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let Some((name, value)) = pair.trim().split_once('=') else {
            continue;
        };
        if name == SESSION_COOKIE {
            return Some(value.to_string());
        }
    }
    None
}

/// Middleware guarding the admin surface. Looks up the presented session
/// token, checks expiry and loads the owning user.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = session_token(request.headers()) else {
        return unauthorized("'auth_session_token' cookie is required for authenticated requests");
    };

    let session = match state.db.find_auth_session(&token).await {
        Ok(Some(session)) => session,
        Ok(None) => return unauthorized("Invalid session"),
        Err(err) => {
            tracing::error!("Auth session lookup failed: {}", err);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if Utc::now() > session.expires_at {
        return unauthorized("Invalid or expired session");
    }

    let user = match state.db.find_user_by_id(session.user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return unauthorized("Invalid or expired session"),
        Err(err) => {
            tracing::error!("User lookup failed: {}", err);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    request.extensions_mut().insert(AuthedUser(user));
    next.run(request).await
}
