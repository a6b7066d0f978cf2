//! Session authentication extractor.
//!
//! Sign-in and session issuance belong to the external auth service; this
//! crate only resolves the session token it left behind.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum_extra::extract::cookie::{Cookie, CookieJar};

use super::{ApiError, INTERNAL_ERROR_MESSAGE};
use crate::state::AppState;
use crate::store::UserRow;

/// Authenticated user resolved from the session cookie or a bearer token.
/// Use as a handler parameter to require authentication.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: UserRow,
}

/// Session token from the named cookie, falling back to `Authorization: Bearer`.
pub(crate) fn session_token(parts: &Parts, cookie_name: &str) -> Option<String> {
    let jar = CookieJar::from_headers(&parts.headers);
    if let Some(token) = jar.get(cookie_name).map(Cookie::value).filter(|v| !v.is_empty()) {
        return Some(token.to_owned());
    }
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
}

impl<S> FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);
        let unauthorized = || ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized");

        let token = session_token(parts, &app_state.config.auth_cookie_name).ok_or_else(unauthorized)?;
        let user = app_state
            .store
            .session_user(&token)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "session lookup failed");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE)
            })?
            .ok_or_else(unauthorized)?;

        Ok(Self { user })
    }
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
