//! Router assembly and HTTP error mapping.
//!
//! SYSTEM CONTEXT
//! ==============
//! Every JSON endpoint lives under `/api`. Browsers call from the configured
//! trusted origins with the session cookie attached, so CORS is an explicit
//! allow list with credentials. The payment webhook reads the raw body for
//! signature checks and is the only route that takes bytes instead of JSON.
//!
//! Errors from the service layer are turned into [`ApiError`] here: the
//! response carries only `{"message"}`, and the grepable code is logged.
//! Handlers take [`ApiPath`] and [`ApiJson`] instead of the bare extractors
//! so malformed ids and bodies get the same error shape.

pub mod auth;
pub mod projects;
pub mod stripe;
pub mod users;

use axum::Router;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{DefaultBodyLimit, FromRequest, FromRequestParts, Path, Request};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::error::ErrorCode;
use crate::services::generation::GenerationError;
use crate::services::ledger::LedgerError;
use crate::services::payment::PaymentError;
use crate::services::project::ProjectError;
use crate::state::AppState;

/// Saved pages are whole HTML documents.
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";
pub const CREATE_SHORT_BALANCE_MESSAGE: &str = "add credits to create new project";
pub const REVISION_SHORT_BALANCE_MESSAGE: &str = "add more credits to make changes";

/// Build the full application router.
pub fn app(state: AppState) -> Router {
    let cors = cors_layer(&state.config.trusted_origins);

    Router::new()
        .route("/api/user/credits", get(users::credits))
        .route("/api/user/project", post(users::create_project))
        .route("/api/user/project/{id}", get(users::get_project))
        .route("/api/user/projects", get(users::list_projects))
        .route("/api/user/project-toggle/{id}", post(users::toggle_publish))
        .route("/api/user/purchase-credits", post(users::purchase_credits))
        .route("/api/project/revision/{id}", post(projects::revise))
        .route("/api/project/save/{id}", put(projects::save))
        .route("/api/project/rollback/{id}", post(projects::rollback))
        .route("/api/project/preview/{id}", get(projects::preview))
        .route("/api/project/published", get(projects::list_published))
        .route("/api/project/published/{id}", get(projects::published_code))
        .route("/api/project/{id}", delete(projects::delete))
        .route("/api/stripe", post(stripe::webhook))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring malformed trusted origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_credentials(true)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

// =============================================================================
// API ERROR
// =============================================================================

/// Error response rendered as `{"message": ...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    /// Log `err` with its code and wrap `message` for the client.
    fn logged<E: ErrorCode>(status: StatusCode, message: impl Into<String>, err: &E) -> Self {
        let code = err.error_code();
        if status.is_server_error() {
            error!(status = status.as_u16(), code, retryable = err.retryable(), error = %err, "request failed");
        } else {
            debug!(status = status.as_u16(), code, error = %err, "request rejected");
        }
        Self::new(status, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "message": self.message }))).into_response()
    }
}

// =============================================================================
// EXTRACTORS
// =============================================================================

/// [`Path`] that rejects with an [`ApiError`].
#[derive(Debug)]
pub struct ApiPath<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Path::<T>::from_request_parts(parts, state).await {
            Ok(Path(value)) => Ok(Self(value)),
            Err(rejection) => Err(path_rejection(&rejection)),
        }
    }
}

/// [`Json`] request body that rejects with an [`ApiError`].
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(json_rejection(&rejection)),
        }
    }
}

fn path_rejection(rejection: &PathRejection) -> ApiError {
    debug!(status = rejection.status().as_u16(), error = %rejection.body_text(), "path rejected");
    ApiError::new(rejection.status(), "Invalid id in request path")
}

fn json_rejection(rejection: &JsonRejection) -> ApiError {
    let detail = rejection.body_text();
    debug!(status = rejection.status().as_u16(), error = %detail, "body rejected");
    ApiError::new(rejection.status(), detail)
}

// =============================================================================
// ERROR MAPPING
// =============================================================================

/// Map a generation failure. `short_balance` is the 403 text for this caller.
pub(crate) fn generation_error(err: GenerationError, short_balance: &'static str) -> ApiError {
    let (status, message) = match &err {
        GenerationError::InvalidInput(msg) => (StatusCode::FORBIDDEN, (*msg).to_owned()),
        GenerationError::InsufficientCredits { .. } => (StatusCode::FORBIDDEN, short_balance.to_owned()),
        GenerationError::ProjectNotFound(_) => (StatusCode::NOT_FOUND, "Project not found".to_owned()),
        GenerationError::LlmNotConfigured => {
            (StatusCode::SERVICE_UNAVAILABLE, "Site generation is not available".to_owned())
        }
        GenerationError::QueueFull => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Too many sites are being generated, please try again shortly".to_owned(),
        ),
        GenerationError::Llm(e) if e.is_quota() => (
            StatusCode::BAD_GATEWAY,
            "The AI provider is over quota, please try again later".to_owned(),
        ),
        GenerationError::Llm(_) => (StatusCode::BAD_GATEWAY, "The AI provider request failed".to_owned()),
        GenerationError::EmptyCode => (StatusCode::BAD_GATEWAY, "Unable to generate code, no changes made".to_owned()),
        GenerationError::Ledger(LedgerError::UserNotFound(_)) => (StatusCode::NOT_FOUND, "User not found".to_owned()),
        GenerationError::Store(_)
        | GenerationError::Ledger(_)
        | GenerationError::Interrupted
        | GenerationError::RefundFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE.to_owned()),
    };
    ApiError::logged(status, message, &err)
}

/// Generation failures only reach here from project creation.
pub(crate) fn project_error(err: ProjectError) -> ApiError {
    match err {
        ProjectError::Generation(e) => generation_error(e, CREATE_SHORT_BALANCE_MESSAGE),
        ProjectError::InvalidInput(msg) => ApiError::logged(StatusCode::BAD_REQUEST, msg, &err),
        ProjectError::NotFound(_) => ApiError::logged(StatusCode::NOT_FOUND, "Project not found", &err),
        ProjectError::VersionNotFound(_) => ApiError::logged(StatusCode::NOT_FOUND, "Version not found", &err),
        ProjectError::Store(_) => ApiError::logged(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE, &err),
    }
}

pub(crate) fn ledger_error(err: LedgerError) -> ApiError {
    match err {
        LedgerError::UserNotFound(_) => ApiError::logged(StatusCode::NOT_FOUND, "User not found", &err),
        LedgerError::InsufficientCredits { .. } => {
            ApiError::logged(StatusCode::FORBIDDEN, "Insufficient credits", &err)
        }
        LedgerError::Store(_) => ApiError::logged(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE, &err),
    }
}

pub(crate) fn payment_error(err: PaymentError) -> ApiError {
    let (status, message) = match &err {
        PaymentError::PlanNotFound(_) => (StatusCode::NOT_FOUND, "Plan not found"),
        PaymentError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, *msg),
        PaymentError::NotConfigured => (StatusCode::SERVICE_UNAVAILABLE, "Payments are not configured"),
        PaymentError::Provider { .. } | PaymentError::Request(_) => {
            (StatusCode::BAD_GATEWAY, "Payment provider request failed")
        }
        PaymentError::MissingSessionUrl => (StatusCode::BAD_GATEWAY, "Stripe session URL not created"),
        PaymentError::InvalidSignature(_) => (StatusCode::BAD_REQUEST, "Webhook signature verification failed"),
        PaymentError::InvalidPayload(_) => (StatusCode::BAD_REQUEST, "Invalid webhook payload"),
        PaymentError::Ledger(LedgerError::UserNotFound(_)) => (StatusCode::NOT_FOUND, "User not found"),
        PaymentError::Store(_) | PaymentError::Ledger(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE)
        }
    };
    ApiError::logged(status, message, &err)
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
