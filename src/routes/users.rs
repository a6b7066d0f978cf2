//! User routes — credits, project creation and listing, publishing, purchases.

use axum::extract::State;
use axum::http::header::ORIGIN;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::{ApiError, ApiJson, ApiPath, ledger_error, payment_error, project_error};
use crate::routes::auth::AuthUser;
use crate::services::{ledger, payment, project};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateProjectBody {
    #[serde(default, alias = "initialPrompt")]
    pub initial_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseBody {
    #[serde(default, rename = "planId")]
    pub plan_id: Option<String>,
}

/// `GET /api/user/credits` — current balance.
pub async fn credits(State(state): State<AppState>, auth: AuthUser) -> Result<Json<Value>, ApiError> {
    let credits = ledger::balance(state.store.as_ref(), auth.user.id)
        .await
        .map_err(ledger_error)?;
    Ok(Json(json!({ "credits": credits })))
}

/// `POST /api/user/project` — create a project and queue its first build.
pub async fn create_project(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(body): ApiJson<CreateProjectBody>,
) -> Result<Json<Value>, ApiError> {
    let prompt = body.initial_prompt.unwrap_or_default();
    let created = project::create(
        state.store.as_ref(),
        state.queue.as_ref(),
        state.config.generation.cost,
        auth.user.id,
        &prompt,
    )
    .await
    .map_err(project_error)?;
    Ok(Json(json!({ "projectId": created.id })))
}

/// `GET /api/user/project/:id` — owned project with conversation and versions.
pub async fn get_project(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(project_id): ApiPath<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let detail = project::get_owned(state.store.as_ref(), auth.user.id, project_id)
        .await
        .map_err(project_error)?;
    Ok(Json(json!({ "project": detail })))
}

/// `GET /api/user/projects` — own projects, most recently updated first.
pub async fn list_projects(State(state): State<AppState>, auth: AuthUser) -> Result<Json<Value>, ApiError> {
    let projects = project::list_mine(state.store.as_ref(), auth.user.id)
        .await
        .map_err(project_error)?;
    Ok(Json(json!({ "projects": projects })))
}

/// `POST /api/user/project-toggle/:id` — flip the publish flag.
pub async fn toggle_publish(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(project_id): ApiPath<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let published = project::toggle_publish(state.store.as_ref(), auth.user.id, project_id)
        .await
        .map_err(project_error)?;
    let message = if published { "project Published" } else { "project Unpublished" };
    Ok(Json(json!({ "message": message })))
}

/// `POST /api/user/purchase-credits` — start a checkout for a credit plan.
pub async fn purchase_credits(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    ApiJson(body): ApiJson<PurchaseBody>,
) -> Result<Json<Value>, ApiError> {
    let Some(plan_id) = body.plan_id.filter(|id| !id.trim().is_empty()) else {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Plan is required"));
    };
    let origin = headers.get(ORIGIN).and_then(|value| value.to_str().ok());

    let url = payment::purchase_credits(
        state.store.as_ref(),
        state.payments.as_deref(),
        auth.user.id,
        &plan_id,
        origin,
    )
    .await
    .map_err(payment_error)?;
    Ok(Json(json!({ "payment_link": url })))
}

#[cfg(test)]
#[path = "users_test.rs"]
mod tests;
