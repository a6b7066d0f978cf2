//! Project routes — revisions, edits, rollback, deletion, previews and the
//! public gallery.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::{ApiError, ApiJson, ApiPath, REVISION_SHORT_BALANCE_MESSAGE, generation_error, project_error};
use crate::routes::auth::AuthUser;
use crate::services::generation::{self, GenerationError};
use crate::services::project;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RevisionBody {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SaveBody {
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RollbackBody {
    #[serde(default, rename = "versionId")]
    pub version_id: Option<Uuid>,
}

/// `POST /api/project/revision/:id` — apply a change request and wait for it.
pub async fn revise(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(project_id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<RevisionBody>,
) -> Result<Json<Value>, ApiError> {
    let Some(ctx) = state.generation.as_ref() else {
        return Err(generation_error(GenerationError::LlmNotConfigured, REVISION_SHORT_BALANCE_MESSAGE));
    };
    let message = body.message.unwrap_or_default();
    generation::revise(ctx, auth.user.id, project_id, &message)
        .await
        .map_err(|e| generation_error(e, REVISION_SHORT_BALANCE_MESSAGE))?;
    Ok(Json(json!({ "message": generation::REVISION_SUCCESS_MESSAGE })))
}

/// `PUT /api/project/save/:id` — overwrite the current code with a hand edit.
pub async fn save(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(project_id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<SaveBody>,
) -> Result<Json<Value>, ApiError> {
    let code = body.code.unwrap_or_default();
    project::save(state.store.as_ref(), auth.user.id, project_id, &code)
        .await
        .map_err(project_error)?;
    Ok(Json(json!({ "message": "Project saved successfully" })))
}

/// `POST /api/project/rollback/:id` — point the project back at a version.
pub async fn rollback(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(project_id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<RollbackBody>,
) -> Result<Json<Value>, ApiError> {
    let Some(version_id) = body.version_id else {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "versionId is required"));
    };
    project::rollback(state.store.as_ref(), auth.user.id, project_id, version_id)
        .await
        .map_err(project_error)?;
    Ok(Json(json!({ "message": "Version rollback successful" })))
}

/// `DELETE /api/project/:id` — remove a project and its history.
pub async fn delete(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(project_id): ApiPath<Uuid>,
) -> Result<Json<Value>, ApiError> {
    project::delete(state.store.as_ref(), auth.user.id, project_id)
        .await
        .map_err(project_error)?;
    Ok(Json(json!({ "message": "Project deleted successfully" })))
}

/// `GET /api/project/preview/:id` — code, metadata and versions for the owner.
pub async fn preview(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(project_id): ApiPath<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let preview = project::preview(state.store.as_ref(), auth.user.id, project_id)
        .await
        .map_err(project_error)?;
    Ok(Json(json!({ "project": preview })))
}

/// `GET /api/project/published` — public gallery.
pub async fn list_published(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let projects = project::list_published(state.store.as_ref())
        .await
        .map_err(project_error)?;
    Ok(Json(json!({ "projects": projects })))
}

/// `GET /api/project/published/:id` — raw code of a published project.
pub async fn published_code(
    State(state): State<AppState>,
    ApiPath(project_id): ApiPath<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let code = project::get_published_code(state.store.as_ref(), project_id)
        .await
        .map_err(project_error)?;
    Ok(Json(json!({ "code": code })))
}

#[cfg(test)]
#[path = "projects_test.rs"]
mod tests;
