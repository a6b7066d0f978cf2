//! Project lifecycle — create, read, publish, save, rollback, delete.
//!
//! DESIGN
//! ======
//! Ownership is enforced in the datastore queries themselves (`WHERE id = $1
//! AND user_id = $2`), so a foreign project is indistinguishable from a
//! missing one and both surface as `NotFound`.

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::generation::{self, GenerationError};
use super::ledger;
use super::worker::{GenerationJob, GenerationQueue};
use crate::error::ErrorCode;
use crate::store::{
    ConversationRow, GenerationStatus, NewProject, ProjectRow, PublishedProject, Role, Store, StoreError, VersionRow,
};

const NAME_MAX_CHARS: usize = 50;
const NAME_TRUNCATED_CHARS: usize = 47;

pub const ROLLBACK_MESSAGE: &str = "I've rolled back your website to selected version. You can now preview it";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("project not found: {0}")]
    NotFound(Uuid),
    #[error("version not found: {0}")]
    VersionNotFound(Uuid),
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorCode for ProjectError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_PROJECT_NOT_FOUND",
            Self::VersionNotFound(_) => "E_VERSION_NOT_FOUND",
            Self::InvalidInput(_) => "E_INVALID_INPUT",
            Self::Generation(e) => e.error_code(),
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Generation(e) => e.retryable(),
            Self::Store(e) => e.retryable(),
            _ => false,
        }
    }
}

/// Owner's view of a project with its full history.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub project: ProjectRow,
    pub conversation: Vec<ConversationRow>,
    pub versions: Vec<VersionRow>,
}

/// Project plus version list, for the preview page.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectPreview {
    #[serde(flatten)]
    pub project: ProjectRow,
    pub versions: Vec<VersionRow>,
}

/// Project name derived from the prompt: up to 50 characters kept whole,
/// longer prompts cut to 47 plus an ellipsis.
#[must_use]
pub fn display_name(prompt: &str) -> String {
    if prompt.chars().count() <= NAME_MAX_CHARS {
        return prompt.to_owned();
    }
    let mut name: String = prompt.chars().take(NAME_TRUNCATED_CHARS).collect();
    name.push_str("...");
    name
}

// =============================================================================
// CREATE
// =============================================================================

/// Create a project, reserve credits and queue its initial generation.
///
/// Returns as soon as the job is queued; the worker pool does the rest.
///
/// # Errors
///
/// `InvalidInput`, `LlmNotConfigured` or `InsufficientCredits` (as
/// `Generation`) before any write. `QueueFull`
/// after the reservation has been refunded.
pub async fn create(
    store: &dyn Store,
    queue: Option<&GenerationQueue>,
    cost: i64,
    user_id: Uuid,
    initial_prompt: &str,
) -> Result<ProjectRow, ProjectError> {
    if initial_prompt.trim().is_empty() {
        return Err(GenerationError::InvalidInput("please enter a prompt").into());
    }
    let Some(queue) = queue else {
        return Err(GenerationError::LlmNotConfigured.into());
    };
    ledger::ensure_balance(store, user_id, cost)
        .await
        .map_err(GenerationError::from)?;

    let project = store
        .create_project(NewProject {
            id: Uuid::new_v4(),
            user_id,
            name: display_name(initial_prompt),
            initial_prompt: initial_prompt.to_owned(),
        })
        .await?;
    store.increment_total_creation(user_id).await?;
    store
        .append_conversation(project.id, Role::User, initial_prompt)
        .await?;

    let reservation = match ledger::reserve(store, user_id, project.id, cost).await {
        Ok(reservation) => reservation,
        Err(e) => {
            // Lost a race with another debit; nothing was reserved.
            let err = GenerationError::from(e);
            store
                .append_conversation(project.id, Role::Assistant, &generation::failure_message(&err))
                .await?;
            store
                .set_generation_status(project.id, GenerationStatus::Failed)
                .await?;
            return Err(err.into());
        }
    };

    if let Err(job) = queue.submit(GenerationJob { reservation, prompt: initial_prompt.to_owned() }) {
        let err = generation::abandon(store, &job.reservation, GenerationError::QueueFull).await;
        return Err(err.into());
    }

    info!(project_id = %project.id, %user_id, "project created; initial generation queued");
    Ok(project)
}

// =============================================================================
// READS
// =============================================================================

/// # Errors
///
/// `NotFound` unless owned by `user_id`.
pub async fn get_owned(store: &dyn Store, user_id: Uuid, project_id: Uuid) -> Result<ProjectDetail, ProjectError> {
    let project = owned(store, user_id, project_id).await?;
    let conversation = store.list_conversation(project_id).await?;
    let versions = store.list_versions(project_id).await?;
    Ok(ProjectDetail { project, conversation, versions })
}

/// # Errors
///
/// `Store` on datastore failure.
pub async fn list_mine(store: &dyn Store, user_id: Uuid) -> Result<Vec<ProjectRow>, ProjectError> {
    Ok(store.list_user_projects(user_id).await?)
}

/// # Errors
///
/// `NotFound` unless owned by `user_id`.
pub async fn preview(store: &dyn Store, user_id: Uuid, project_id: Uuid) -> Result<ProjectPreview, ProjectError> {
    let project = owned(store, user_id, project_id).await?;
    let versions = store.list_versions(project_id).await?;
    Ok(ProjectPreview { project, versions })
}

/// # Errors
///
/// `Store` on datastore failure.
pub async fn list_published(store: &dyn Store) -> Result<Vec<PublishedProject>, ProjectError> {
    Ok(store.list_published_projects().await?)
}

/// Current code of a published project.
///
/// # Errors
///
/// `NotFound` unless the project is published and has non-empty code.
pub async fn get_published_code(store: &dyn Store, project_id: Uuid) -> Result<String, ProjectError> {
    store
        .get_project(project_id)
        .await?
        .filter(|project| project.is_published)
        .and_then(|project| project.current_code)
        .filter(|code| !code.is_empty())
        .ok_or(ProjectError::NotFound(project_id))
}

async fn owned(store: &dyn Store, user_id: Uuid, project_id: Uuid) -> Result<ProjectRow, ProjectError> {
    store
        .get_owned_project(project_id, user_id)
        .await?
        .ok_or(ProjectError::NotFound(project_id))
}

// =============================================================================
// MUTATIONS
// =============================================================================

/// Flip the publish flag and return the new value.
///
/// # Errors
///
/// `NotFound` unless owned by `user_id`.
pub async fn toggle_publish(store: &dyn Store, user_id: Uuid, project_id: Uuid) -> Result<bool, ProjectError> {
    let published = store
        .toggle_publish(project_id, user_id)
        .await?
        .ok_or(ProjectError::NotFound(project_id))?;
    info!(%project_id, published, "publish flag toggled");
    Ok(published)
}

/// Overwrite the current code with a hand edit. No version is recorded.
///
/// # Errors
///
/// `InvalidInput` for blank code, `NotFound` unless owned by `user_id`.
pub async fn save(store: &dyn Store, user_id: Uuid, project_id: Uuid, code: &str) -> Result<(), ProjectError> {
    if code.trim().is_empty() {
        return Err(ProjectError::InvalidInput("Code is required"));
    }
    if !store.save_code(project_id, user_id, code).await? {
        return Err(ProjectError::NotFound(project_id));
    }
    Ok(())
}

/// Point the project back at one of its own versions.
///
/// # Errors
///
/// `NotFound` unless owned by `user_id`; `VersionNotFound` when the version
/// is missing or belongs to a different project.
pub async fn rollback(
    store: &dyn Store,
    user_id: Uuid,
    project_id: Uuid,
    version_id: Uuid,
) -> Result<(), ProjectError> {
    owned(store, user_id, project_id).await?;
    let version = store
        .get_version(version_id)
        .await?
        .filter(|version| version.project_id == project_id)
        .ok_or(ProjectError::VersionNotFound(version_id))?;

    store
        .apply_rollback(project_id, &version, ROLLBACK_MESSAGE)
        .await?;
    info!(%project_id, %version_id, "project rolled back");
    Ok(())
}

/// Hard delete; versions and conversation go with the project.
///
/// # Errors
///
/// `NotFound` unless owned by `user_id`.
pub async fn delete(store: &dyn Store, user_id: Uuid, project_id: Uuid) -> Result<(), ProjectError> {
    if !store.delete_project(project_id, user_id).await? {
        return Err(ProjectError::NotFound(project_id));
    }
    info!(%project_id, %user_id, "project deleted");
    Ok(())
}

#[cfg(test)]
#[path = "project_test.rs"]
mod tests;
