//! Datastore repository — users, projects, versions, conversation, purchases.
//!
//! ARCHITECTURE
//! ============
//! Services talk to the datastore only through the [`Store`] trait so the
//! generation workflow can be exercised without a live Postgres. Production
//! uses [`postgres::PgStore`]; tests use the in-memory implementation.
//!
//! Every multi-row mutation that must not be observed half-applied (credit
//! reservation, refund, version commit, rollback, purchase settlement) is a
//! single trait method so the implementation can wrap it in one transaction.

pub mod postgres;

#[cfg(test)]
pub(crate) mod memory;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid {column} value in row: {value}")]
    InvalidValue { column: &'static str, value: String },
    #[error("write conflict: {0}")]
    Conflict(&'static str),
}

impl crate::error::ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_DATABASE",
            Self::InvalidValue { .. } => "E_INVALID_ROW",
            Self::Conflict(_) => "E_WRITE_CONFLICT",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)))
    }
}

// =============================================================================
// ENUMS
// =============================================================================

/// Author of a conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Progress of the most recent generation for a project, polled by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    /// Queued, waiting for a worker.
    Pending,
    Generating,
    Ready,
    Failed,
}

impl GenerationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "generating" => Some(Self::Generating),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

// =============================================================================
// ROWS
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct UserRow {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub credits: i64,
    #[serde(rename = "totalCreation")]
    pub total_creation: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectRow {
    pub id: Uuid,
    #[serde(rename = "userId")]
    pub user_id: Uuid,
    pub name: String,
    pub initial_prompt: String,
    pub current_code: Option<String>,
    pub current_version_index: Option<Uuid>,
    #[serde(rename = "isPublished")]
    pub is_published: bool,
    #[serde(rename = "generationStatus")]
    pub generation_status: GenerationStatus,
    #[serde(rename = "createdAt", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(rename = "updatedAt", with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Immutable code snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct VersionRow {
    pub id: Uuid,
    #[serde(rename = "projectId")]
    pub project_id: Uuid,
    pub code: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationRow {
    pub id: Uuid,
    #[serde(rename = "projectId")]
    pub project_id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Credit purchase attempt. `is_paid` flips once, from the payment webhook.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionRow {
    pub id: Uuid,
    #[serde(rename = "userId")]
    pub user_id: Uuid,
    #[serde(rename = "planId")]
    pub plan_id: String,
    pub amount: i64,
    pub credits: i64,
    #[serde(rename = "isPaid")]
    pub is_paid: bool,
}

/// Published project joined with its owner's display name.
#[derive(Debug, Clone, Serialize)]
pub struct PublishedProject {
    #[serde(flatten)]
    pub project: ProjectRow,
    #[serde(rename = "ownerName")]
    pub owner_name: String,
}

#[derive(Debug, Clone)]
pub struct NewProject {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub initial_prompt: String,
}

/// Everything written when a generation succeeds.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub attempt_id: Uuid,
    pub project_id: Uuid,
    pub code: String,
    pub description: String,
    /// Assistant conversation entry recorded alongside the version.
    pub message: String,
}

/// Generation attempt still holding its debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedAttempt {
    pub attempt_id: Uuid,
    pub user_id: Uuid,
    /// `None` once the project has been deleted.
    pub project_id: Option<Uuid>,
    pub cost: i64,
}

/// Result of settling a paid purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettledPurchase {
    pub user_id: Uuid,
    pub credits: i64,
    pub balance: i64,
}

// =============================================================================
// STORE TRAIT
// =============================================================================

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // ----- users & sessions -----

    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRow>, StoreError>;

    /// Resolve an unexpired session token issued by the auth provider.
    async fn session_user(&self, token: &str) -> Result<Option<UserRow>, StoreError>;

    async fn increment_total_creation(&self, user_id: Uuid) -> Result<(), StoreError>;

    // ----- credits -----

    /// Atomically debit `cost` and record a `reserved` generation attempt.
    ///
    /// Returns the new balance, or `None` when the user is unknown or the
    /// balance is below `cost` (nothing is written in that case).
    async fn reserve_generation(
        &self,
        attempt_id: Uuid,
        user_id: Uuid,
        project_id: Uuid,
        cost: i64,
    ) -> Result<Option<i64>, StoreError>;

    /// Move a `reserved` attempt to `refunded` and credit its cost back.
    ///
    /// Returns the new balance, or `None` if the attempt was already settled.
    async fn refund_generation(&self, attempt_id: Uuid) -> Result<Option<i64>, StoreError>;

    /// Attempts still `reserved`, oldest first.
    async fn list_reserved_attempts(&self) -> Result<Vec<ReservedAttempt>, StoreError>;

    // ----- projects -----

    async fn create_project(&self, project: NewProject) -> Result<ProjectRow, StoreError>;

    async fn get_project(&self, project_id: Uuid) -> Result<Option<ProjectRow>, StoreError>;

    async fn get_owned_project(&self, project_id: Uuid, user_id: Uuid) -> Result<Option<ProjectRow>, StoreError>;

    /// Projects owned by `user_id`, most recently updated first.
    async fn list_user_projects(&self, user_id: Uuid) -> Result<Vec<ProjectRow>, StoreError>;

    async fn list_published_projects(&self) -> Result<Vec<PublishedProject>, StoreError>;

    async fn set_generation_status(&self, project_id: Uuid, status: GenerationStatus) -> Result<(), StoreError>;

    /// Flip `is_published`, returning the new value (`None` if not owned).
    async fn toggle_publish(&self, project_id: Uuid, user_id: Uuid) -> Result<Option<bool>, StoreError>;

    /// Overwrite `current_code` without creating a version. `false` if not owned.
    async fn save_code(&self, project_id: Uuid, user_id: Uuid, code: &str) -> Result<bool, StoreError>;

    /// Hard delete. Versions and conversation go with it. `false` if not owned.
    async fn delete_project(&self, project_id: Uuid, user_id: Uuid) -> Result<bool, StoreError>;

    // ----- versions & conversation -----

    async fn get_version(&self, version_id: Uuid) -> Result<Option<VersionRow>, StoreError>;

    /// Versions of a project, oldest first.
    async fn list_versions(&self, project_id: Uuid) -> Result<Vec<VersionRow>, StoreError>;

    async fn append_conversation(
        &self,
        project_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<ConversationRow, StoreError>;

    /// Conversation of a project in the order entries were appended.
    async fn list_conversation(&self, project_id: Uuid) -> Result<Vec<ConversationRow>, StoreError>;

    /// Insert the version, append the success entry, repoint the project and
    /// complete the attempt, all or nothing.
    async fn commit_generation(&self, version: NewVersion) -> Result<VersionRow, StoreError>;

    /// Point the project at an existing version and append `message`, all or nothing.
    async fn apply_rollback(&self, project_id: Uuid, version: &VersionRow, message: &str) -> Result<(), StoreError>;

    // ----- purchases -----

    async fn create_transaction(
        &self,
        user_id: Uuid,
        plan_id: &str,
        amount: i64,
        credits: i64,
    ) -> Result<TransactionRow, StoreError>;

    /// Mark an unpaid transaction paid and credit its user, all or nothing.
    ///
    /// Returns `None` if the transaction is unknown or already paid.
    async fn settle_transaction(&self, transaction_id: Uuid) -> Result<Option<SettledPurchase>, StoreError>;
}
