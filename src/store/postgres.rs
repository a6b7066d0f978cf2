//! `PostgreSQL` implementation of [`Store`].
//!
//! DESIGN
//! ======
//! Credit mutations are conditional single statements
//! (`credits = credits - $n WHERE credits >= $n`), never read-modify-write,
//! so concurrent generations by the same user cannot lose updates or drive
//! the balance negative. Compound writes run inside one transaction; an early
//! return drops the transaction, which rolls it back.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    ConversationRow, GenerationStatus, NewProject, NewVersion, ProjectRow, PublishedProject, ReservedAttempt, Role,
    SettledPurchase, Store, StoreError, TransactionRow, UserRow, VersionRow,
};

const PROJECT_COLUMNS: &str = "p.id, p.user_id, p.name, p.initial_prompt, p.current_code, \
                               p.current_version_index, p.is_published, p.generation_status, \
                               p.created_at, p.updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// =============================================================================
// ROW DECODING
// =============================================================================

fn user_from_row(row: &PgRow) -> Result<UserRow, StoreError> {
    Ok(UserRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        credits: row.try_get("credits")?,
        total_creation: row.try_get("total_creation")?,
    })
}

fn project_from_row(row: &PgRow) -> Result<ProjectRow, StoreError> {
    let status: String = row.try_get("generation_status")?;
    let generation_status = GenerationStatus::parse(&status)
        .ok_or(StoreError::InvalidValue { column: "generation_status", value: status })?;
    Ok(ProjectRow {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        initial_prompt: row.try_get("initial_prompt")?,
        current_code: row.try_get("current_code")?,
        current_version_index: row.try_get("current_version_index")?,
        is_published: row.try_get("is_published")?,
        generation_status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn version_from_row(row: &PgRow) -> Result<VersionRow, StoreError> {
    Ok(VersionRow {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        code: row.try_get("code")?,
        description: row.try_get("description")?,
        timestamp: row.try_get("created_at")?,
    })
}

fn conversation_from_row(row: &PgRow) -> Result<ConversationRow, StoreError> {
    let raw_role: String = row.try_get("role")?;
    let role = Role::parse(&raw_role).ok_or(StoreError::InvalidValue { column: "role", value: raw_role })?;
    Ok(ConversationRow {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        role,
        content: row.try_get("content")?,
        timestamp: row.try_get("created_at")?,
    })
}

// =============================================================================
// STORE
// =============================================================================

#[async_trait::async_trait]
impl Store for PgStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRow>, StoreError> {
        let row = sqlx::query("SELECT id, name, email, credits, total_creation FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn session_user(&self, token: &str) -> Result<Option<UserRow>, StoreError> {
        let row = sqlx::query(
            r"SELECT u.id, u.name, u.email, u.credits, u.total_creation
              FROM sessions s
              JOIN users u ON u.id = s.user_id
              WHERE s.token = $1 AND s.expires_at > now()",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn increment_total_creation(&self, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET total_creation = total_creation + 1 WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reserve_generation(
        &self,
        attempt_id: Uuid,
        user_id: Uuid,
        project_id: Uuid,
        cost: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let balance: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET credits = credits - $2 WHERE id = $1 AND credits >= $2 RETURNING credits",
        )
        .bind(user_id)
        .bind(cost)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(balance) = balance else {
            return Ok(None);
        };

        sqlx::query("INSERT INTO generation_attempts (id, user_id, project_id, cost) VALUES ($1, $2, $3, $4)")
            .bind(attempt_id)
            .bind(user_id)
            .bind(project_id)
            .bind(cost)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(balance))
    }

    async fn refund_generation(&self, attempt_id: Uuid) -> Result<Option<i64>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let attempt = sqlx::query_as::<_, (Uuid, i64)>(
            "UPDATE generation_attempts SET status = 'refunded', settled_at = now()
             WHERE id = $1 AND status = 'reserved'
             RETURNING user_id, cost",
        )
        .bind(attempt_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((user_id, cost)) = attempt else {
            return Ok(None);
        };

        let balance: i64 = sqlx::query_scalar("UPDATE users SET credits = credits + $2 WHERE id = $1 RETURNING credits")
            .bind(user_id)
            .bind(cost)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(balance))
    }

    async fn list_reserved_attempts(&self) -> Result<Vec<ReservedAttempt>, StoreError> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, Option<Uuid>, i64)>(
            "SELECT id, user_id, project_id, cost FROM generation_attempts
             WHERE status = 'reserved'
             ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(attempt_id, user_id, project_id, cost)| ReservedAttempt { attempt_id, user_id, project_id, cost })
            .collect())
    }

    async fn create_project(&self, project: NewProject) -> Result<ProjectRow, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO projects AS p (id, user_id, name, initial_prompt)
             VALUES ($1, $2, $3, $4)
             RETURNING {PROJECT_COLUMNS}"
        ))
        .bind(project.id)
        .bind(project.user_id)
        .bind(&project.name)
        .bind(&project.initial_prompt)
        .fetch_one(&self.pool)
        .await?;
        project_from_row(&row)
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Option<ProjectRow>, StoreError> {
        let row = sqlx::query(&format!("SELECT {PROJECT_COLUMNS} FROM projects p WHERE p.id = $1"))
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(project_from_row).transpose()
    }

    async fn get_owned_project(&self, project_id: Uuid, user_id: Uuid) -> Result<Option<ProjectRow>, StoreError> {
        let row = sqlx::query(&format!("SELECT {PROJECT_COLUMNS} FROM projects p WHERE p.id = $1 AND p.user_id = $2"))
            .bind(project_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(project_from_row).transpose()
    }

    async fn list_user_projects(&self, user_id: Uuid) -> Result<Vec<ProjectRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects p WHERE p.user_id = $1 ORDER BY p.updated_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(project_from_row).collect()
    }

    async fn list_published_projects(&self) -> Result<Vec<PublishedProject>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS}, u.name AS owner_name
             FROM projects p
             JOIN users u ON u.id = p.user_id
             WHERE p.is_published AND coalesce(p.current_code, '') <> ''
             ORDER BY p.updated_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok(PublishedProject { project: project_from_row(row)?, owner_name: row.try_get("owner_name")? }))
            .collect()
    }

    async fn set_generation_status(&self, project_id: Uuid, status: GenerationStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE projects SET generation_status = $2 WHERE id = $1")
            .bind(project_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn toggle_publish(&self, project_id: Uuid, user_id: Uuid) -> Result<Option<bool>, StoreError> {
        let published: Option<bool> = sqlx::query_scalar(
            "UPDATE projects SET is_published = NOT is_published, updated_at = now()
             WHERE id = $1 AND user_id = $2
             RETURNING is_published",
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(published)
    }

    async fn save_code(&self, project_id: Uuid, user_id: Uuid, code: &str) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE projects SET current_code = $3, updated_at = now() WHERE id = $1 AND user_id = $2")
                .bind(project_id)
                .bind(user_id)
                .bind(code)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_project(&self, project_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1 AND user_id = $2")
            .bind(project_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_version(&self, version_id: Uuid) -> Result<Option<VersionRow>, StoreError> {
        let row = sqlx::query("SELECT id, project_id, code, description, created_at FROM versions WHERE id = $1")
            .bind(version_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(version_from_row).transpose()
    }

    async fn list_versions(&self, project_id: Uuid) -> Result<Vec<VersionRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, project_id, code, description, created_at
             FROM versions WHERE project_id = $1
             ORDER BY created_at ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(version_from_row).collect()
    }

    async fn append_conversation(
        &self,
        project_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<ConversationRow, StoreError> {
        let id = Uuid::new_v4();
        let timestamp: OffsetDateTime = sqlx::query_scalar(
            "INSERT INTO conversation (id, project_id, role, content) VALUES ($1, $2, $3, $4) RETURNING created_at",
        )
        .bind(id)
        .bind(project_id)
        .bind(role.as_str())
        .bind(content)
        .fetch_one(&self.pool)
        .await?;
        Ok(ConversationRow { id, project_id, role, content: content.to_owned(), timestamp })
    }

    async fn list_conversation(&self, project_id: Uuid) -> Result<Vec<ConversationRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, project_id, role, content, created_at
             FROM conversation WHERE project_id = $1
             ORDER BY created_at ASC, seq ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    async fn commit_generation(&self, version: NewVersion) -> Result<VersionRow, StoreError> {
        let mut tx = self.pool.begin().await?;

        let completed = sqlx::query(
            "UPDATE generation_attempts SET status = 'completed', settled_at = now()
             WHERE id = $1 AND status = 'reserved'",
        )
        .bind(version.attempt_id)
        .execute(&mut *tx)
        .await?;
        if completed.rows_affected() == 0 {
            return Err(StoreError::Conflict("generation attempt already settled"));
        }

        let version_id = Uuid::new_v4();
        let timestamp: OffsetDateTime = sqlx::query_scalar(
            "INSERT INTO versions (id, project_id, code, description) VALUES ($1, $2, $3, $4) RETURNING created_at",
        )
        .bind(version_id)
        .bind(version.project_id)
        .bind(&version.code)
        .bind(&version.description)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO conversation (id, project_id, role, content) VALUES ($1, $2, 'assistant', $3)")
            .bind(Uuid::new_v4())
            .bind(version.project_id)
            .bind(&version.message)
            .execute(&mut *tx)
            .await?;

        let updated = sqlx::query(
            "UPDATE projects
             SET current_code = $2, current_version_index = $3, generation_status = 'ready', updated_at = now()
             WHERE id = $1",
        )
        .bind(version.project_id)
        .bind(&version.code)
        .bind(version_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Conflict("project no longer exists"));
        }

        tx.commit().await?;
        Ok(VersionRow {
            id: version_id,
            project_id: version.project_id,
            code: version.code,
            description: version.description,
            timestamp,
        })
    }

    async fn apply_rollback(&self, project_id: Uuid, version: &VersionRow, message: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE projects SET current_code = $2, current_version_index = $3, updated_at = now() WHERE id = $1",
        )
        .bind(project_id)
        .bind(&version.code)
        .bind(version.id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Conflict("project no longer exists"));
        }

        sqlx::query("INSERT INTO conversation (id, project_id, role, content) VALUES ($1, $2, 'assistant', $3)")
            .bind(Uuid::new_v4())
            .bind(project_id)
            .bind(message)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn create_transaction(
        &self,
        user_id: Uuid,
        plan_id: &str,
        amount: i64,
        credits: i64,
    ) -> Result<TransactionRow, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO transactions (id, user_id, plan_id, amount, credits) VALUES ($1, $2, $3, $4, $5)")
            .bind(id)
            .bind(user_id)
            .bind(plan_id)
            .bind(amount)
            .bind(credits)
            .execute(&self.pool)
            .await?;
        Ok(TransactionRow { id, user_id, plan_id: plan_id.to_owned(), amount, credits, is_paid: false })
    }

    async fn settle_transaction(&self, transaction_id: Uuid) -> Result<Option<SettledPurchase>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let purchase = sqlx::query_as::<_, (Uuid, i64)>(
            "UPDATE transactions SET is_paid = true, paid_at = now()
             WHERE id = $1 AND NOT is_paid
             RETURNING user_id, credits",
        )
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((user_id, credits)) = purchase else {
            return Ok(None);
        };

        let balance: i64 = sqlx::query_scalar("UPDATE users SET credits = credits + $2 WHERE id = $1 RETURNING credits")
            .bind(user_id)
            .bind(credits)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(SettledPurchase { user_id, credits, balance }))
    }
}

#[cfg(all(test, feature = "live-db-tests"))]
#[path = "postgres_test.rs"]
mod tests;
