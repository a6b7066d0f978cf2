//! In-memory [`Store`] for unit tests.
//!
//! Mirrors the `PostgreSQL` semantics that the services rely on: conditional
//! credit debits, single-use attempt settlement, ownership filters and
//! cascading deletes. Failure switches let tests force the error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    ConversationRow, GenerationStatus, NewProject, NewVersion, ProjectRow, PublishedProject, ReservedAttempt, Role,
    SettledPurchase, Store, StoreError, TransactionRow, UserRow, VersionRow,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptStatus {
    Reserved,
    Completed,
    Refunded,
}

struct Attempt {
    user_id: Uuid,
    project_id: Option<Uuid>,
    cost: i64,
    status: AttemptStatus,
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, UserRow>,
    sessions: HashMap<String, Uuid>,
    projects: HashMap<Uuid, ProjectRow>,
    versions: Vec<VersionRow>,
    conversation: Vec<ConversationRow>,
    transactions: HashMap<Uuid, TransactionRow>,
    attempts: HashMap<Uuid, Attempt>,
    /// Attempt ids in reservation order.
    attempt_order: Vec<Uuid>,
    last_tick: Option<OffsetDateTime>,
}

impl Inner {
    /// Strictly increasing timestamps so ordering by time is deterministic.
    fn tick(&mut self) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        let next = match self.last_tick {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_tick = Some(next);
        next
    }

    fn push_entry(&mut self, project_id: Uuid, role: Role, content: &str) -> ConversationRow {
        let entry = ConversationRow {
            id: Uuid::new_v4(),
            project_id,
            role,
            content: content.to_owned(),
            timestamp: self.tick(),
        };
        self.conversation.push(entry.clone());
        entry
    }
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    inner: Mutex<Inner>,
    fail_refunds: AtomicBool,
    fail_commits: AtomicBool,
}

fn injected_failure() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn seed_user(&self, name: &str, credits: i64) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().await.users.insert(
            id,
            UserRow { id, name: name.to_owned(), email: Some(format!("{id}@example.test")), credits, total_creation: 0 },
        );
        id
    }

    pub(crate) async fn seed_session(&self, user_id: Uuid) -> String {
        let token = format!("session-{}", Uuid::new_v4());
        self.inner.lock().await.sessions.insert(token.clone(), user_id);
        token
    }

    pub(crate) async fn credits(&self, user_id: Uuid) -> i64 {
        self.inner.lock().await.users.get(&user_id).map_or(0, |user| user.credits)
    }

    pub(crate) async fn attempt_status(&self, attempt_id: Uuid) -> Option<AttemptStatus> {
        self.inner.lock().await.attempts.get(&attempt_id).map(|attempt| attempt.status)
    }

    pub(crate) async fn attempts_for(&self, user_id: Uuid) -> Vec<AttemptStatus> {
        self.inner
            .lock()
            .await
            .attempts
            .values()
            .filter(|attempt| attempt.user_id == user_id)
            .map(|attempt| attempt.status)
            .collect()
    }

    pub(crate) fn fail_refunds(&self, fail: bool) {
        self.fail_refunds.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRow>, StoreError> {
        Ok(self.inner.lock().await.users.get(&user_id).cloned())
    }

    async fn session_user(&self, token: &str) -> Result<Option<UserRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.sessions.get(token).and_then(|user_id| inner.users.get(user_id)).cloned())
    }

    async fn increment_total_creation(&self, user_id: Uuid) -> Result<(), StoreError> {
        if let Some(user) = self.inner.lock().await.users.get_mut(&user_id) {
            user.total_creation += 1;
        }
        Ok(())
    }

    async fn reserve_generation(
        &self,
        attempt_id: Uuid,
        user_id: Uuid,
        project_id: Uuid,
        cost: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(user) = inner.users.get_mut(&user_id) else {
            return Ok(None);
        };
        if user.credits < cost {
            return Ok(None);
        }
        user.credits -= cost;
        let balance = user.credits;
        inner
            .attempts
            .insert(attempt_id, Attempt { user_id, project_id: Some(project_id), cost, status: AttemptStatus::Reserved });
        inner.attempt_order.push(attempt_id);
        Ok(Some(balance))
    }

    async fn refund_generation(&self, attempt_id: Uuid) -> Result<Option<i64>, StoreError> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }
        let mut inner = self.inner.lock().await;
        let Some(attempt) = inner.attempts.get_mut(&attempt_id) else {
            return Ok(None);
        };
        if attempt.status != AttemptStatus::Reserved {
            return Ok(None);
        }
        attempt.status = AttemptStatus::Refunded;
        let (user_id, cost) = (attempt.user_id, attempt.cost);
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or(StoreError::Conflict("attempt owner no longer exists"))?;
        user.credits += cost;
        Ok(Some(user.credits))
    }

    async fn list_reserved_attempts(&self) -> Result<Vec<ReservedAttempt>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .attempt_order
            .iter()
            .filter_map(|id| inner.attempts.get(id).map(|attempt| (id, attempt)))
            .filter(|(_, attempt)| attempt.status == AttemptStatus::Reserved)
            .map(|(id, attempt)| ReservedAttempt {
                attempt_id: *id,
                user_id: attempt.user_id,
                project_id: attempt.project_id,
                cost: attempt.cost,
            })
            .collect())
    }

    async fn create_project(&self, project: NewProject) -> Result<ProjectRow, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let row = ProjectRow {
            id: project.id,
            user_id: project.user_id,
            name: project.name,
            initial_prompt: project.initial_prompt,
            current_code: None,
            current_version_index: None,
            is_published: false,
            generation_status: GenerationStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        inner.projects.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Option<ProjectRow>, StoreError> {
        Ok(self.inner.lock().await.projects.get(&project_id).cloned())
    }

    async fn get_owned_project(&self, project_id: Uuid, user_id: Uuid) -> Result<Option<ProjectRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.projects.get(&project_id).filter(|p| p.user_id == user_id).cloned())
    }

    async fn list_user_projects(&self, user_id: Uuid) -> Result<Vec<ProjectRow>, StoreError> {
        let inner = self.inner.lock().await;
        let mut projects: Vec<ProjectRow> = inner.projects.values().filter(|p| p.user_id == user_id).cloned().collect();
        projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(projects)
    }

    async fn list_published_projects(&self) -> Result<Vec<PublishedProject>, StoreError> {
        let inner = self.inner.lock().await;
        let mut published: Vec<PublishedProject> = inner
            .projects
            .values()
            .filter(|p| p.is_published && p.current_code.as_deref().is_some_and(|code| !code.is_empty()))
            .map(|p| PublishedProject {
                project: p.clone(),
                owner_name: inner.users.get(&p.user_id).map(|u| u.name.clone()).unwrap_or_default(),
            })
            .collect();
        published.sort_by(|a, b| b.project.updated_at.cmp(&a.project.updated_at));
        Ok(published)
    }

    async fn set_generation_status(&self, project_id: Uuid, status: GenerationStatus) -> Result<(), StoreError> {
        if let Some(project) = self.inner.lock().await.projects.get_mut(&project_id) {
            project.generation_status = status;
        }
        Ok(())
    }

    async fn toggle_publish(&self, project_id: Uuid, user_id: Uuid) -> Result<Option<bool>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let Some(project) = inner.projects.get_mut(&project_id).filter(|p| p.user_id == user_id) else {
            return Ok(None);
        };
        project.is_published = !project.is_published;
        project.updated_at = now;
        Ok(Some(project.is_published))
    }

    async fn save_code(&self, project_id: Uuid, user_id: Uuid, code: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let Some(project) = inner.projects.get_mut(&project_id).filter(|p| p.user_id == user_id) else {
            return Ok(false);
        };
        project.current_code = Some(code.to_owned());
        project.updated_at = now;
        Ok(true)
    }

    async fn delete_project(&self, project_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.projects.get(&project_id).is_some_and(|p| p.user_id == user_id) {
            return Ok(false);
        }
        inner.projects.remove(&project_id);
        inner.versions.retain(|v| v.project_id != project_id);
        inner.conversation.retain(|c| c.project_id != project_id);
        for attempt in inner.attempts.values_mut().filter(|a| a.project_id == Some(project_id)) {
            attempt.project_id = None;
        }
        Ok(true)
    }

    async fn get_version(&self, version_id: Uuid) -> Result<Option<VersionRow>, StoreError> {
        Ok(self.inner.lock().await.versions.iter().find(|v| v.id == version_id).cloned())
    }

    async fn list_versions(&self, project_id: Uuid) -> Result<Vec<VersionRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.versions.iter().filter(|v| v.project_id == project_id).cloned().collect())
    }

    async fn append_conversation(
        &self,
        project_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<ConversationRow, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.projects.contains_key(&project_id) {
            return Err(StoreError::Conflict("project no longer exists"));
        }
        Ok(inner.push_entry(project_id, role, content))
    }

    async fn list_conversation(&self, project_id: Uuid) -> Result<Vec<ConversationRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.conversation.iter().filter(|c| c.project_id == project_id).cloned().collect())
    }

    async fn commit_generation(&self, version: NewVersion) -> Result<VersionRow, StoreError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }
        let mut inner = self.inner.lock().await;
        let reserved = inner
            .attempts
            .get(&version.attempt_id)
            .is_some_and(|attempt| attempt.status == AttemptStatus::Reserved);
        if !reserved {
            return Err(StoreError::Conflict("generation attempt already settled"));
        }
        if !inner.projects.contains_key(&version.project_id) {
            return Err(StoreError::Conflict("project no longer exists"));
        }

        let timestamp = inner.tick();
        let row = VersionRow {
            id: Uuid::new_v4(),
            project_id: version.project_id,
            code: version.code,
            description: version.description,
            timestamp,
        };
        inner.versions.push(row.clone());
        inner.push_entry(version.project_id, Role::Assistant, &version.message);
        if let Some(project) = inner.projects.get_mut(&version.project_id) {
            project.current_code = Some(row.code.clone());
            project.current_version_index = Some(row.id);
            project.generation_status = GenerationStatus::Ready;
            project.updated_at = timestamp;
        }
        if let Some(attempt) = inner.attempts.get_mut(&version.attempt_id) {
            attempt.status = AttemptStatus::Completed;
        }
        Ok(row)
    }

    async fn apply_rollback(&self, project_id: Uuid, version: &VersionRow, message: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let Some(project) = inner.projects.get_mut(&project_id) else {
            return Err(StoreError::Conflict("project no longer exists"));
        };
        project.current_code = Some(version.code.clone());
        project.current_version_index = Some(version.id);
        project.updated_at = now;
        inner.push_entry(project_id, Role::Assistant, message);
        Ok(())
    }

    async fn create_transaction(
        &self,
        user_id: Uuid,
        plan_id: &str,
        amount: i64,
        credits: i64,
    ) -> Result<TransactionRow, StoreError> {
        let row = TransactionRow { id: Uuid::new_v4(), user_id, plan_id: plan_id.to_owned(), amount, credits, is_paid: false };
        self.inner.lock().await.transactions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn settle_transaction(&self, transaction_id: Uuid) -> Result<Option<SettledPurchase>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(transaction) = inner.transactions.get_mut(&transaction_id).filter(|t| !t.is_paid) else {
            return Ok(None);
        };
        transaction.is_paid = true;
        let (user_id, credits) = (transaction.user_id, transaction.credits);
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or(StoreError::Conflict("purchaser no longer exists"))?;
        user.credits += credits;
        Ok(Some(SettledPurchase { user_id, credits, balance: user.credits }))
    }
}
