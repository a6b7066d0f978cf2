//! Generation workflow — prompt enhancement, code generation, persistence,
//! refund on failure.
//!
//! DESIGN
//! ======
//! A generation moves through `CreditsReserved → PromptEnhanced →
//! CodeGenerated → Persisted`, or to `Failed` from any step after the
//! reservation. Conversation entries are appended as each step completes, so
//! a failed attempt still leaves its partial history behind.
//!
//! The success path is a single `Store::commit_generation` call: the version,
//! the success entry, the project pointer and the attempt completion land
//! together or not at all. Every failure refunds the reservation before the
//! error is returned; a failed refund is reported alongside the root cause
//! instead of replacing it.
//!
//! SYSTEM CONTEXT
//! ==============
//! Revisions are requested from the HTTP handler via [`revise`], which runs
//! everything after the reservation on a detached task: a client that hangs
//! up does not cancel the work, so the attempt always reaches `completed` or
//! `refunded`. Initial generations are queued by `services::project::create`
//! and executed by the worker pool through [`run_initial`].
//!
//! Attempts still `reserved` when the process starts belong to work that a
//! previous process never finished; [`recover_interrupted`] settles them.

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use super::ledger::{self, LedgerError, Reservation};
use crate::config::GenerationConfig;
use crate::error::ErrorCode;
use crate::llm::{ChatResponse, LlmChat, LlmError, Message};
use crate::store::{GenerationStatus, NewVersion, Role, Store, StoreError, VersionRow};

const ENHANCE_INITIAL_SYSTEM: &str =
    "Enhance this website request with specific design details. Be concise (2-3 sentences max).";
const ENHANCE_REVISION_SYSTEM: &str =
    "Enhance this website change request with specific design details. Be concise (1-2 sentences).";
const ENHANCE_INITIAL_MAX_TOKENS: u32 = 300;
const ENHANCE_REVISION_MAX_TOKENS: u32 = 200;

const CODE_INITIAL_SYSTEM: &str = "Expert web developer. Return ONLY complete HTML with Tailwind CSS. \
Include JS in <script> before </body>. No markdown.
IMPORTANT: For images, use placeholder services like:
- https://picsum.photos/WIDTH/HEIGHT for random photos
- https://placehold.co/WIDTHxHEIGHT for colored placeholders
- https://via.placeholder.com/WIDTHxHEIGHT for simple placeholders
Always include real-looking images - never use broken or missing image sources.";
const CODE_REVISION_SYSTEM: &str = "Expert web developer. Update HTML with Tailwind CSS. Return complete HTML only.";

pub const INITIAL_VERSION_DESCRIPTION: &str = "Initial version";
pub const REVISION_VERSION_DESCRIPTION: &str = "Change made";
pub const INITIAL_SUCCESS_MESSAGE: &str = "Generated initial version of the website request any changes.";
pub const REVISION_SUCCESS_MESSAGE: &str = "Changes made successfully";
pub const INITIAL_EMPTY_CODE_MESSAGE: &str = "Unable to generate the code, please try again";
pub const REVISION_EMPTY_CODE_MESSAGE: &str = "Unable to generate the code";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("project not found: {0}")]
    ProjectNotFound(Uuid),
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },
    #[error("site generation is not configured")]
    LlmNotConfigured,
    #[error("generation queue is full")]
    QueueFull,
    #[error("completion failed: {0}")]
    Llm(#[from] LlmError),
    #[error("model returned no code")]
    EmptyCode,
    #[error("generation was interrupted")]
    Interrupted,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(LedgerError),
    #[error("{cause} (refund also failed: {refund})")]
    RefundFailed { cause: Box<GenerationError>, refund: LedgerError },
}

impl From<LedgerError> for GenerationError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredits { balance, required } => Self::InsufficientCredits { balance, required },
            other => Self::Ledger(other),
        }
    }
}

impl ErrorCode for GenerationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ProjectNotFound(_) => "E_PROJECT_NOT_FOUND",
            Self::InvalidInput(_) => "E_INVALID_INPUT",
            Self::InsufficientCredits { .. } => "E_INSUFFICIENT_CREDITS",
            Self::LlmNotConfigured => "E_LLM_NOT_CONFIGURED",
            Self::QueueFull => "E_GENERATION_QUEUE_FULL",
            Self::Llm(_) => "E_LLM_ERROR",
            Self::EmptyCode => "E_EMPTY_CODE",
            Self::Interrupted => "E_GENERATION_INTERRUPTED",
            Self::Store(e) => e.error_code(),
            Self::Ledger(e) => e.error_code(),
            Self::RefundFailed { .. } => "E_REFUND_FAILED",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Llm(e) => e.retryable(),
            Self::Store(e) => e.retryable(),
            Self::QueueFull | Self::EmptyCode | Self::Interrupted => true,
            _ => false,
        }
    }
}

/// Everything a generation needs, shared by the HTTP path and the worker pool.
#[derive(Clone)]
pub struct GenerationContext {
    pub store: Arc<dyn Store>,
    pub llm: Arc<dyn LlmChat>,
    pub config: GenerationConfig,
}

/// Workflow step reached by an attempt, recorded in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CreditsReserved,
    PromptEnhanced,
    CodeGenerated,
    Persisted,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreditsReserved => "credits_reserved",
            Self::PromptEnhanced => "prompt_enhanced",
            Self::CodeGenerated => "code_generated",
            Self::Persisted => "persisted",
        }
    }
}

/// What is being generated; selects prompts, budgets and messages.
enum Request<'a> {
    Initial { prompt: &'a str },
    Revision { current_code: &'a str, message: &'a str },
}

impl Request<'_> {
    fn enhance_call(&self) -> (u32, &'static str, Message) {
        match self {
            Self::Initial { prompt } => (ENHANCE_INITIAL_MAX_TOKENS, ENHANCE_INITIAL_SYSTEM, Message::user(*prompt)),
            Self::Revision { message, .. } => (
                ENHANCE_REVISION_MAX_TOKENS,
                ENHANCE_REVISION_SYSTEM,
                Message::user(format!("User's request: \"{message}\"")),
            ),
        }
    }

    /// Enhanced text, or the user's own words when the model returned nothing.
    fn enhanced_or_original(&self, enhanced: &str) -> String {
        let enhanced = enhanced.trim();
        if !enhanced.is_empty() {
            return enhanced.to_owned();
        }
        match self {
            Self::Initial { prompt } => (*prompt).to_owned(),
            Self::Revision { message, .. } => (*message).to_owned(),
        }
    }

    fn code_call(&self, enhanced: &str) -> (&'static str, Message) {
        match self {
            Self::Initial { .. } => (CODE_INITIAL_SYSTEM, Message::user(enhanced)),
            Self::Revision { current_code, .. } => (
                CODE_REVISION_SYSTEM,
                Message::user(format!(
                    "Here is the current website code: \"{current_code}\" The user wants this change: \"{enhanced}\""
                )),
            ),
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Self::Initial { .. } => INITIAL_VERSION_DESCRIPTION,
            Self::Revision { .. } => REVISION_VERSION_DESCRIPTION,
        }
    }

    fn success_message(&self) -> &'static str {
        match self {
            Self::Initial { .. } => INITIAL_SUCCESS_MESSAGE,
            Self::Revision { .. } => REVISION_SUCCESS_MESSAGE,
        }
    }

    fn empty_code_message(&self) -> &'static str {
        match self {
            Self::Initial { .. } => INITIAL_EMPTY_CODE_MESSAGE,
            Self::Revision { .. } => REVISION_EMPTY_CODE_MESSAGE,
        }
    }
}

// =============================================================================
// SANITIZING
// =============================================================================

/// Remove Markdown code-fence delimiters anywhere in `raw`, then trim.
///
/// A delimiter is three backticks, an optional alphabetic language tag and
/// at most one newline.
#[must_use]
pub fn strip_code_fences(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(idx) = rest.find("```") {
        out.push_str(&rest[..idx]);
        rest = rest[idx + 3..].trim_start_matches(|c: char| c.is_ascii_alphabetic());
        rest = rest.strip_prefix('\n').unwrap_or(rest);
    }
    out.push_str(rest);
    out.trim().to_owned()
}

#[must_use]
pub fn enhanced_prompt_message(enhanced: &str) -> String {
    format!("I've enhanced your prompt to: \"{enhanced}\"")
}

#[must_use]
pub fn failure_message(err: &GenerationError) -> String {
    format!("Error generating website: {err}")
}

// =============================================================================
// ENTRY POINTS
// =============================================================================

/// Apply a revision to an owned project and wait for the result.
///
/// # Errors
///
/// Validation errors (`InvalidInput`, `ProjectNotFound`, `InsufficientCredits`)
/// are returned before any write. Later errors are returned after the
/// reservation has been refunded.
pub async fn revise(
    ctx: &GenerationContext,
    user_id: Uuid,
    project_id: Uuid,
    message: &str,
) -> Result<VersionRow, GenerationError> {
    if message.trim().is_empty() {
        return Err(GenerationError::InvalidInput("please enter a valid message"));
    }
    let project = ctx
        .store
        .get_owned_project(project_id, user_id)
        .await?
        .ok_or(GenerationError::ProjectNotFound(project_id))?;
    ledger::ensure_balance(ctx.store.as_ref(), user_id, ctx.config.cost).await?;

    ctx.store
        .append_conversation(project_id, Role::User, message)
        .await?;
    let reservation = ledger::reserve(ctx.store.as_ref(), user_id, project_id, ctx.config.cost).await?;

    let current_code = project.current_code.unwrap_or_default();
    let message = message.to_owned();
    let task_ctx = ctx.clone();
    let task = tokio::spawn(async move {
        let request = Request::Revision { current_code: &current_code, message: &message };
        execute(&task_ctx, &reservation, &request).await
    });
    match task.await {
        Ok(result) => result,
        Err(e) => {
            error!(%project_id, attempt_id = %reservation.attempt_id, error = %e, "revision task aborted");
            Err(abandon(ctx.store.as_ref(), &reservation, GenerationError::Interrupted).await)
        }
    }
}

/// Run a queued initial generation for `reservation.project_id`.
///
/// # Errors
///
/// Returns the failure after the reservation has been refunded and the
/// failure recorded in the conversation.
pub async fn run_initial(
    ctx: &GenerationContext,
    reservation: &Reservation,
    prompt: &str,
) -> Result<VersionRow, GenerationError> {
    execute(ctx, reservation, &Request::Initial { prompt }).await
}

/// Refund and fail every attempt left `reserved` by a previous process.
///
/// Must run before the worker pool starts and before requests are served.
/// Returns how many attempts were settled.
///
/// # Errors
///
/// `Ledger` when the outstanding attempts cannot be listed or an orphaned
/// attempt cannot be refunded.
pub async fn recover_interrupted(store: &dyn Store) -> Result<usize, GenerationError> {
    let outstanding = ledger::outstanding_reservations(store).await?;
    for attempt in &outstanding {
        match attempt.project_id {
            Some(project_id) => {
                let reservation = Reservation {
                    attempt_id: attempt.attempt_id,
                    user_id: attempt.user_id,
                    project_id,
                    cost: attempt.cost,
                };
                abandon(store, &reservation, GenerationError::Interrupted).await;
            }
            None => {
                ledger::refund_orphaned(store, attempt).await?;
            }
        }
    }
    if !outstanding.is_empty() {
        warn!(count = outstanding.len(), "settled generations interrupted by a previous shutdown");
    }
    Ok(outstanding.len())
}

async fn execute(
    ctx: &GenerationContext,
    reservation: &Reservation,
    request: &Request<'_>,
) -> Result<VersionRow, GenerationError> {
    log_stage(reservation, Stage::CreditsReserved);
    match steps(ctx, reservation, request).await {
        Ok(version) => {
            log_stage(reservation, Stage::Persisted);
            Ok(version)
        }
        Err(cause) => Err(abandon(ctx.store.as_ref(), reservation, cause).await),
    }
}

async fn steps(
    ctx: &GenerationContext,
    reservation: &Reservation,
    request: &Request<'_>,
) -> Result<VersionRow, GenerationError> {
    let project_id = reservation.project_id;
    ctx.store
        .set_generation_status(project_id, GenerationStatus::Generating)
        .await?;

    let (max_tokens, system, message) = request.enhance_call();
    let response = ctx.llm.chat(max_tokens, system, &[message]).await?;
    log_completion(reservation, Stage::PromptEnhanced, &response);
    let enhanced = request.enhanced_or_original(&response.text);
    ctx.store
        .append_conversation(project_id, Role::Assistant, &enhanced_prompt_message(&enhanced))
        .await?;
    log_stage(reservation, Stage::PromptEnhanced);

    let (system, message) = request.code_call(&enhanced);
    let response = ctx
        .llm
        .chat(ctx.config.code_max_tokens, system, &[message])
        .await?;
    log_completion(reservation, Stage::CodeGenerated, &response);
    let code = strip_code_fences(&response.text);
    if code.is_empty() {
        ctx.store
            .append_conversation(project_id, Role::Assistant, request.empty_code_message())
            .await?;
        return Err(GenerationError::EmptyCode);
    }
    log_stage(reservation, Stage::CodeGenerated);

    let version = ctx
        .store
        .commit_generation(NewVersion {
            attempt_id: reservation.attempt_id,
            project_id,
            code,
            description: request.description().to_owned(),
            message: request.success_message().to_owned(),
        })
        .await?;
    Ok(version)
}

/// Refund, record and flag a failed attempt. Returns the error to surface.
///
/// Also used when a reserved job never reaches a worker.
pub(crate) async fn abandon(store: &dyn Store, reservation: &Reservation, cause: GenerationError) -> GenerationError {
    let project_id = reservation.project_id;
    warn!(
        %project_id,
        attempt_id = %reservation.attempt_id,
        code = cause.error_code(),
        error = %cause,
        "generation failed"
    );

    let refund = ledger::refund(store, reservation).await;

    // Empty output already left its own explanation.
    if !matches!(cause, GenerationError::EmptyCode) {
        if let Err(e) = store
            .append_conversation(project_id, Role::Assistant, &failure_message(&cause))
            .await
        {
            warn!(%project_id, error = %e, "failed to record generation failure");
        }
    }
    if let Err(e) = store
        .set_generation_status(project_id, GenerationStatus::Failed)
        .await
    {
        warn!(%project_id, error = %e, "failed to mark generation failed");
    }

    match refund {
        Ok(_) => cause,
        Err(refund) => {
            error!(
                %project_id,
                attempt_id = %reservation.attempt_id,
                user_id = %reservation.user_id,
                cost = reservation.cost,
                error = %cause,
                refund_error = %refund,
                "generation failed and credits were not refunded"
            );
            GenerationError::RefundFailed { cause: Box::new(cause), refund }
        }
    }
}

/// Token usage per model call; `stage` is the step the call serves.
fn log_completion(reservation: &Reservation, stage: Stage, response: &ChatResponse) {
    info!(
        project_id = %reservation.project_id,
        attempt_id = %reservation.attempt_id,
        stage = stage.as_str(),
        model = %response.model,
        finish_reason = %response.finish_reason,
        input_tokens = response.input_tokens,
        output_tokens = response.output_tokens,
        "completion received"
    );
    if response.finish_reason == "length" {
        warn!(project_id = %reservation.project_id, stage = stage.as_str(), "completion hit the token limit");
    }
}

fn log_stage(reservation: &Reservation, stage: Stage) {
    info!(
        project_id = %reservation.project_id,
        attempt_id = %reservation.attempt_id,
        stage = stage.as_str(),
        "generation progressed"
    );
}

#[cfg(test)]
#[path = "generation_test.rs"]
mod tests;
