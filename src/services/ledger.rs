//! Credit ledger — balance checks, generation reservations, refunds, top-ups.
//!
//! DESIGN
//! ======
//! Every mutation is delegated to a single conditional datastore write, so
//! the balance is never read, modified in memory and written back. A
//! generation debit is a [`Reservation`] keyed by a fresh attempt id; the
//! compensating refund transitions that attempt exactly once, so calling
//! [`refund`] again (a retry, a duplicate failure path) cannot mint credits.

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::store::{ReservedAttempt, SettledPurchase, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },
    #[error("user not found: {0}")]
    UserNotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorCode for LedgerError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InsufficientCredits { .. } => "E_INSUFFICIENT_CREDITS",
            Self::UserNotFound(_) => "E_USER_NOT_FOUND",
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.retryable())
    }
}

/// Credits held against one generation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub attempt_id: Uuid,
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub cost: i64,
}

/// Current balance.
///
/// # Errors
///
/// `UserNotFound` for an unknown user, `Store` on datastore failure.
pub async fn balance(store: &dyn Store, user_id: Uuid) -> Result<i64, LedgerError> {
    store
        .get_user(user_id)
        .await?
        .map(|user| user.credits)
        .ok_or(LedgerError::UserNotFound(user_id))
}

/// Fail fast with `InsufficientCredits` before any write when the balance is short.
///
/// Advisory only: [`reserve`] re-checks atomically.
///
/// # Errors
///
/// `InsufficientCredits`, `UserNotFound`, or `Store`.
pub async fn ensure_balance(store: &dyn Store, user_id: Uuid, required: i64) -> Result<i64, LedgerError> {
    let balance = balance(store, user_id).await?;
    if balance < required {
        return Err(LedgerError::InsufficientCredits { balance, required });
    }
    Ok(balance)
}

/// Debit `cost` for a new generation attempt.
///
/// # Errors
///
/// `InsufficientCredits` when the conditional debit matched no row,
/// `UserNotFound`, or `Store`.
pub async fn reserve(store: &dyn Store, user_id: Uuid, project_id: Uuid, cost: i64) -> Result<Reservation, LedgerError> {
    let attempt_id = Uuid::new_v4();
    match store.reserve_generation(attempt_id, user_id, project_id, cost).await? {
        Some(balance) => {
            info!(%user_id, %project_id, %attempt_id, cost, balance, "credits reserved");
            Ok(Reservation { attempt_id, user_id, project_id, cost })
        }
        None => {
            let balance = balance(store, user_id).await?;
            Err(LedgerError::InsufficientCredits { balance, required: cost })
        }
    }
}

/// Return a reservation's credits. `Ok(false)` if it was already settled.
///
/// # Errors
///
/// `Store` when the refund could not be written; the attempt stays reserved.
pub async fn refund(store: &dyn Store, reservation: &Reservation) -> Result<bool, LedgerError> {
    refund_attempt(store, reservation.attempt_id, reservation.user_id, reservation.cost).await
}

/// Refund an attempt whose project no longer exists.
///
/// # Errors
///
/// `Store` when the refund could not be written.
pub async fn refund_orphaned(store: &dyn Store, attempt: &ReservedAttempt) -> Result<bool, LedgerError> {
    refund_attempt(store, attempt.attempt_id, attempt.user_id, attempt.cost).await
}

/// Attempts still holding credits, oldest first.
///
/// # Errors
///
/// `Store` on datastore failure.
pub async fn outstanding_reservations(store: &dyn Store) -> Result<Vec<ReservedAttempt>, LedgerError> {
    Ok(store.list_reserved_attempts().await?)
}

async fn refund_attempt(store: &dyn Store, attempt_id: Uuid, user_id: Uuid, cost: i64) -> Result<bool, LedgerError> {
    match store.refund_generation(attempt_id).await {
        Ok(Some(balance)) => {
            info!(%user_id, %attempt_id, cost, balance, "credits refunded");
            Ok(true)
        }
        Ok(None) => {
            warn!(%attempt_id, "refund skipped; attempt already settled");
            Ok(false)
        }
        Err(e) => {
            error!(%attempt_id, %user_id, error = %e, "refund failed");
            Err(e.into())
        }
    }
}

/// Credit a paid purchase. `Ok(None)` if unknown or already credited.
///
/// # Errors
///
/// `Store` on datastore failure.
pub async fn credit_purchase(store: &dyn Store, transaction_id: Uuid) -> Result<Option<SettledPurchase>, LedgerError> {
    let settled = store.settle_transaction(transaction_id).await?;
    if let Some(purchase) = settled {
        info!(
            %transaction_id,
            user_id = %purchase.user_id,
            credits = purchase.credits,
            balance = purchase.balance,
            "purchase credited"
        );
    }
    Ok(settled)
}

#[cfg(test)]
#[path = "ledger_test.rs"]
mod tests;
