use super::*;
use crate::store::NewProject;
use crate::store::memory::{AttemptStatus, MemoryStore};

async fn seed_project(store: &MemoryStore, user_id: Uuid) -> Uuid {
    let id = Uuid::new_v4();
    store
        .create_project(NewProject { id, user_id, name: "p".into(), initial_prompt: "p".into() })
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn balance_of_unknown_user_is_not_found() {
    let store = MemoryStore::new();
    let missing = Uuid::new_v4();
    assert!(matches!(balance(&store, missing).await, Err(LedgerError::UserNotFound(id)) if id == missing));
}

#[tokio::test]
async fn ensure_balance_rejects_short_balance() {
    let store = MemoryStore::new();
    let user = store.seed_user("Pat", 4).await;
    let err = ensure_balance(&store, user, 5).await.unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientCredits { balance: 4, required: 5 }));
    assert_eq!(err.error_code(), "E_INSUFFICIENT_CREDITS");
}

#[tokio::test]
async fn reserve_debits_and_records_attempt() {
    let store = MemoryStore::new();
    let user = store.seed_user("Pat", 100).await;
    let project = seed_project(&store, user).await;

    let reservation = reserve(&store, user, project, 5).await.unwrap();
    assert_eq!(store.credits(user).await, 95);
    assert_eq!(store.attempt_status(reservation.attempt_id).await, Some(AttemptStatus::Reserved));
}

#[tokio::test]
async fn reserve_with_short_balance_writes_nothing() {
    let store = MemoryStore::new();
    let user = store.seed_user("Pat", 3).await;
    let project = seed_project(&store, user).await;

    let err = reserve(&store, user, project, 5).await.unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientCredits { balance: 3, required: 5 }));
    assert_eq!(store.credits(user).await, 3);
    assert!(store.attempts_for(user).await.is_empty());
}

#[tokio::test]
async fn refund_restores_exactly_once() {
    let store = MemoryStore::new();
    let user = store.seed_user("Pat", 10).await;
    let project = seed_project(&store, user).await;
    let reservation = reserve(&store, user, project, 5).await.unwrap();

    assert!(refund(&store, &reservation).await.unwrap());
    assert!(!refund(&store, &reservation).await.unwrap());
    assert_eq!(store.credits(user).await, 10);
    assert_eq!(store.attempt_status(reservation.attempt_id).await, Some(AttemptStatus::Refunded));
}

#[tokio::test]
async fn refund_failure_leaves_attempt_reserved() {
    let store = MemoryStore::new();
    let user = store.seed_user("Pat", 10).await;
    let project = seed_project(&store, user).await;
    let reservation = reserve(&store, user, project, 5).await.unwrap();

    store.fail_refunds(true);
    let err = refund(&store, &reservation).await.unwrap_err();
    assert!(matches!(err, LedgerError::Store(_)));
    assert!(err.retryable());
    assert_eq!(store.attempt_status(reservation.attempt_id).await, Some(AttemptStatus::Reserved));

    store.fail_refunds(false);
    assert!(refund(&store, &reservation).await.unwrap());
    assert_eq!(store.credits(user).await, 10);
}

#[tokio::test]
async fn credit_purchase_is_idempotent() {
    let store = MemoryStore::new();
    let user = store.seed_user("Pat", 0).await;
    let transaction = store.create_transaction(user, "pro", 19, 400).await.unwrap();

    let first = credit_purchase(&store, transaction.id).await.unwrap();
    assert_eq!(first.map(|p| p.balance), Some(400));
    assert!(credit_purchase(&store, transaction.id).await.unwrap().is_none());
    assert_eq!(store.credits(user).await, 400);
}

#[tokio::test]
async fn outstanding_reservations_lists_only_unsettled_attempts() {
    let store = MemoryStore::new();
    let user = store.seed_user("Pat", 100).await;
    let project = seed_project(&store, user).await;
    let settled = reserve(&store, user, project, 5).await.unwrap();
    let open = reserve(&store, user, project, 5).await.unwrap();
    refund(&store, &settled).await.unwrap();

    let outstanding = outstanding_reservations(&store).await.unwrap();
    assert_eq!(outstanding.len(), 1);
    assert_eq!(outstanding[0].attempt_id, open.attempt_id);
    assert_eq!(outstanding[0].project_id, Some(project));
}

#[tokio::test]
async fn orphaned_attempt_is_refunded_after_project_delete() {
    let store = MemoryStore::new();
    let user = store.seed_user("Pat", 20).await;
    let project = seed_project(&store, user).await;
    reserve(&store, user, project, 5).await.unwrap();
    store.delete_project(project, user).await.unwrap();

    let outstanding = outstanding_reservations(&store).await.unwrap();
    assert_eq!(outstanding[0].project_id, None);
    assert!(refund_orphaned(&store, &outstanding[0]).await.unwrap());
    assert!(!refund_orphaned(&store, &outstanding[0]).await.unwrap());
    assert_eq!(store.credits(user).await, 20);
}
