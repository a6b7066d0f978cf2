use std::sync::Arc;

use axum::body::to_bytes;
use uuid::Uuid;

use super::*;
use crate::llm::LlmError;
use crate::store::StoreError;

const SHORT: &str = REVISION_SHORT_BALANCE_MESSAGE;

#[tokio::test]
async fn api_error_renders_message_only() {
    let response = ApiError::new(StatusCode::NOT_FOUND, "Project not found").into_response();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = to_bytes(response.into_body(), 1024).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json, serde_json::json!({ "message": "Project not found" }));
}

#[test]
fn generation_errors_map_to_statuses() {
    let cases = [
        (GenerationError::InvalidInput("please enter a valid message"), StatusCode::FORBIDDEN),
        (GenerationError::InsufficientCredits { balance: 1, required: 5 }, StatusCode::FORBIDDEN),
        (GenerationError::ProjectNotFound(Uuid::nil()), StatusCode::NOT_FOUND),
        (GenerationError::LlmNotConfigured, StatusCode::SERVICE_UNAVAILABLE),
        (GenerationError::QueueFull, StatusCode::SERVICE_UNAVAILABLE),
        (GenerationError::Llm(LlmError::Timeout), StatusCode::BAD_GATEWAY),
        (GenerationError::EmptyCode, StatusCode::BAD_GATEWAY),
        (GenerationError::Store(StoreError::Conflict("x")), StatusCode::INTERNAL_SERVER_ERROR),
    ];
    for (err, status) in cases {
        let label = err.to_string();
        assert_eq!(generation_error(err, SHORT).status, status, "{label}");
    }
}

#[test]
fn short_balance_message_is_caller_specific() {
    let err = GenerationError::InsufficientCredits { balance: 0, required: 5 };
    assert_eq!(generation_error(err, "add credits to create new project").message, "add credits to create new project");
}

#[test]
fn internal_errors_hide_details() {
    let err = GenerationError::Store(StoreError::Conflict("generation attempt already settled"));
    assert_eq!(generation_error(err, SHORT).message, INTERNAL_ERROR_MESSAGE);
}

#[test]
fn refund_failure_is_internal() {
    let err = GenerationError::RefundFailed {
        cause: Box::new(GenerationError::EmptyCode),
        refund: LedgerError::Store(StoreError::Conflict("x")),
    };
    assert_eq!(generation_error(err, SHORT).status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[test]
fn project_errors_map_to_statuses() {
    assert_eq!(project_error(ProjectError::InvalidInput("Code is required")).status, StatusCode::BAD_REQUEST);
    assert_eq!(project_error(ProjectError::NotFound(Uuid::nil())).status, StatusCode::NOT_FOUND);
    let version = project_error(ProjectError::VersionNotFound(Uuid::nil()));
    assert_eq!((version.status, version.message.as_str()), (StatusCode::NOT_FOUND, "Version not found"));
    let queue = project_error(ProjectError::Generation(GenerationError::QueueFull));
    assert_eq!(queue.status, StatusCode::SERVICE_UNAVAILABLE);
    let blank = project_error(ProjectError::Generation(GenerationError::InvalidInput("please enter a prompt")));
    assert_eq!(blank.status, StatusCode::FORBIDDEN);
}

#[test]
fn interrupted_generation_is_internal() {
    let err = generation_error(GenerationError::Interrupted, SHORT);
    assert_eq!((err.status, err.message.as_str()), (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE));
}

#[test]
fn payment_errors_map_to_statuses() {
    assert_eq!(payment_error(PaymentError::PlanNotFound("x".into())).status, StatusCode::NOT_FOUND);
    assert_eq!(payment_error(PaymentError::NotConfigured).status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(payment_error(PaymentError::InvalidSignature("bad")).status, StatusCode::BAD_REQUEST);
    assert_eq!(payment_error(PaymentError::MissingSessionUrl).status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        payment_error(PaymentError::Provider { status: 500, body: String::new() }).status,
        StatusCode::BAD_GATEWAY
    );
}

#[test]
fn ledger_user_not_found_is_404() {
    let err = ledger_error(LedgerError::UserNotFound(Uuid::nil()));
    assert_eq!((err.status, err.message.as_str()), (StatusCode::NOT_FOUND, "User not found"));
}

#[tokio::test]
async fn router_builds_with_malformed_origin() {
    let mut config = crate::state::test_helpers::test_config();
    config.trusted_origins.push("bad\norigin".into());
    let store = Arc::new(crate::store::memory::MemoryStore::new());
    let _router = app(AppState::new(store, config));
}

// =============================================================================
// EXTRACTOR REJECTIONS
// =============================================================================

/// Serve `state` on an ephemeral port and return its base URL.
async fn serve(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app(state)).await.unwrap() });
    format!("http://{addr}")
}

async fn message_only(response: reqwest::Response) -> String {
    let body: serde_json::Value = response.json().await.unwrap();
    let object = body.as_object().unwrap();
    assert_eq!(object.len(), 1, "unexpected fields in {body}");
    object["message"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn malformed_project_id_is_a_json_bad_request() {
    let store = Arc::new(crate::store::memory::MemoryStore::new());
    let base = serve(crate::state::test_helpers::test_app_state(store)).await;

    let response = reqwest::get(format!("{base}/api/project/published/not-a-uuid")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(message_only(response).await, "Invalid id in request path");
}

#[tokio::test]
async fn malformed_json_body_is_a_json_bad_request() {
    let store = Arc::new(crate::store::memory::MemoryStore::new());
    let user = store.seed_user("Pat", 100).await;
    let token = store.seed_session(user).await;
    let base = serve(crate::state::test_helpers::test_app_state(Arc::clone(&store))).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/api/user/project"))
        .bearer_auth(token)
        .header(CONTENT_TYPE, "application/json")
        .body("{\"initialPrompt\": ")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(!message_only(response).await.is_empty());
    assert_eq!(store.credits(user).await, 100);
}
