//! Payment webhook.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use serde_json::{Value, json};
use tracing::info;

use super::{ApiError, payment_error};
use crate::services::payment::{self, WebhookOutcome};
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// `POST /api/stripe` — verify the signature and settle completed checkouts.
pub async fn webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let now = time::OffsetDateTime::now_utc().unix_timestamp();

    let outcome = payment::handle_webhook(
        state.store.as_ref(),
        state.config.stripe_webhook_secret.as_deref(),
        signature,
        &body,
        now,
    )
    .await
    .map_err(payment_error)?;

    if let WebhookOutcome::Credited(purchase) = outcome {
        info!(user_id = %purchase.user_id, credits = purchase.credits, "webhook credited purchase");
    }
    Ok(Json(json!({ "received": true })))
}

#[cfg(test)]
#[path = "stripe_test.rs"]
mod tests;
