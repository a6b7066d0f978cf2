//! Credit purchases — plan catalog, hosted checkout sessions, payment webhook.
//!
//! DESIGN
//! ======
//! A purchase is recorded as an unpaid transaction before the checkout
//! session exists, and the session carries the transaction id in its
//! metadata. The webhook is the only path that marks a transaction paid; it
//! does so together with the credit top-up in one datastore transaction, so
//! replayed webhook deliveries are acknowledged without crediting twice.

use std::time::Duration;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ledger::{self, LedgerError};
use crate::error::ErrorCode;
use crate::store::{SettledPurchase, Store, StoreError};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";
pub const APP_ID: &str = "ai-site-builder";
const CHECKOUT_EXPIRY_SECS: i64 = 30 * 60;
const SIGNATURE_TOLERANCE_SECS: i64 = 300;
const STRIPE_REQUEST_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// PLANS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub id: &'static str,
    pub credits: i64,
    /// Whole US dollars.
    pub amount: i64,
}

pub const PLANS: [Plan; 3] = [
    Plan { id: "basic", credits: 100, amount: 5 },
    Plan { id: "pro", credits: 400, amount: 19 },
    Plan { id: "enterprise", credits: 1000, amount: 49 },
];

#[must_use]
pub fn find_plan(plan_id: &str) -> Option<&'static Plan> {
    PLANS.iter().find(|plan| plan.id == plan_id)
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("plan not found: {0}")]
    PlanNotFound(String),
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("payments are not configured")]
    NotConfigured,
    #[error("payment provider returned status {status}")]
    Provider { status: u16, body: String },
    #[error("payment provider request failed: {0}")]
    Request(String),
    #[error("payment provider did not return a checkout URL")]
    MissingSessionUrl,
    #[error("invalid webhook signature: {0}")]
    InvalidSignature(&'static str),
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ErrorCode for PaymentError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::PlanNotFound(_) => "E_PLAN_NOT_FOUND",
            Self::InvalidInput(_) => "E_INVALID_INPUT",
            Self::NotConfigured => "E_PAYMENTS_NOT_CONFIGURED",
            Self::Provider { .. } => "E_PAYMENT_PROVIDER",
            Self::Request(_) => "E_PAYMENT_REQUEST",
            Self::MissingSessionUrl => "E_PAYMENT_SESSION_URL",
            Self::InvalidSignature(_) => "E_WEBHOOK_SIGNATURE",
            Self::InvalidPayload(_) => "E_WEBHOOK_PAYLOAD",
            Self::Store(e) => e.error_code(),
            Self::Ledger(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Request(_) | Self::Provider { status: 500..=599, .. } => true,
            Self::Store(e) => e.retryable(),
            Self::Ledger(e) => e.retryable(),
            _ => false,
        }
    }
}

// =============================================================================
// PROVIDER
// =============================================================================

/// What the hosted checkout page needs to sell one plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub transaction_id: Uuid,
    /// Browser origin the user returns to.
    pub origin: String,
    pub credits: i64,
    pub amount: i64,
}

#[async_trait::async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a hosted checkout session and return its URL, if the provider gave one.
    ///
    /// # Errors
    ///
    /// `Request` for transport failures, `Provider` for non-success statuses.
    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<Option<String>, PaymentError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeConfig {
    pub secret_key: String,
    pub api_base: String,
}

impl StripeConfig {
    /// `None` when `STRIPE_SECRET_KEY` is unset, which disables purchases.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())?;
        let api_base = std::env::var("STRIPE_API_BASE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_STRIPE_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        Some(Self { secret_key, api_base })
    }
}

pub struct StripeClient {
    http: reqwest::Client,
    config: StripeConfig,
}

impl StripeClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: StripeConfig) -> Result<Self, PaymentError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(STRIPE_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| PaymentError::Request(e.to_string()))?;
        Ok(Self { http, config })
    }
}

#[async_trait::async_trait]
impl PaymentProvider for StripeClient {
    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<Option<String>, PaymentError> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let response = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.config.api_base))
            .bearer_auth(&self.config.secret_key)
            .form(&checkout_form(request, now))
            .send()
            .await
            .map_err(|e| PaymentError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| PaymentError::Request(e.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(PaymentError::Provider { status, body });
        }
        let session: Value = serde_json::from_str(&body).map_err(|e| PaymentError::InvalidPayload(e.to_string()))?;
        Ok(session.get("url").and_then(Value::as_str).map(str::to_owned))
    }
}

/// Form fields for a one-item USD checkout session expiring 30 minutes after `now`.
pub(crate) fn checkout_form(request: &CheckoutRequest, now: i64) -> Vec<(&'static str, String)> {
    vec![
        ("mode", "payment".into()),
        ("success_url", format!("{}/loading", request.origin)),
        ("cancel_url", request.origin.clone()),
        ("line_items[0][quantity]", "1".into()),
        ("line_items[0][price_data][currency]", "usd".into()),
        ("line_items[0][price_data][product_data][name]", format!("AISiteBuilder- {} credits", request.credits)),
        ("line_items[0][price_data][unit_amount]", (request.amount * 100).to_string()),
        ("metadata[transactionId]", request.transaction_id.to_string()),
        ("metadata[appId]", APP_ID.into()),
        ("expires_at", (now + CHECKOUT_EXPIRY_SECS).to_string()),
    ]
}

// =============================================================================
// PURCHASE
// =============================================================================

/// Record an unpaid transaction for `plan_id` and return the checkout URL.
///
/// # Errors
///
/// `PlanNotFound` before anything is written, `NotConfigured` when no
/// provider is wired, `MissingSessionUrl` or provider errors afterwards.
pub async fn purchase_credits(
    store: &dyn Store,
    provider: Option<&dyn PaymentProvider>,
    user_id: Uuid,
    plan_id: &str,
    origin: Option<&str>,
) -> Result<String, PaymentError> {
    let plan = find_plan(plan_id).ok_or_else(|| PaymentError::PlanNotFound(plan_id.to_owned()))?;
    let provider = provider.ok_or(PaymentError::NotConfigured)?;
    let origin = origin
        .map(|o| o.trim().trim_end_matches('/'))
        .filter(|o| !o.is_empty())
        .ok_or(PaymentError::InvalidInput("missing Origin header"))?;

    let transaction = store
        .create_transaction(user_id, plan.id, plan.amount, plan.credits)
        .await?;
    let request = CheckoutRequest {
        transaction_id: transaction.id,
        origin: origin.to_owned(),
        credits: plan.credits,
        amount: plan.amount,
    };
    let url = provider
        .create_checkout(&request)
        .await?
        .ok_or(PaymentError::MissingSessionUrl)?;

    info!(%user_id, transaction_id = %transaction.id, plan = plan.id, "checkout session created");
    Ok(url)
}

// =============================================================================
// WEBHOOK
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Credited(SettledPurchase),
    /// Unknown or already-paid transaction; nothing changed.
    AlreadySettled,
    /// Some other event type or another application's session.
    Ignored,
}

/// Check a `t=<unix>,v1=<hex>` signature header against `payload`.
///
/// # Errors
///
/// `InvalidSignature` for a malformed header, a stale timestamp, or no
/// matching `v1` signature.
pub fn verify_signature(secret: &str, header: &str, payload: &[u8], now: i64) -> Result<(), PaymentError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(PaymentError::InvalidSignature("missing timestamp"))?;
    if signatures.is_empty() {
        return Err(PaymentError::InvalidSignature("missing v1 signature"));
    }
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(PaymentError::InvalidSignature("timestamp outside tolerance"));
    }

    let matches = signatures.iter().any(|signature| {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    });
    if matches { Ok(()) } else { Err(PaymentError::InvalidSignature("no matching signature")) }
}

/// Verify and apply one webhook delivery.
///
/// # Errors
///
/// `NotConfigured` without a signing secret, `InvalidSignature`,
/// `InvalidPayload` for unparseable JSON or transaction ids, `Ledger` on
/// datastore failure.
pub async fn handle_webhook(
    store: &dyn Store,
    secret: Option<&str>,
    signature: Option<&str>,
    payload: &[u8],
    now: i64,
) -> Result<WebhookOutcome, PaymentError> {
    let secret = secret.ok_or(PaymentError::NotConfigured)?;
    let signature = signature.ok_or(PaymentError::InvalidSignature("missing Stripe-Signature header"))?;
    verify_signature(secret, signature, payload, now)?;

    let event: Value = serde_json::from_slice(payload).map_err(|e| PaymentError::InvalidPayload(e.to_string()))?;
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
    if event_type != "checkout.session.completed" {
        debug!(event_type, "ignoring webhook event");
        return Ok(WebhookOutcome::Ignored);
    }

    let metadata = event.pointer("/data/object/metadata");
    let field = |key: &str| metadata.and_then(|m| m.get(key)).and_then(Value::as_str);
    if field("appId") != Some(APP_ID) {
        debug!("ignoring checkout for another application");
        return Ok(WebhookOutcome::Ignored);
    }
    let raw_id = field("transactionId").ok_or_else(|| PaymentError::InvalidPayload("missing transactionId".into()))?;
    let transaction_id =
        Uuid::parse_str(raw_id).map_err(|_| PaymentError::InvalidPayload(format!("bad transactionId {raw_id:?}")))?;

    match ledger::credit_purchase(store, transaction_id).await? {
        Some(purchase) => Ok(WebhookOutcome::Credited(purchase)),
        None => {
            warn!(%transaction_id, "webhook for unknown or already-paid transaction");
            Ok(WebhookOutcome::AlreadySettled)
        }
    }
}

#[cfg(test)]
#[path = "payment_test.rs"]
mod tests;
