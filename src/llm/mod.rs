//! LLM — completion client for the site generator.
//!
//! DESIGN
//! ======
//! One OpenAI-compatible transport. The primary model is tried first; a quota
//! error (429, or a 402/credits-exhausted body) triggers exactly one retry on
//! the configured fallback model with a smaller token budget. Network errors
//! and other statuses propagate untouched; there are no transport retries.

pub mod config;
pub mod openai;
pub mod types;

use std::future::Future;

use config::LlmConfig;
use tracing::warn;
pub use types::{ChatResponse, LlmChat, LlmError, Message};

/// Token ceiling for the fallback attempt.
pub const FALLBACK_MAX_TOKENS: u32 = 800;

// =============================================================================
// CLIENT
// =============================================================================

/// Concrete LLM client configured from environment variables by [`LlmClient::from_env`].
pub struct LlmClient {
    inner: openai::OpenAiClient,
    model: String,
    fallback_model: Option<String>,
}

impl LlmClient {
    /// # Errors
    ///
    /// Returns an error if the API key is missing or the HTTP client fails.
    pub fn from_env() -> Result<Self, LlmError> {
        Self::from_config(LlmConfig::from_env()?)
    }

    /// Build an LLM client from a parsed typed config.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn from_config(config: LlmConfig) -> Result<Self, LlmError> {
        let inner = openai::OpenAiClient::new(config.api_key, config.base_url, config.referer, config.title, config.timeouts)?;
        Ok(Self { inner, model: config.model, fallback_model: config.fallback_model })
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait::async_trait]
impl LlmChat for LlmClient {
    async fn chat(&self, max_tokens: u32, system: &str, messages: &[Message]) -> Result<ChatResponse, LlmError> {
        with_fallback(&self.model, self.fallback_model.as_deref(), max_tokens, |model, tokens| {
            self.inner.chat(model, tokens, system, messages)
        })
        .await
    }
}

/// Run `call` on `primary`, retrying once on `fallback` after a quota error.
pub(crate) async fn with_fallback<'a, F, Fut>(
    primary: &'a str,
    fallback: Option<&'a str>,
    max_tokens: u32,
    call: F,
) -> Result<ChatResponse, LlmError>
where
    F: Fn(&'a str, u32) -> Fut,
    Fut: Future<Output = Result<ChatResponse, LlmError>>,
{
    match call(primary, max_tokens).await {
        Err(err) if err.is_quota() => {
            let Some(fallback) = fallback else {
                return Err(err);
            };
            warn!(primary, fallback, error = %err, "primary model refused; retrying on fallback");
            call(fallback, max_tokens.min(FALLBACK_MAX_TOKENS)).await
        }
        other => other,
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
