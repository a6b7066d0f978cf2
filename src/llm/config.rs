//! LLM configuration parsed from environment variables.

use super::types::LlmError;

pub const DEFAULT_AI_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_AI_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_AI_TITLE: &str = "AI Site Builder";
pub const DEFAULT_LLM_REQUEST_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_LLM_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LlmTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    /// Tried once when the primary model answers with a quota error.
    pub fallback_model: Option<String>,
    pub base_url: String,
    /// Sent as `HTTP-Referer` for provider attribution.
    pub referer: Option<String>,
    pub title: String,
    pub timeouts: LlmTimeouts,
}

impl LlmConfig {
    /// Build typed LLM config from environment variables.
    ///
    /// Required:
    /// - `AI_API_KEY`
    ///
    /// Optional:
    /// - `AI_MODEL`: default `openai/gpt-4o-mini`
    /// - `AI_FALLBACK_MODEL`: no fallback when absent
    /// - `AI_BASE_URL`: default `OpenRouter`
    /// - `AI_REFERER`, `AI_TITLE`: attribution headers
    /// - `AI_REQUEST_TIMEOUT_SECS`: default 120
    /// - `AI_CONNECT_TIMEOUT_SECS`: default 10
    ///
    /// # Errors
    ///
    /// Returns an error if the key is missing or a timeout is malformed.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_key = env_non_empty("AI_API_KEY").ok_or_else(|| LlmError::MissingApiKey { var: "AI_API_KEY".into() })?;
        let model = env_non_empty("AI_MODEL").unwrap_or_else(|| DEFAULT_AI_MODEL.to_string());
        let fallback_model = env_non_empty("AI_FALLBACK_MODEL").filter(|fallback| *fallback != model);
        let base_url = env_non_empty("AI_BASE_URL")
            .unwrap_or_else(|| DEFAULT_AI_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let timeouts = LlmTimeouts {
            request_secs: env_parse_u64("AI_REQUEST_TIMEOUT_SECS", DEFAULT_LLM_REQUEST_TIMEOUT_SECS)?,
            connect_secs: env_parse_u64("AI_CONNECT_TIMEOUT_SECS", DEFAULT_LLM_CONNECT_TIMEOUT_SECS)?,
        };

        Ok(Self {
            api_key,
            model,
            fallback_model,
            base_url,
            referer: env_non_empty("AI_REFERER"),
            title: env_non_empty("AI_TITLE").unwrap_or_else(|| DEFAULT_AI_TITLE.to_string()),
            timeouts,
        })
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse_u64(key: &str, default: u64) -> Result<u64, LlmError> {
    match env_non_empty(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| LlmError::ConfigParse(format!("{key} must be a whole number of seconds, got {raw:?}"))),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
