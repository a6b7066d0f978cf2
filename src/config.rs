//! Process configuration parsed from environment variables.
//!
//! SYSTEM CONTEXT
//! ==============
//! `main` builds one [`AppConfig`] at startup and hands it to `AppState`.
//! Nothing else reads the environment for these settings, so handlers and
//! services see a single consistent snapshot.

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_AUTH_COOKIE_NAME: &str = "auth_session";
pub const DEFAULT_GENERATION_COST: i64 = 5;
pub const DEFAULT_CODE_MAX_TOKENS: u32 = 2000;
pub const DEFAULT_GENERATION_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_GENERATION_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

/// Tuning for the credit-metered generation workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationConfig {
    /// Credits debited per generation attempt.
    pub cost: i64,
    /// `max_tokens` for the code generation call.
    pub code_max_tokens: u32,
    /// Upper bound on concurrently running background generations.
    pub max_concurrency: usize,
    /// Jobs that may wait for a worker before new projects are rejected.
    pub queue_capacity: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            cost: DEFAULT_GENERATION_COST,
            code_max_tokens: DEFAULT_CODE_MAX_TOKENS,
            max_concurrency: DEFAULT_GENERATION_MAX_CONCURRENCY,
            queue_capacity: DEFAULT_GENERATION_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub port: u16,
    /// CORS allow list. Empty means cross-origin requests are refused.
    pub trusted_origins: Vec<String>,
    pub auth_cookie_name: String,
    pub generation: GenerationConfig,
    /// Signing secret for the payment webhook. Webhooks are refused without it.
    pub stripe_webhook_secret: Option<String>,
}

impl AppConfig {
    /// Build config from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `DATABASE_URL` is missing or a numeric value is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if `DATABASE_URL` is missing or a numeric value is malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database = DatabaseConfig {
            url: lookup("DATABASE_URL")
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing("DATABASE_URL"))?,
            max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
            acquire_timeout_secs: parse_or(&lookup, "DB_ACQUIRE_TIMEOUT_SECS", DEFAULT_DB_ACQUIRE_TIMEOUT_SECS)?,
        };

        let generation = GenerationConfig {
            cost: parse_or(&lookup, "GENERATION_COST", DEFAULT_GENERATION_COST)?,
            code_max_tokens: parse_or(&lookup, "AI_MAX_TOKENS", DEFAULT_CODE_MAX_TOKENS)?,
            max_concurrency: parse_or(&lookup, "GENERATION_MAX_CONCURRENCY", DEFAULT_GENERATION_MAX_CONCURRENCY)?,
            queue_capacity: parse_or(&lookup, "GENERATION_QUEUE_CAPACITY", DEFAULT_GENERATION_QUEUE_CAPACITY)?,
        };
        if generation.cost <= 0 {
            return Err(ConfigError::Invalid { key: "GENERATION_COST", value: generation.cost.to_string() });
        }
        if generation.max_concurrency == 0 {
            return Err(ConfigError::Invalid { key: "GENERATION_MAX_CONCURRENCY", value: "0".into() });
        }
        if generation.queue_capacity == 0 {
            return Err(ConfigError::Invalid { key: "GENERATION_QUEUE_CAPACITY", value: "0".into() });
        }

        Ok(Self {
            database,
            port: parse_or(&lookup, "PORT", DEFAULT_PORT)?,
            trusted_origins: parse_origins(lookup("TRUSTED_ORIGINS").as_deref()),
            auth_cookie_name: lookup("AUTH_COOKIE_NAME")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_AUTH_COOKIE_NAME.to_owned()),
            generation,
            stripe_webhook_secret: lookup("STRIPE_WEBHOOK_SECRET").filter(|v| !v.trim().is_empty()),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

/// Split a comma-separated origin list, dropping blanks and trailing slashes.
pub(crate) fn parse_origins(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|origin| origin.trim().trim_end_matches('/'))
        .filter(|origin| !origin.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
