//! Error codes shared by services and the HTTP layer.
//!
//! DESIGN
//! ======
//! Each service owns its own `thiserror` enum. They all implement
//! [`ErrorCode`] so the route layer can log a grepable code next to the
//! human-readable message without exposing internals in the response body.

/// Grepable error code and retryable flag for structured error logging.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}
