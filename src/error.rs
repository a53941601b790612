//! Error types for the Tollgate service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Tollgate operations.
///
/// None of these are produced by a plain rate limit check: exceeding a limit
/// is reported through [`RateLimitResult`](crate::ratelimit::RateLimitResult)
/// and store failures are absorbed by the memory fallback.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy name that is not present in the catalog
    #[error("Unknown rate limit policy: {0}")]
    UnknownPolicy(String),

    /// Store errors surfaced during startup
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
