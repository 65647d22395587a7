//! Error types for pool operations

use std::time::Duration;

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every profile is cooling or quarantined — the emergency condition.
    /// `retry_after` is the time until the earliest cooldown expires, if any
    /// profile is cooling at all; callers may wait that long and re-select.
    #[error("rotation exhausted: {detail}")]
    RotationExhausted {
        detail: String,
        retry_after: Option<Duration>,
    },

    #[error("profile not found: {0}")]
    NotFound(String),

    #[error("profile store error: {0}")]
    Store(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
