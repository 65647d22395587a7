//! Automation-driver capability and failure taxonomy
//!
//! Defines the `Driver` trait that decouples the resilience layer from the
//! page/automation machinery actually talking to the backend UI. The gateway
//! only ever sees four operations: submit a request, poll its status, harvest
//! the final text, and abort. Everything else (selectors, page lifecycle,
//! prompt construction) lives behind this seam.

pub mod classify;
pub mod http;

pub use classify::{classify_message, classify_status};
pub use http::HttpDriver;

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

/// Classification of a terminal backend failure, used by the retry policy to
/// decide between local retry, pool rotation, and surfacing a typed error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 403 from the backend; retryable with backoff across profiles
    Forbidden,
    /// Transient rate limit; rotate to the next profile, no local retry
    RateLimited,
    /// Subscription/daily quota exhausted; rotate, longer cooldown
    QuotaExceeded,
    /// The whole request's hard ceiling elapsed
    Timeout,
    /// Backend-side 5xx or internal error
    BackendError,
    /// Anything we could not classify
    Unknown,
}

impl FailureKind {
    /// Stable label for metrics and error bodies.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Forbidden => "forbidden",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::QuotaExceeded => "quota_exceeded",
            FailureKind::Timeout => "timeout",
            FailureKind::BackendError => "backend_error",
            FailureKind::Unknown => "unknown",
        }
    }
}

/// Handle to one submitted request, passed to every retrieval channel.
///
/// `host` is the backend hostname the submission's TLS connection targets,
/// used to match intercepted frames to this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionHandle {
    pub id: String,
    pub host: String,
}

/// Status reported by the driver's side channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionStatus {
    Pending,
    Done,
    Error(String),
}

/// Errors from driver operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("submission failed: {0}")]
    Submit(String),

    #[error("backend reported failure: {message}")]
    Backend { kind: FailureKind, message: String },

    #[error("driver session lost: {0}")]
    SessionLost(String),
}

impl Error {
    /// Map a driver error onto the failure taxonomy.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Backend { kind, .. } => *kind,
            Error::Submit(msg) | Error::SessionLost(msg) => classify_message(msg),
        }
    }
}

/// Result alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Capability surface of the external automation driver.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Driver>`), matching how the gateway shares one driver across
/// concurrently racing channels.
pub trait Driver: Send + Sync {
    /// Submit opaque request content to the backend; returns a handle the
    /// retrieval channels use to identify this in-flight request.
    fn submit<'a>(
        &'a self,
        request: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SubmissionHandle>> + Send + 'a>>;

    /// Poll the side channel for the submission's status.
    fn poll_status<'a>(
        &'a self,
        handle: &'a SubmissionHandle,
    ) -> Pin<Box<dyn Future<Output = Result<SubmissionStatus>> + Send + 'a>>;

    /// Harvest the final response text once the backend reports completion.
    fn harvest_final_text<'a>(
        &'a self,
        handle: &'a SubmissionHandle,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    /// Abort the in-flight submission, leaving the session ready for the
    /// next request. Called on client cancellation.
    fn abort<'a>(
        &'a self,
        handle: &'a SubmissionHandle,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}
