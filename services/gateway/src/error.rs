//! Gateway error taxonomy and HTTP mapping
//!
//! Every terminal request outcome maps to exactly one variant here; handlers
//! render them as the JSON error envelope `{"error":{"type","message",
//! "request_id"}}` so callers can distinguish retry-later conditions
//! (`rotation_exhausted`, `rate_limited`) from hard failures.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use driver::FailureKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("every credential profile is cooling or quarantined: {detail}")]
    RotationExhausted {
        detail: String,
        retry_after: Option<Duration>,
    },

    #[error("retry budget exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    #[error("backend rate limited the active profile")]
    RateLimited,

    #[error("backend quota exhausted for the active profile")]
    QuotaExceeded,

    #[error("request exceeded the retrieval ceiling")]
    Timeout,

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("client cancelled the request")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable machine-readable error type for the JSON envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::RotationExhausted { .. } => "rotation_exhausted",
            Error::RetryExhausted { .. } => "retry_exhausted",
            Error::RateLimited => "rate_limited",
            Error::QuotaExceeded => "quota_exceeded",
            Error::Timeout => "timeout",
            Error::Backend(_) => "backend_error",
            Error::Cancelled => "cancelled",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::RotationExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::RetryExhausted { .. } => StatusCode::BAD_GATEWAY,
            Error::RateLimited | Error::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Backend(_) => StatusCode::BAD_GATEWAY,
            // Nonstandard but conventional "client closed request".
            Error::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        }
    }

    /// Map a terminal failure kind that exhausted its handling options.
    pub fn from_failure(kind: FailureKind, message: String) -> Self {
        match kind {
            FailureKind::RateLimited => Error::RateLimited,
            FailureKind::QuotaExceeded => Error::QuotaExceeded,
            FailureKind::Timeout => Error::Timeout,
            _ => Error::Backend(message),
        }
    }

    /// Render the JSON error envelope for one request.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        });

        let mut response = (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response();

        if let Error::RotationExhausted {
            retry_after: Some(after),
            ..
        } = &self
            && let Ok(value) = after.as_secs().max(1).to_string().parse()
        {
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, value);
        }
        response
    }
}

impl From<session_pool::Error> for Error {
    fn from(e: session_pool::Error) -> Self {
        match e {
            session_pool::Error::RotationExhausted {
                detail,
                retry_after,
            } => Error::RotationExhausted {
                detail,
                retry_after,
            },
            other => Error::Backend(other.to_string()),
        }
    }
}
