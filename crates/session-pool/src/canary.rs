//! Structural canary check for credential payloads
//!
//! A cheap pre-promotion validation: the payload must be well-formed JSON
//! with a non-empty cookie set, and must not be self-evidently expired. This
//! is not an authentication check — the backend is the only authority on
//! whether a credential actually works — it only filters out payloads that
//! cannot possibly work, before they burn a request.

use thiserror::Error;

/// Why a payload failed the canary.
#[derive(Debug, Error)]
pub enum CanaryError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(String),

    #[error("payload has no cookies")]
    Empty,

    #[error("every cookie expired (latest expiry {latest_expiry_secs}s epoch)")]
    Expired { latest_expiry_secs: i64 },
}

/// Run the canary against an opaque payload.
///
/// `now_secs` is the current wall-clock time as a unix timestamp in seconds.
/// Cookies with `expires <= 0` are session cookies and never count as
/// expired; the payload is rejected only when every cookie that carries a
/// positive expiry is already past it.
pub fn check(payload: &str, now_secs: i64) -> Result<(), CanaryError> {
    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| CanaryError::Malformed(e.to_string()))?;

    let cookies = value
        .get("cookies")
        .and_then(|c| c.as_array())
        .ok_or(CanaryError::Empty)?;
    if cookies.is_empty() {
        return Err(CanaryError::Empty);
    }

    let mut latest_expiry: Option<i64> = None;
    let mut has_session_cookie = false;
    for cookie in cookies {
        match cookie.get("expires").and_then(|e| e.as_f64()) {
            Some(expires) if expires > 0.0 => {
                let expires = expires as i64;
                latest_expiry = Some(latest_expiry.map_or(expires, |l| l.max(expires)));
            }
            // Session cookies (expires absent or -1) carry no expiry evidence
            _ => has_session_cookie = true,
        }
    }

    match latest_expiry {
        Some(latest) if latest <= now_secs && !has_session_cookie => {
            Err(CanaryError::Expired {
                latest_expiry_secs: latest,
            })
        }
        _ => Ok(()),
    }
}
