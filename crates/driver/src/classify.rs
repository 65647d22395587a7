//! Failure classification for backend responses
//!
//! Distinguishes transient rate limits (429 with a generic message) from real
//! quota exhaustion (429 carrying the backend's usage-limit phrasing). Only
//! quota exhaustion earns the longer cooldown; a plain rate limit cools the
//! profile for the short window and the pool moves on.

use crate::FailureKind;

/// Quota exhaustion phrases seen in backend 429 bodies and driver error
/// surfaces. These mean the account's usage allowance is spent, not that the
/// caller was momentarily too fast.
const QUOTA_PATTERNS: &[&str] = &[
    "quota exceeded",
    "usage limit",
    "resource has been exhausted",
    "daily limit",
    "resource_exhausted",
];

/// Classify a 429 body as quota exhaustion or a transient rate limit.
pub fn classify_429(body: &str) -> FailureKind {
    let lower = body.to_lowercase();
    for pattern in QUOTA_PATTERNS {
        if lower.contains(pattern) {
            return FailureKind::QuotaExceeded;
        }
    }
    FailureKind::RateLimited
}

/// Classify a terminal backend failure by HTTP status and response body.
///
/// 429 dispatches to `classify_429`. 403 is Forbidden (retryable per policy),
/// 408/504 are timeouts, other 5xx are backend errors, anything else is
/// Unknown.
pub fn classify_status(status: u16, body: &str) -> FailureKind {
    match status {
        429 => classify_429(body),
        403 => FailureKind::Forbidden,
        408 | 504 => FailureKind::Timeout,
        s if (500..600).contains(&s) => FailureKind::BackendError,
        _ => FailureKind::Unknown,
    }
}

/// Best-effort classification of a driver error message with no HTTP status
/// attached (the automation surface often only sees page text).
pub fn classify_message(message: &str) -> FailureKind {
    let lower = message.to_lowercase();
    if lower.contains("403") || lower.contains("forbidden") {
        return FailureKind::Forbidden;
    }
    for pattern in QUOTA_PATTERNS {
        if lower.contains(pattern) {
            return FailureKind::QuotaExceeded;
        }
    }
    if lower.contains("rate limit") || lower.contains("429") {
        return FailureKind::RateLimited;
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return FailureKind::Timeout;
    }
    if lower.contains("internal error") || lower.contains("unavailable") {
        return FailureKind::BackendError;
    }
    FailureKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_429_quota_exceeded_phrase() {
        let body = r#"{"error":{"message":"Quota exceeded for this account"}}"#;
        assert_eq!(classify_429(body), FailureKind::QuotaExceeded);
    }

    #[test]
    fn classify_429_usage_limit_phrase() {
        let body = r#"{"error":{"message":"You have reached the usage limit for today"}}"#;
        assert_eq!(classify_429(body), FailureKind::QuotaExceeded);
    }

    #[test]
    fn classify_429_resource_exhausted() {
        let body = r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(classify_429(body), FailureKind::QuotaExceeded);
    }

    #[test]
    fn classify_429_generic_is_rate_limited() {
        let body = r#"{"error":{"message":"Too many requests, please retry"}}"#;
        assert_eq!(classify_429(body), FailureKind::RateLimited);
    }

    #[test]
    fn classify_429_empty_body_is_rate_limited() {
        assert_eq!(classify_429(""), FailureKind::RateLimited);
    }

    #[test]
    fn classify_429_case_insensitive() {
        let body = r#"{"error":{"message":"DAILY LIMIT REACHED"}}"#;
        assert_eq!(classify_429(body), FailureKind::QuotaExceeded);
    }

    #[test]
    fn classify_status_403_forbidden() {
        assert_eq!(classify_status(403, "forbidden"), FailureKind::Forbidden);
    }

    #[test]
    fn classify_status_429_delegates() {
        let body = r#"{"error":{"message":"quota exceeded"}}"#;
        assert_eq!(classify_status(429, body), FailureKind::QuotaExceeded);
    }

    #[test]
    fn classify_status_timeouts() {
        assert_eq!(classify_status(408, ""), FailureKind::Timeout);
        assert_eq!(classify_status(504, ""), FailureKind::Timeout);
    }

    #[test]
    fn classify_status_5xx_backend_error() {
        assert_eq!(classify_status(500, ""), FailureKind::BackendError);
        assert_eq!(classify_status(502, ""), FailureKind::BackendError);
        assert_eq!(classify_status(503, ""), FailureKind::BackendError);
        assert_eq!(classify_status(599, ""), FailureKind::BackendError);
    }

    #[test]
    fn classify_status_unmapped_is_unknown() {
        assert_eq!(classify_status(418, "teapot"), FailureKind::Unknown);
        assert_eq!(classify_status(200, "ok"), FailureKind::Unknown);
    }

    #[test]
    fn classify_message_variants() {
        assert_eq!(
            classify_message("upstream 403 Forbidden"),
            FailureKind::Forbidden
        );
        assert_eq!(
            classify_message("rate limit exceeded, retry later"),
            FailureKind::RateLimited
        );
        assert_eq!(
            classify_message("navigation timed out after 30s"),
            FailureKind::Timeout
        );
        assert_eq!(
            classify_message("service unavailable"),
            FailureKind::BackendError
        );
        assert_eq!(classify_message("target closed"), FailureKind::Unknown);
    }
}
