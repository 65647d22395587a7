//! Attempt loop with pool rotation and backoff
//!
//! Drives one logical request through up to `max_attempts` attempts, each on
//! whatever profile the pool currently holds active. Failure handling:
//!
//! - `Forbidden`: cool the profile, sleep an exponential backoff, re-select
//! - `RateLimited` / `QuotaExceeded`: cool the profile, re-select immediately
//!   (a different profile is not subject to the old one's limit, so there is
//!   nothing to wait for)
//! - `Timeout` / `BackendError` / `Unknown`: surface typed, pool untouched —
//!   these say nothing about the credential
//! - cancellation: surface immediately and never touch pool state
//!
//! Retries re-submit the identical request content.

use std::future::Future;
use std::time::Duration;

use driver::FailureKind;
use session_pool::{Outcome, PoolManager, SelectedProfile};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Why one attempt did not produce text.
#[derive(Debug)]
pub enum AttemptError {
    Failed { kind: FailureKind, message: String },
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    /// Backoff before retrying after the zero-based `attempt`: base doubled
    /// per attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_cap, |d| d.min(self.backoff_cap))
    }

    /// Run `attempt_fn` until it succeeds, the retry budget runs out, or a
    /// non-retryable failure surfaces.
    pub async fn run<F, Fut>(&self, pool: &PoolManager, mut attempt_fn: F) -> Result<String>
    where
        F: FnMut(SelectedProfile, u32) -> Fut,
        Fut: Future<Output = std::result::Result<String, AttemptError>>,
    {
        for attempt in 0..self.max_attempts {
            let profile = pool.current_or_select().await?;
            let profile_id = profile.id.clone();
            debug!(attempt, profile_id = %profile_id, "starting attempt");

            match attempt_fn(profile, attempt).await {
                Ok(text) => {
                    pool.mark_outcome(&profile_id, Outcome::Success).await?;
                    return Ok(text);
                }
                Err(AttemptError::Cancelled) => return Err(Error::Cancelled),
                Err(AttemptError::Failed { kind, message }) => match kind {
                    FailureKind::Forbidden => {
                        pool.mark_outcome(&profile_id, Outcome::Forbidden).await?;
                        metrics::counter!("retry_attempts_total", "kind" => "forbidden")
                            .increment(1);
                        // The final attempt reports exhaustion immediately
                        // instead of sleeping a backoff nobody consumes.
                        if attempt + 1 < self.max_attempts {
                            let delay = self.backoff(attempt);
                            warn!(
                                attempt,
                                profile_id = %profile_id,
                                backoff_ms = delay.as_millis() as u64,
                                "forbidden response, cooling profile and backing off"
                            );
                            tokio::time::sleep(delay).await;
                        } else {
                            warn!(attempt, profile_id = %profile_id, "forbidden response on final attempt");
                        }
                    }
                    FailureKind::RateLimited => {
                        pool.mark_outcome(&profile_id, Outcome::RateLimited).await?;
                        info!(attempt, profile_id = %profile_id, "rate limited, rotating");
                        metrics::counter!("retry_attempts_total", "kind" => "rate_limited")
                            .increment(1);
                    }
                    FailureKind::QuotaExceeded => {
                        pool.mark_outcome(&profile_id, Outcome::QuotaExceeded)
                            .await?;
                        info!(attempt, profile_id = %profile_id, "quota exceeded, rotating");
                        metrics::counter!("retry_attempts_total", "kind" => "quota_exceeded")
                            .increment(1);
                    }
                    FailureKind::Timeout | FailureKind::BackendError | FailureKind::Unknown => {
                        return Err(Error::from_failure(kind, message));
                    }
                },
            }
        }

        warn!(attempts = self.max_attempts, "retry budget exhausted");
        metrics::counter!("retry_exhausted_total").increment(1);
        Err(Error::RetryExhausted {
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Secret;
    use session_pool::{AuthProfile, CooldownConfig, PoolBucket, ProfileState};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    const FAR_FUTURE: i64 = 4_102_444_800;

    fn payload() -> String {
        format!(r#"{{"cookies":[{{"name":"sid","value":"x","expires":{FAR_FUTURE}}}]}}"#)
    }

    fn profile(id: &str, bucket: PoolBucket) -> AuthProfile {
        AuthProfile::unverified(id.into(), bucket, Secret::new(payload()))
    }

    fn pool(profiles: Vec<AuthProfile>) -> PoolManager {
        PoolManager::new(profiles, CooldownConfig::default())
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_secs(1));
        assert_eq!(p.backoff(1), Duration::from_secs(2));
        assert_eq!(p.backoff(4), Duration::from_secs(16));
        assert_eq!(p.backoff(5), Duration::from_secs(30));
        assert_eq!(p.backoff(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn success_marks_outcome_and_returns() {
        let pool = pool(vec![profile("primary/a", PoolBucket::Primary)]);
        let text = policy()
            .run(&pool, |p, _| async move {
                assert_eq!(p.id, "primary/a");
                Ok("done".to_string())
            })
            .await
            .unwrap();
        assert_eq!(text, "done");

        // Profile stays active for the next request.
        let again = pool.current_or_select().await.unwrap();
        assert_eq!(again.id, "primary/a");
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_burst_cools_every_profile_then_exhausts() {
        let pool = pool(vec![
            profile("primary/a", PoolBucket::Primary),
            profile("backup/b", PoolBucket::Backup),
            profile("emergency/c", PoolBucket::Emergency),
        ]);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();

        let err = policy()
            .run(&pool, move |p, _| {
                let seen = seen2.clone();
                async move {
                    seen.lock().unwrap().push(p.id.clone());
                    Err(AttemptError::Failed {
                        kind: FailureKind::Forbidden,
                        message: "403".into(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RetryExhausted { attempts: 3 }));
        // Each attempt burned a different profile, in bucket priority order.
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["primary/a", "backup/b", "emergency/c"]
        );
        // All three are now cooling; a fresh selection must fail.
        let err = pool.current_or_select().await.unwrap_err();
        assert!(matches!(err, session_pool::Error::RotationExhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_sleeps_backoff_between_attempts_only() {
        let pool = pool(vec![
            profile("primary/a", PoolBucket::Primary),
            profile("primary/b", PoolBucket::Primary),
            profile("primary/c", PoolBucket::Primary),
        ]);
        let start = tokio::time::Instant::now();

        let err = policy()
            .run(&pool, |_, _| async {
                Err(AttemptError::Failed {
                    kind: FailureKind::Forbidden,
                    message: "403".into(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetryExhausted { attempts: 3 }));

        // Backoffs of 1s + 2s elapsed between attempts; the final attempt
        // surfaces exhaustion without sleeping its 4s backoff.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_rotates_without_sleeping() {
        let pool = pool(vec![
            profile("primary/a", PoolBucket::Primary),
            profile("backup/b", PoolBucket::Backup),
        ]);
        let start = tokio::time::Instant::now();

        let text = policy()
            .run(&pool, |p, _| async move {
                if p.id == "primary/a" {
                    Err(AttemptError::Failed {
                        kind: FailureKind::RateLimited,
                        message: "429".into(),
                    })
                } else {
                    Ok("from backup".to_string())
                }
            })
            .await
            .unwrap();

        assert_eq!(text, "from backup");
        assert_eq!(start.elapsed(), Duration::ZERO, "no backoff on rate limit");
    }

    #[tokio::test]
    async fn quota_exceeded_rotates_to_next_bucket() {
        let pool = pool(vec![
            profile("primary/a", PoolBucket::Primary),
            profile("emergency/c", PoolBucket::Emergency),
        ]);

        let text = policy()
            .run(&pool, |p, _| async move {
                if p.id == "primary/a" {
                    Err(AttemptError::Failed {
                        kind: FailureKind::QuotaExceeded,
                        message: "quota".into(),
                    })
                } else {
                    Ok("from emergency".to_string())
                }
            })
            .await
            .unwrap();
        assert_eq!(text, "from emergency");
    }

    #[tokio::test]
    async fn timeout_surfaces_without_touching_pool() {
        let pool = pool(vec![profile("primary/a", PoolBucket::Primary)]);

        let err = policy()
            .run(&pool, |_, _| async {
                Err(AttemptError::Failed {
                    kind: FailureKind::Timeout,
                    message: "ceiling".into(),
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout));
        // The profile is still active and immediately reusable.
        let again = pool.current_or_select().await.unwrap();
        assert_eq!(again.id, "primary/a");
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot["active_profile"], "primary/a");
    }

    #[tokio::test]
    async fn cancellation_leaves_pool_untouched() {
        let pool = pool(vec![profile("primary/a", PoolBucket::Primary)]);
        let calls = AtomicU32::new(0);

        let err = policy()
            .run(&pool, |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AttemptError::Cancelled) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no retry after cancel");
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot["active_profile"], "primary/a");
        assert_eq!(snapshot["status"], "healthy");
    }

    #[tokio::test]
    async fn exhausted_pool_surfaces_rotation_exhausted() {
        let pool = pool(vec![]);
        let err = policy()
            .run(&pool, |_, _| async { Ok(String::new()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RotationExhausted { .. }));
    }
}
