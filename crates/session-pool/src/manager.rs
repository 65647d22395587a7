//! Pool manager: selection, promotion, and outcome bookkeeping
//!
//! All state lives behind one async mutex, so candidate selection and outcome
//! reporting are linearizable: at most one profile is `Active` at any instant,
//! and a selection that races an outcome report sees the post-report states.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::canary;
use crate::error::{Error, Result};
use crate::profile::{AuthProfile, Outcome, PoolBucket, ProfileState};
use crate::store::ProfileStore;

/// Per-outcome cooldown windows.
#[derive(Debug, Clone, Copy)]
pub struct CooldownConfig {
    /// Window applied on `RateLimited` and `Forbidden` outcomes.
    pub rate_limit: Duration,
    /// Window applied on `QuotaExceeded`; typically much longer.
    pub quota_exceeded: Duration,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            rate_limit: Duration::from_secs(60),
            quota_exceeded: Duration::from_secs(3600),
        }
    }
}

/// A profile the manager promoted to `Active`, handed to the caller for the
/// duration of one request attempt.
#[derive(Debug, Clone)]
pub struct SelectedProfile {
    pub id: String,
    pub bucket: PoolBucket,
    pub payload: String,
}

struct PoolInner {
    profiles: Vec<AuthProfile>,
    /// Index of the profile currently `Active`, if any.
    active: Option<usize>,
}

/// Owns the profile set and enforces the single-active invariant.
pub struct PoolManager {
    inner: Mutex<PoolInner>,
    cooldowns: CooldownConfig,
}

impl PoolManager {
    /// Build a manager over an already-loaded profile set.
    pub fn new(profiles: Vec<AuthProfile>, cooldowns: CooldownConfig) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                profiles,
                active: None,
            }),
            cooldowns,
        }
    }

    /// Scan the store and build a manager with every profile `Unverified`.
    pub async fn from_store(store: &ProfileStore, cooldowns: CooldownConfig) -> Result<Self> {
        let profiles = store
            .scan()
            .await?
            .into_iter()
            .map(|(bucket, id, payload)| AuthProfile::unverified(id, bucket, payload))
            .collect();
        Ok(Self::new(profiles, cooldowns))
    }

    /// Return the currently active profile, selecting one if none is active.
    pub async fn current_or_select(&self) -> Result<SelectedProfile> {
        let mut inner = self.inner.lock().await;
        if let Some(idx) = inner.active {
            let p = &inner.profiles[idx];
            if p.state == ProfileState::Active {
                return Ok(SelectedProfile {
                    id: p.id.clone(),
                    bucket: p.bucket,
                    payload: p.payload.expose().clone(),
                });
            }
            // Outcome reporting demoted it without clearing the slot;
            // fall through to a fresh selection.
            inner.active = None;
        }
        self.select_locked(&mut inner)
    }

    /// Demote any current active profile and promote the next eligible one.
    ///
    /// Scans primary → backup → emergency. Expired cooldowns are cleared
    /// lazily here; each candidate must pass the canary before promotion, and
    /// a canary failure quarantines it and moves the scan on. Returns
    /// `RotationExhausted` when no profile can be promoted.
    pub async fn select_candidate(&self) -> Result<SelectedProfile> {
        let mut inner = self.inner.lock().await;
        if let Some(idx) = inner.active.take() {
            let p = &mut inner.profiles[idx];
            // A profile still Active was not demoted by an outcome report;
            // it goes back to the candidate set rather than being punished.
            if p.state == ProfileState::Active {
                p.state = ProfileState::Unverified;
            }
        }
        self.select_locked(&mut inner)
    }

    fn select_locked(&self, inner: &mut PoolInner) -> Result<SelectedProfile> {
        let now = Instant::now();
        let now_secs = unix_now_secs();

        for bucket in PoolBucket::SCAN_ORDER {
            // Store scan already ordered profiles; filter per bucket to keep
            // the priority order explicit even if the vec was built by hand.
            for idx in 0..inner.profiles.len() {
                if inner.profiles[idx].bucket != bucket {
                    continue;
                }
                let p = &mut inner.profiles[idx];
                match p.state {
                    ProfileState::Quarantined => continue,
                    ProfileState::Active => continue,
                    ProfileState::Cooling { until } if until > now => continue,
                    ProfileState::Cooling { .. } => {
                        // Lazy expiry: back to the candidate set, but it must
                        // re-pass the canary like any unverified profile.
                        p.state = ProfileState::Unverified;
                    }
                    ProfileState::Unverified => {}
                }

                match canary::check(p.payload.expose(), now_secs) {
                    Ok(()) => {
                        p.state = ProfileState::Active;
                        p.last_failure = None;
                        inner.active = Some(idx);
                        let p = &inner.profiles[idx];
                        info!(profile_id = %p.id, bucket = p.bucket.dir_name(), "profile promoted to active");
                        metrics::counter!("pool_promotions_total").increment(1);
                        return Ok(SelectedProfile {
                            id: p.id.clone(),
                            bucket: p.bucket,
                            payload: p.payload.expose().clone(),
                        });
                    }
                    Err(e) => {
                        warn!(profile_id = %p.id, error = %e, "canary failed, quarantining profile");
                        p.state = ProfileState::Quarantined;
                        p.consecutive_failures += 1;
                        metrics::counter!("pool_quarantines_total").increment(1);
                    }
                }
            }
        }

        Err(self.exhausted(inner, now))
    }

    fn exhausted(&self, inner: &PoolInner, now: Instant) -> Error {
        let mut cooling = 0usize;
        let mut quarantined = 0usize;
        let mut earliest: Option<Instant> = None;
        for p in &inner.profiles {
            match p.state {
                ProfileState::Cooling { until } => {
                    cooling += 1;
                    earliest = Some(earliest.map_or(until, |e| e.min(until)));
                }
                ProfileState::Quarantined => quarantined += 1,
                _ => {}
            }
        }
        let retry_after = earliest.map(|e| e.saturating_duration_since(now));
        warn!(
            total = inner.profiles.len(),
            cooling, quarantined, "every profile unavailable, rotation exhausted"
        );
        metrics::counter!("pool_rotation_exhausted_total").increment(1);
        Error::RotationExhausted {
            detail: format!(
                "{} profiles: {cooling} cooling, {quarantined} quarantined",
                inner.profiles.len()
            ),
            retry_after,
        }
    }

    /// Report the terminal outcome of a request made with `profile_id`.
    ///
    /// Non-success outcomes demote the profile and clear the active slot so
    /// the next selection starts from a clean scan.
    pub async fn mark_outcome(&self, profile_id: &str, outcome: Outcome) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let idx = inner
            .profiles
            .iter()
            .position(|p| p.id == profile_id)
            .ok_or_else(|| Error::NotFound(profile_id.to_string()))?;

        let cooldown = match outcome {
            Outcome::Success => {
                let p = &mut inner.profiles[idx];
                p.consecutive_failures = 0;
                p.last_failure = None;
                return Ok(());
            }
            Outcome::RateLimited | Outcome::Forbidden => Some(self.cooldowns.rate_limit),
            Outcome::QuotaExceeded => Some(self.cooldowns.quota_exceeded),
            Outcome::CanaryFailed => None,
        };

        let p = &mut inner.profiles[idx];
        p.consecutive_failures += 1;
        p.last_failure = Some(match outcome {
            Outcome::Forbidden => driver::FailureKind::Forbidden,
            Outcome::RateLimited => driver::FailureKind::RateLimited,
            Outcome::QuotaExceeded => driver::FailureKind::QuotaExceeded,
            _ => driver::FailureKind::Unknown,
        });
        match cooldown {
            Some(window) => {
                p.state = ProfileState::Cooling {
                    until: Instant::now() + window,
                };
                info!(
                    profile_id = %p.id,
                    cooldown_secs = window.as_secs(),
                    "profile cooling after failure"
                );
                metrics::counter!("pool_cooldowns_total").increment(1);
            }
            None => {
                p.state = ProfileState::Quarantined;
                warn!(profile_id = %p.id, "profile quarantined");
                metrics::counter!("pool_quarantines_total").increment(1);
            }
        }

        if inner.active == Some(idx) {
            inner.active = None;
        }
        Ok(())
    }

    /// Health snapshot: per-bucket state counts plus the active profile id.
    pub async fn snapshot(&self) -> serde_json::Value {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let buckets: Vec<serde_json::Value> = PoolBucket::SCAN_ORDER
            .iter()
            .map(|bucket| {
                let mut counts = [0usize; 4];
                for p in inner.profiles.iter().filter(|p| p.bucket == *bucket) {
                    let slot = match p.state {
                        ProfileState::Unverified => 0,
                        ProfileState::Active => 1,
                        // An expired cooldown reads as available even before
                        // a selection lazily clears it.
                        ProfileState::Cooling { until } if until > now => 2,
                        ProfileState::Cooling { .. } => 0,
                        ProfileState::Quarantined => 3,
                    };
                    counts[slot] += 1;
                }
                serde_json::json!({
                    "bucket": bucket.dir_name(),
                    "unverified": counts[0],
                    "active": counts[1],
                    "cooling": counts[2],
                    "quarantined": counts[3],
                })
            })
            .collect();

        let active_id = inner
            .active
            .and_then(|idx| inner.profiles.get(idx))
            .filter(|p| p.state == ProfileState::Active)
            .map(|p| p.id.clone());

        let any_available = inner.profiles.iter().any(|p| match p.state {
            ProfileState::Unverified | ProfileState::Active => true,
            ProfileState::Cooling { until } => until <= now,
            ProfileState::Quarantined => false,
        });

        serde_json::json!({
            "status": if active_id.is_some() {
                "healthy"
            } else if any_available {
                "degraded"
            } else {
                "unhealthy"
            },
            "active_profile": active_id,
            "buckets": buckets,
        })
    }
}

fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
