//! Auth profile model and state machine

use common::Secret;
use driver::FailureKind;
use tokio::time::Instant;

/// Named credential bucket, scanned in fixed priority order.
///
/// `backup` and `emergency` hold separate, non-duplicated profiles used only
/// once the buckets before them are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolBucket {
    Primary,
    Backup,
    Emergency,
}

impl PoolBucket {
    /// Fixed scan order: primary → backup → emergency.
    pub const SCAN_ORDER: [PoolBucket; 3] =
        [PoolBucket::Primary, PoolBucket::Backup, PoolBucket::Emergency];

    /// Directory name under the profile store root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            PoolBucket::Primary => "primary",
            PoolBucket::Backup => "backup",
            PoolBucket::Emergency => "emergency",
        }
    }
}

/// Runtime state of a profile.
///
/// Transitions:
/// - Unverified → Active (canary pass at selection)
/// - Active → Cooling (rate limit / quota / forbidden outcome)
/// - Cooling → Unverified (cooldown expired, lazily at selection time)
/// - any → Quarantined (canary/structural failure; terminal until an
///   operator refreshes the payload)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileState {
    Unverified,
    Active,
    Cooling { until: Instant },
    Quarantined,
}

impl ProfileState {
    /// State label for health output and logging.
    pub fn label(&self) -> &'static str {
        match self {
            ProfileState::Unverified => "unverified",
            ProfileState::Active => "active",
            ProfileState::Cooling { .. } => "cooling",
            ProfileState::Quarantined => "quarantined",
        }
    }
}

/// Terminal request outcome reported back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// 403 burst member; cools the profile so the retry loop cannot
    /// re-select it within the same burst
    Forbidden,
    RateLimited,
    QuotaExceeded,
    CanaryFailed,
}

/// One credential profile with its opaque payload and runtime state.
#[derive(Debug)]
pub struct AuthProfile {
    pub id: String,
    pub bucket: PoolBucket,
    pub payload: Secret<String>,
    pub state: ProfileState,
    pub last_failure: Option<FailureKind>,
    pub consecutive_failures: u32,
}

impl AuthProfile {
    /// A freshly loaded profile: unverified, no failure history.
    pub fn unverified(id: String, bucket: PoolBucket, payload: Secret<String>) -> Self {
        Self {
            id,
            bucket,
            payload,
            state: ProfileState::Unverified,
            last_failure: None,
            consecutive_failures: 0,
        }
    }
}
