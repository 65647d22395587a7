//! Credential pool for the automation session
//!
//! Manages three prioritized buckets of auth profiles (primary, backup,
//! emergency) with a single-active invariant, cooldown/quarantine state
//! machine, and a structural canary check run before any promotion. Profiles
//! are opaque payloads loaded from the filesystem store; this layer never
//! interprets them beyond the canary.
//!
//! Profile lifecycle:
//! 1. Store scan at startup/on-demand loads every profile as `Unverified`
//! 2. `select_candidate` scans primary → backup → emergency, runs the canary
//!    on the first eligible profile, promotes it to `Active`
//! 3. Rate limit / quota outcome → `Cooling` until a per-kind deadline
//! 4. Canary or structural failure → `Quarantined` until an operator
//!    refreshes the payload externally
//! 5. Cooldown expiry is evaluated lazily at selection time; an expired
//!    `Cooling` profile is `Unverified` again and must re-pass the canary
//!
//! States are in-memory only: a process restart resets every profile to
//! `Unverified`.

pub mod canary;
pub mod error;
pub mod manager;
pub mod profile;
pub mod store;

pub use error::{Error, Result};
pub use manager::{CooldownConfig, PoolManager, SelectedProfile};
pub use profile::{AuthProfile, Outcome, PoolBucket, ProfileState};
pub use store::ProfileStore;
