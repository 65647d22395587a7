//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults. The env overlay
//! accepts the operational knob names used by the deployment tooling
//! (RATE_LIMIT_COOLDOWN_SECONDS and friends) so a container can be tuned
//! without editing the TOML.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub pools: PoolsConfig,
    #[serde(default)]
    pub cooldown: CooldownSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub channels: ChannelsSection,
    pub intercept: InterceptSection,
    #[serde(default)]
    pub driver: DriverSection,
}

/// API listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Credential pool store location
#[derive(Debug, Deserialize)]
pub struct PoolsConfig {
    pub dir: PathBuf,
}

/// Cooldown windows applied by the pool on failure outcomes
#[derive(Debug, Deserialize)]
pub struct CooldownSection {
    #[serde(default = "default_rate_limit_secs")]
    pub rate_limit_secs: u64,
    #[serde(default = "default_quota_exceeded_secs")]
    pub quota_exceeded_secs: u64,
}

/// Retry budget and backoff shape for 403 bursts
#[derive(Debug, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

/// Retrieval channel timers
#[derive(Debug, Deserialize)]
pub struct ChannelsSection {
    /// T1: no first byte on the tap within this window starts the poller.
    #[serde(default = "default_first_byte_timeout_ms")]
    pub first_byte_timeout_ms: u64,
    /// T2: no terminal within this window starts the harvest fallback.
    #[serde(default = "default_escalation_timeout_ms")]
    pub escalation_timeout_ms: u64,
    /// Hard per-request ceiling.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Interception proxy settings
#[derive(Debug, Deserialize)]
pub struct InterceptSection {
    pub listen_addr: SocketAddr,
    pub root_ca_path: PathBuf,
}

/// Automation sidecar endpoint
#[derive(Debug, Deserialize)]
pub struct DriverSection {
    #[serde(default = "default_driver_base_url")]
    pub base_url: String,
}

fn default_max_connections() -> usize {
    1000
}
fn default_rate_limit_secs() -> u64 {
    60
}
fn default_quota_exceeded_secs() -> u64 {
    3600
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_secs() -> u64 {
    1
}
fn default_backoff_cap_secs() -> u64 {
    30
}
fn default_first_byte_timeout_ms() -> u64 {
    1500
}
fn default_escalation_timeout_ms() -> u64 {
    8000
}
fn default_request_timeout_ms() -> u64 {
    120_000
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_driver_base_url() -> String {
    "http://127.0.0.1:9333".to_string()
}

impl Default for CooldownSection {
    fn default() -> Self {
        Self {
            rate_limit_secs: default_rate_limit_secs(),
            quota_exceeded_secs: default_quota_exceeded_secs(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

impl Default for ChannelsSection {
    fn default() -> Self {
        Self {
            first_byte_timeout_ms: default_first_byte_timeout_ms(),
            escalation_timeout_ms: default_escalation_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            base_url: default_driver_base_url(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, overlay env vars, validate.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_overlay()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overlay(&mut self) -> common::Result<()> {
        overlay_u64("RATE_LIMIT_COOLDOWN_SECONDS", &mut self.cooldown.rate_limit_secs)?;
        overlay_u64(
            "QUOTA_EXCEEDED_COOLDOWN_SECONDS",
            &mut self.cooldown.quota_exceeded_secs,
        )?;
        overlay_u64("BACKOFF_BASE_SECONDS", &mut self.retry.backoff_base_secs)?;
        overlay_u64("BACKOFF_CAP_SECONDS", &mut self.retry.backoff_cap_secs)?;
        overlay_u64("CHANNEL_T1_MS", &mut self.channels.first_byte_timeout_ms)?;
        overlay_u64("CHANNEL_T2_MS", &mut self.channels.escalation_timeout_ms)?;
        overlay_u64("REQUEST_TIMEOUT_MS", &mut self.channels.request_timeout_ms)?;

        if let Ok(raw) = std::env::var("MAX_RETRY_ATTEMPTS") {
            self.retry.max_attempts = raw.parse().map_err(|_| {
                common::Error::Config(format!("MAX_RETRY_ATTEMPTS is not a number: {raw}"))
            })?;
        }
        if let Ok(raw) = std::env::var("ROOT_CA_STORAGE_PATH") {
            self.intercept.root_ca_path = PathBuf::from(raw);
        }
        if let Ok(raw) = std::env::var("DRIVER_BASE_URL") {
            self.driver.base_url = raw;
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(common::Error::Config(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }
        if self.channels.first_byte_timeout_ms == 0
            || self.channels.escalation_timeout_ms == 0
            || self.channels.request_timeout_ms == 0
            || self.channels.poll_interval_ms == 0
        {
            return Err(common::Error::Config(
                "channel timers must all be greater than 0".into(),
            ));
        }
        // A zero window would let a profile enter Cooling with a deadline
        // that is already due.
        if self.cooldown.rate_limit_secs == 0 || self.cooldown.quota_exceeded_secs == 0 {
            return Err(common::Error::Config(
                "cooldown windows must be greater than 0".into(),
            ));
        }
        if self.channels.first_byte_timeout_ms >= self.channels.escalation_timeout_ms {
            return Err(common::Error::Config(format!(
                "first_byte_timeout_ms ({}) must be less than escalation_timeout_ms ({})",
                self.channels.first_byte_timeout_ms, self.channels.escalation_timeout_ms
            )));
        }
        if self.channels.escalation_timeout_ms >= self.channels.request_timeout_ms {
            return Err(common::Error::Config(format!(
                "escalation_timeout_ms ({}) must be less than request_timeout_ms ({})",
                self.channels.escalation_timeout_ms, self.channels.request_timeout_ms
            )));
        }
        if !self.pools.dir.is_dir() {
            return Err(common::Error::Config(format!(
                "pools.dir is not a directory: {}",
                self.pools.dir.display()
            )));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-gateway.toml")
    }

    pub fn first_byte_timeout(&self) -> Duration {
        Duration::from_millis(self.channels.first_byte_timeout_ms)
    }

    pub fn escalation_timeout(&self) -> Duration {
        Duration::from_millis(self.channels.escalation_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.channels.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.channels.poll_interval_ms)
    }
}

fn overlay_u64(var: &str, target: &mut u64) -> common::Result<()> {
    if let Ok(raw) = std::env::var(var) {
        *target = raw
            .parse()
            .map_err(|_| common::Error::Config(format!("{var} is not a number: {raw}")))?;
    }
    Ok(())
}
