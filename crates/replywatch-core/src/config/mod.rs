//! Environment-driven service configuration.
//!
//! Every replica reads the same variables; `POD_ID` is the only value that
//! must differ per replica and defaults to `<hostname>-<random>`. Malformed
//! numeric values fall back to their defaults rather than failing startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default base timeout interval N in milliseconds.
pub const DEFAULT_TIMEOUT_INTERVAL_MS: i64 = 30_000;

/// Default detector scan cadence in milliseconds.
pub const DEFAULT_CHECK_INTERVAL_MS: i64 = 1_000;

/// Default leader lease TTL in seconds.
pub const DEFAULT_LEADER_TTL_SECS: u64 = 10;

/// Default interval between lease acquisition attempts in seconds.
pub const DEFAULT_ELECTION_INTERVAL_SECS: u64 = 5;

/// Default interval between cleanup passes.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3_600;

/// Default maximum age of a waiting entry before cleanup removes it.
pub const DEFAULT_MAX_AGE_SECS: u64 = 24 * 3_600;

/// Default ingress HTTP port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default metrics HTTP port.
pub const DEFAULT_METRICS_PORT: u16 = 9090;

/// Default consumer group name.
pub const DEFAULT_CONSUMER_GROUP: &str = "timeout-processors";

/// Default store URL.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Maximum entries per consumer group read.
pub const CONSUMER_BATCH: usize = 10;

/// Server-side block timeout for consumer group reads.
pub const CONSUMER_BLOCK: Duration = Duration::from_secs(1);

/// Interval between pending-message recovery passes.
pub const RECOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Minimum idle time before a pending entry may be claimed.
pub const RECOVERY_MIN_IDLE: Duration = Duration::from_secs(60);

/// Service configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Store connection URL (`REDIS_URL`).
    pub redis_url: String,

    /// Base timeout interval N in ms (`TIMEOUT_INTERVAL_MS`).
    pub timeout_interval_ms: i64,

    /// Detector scan cadence in ms (`CHECK_INTERVAL_MS`).
    pub check_interval_ms: i64,

    /// Leader lease TTL in seconds (`LEADER_ELECTION_TTL`).
    pub leader_ttl_secs: u64,

    /// Interval between lease acquisition attempts in seconds.
    pub election_interval_secs: u64,

    /// This replica's identity (`POD_ID`).
    pub pod_id: String,

    /// Ingress HTTP port (`PORT`).
    pub port: u16,

    /// Consumer group name (`CONSUMER_GROUP_NAME`).
    pub consumer_group: String,

    /// Log level (`LOG_LEVEL`).
    pub log_level: String,

    /// Metrics HTTP port (`METRICS_PORT`).
    pub metrics_port: u16,

    /// Interval between cleanup passes in seconds.
    pub cleanup_interval_secs: u64,

    /// Maximum age of a waiting entry in seconds before cleanup.
    pub max_age_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            timeout_interval_ms: DEFAULT_TIMEOUT_INTERVAL_MS,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            leader_ttl_secs: DEFAULT_LEADER_TTL_SECS,
            election_interval_secs: DEFAULT_ELECTION_INTERVAL_SECS,
            pod_id: generate_pod_id(),
            port: DEFAULT_PORT,
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            log_level: "info".to_string(),
            metrics_port: DEFAULT_METRICS_PORT,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            max_age_secs: DEFAULT_MAX_AGE_SECS,
        }
    }
}

impl Config {
    /// Loads configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            redis_url: env_string("REDIS_URL", DEFAULT_REDIS_URL),
            timeout_interval_ms: env_parse("TIMEOUT_INTERVAL_MS", DEFAULT_TIMEOUT_INTERVAL_MS),
            check_interval_ms: env_parse("CHECK_INTERVAL_MS", DEFAULT_CHECK_INTERVAL_MS),
            leader_ttl_secs: env_parse("LEADER_ELECTION_TTL", DEFAULT_LEADER_TTL_SECS),
            election_interval_secs: env_parse(
                "LEADER_ELECTION_INTERVAL",
                DEFAULT_ELECTION_INTERVAL_SECS,
            ),
            pod_id: std::env::var("POD_ID")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(generate_pod_id),
            port: env_parse("PORT", DEFAULT_PORT),
            consumer_group: env_string("CONSUMER_GROUP_NAME", DEFAULT_CONSUMER_GROUP),
            log_level: env_string("LOG_LEVEL", "info"),
            metrics_port: env_parse("METRICS_PORT", DEFAULT_METRICS_PORT),
            cleanup_interval_secs: env_parse("CLEANUP_INTERVAL", DEFAULT_CLEANUP_INTERVAL_SECS),
            max_age_secs: env_parse("CLEANUP_MAX_AGE", DEFAULT_MAX_AGE_SECS),
        }
    }

    /// Base timeout interval N as a [`Duration`].
    #[must_use]
    pub fn timeout_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_interval_ms.max(0).unsigned_abs())
    }

    /// Detector scan cadence as a [`Duration`].
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(0).unsigned_abs())
    }

    /// Leader lease TTL as a [`Duration`].
    #[must_use]
    pub const fn leader_ttl(&self) -> Duration {
        Duration::from_secs(self.leader_ttl_secs)
    }

    /// Interval between lease acquisition attempts as a [`Duration`].
    #[must_use]
    pub const fn election_interval(&self) -> Duration {
        Duration::from_secs(self.election_interval_secs)
    }

    /// Interval between cleanup passes as a [`Duration`].
    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Maximum waiting-entry age as milliseconds.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // ages far below i64::MAX ms
    pub const fn max_age_ms(&self) -> i64 {
        (self.max_age_secs * 1_000) as i64
    }

    /// Consumer name for this replica within the consumer group.
    #[must_use]
    pub fn consumer_name(&self) -> String {
        format!("consumer-{}", self.pod_id)
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Generates a replica identity from the hostname plus a random suffix.
fn generate_pod_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    match nix::unistd::gethostname() {
        Ok(name) => format!("{}-{}", name.to_string_lossy(), &suffix[..8]),
        Err(_) => suffix,
    }
}
