//! Cluster service configuration
//!
//! Configuration is loaded with figment in precedence order (later overrides earlier):
//! 1. Default values
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `SAH_CLUSTER_`
//!
//! Every interval, timeout, multiplier and count must be strictly positive.
//! Invalid values are rejected, never clamped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bounded::BoundedTaskConfig;
use crate::error::{ClusterError, Result};
use crate::leader_info::LEADER_ID_LEN;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "SAH_CLUSTER_";

/// Unit of a configured time value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
}

impl TimeUnit {
    /// Convert `value` in this unit to a [`Duration`]
    pub fn to_duration(self, value: u64) -> Duration {
        match self {
            TimeUnit::Milliseconds => Duration::from_millis(value),
            TimeUnit::Seconds => Duration::from_secs(value),
            TimeUnit::Minutes => Duration::from_secs(value.saturating_mul(60)),
        }
    }
}

/// Configuration shared by every namespace of a cluster service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Directory holding one lock file per namespace
    pub root: PathBuf,
    /// Delay before the first lock attempt
    pub acquire_lock_delay: u64,
    pub acquire_lock_delay_unit: TimeUnit,
    /// Period between lock attempts, also the heartbeat period while leading
    pub acquire_lock_interval: u64,
    pub acquire_lock_interval_unit: TimeUnit,
    /// Multiple of the leader's declared interval after which an unchanged heartbeat is stale
    pub heartbeat_timeout_multiplier: u32,
    /// Attempts per bounded I/O task
    pub task_max_attempts: u32,
    /// Timeout of a single bounded I/O attempt
    pub task_timeout: u64,
    pub task_timeout_unit: TimeUnit,
    /// Size of the bounded I/O pool
    pub io_threads: usize,
    /// Identity written into leader records, a fresh UUID when unset
    pub member_id: Option<String>,
    /// Whether the leader refreshes its record every interval
    pub write_heartbeat: bool,
    /// Truncate and sync data plus metadata on every heartbeat write
    pub force_metadata: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("sah-cluster"),
            acquire_lock_delay: 1,
            acquire_lock_delay_unit: TimeUnit::Seconds,
            acquire_lock_interval: 10,
            acquire_lock_interval_unit: TimeUnit::Seconds,
            heartbeat_timeout_multiplier: 5,
            task_max_attempts: 5,
            task_timeout: 10,
            task_timeout_unit: TimeUnit::Seconds,
            io_threads: 4,
            member_id: None,
            write_heartbeat: true,
            force_metadata: false,
        }
    }
}

impl ClusterConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from defaults, an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            debug!("Loading cluster configuration from {}", path.display());
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Set the root directory
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Set the delay before the first lock attempt
    pub fn with_acquire_lock_delay(mut self, value: u64, unit: TimeUnit) -> Self {
        self.acquire_lock_delay = value;
        self.acquire_lock_delay_unit = unit;
        self
    }

    /// Set the period between lock attempts
    pub fn with_acquire_lock_interval(mut self, value: u64, unit: TimeUnit) -> Self {
        self.acquire_lock_interval = value;
        self.acquire_lock_interval_unit = unit;
        self
    }

    /// Set the heartbeat staleness multiplier
    pub fn with_heartbeat_timeout_multiplier(mut self, multiplier: u32) -> Self {
        self.heartbeat_timeout_multiplier = multiplier;
        self
    }

    /// Set the attempt budget of bounded I/O tasks
    pub fn with_task_max_attempts(mut self, attempts: u32) -> Self {
        self.task_max_attempts = attempts;
        self
    }

    /// Set the timeout of a single bounded I/O attempt
    pub fn with_task_timeout(mut self, value: u64, unit: TimeUnit) -> Self {
        self.task_timeout = value;
        self.task_timeout_unit = unit;
        self
    }

    /// Set the size of the bounded I/O pool
    pub fn with_io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads;
        self
    }

    /// Set the member identity
    pub fn with_member_id(mut self, id: impl Into<String>) -> Self {
        self.member_id = Some(id.into());
        self
    }

    /// Enable or disable heartbeat writes while leading
    pub fn with_write_heartbeat(mut self, enabled: bool) -> Self {
        self.write_heartbeat = enabled;
        self
    }

    /// Enable or disable metadata syncing on heartbeat writes
    pub fn with_force_metadata(mut self, enabled: bool) -> Self {
        self.force_metadata = enabled;
        self
    }

    /// Delay before the first lock attempt
    pub fn acquire_lock_delay(&self) -> Duration {
        self.acquire_lock_delay_unit
            .to_duration(self.acquire_lock_delay)
    }

    /// Period between lock attempts
    pub fn acquire_lock_interval(&self) -> Duration {
        self.acquire_lock_interval_unit
            .to_duration(self.acquire_lock_interval)
    }

    /// Timeout of a single bounded attempt
    pub fn task_timeout(&self) -> Duration {
        self.task_timeout_unit.to_duration(self.task_timeout)
    }

    /// Attempt budget handed to the bounded executor
    pub fn bounded_task_config(&self) -> BoundedTaskConfig {
        BoundedTaskConfig {
            max_attempts: self.task_max_attempts,
            timeout: self.task_timeout(),
        }
    }

    /// Check every value, failing on the first invalid one
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(ClusterError::invalid_config("root", "must not be empty"));
        }

        let positive = [
            ("acquire_lock_delay", self.acquire_lock_delay),
            ("acquire_lock_interval", self.acquire_lock_interval),
            ("task_timeout", self.task_timeout),
            (
                "heartbeat_timeout_multiplier",
                u64::from(self.heartbeat_timeout_multiplier),
            ),
            ("task_max_attempts", u64::from(self.task_max_attempts)),
            ("io_threads", self.io_threads as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ClusterError::invalid_config(key, "must be greater than 0"));
            }
        }

        if let Some(id) = &self.member_id {
            if id.is_empty() || id.len() > LEADER_ID_LEN || id.contains('\0') {
                return Err(ClusterError::invalid_config(
                    "member_id",
                    format!("must be 1 to {} bytes without NUL", LEADER_ID_LEN),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClusterConfig::new();
        config.validate().unwrap();
        assert_eq!(config.acquire_lock_delay(), Duration::from_secs(1));
        assert_eq!(config.acquire_lock_interval(), Duration::from_secs(10));
        assert_eq!(config.task_timeout(), Duration::from_secs(10));
        assert!(config.write_heartbeat);
    }

    #[test]
    fn test_time_unit_conversion() {
        assert_eq!(
            TimeUnit::Milliseconds.to_duration(250),
            Duration::from_millis(250)
        );
        assert_eq!(TimeUnit::Seconds.to_duration(3), Duration::from_secs(3));
        assert_eq!(TimeUnit::Minutes.to_duration(2), Duration::from_secs(120));
    }

    #[test]
    fn test_zero_values_are_rejected() {
        let cases = [
            ClusterConfig::new().with_acquire_lock_delay(0, TimeUnit::Seconds),
            ClusterConfig::new().with_acquire_lock_interval(0, TimeUnit::Seconds),
            ClusterConfig::new().with_task_timeout(0, TimeUnit::Milliseconds),
            ClusterConfig::new().with_heartbeat_timeout_multiplier(0),
            ClusterConfig::new().with_task_max_attempts(0),
            ClusterConfig::new().with_io_threads(0),
        ];

        for config in cases {
            let err = config.validate().unwrap_err();
            assert!(
                matches!(err, ClusterError::InvalidConfig { .. }),
                "unexpected error: {:?}",
                err
            );
            assert!(err.to_string().contains("must be greater than 0"));
        }
    }

    #[test]
    fn test_invalid_member_id_is_rejected() {
        let too_long = ClusterConfig::new().with_member_id("x".repeat(37));
        assert!(too_long.validate().is_err());

        let empty = ClusterConfig::new().with_member_id("");
        assert!(empty.validate().is_err());

        let fits = ClusterConfig::new().with_member_id("x".repeat(36));
        assert!(fits.validate().is_ok());
    }

    #[test]
    fn test_empty_root_is_rejected() {
        let err = ClusterConfig::new().with_root("").validate().unwrap_err();
        assert!(err.to_string().contains("'root'"));
    }

    #[test]
    #[serial]
    fn test_load_from_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.toml");
        fs::write(
            &path,
            r#"
root = "/mnt/shared/leaders"
acquire_lock_interval = 500
acquire_lock_interval_unit = "milliseconds"
task_max_attempts = 2
member_id = "node-a"
"#,
        )
        .unwrap();

        let config = ClusterConfig::load(Some(&path)).unwrap();
        assert_eq!(config.root, PathBuf::from("/mnt/shared/leaders"));
        assert_eq!(config.acquire_lock_interval(), Duration::from_millis(500));
        assert_eq!(config.task_max_attempts, 2);
        assert_eq!(config.member_id.as_deref(), Some("node-a"));
        assert_eq!(config.acquire_lock_delay(), Duration::from_secs(1));
    }

    #[test]
    #[serial]
    fn test_load_rejects_invalid_file_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.toml");
        fs::write(&path, "heartbeat_timeout_multiplier = 0\n").unwrap();

        let err = ClusterConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ClusterError::InvalidConfig { .. }));
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.toml");
        fs::write(&path, "task_max_attempts = 2\n").unwrap();

        std::env::set_var("SAH_CLUSTER_TASK_MAX_ATTEMPTS", "7");
        let config = ClusterConfig::load(Some(&path));
        std::env::remove_var("SAH_CLUSTER_TASK_MAX_ATTEMPTS");

        assert_eq!(config.unwrap().task_max_attempts, 7);
    }
}
