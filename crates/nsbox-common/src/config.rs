//! Global configuration model for the nsbox runtime.
//!
//! Every field has a default, so an empty JSON object (or no file at all)
//! yields a usable configuration. Command-line flags override whatever is
//! loaded here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{NsboxError, Result};
use crate::types::{CpuQuota, ResourceLimits};

/// Retry policy for removing a control group whose members are still exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleasePolicy {
    /// Number of removal attempts, including the first.
    pub attempts: u32,
    /// Delay before the second attempt; doubled for each further attempt.
    pub initial_backoff_ms: u64,
}

impl ReleasePolicy {
    /// Returns the delay to wait after failed attempt number `attempt` (0-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }
}

impl Default for ReleasePolicy {
    fn default() -> Self {
        Self {
            attempts: constants::DEFAULT_RELEASE_ATTEMPTS,
            initial_backoff_ms: constants::DEFAULT_RELEASE_BACKOFF_MS,
        }
    }
}

/// Root configuration for the nsbox runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Pre-extracted minimal-userland tree used as the container root.
    pub rootfs: Option<PathBuf>,
    /// Mount point of the cgroup v2 unified hierarchy.
    pub cgroup_root: PathBuf,
    /// Group under which per-container groups are created.
    pub cgroup_parent: String,
    /// Hostname given to containers.
    pub hostname: String,
    /// Limits applied when the command line sets none.
    pub default_limits: ResourceLimits,
    /// Milliseconds between a forwarded termination signal and SIGKILL.
    pub stop_grace_ms: u64,
    /// Control group removal retry policy.
    pub release: ReleasePolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rootfs: None,
            cgroup_root: PathBuf::from(constants::CGROUP_V2_PATH),
            cgroup_parent: constants::DEFAULT_CGROUP_PARENT.to_string(),
            hostname: constants::DEFAULT_HOSTNAME.to_string(),
            default_limits: ResourceLimits {
                memory_max_bytes: Some(constants::DEFAULT_MEMORY_LIMIT),
                cpu_quota: Some(CpuQuota::from_percent(constants::DEFAULT_CPU_PERCENT)),
                cpu_weight: None,
            },
            stop_grace_ms: constants::DEFAULT_STOP_GRACE_MS,
            release: ReleasePolicy::default(),
        }
    }
}

impl RuntimeConfig {
    /// Loads the configuration from a JSON file, or defaults when `path` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// contains invalid values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|e| NsboxError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty or nested cgroup parent, a relative
    /// cgroup root, zero release attempts, or invalid default limits.
    pub fn validate(&self) -> Result<()> {
        if self.cgroup_parent.is_empty() || self.cgroup_parent.contains('/') {
            return Err(NsboxError::Config {
                message: format!("cgroup_parent must be a single name: {:?}", self.cgroup_parent),
            });
        }
        if !self.cgroup_root.is_absolute() {
            return Err(NsboxError::Config {
                message: "cgroup_root must be absolute".into(),
            });
        }
        if self.release.attempts == 0 {
            return Err(NsboxError::Config {
                message: "release.attempts must be at least 1".into(),
            });
        }
        self.default_limits.validate()
    }

    /// Grace period before escalating to SIGKILL.
    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_yields_defaults() {
        let config = RuntimeConfig::load(None).expect("defaults");
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nsbox.json");
        std::fs::write(
            &path,
            r#"{ "rootfs": "/srv/busybox", "default_limits": { "memory_max_bytes": 52428800 } }"#,
        )
        .expect("write config");

        let config = RuntimeConfig::load(Some(&path)).expect("load");
        assert_eq!(config.rootfs, Some(PathBuf::from("/srv/busybox")));
        assert_eq!(config.default_limits.memory_max_bytes, Some(52_428_800));
        assert_eq!(config.hostname, "nsbox");
        assert_eq!(config.release, ReleasePolicy::default());
    }

    #[test]
    fn defaults_cap_memory_and_cpu() {
        let limits = RuntimeConfig::default().default_limits;
        assert_eq!(limits.memory_max_bytes, Some(50 * 1024 * 1024));
        assert_eq!(limits.cpu_quota, Some(CpuQuota::from_percent(25)));
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn nested_parent_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nsbox.json");
        std::fs::write(&path, r#"{ "cgroup_parent": "a/b" }"#).expect("write config");
        assert!(RuntimeConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn unreadable_file_reports_path() {
        let err = RuntimeConfig::load(Some(Path::new("/nonexistent/nsbox.json"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/nsbox.json"));
    }

    #[test]
    fn backoff_doubles() {
        let policy = ReleasePolicy {
            attempts: 4,
            initial_backoff_ms: 10,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(40));
    }
}
