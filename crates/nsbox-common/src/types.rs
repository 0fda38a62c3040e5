//! Domain primitive types used across the nsbox workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{CPU_PERIOD_US, CPU_WEIGHT_MAX, EXIT_SIGNAL_BASE};
use crate::error::{NsboxError, Result};

/// Unique identifier for a container instance.
///
/// Doubles as the name of the container's control group, so two
/// concurrent launches never share limits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks that the ID can be used as a single cgroup directory name.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is empty, contains a path separator, or is
    /// a relative path component.
    pub fn validate(&self) -> Result<()> {
        let id = self.0.as_str();
        if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\0') {
            return Err(NsboxError::Config {
                message: format!("invalid container id: {id:?}"),
            });
        }
        Ok(())
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CPU bandwidth cap written to `cpu.max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuQuota {
    /// Runtime allowed per period, in microseconds.
    pub quota_us: u64,
    /// Accounting period, in microseconds.
    pub period_us: u64,
}

impl CpuQuota {
    /// Builds a quota from a percentage of one CPU (`200` means two CPUs).
    #[must_use]
    pub const fn from_percent(percent: u32) -> Self {
        Self {
            quota_us: percent as u64 * (CPU_PERIOD_US / 100),
            period_us: CPU_PERIOD_US,
        }
    }
}

impl fmt::Display for CpuQuota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.quota_us, self.period_us)
    }
}

/// Resource limits for a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Hard memory ceiling in bytes (`memory.max`).
    pub memory_max_bytes: Option<u64>,
    /// CPU bandwidth cap (`cpu.max`).
    pub cpu_quota: Option<CpuQuota>,
    /// Relative CPU share, 1..=10000 (`cpu.weight`).
    pub cpu_weight: Option<u64>,
}

impl ResourceLimits {
    /// Returns `true` when no limit is set.
    #[must_use]
    pub const fn is_unbounded(&self) -> bool {
        self.memory_max_bytes.is_none() && self.cpu_quota.is_none() && self.cpu_weight.is_none()
    }

    /// Fills every unset limit from `defaults`.
    #[must_use]
    pub fn or(self, defaults: &Self) -> Self {
        Self {
            memory_max_bytes: self.memory_max_bytes.or(defaults.memory_max_bytes),
            cpu_quota: self.cpu_quota.or(defaults.cpu_quota),
            cpu_weight: self.cpu_weight.or(defaults.cpu_weight),
        }
    }

    /// Validates that every set limit is accepted by the kernel.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero memory ceiling, a zero quota or period,
    /// or a weight outside `1..=10000`.
    pub fn validate(&self) -> Result<()> {
        if self.memory_max_bytes == Some(0) {
            return Err(NsboxError::Config {
                message: "memory limit must be greater than zero".into(),
            });
        }
        if let Some(q) = self.cpu_quota {
            if q.quota_us == 0 || q.period_us == 0 {
                return Err(NsboxError::Config {
                    message: format!("invalid cpu quota: {q}"),
                });
            }
        }
        if let Some(w) = self.cpu_weight {
            if !(1..=CPU_WEIGHT_MAX).contains(&w) {
                return Err(NsboxError::Config {
                    message: format!("cpu weight {w} outside 1..={CPU_WEIGHT_MAX}"),
                });
            }
        }
        Ok(())
    }
}

/// Set of kernel namespaces requested for the child.
///
/// A logical value only; it is consumed once when the child is created.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSet {
    /// Private process-ID tree.
    pub pid: bool,
    /// Private network stack.
    pub network: bool,
    /// Private mount table.
    pub mount: bool,
    /// Private hostname and domain name.
    pub uts: bool,
    /// Private System V IPC and POSIX message queues.
    pub ipc: bool,
}

impl NamespaceSet {
    /// Requests every namespace the runtime knows about.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            pid: true,
            network: true,
            mount: true,
            uts: true,
            ipc: true,
        }
    }

    /// Returns the short names of the requested namespaces.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        [
            (self.pid, "pid"),
            (self.network, "net"),
            (self.mount, "mnt"),
            (self.uts, "uts"),
            (self.ipc, "ipc"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }
}

impl Default for NamespaceSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Lifecycle state of a container process.
///
/// States only move forward; no state is ever revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Child exists with its namespaces but has not pivoted yet.
    Created,
    /// Root filesystem has been pivoted.
    Jailed,
    /// The target program replaced the bootstrap code.
    Running,
    /// Exit status has been captured.
    Exited,
    /// Resources have been released.
    Reaped,
}

impl ContainerState {
    /// Returns whether moving from `self` to `next` goes strictly forward.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        next > self
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Jailed => write!(f, "jailed"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Reaped => write!(f, "reaped"),
        }
    }
}

/// How a container's PID 1 terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Normal exit with the given code.
    Exited(i32),
    /// Killed by the given signal number.
    Signaled(i32),
}

impl ExitStatus {
    /// Returns the exit code the runtime mirrors to its own caller.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(sig) => EXIT_SIGNAL_BASE + sig,
        }
    }

    /// Returns `true` for a normal exit with code zero.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Returns the terminating signal, if any.
    #[must_use]
    pub const fn signal(self) -> Option<i32> {
        match self {
            Self::Signaled(sig) => Some(sig),
            Self::Exited(_) => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(sig) => write!(f, "killed by signal {sig}"),
        }
    }
}
