//! Cgroups v2 resource management.
//!
//! The limiter never touches control files directly: every operation goes
//! through a [`ControlGroupBackend`], implemented for the real unified
//! hierarchy by [`v2::CgroupV2`] and, for tests, by an in-memory fake.
//!
//! A container's group lives at `<mount>/<parent>/<container-id>` and is
//! created with all limits written before the child is attached.

pub mod cpu;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod memory;
pub mod pressure;
pub mod v2;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nsbox_common::config::{ReleasePolicy, RuntimeConfig};
use nsbox_common::constants::REQUIRED_CONTROLLERS;
use nsbox_common::error::{NsboxError, Result};
use nsbox_common::spec::ContainerSpec;
use nsbox_common::types::{CpuQuota, ResourceLimits};
use serde::Serialize;

pub use cpu::CpuStat;
pub use memory::MemoryEvents;
pub use pressure::Pressure;

/// One value written to a control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// Hard memory ceiling in bytes (`memory.max`).
    MemoryMax(u64),
    /// Swap ceiling in bytes (`memory.swap.max`).
    SwapMax(u64),
    /// Kill the whole group on OOM (`memory.oom.group`).
    OomGroup(bool),
    /// Bandwidth cap (`cpu.max`).
    CpuMax(CpuQuota),
    /// Relative share under contention (`cpu.weight`).
    CpuWeight(u64),
}

impl Limit {
    /// Control file the limit is written to.
    #[must_use]
    pub const fn control_file(&self) -> &'static str {
        match self {
            Self::MemoryMax(_) => "memory.max",
            Self::SwapMax(_) => "memory.swap.max",
            Self::OomGroup(_) => "memory.oom.group",
            Self::CpuMax(_) => "cpu.max",
            Self::CpuWeight(_) => "cpu.weight",
        }
    }

    /// Value in the format the kernel expects.
    #[must_use]
    pub fn value(&self) -> String {
        match self {
            Self::MemoryMax(bytes) | Self::SwapMax(bytes) => bytes.to_string(),
            Self::OomGroup(on) => u8::from(*on).to_string(),
            Self::CpuMax(quota) => quota.to_string(),
            Self::CpuWeight(weight) => weight.to_string(),
        }
    }

    /// Whether the limit is skipped when the kernel lacks its control file.
    ///
    /// `memory.swap.max` is absent without swap accounting and
    /// `memory.oom.group` on kernels older than 4.19.
    #[must_use]
    pub const fn is_optional(&self) -> bool {
        matches!(self, Self::SwapMax(_) | Self::OomGroup(_))
    }

    /// Expands resource limits into the control-file writes that enforce them.
    #[must_use]
    pub fn expand(limits: &ResourceLimits) -> Vec<Self> {
        let mut out = Vec::new();
        if let Some(bytes) = limits.memory_max_bytes {
            out.push(Self::MemoryMax(bytes));
            out.push(Self::SwapMax(0));
            out.push(Self::OomGroup(true));
        }
        if let Some(quota) = limits.cpu_quota {
            out.push(Self::CpuMax(quota));
        }
        if let Some(weight) = limits.cpu_weight {
            out.push(Self::CpuWeight(weight));
        }
        out
    }
}

/// Outcome of one attempt to remove a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The group existed and is gone now.
    Removed,
    /// There was nothing to remove.
    Absent,
    /// The kernel still counts members in the group.
    Busy,
}

/// Snapshot of a group's resource consumption.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    /// Bytes currently charged (`memory.current`).
    pub memory_current: u64,
    /// High-water mark (`memory.peak`), when the kernel provides it.
    pub memory_peak: Option<u64>,
    /// Counters from `memory.events`.
    pub memory_events: MemoryEvents,
    /// Counters from `cpu.stat`.
    pub cpu: CpuStat,
    /// Memory pressure stall information.
    pub memory_pressure: Option<Pressure>,
    /// CPU pressure stall information.
    pub cpu_pressure: Option<Pressure>,
}

/// Narrow interface over a cgroup hierarchy.
///
/// Groups are named by paths relative to the hierarchy's mount point.
pub trait ControlGroupBackend: fmt::Debug + Send + Sync {
    /// Absolute location of `group`, for diagnostics.
    fn location(&self, group: &Path) -> PathBuf;

    /// Checks that `required` controllers exist and delegates them down to
    /// `parent`, creating `parent` if needed.
    ///
    /// # Errors
    ///
    /// Fails when the hierarchy is not cgroup v2 or a controller is missing.
    fn prepare(&self, parent: &Path, required: &[&str]) -> Result<()>;

    /// Creates an empty group.
    ///
    /// # Errors
    ///
    /// Fails if the group already exists or cannot be created.
    fn create(&self, group: &Path) -> Result<()>;

    /// Writes one limit.
    ///
    /// # Errors
    ///
    /// Fails if the kernel rejects the value or a required file is missing.
    fn set_limit(&self, group: &Path, limit: Limit) -> Result<()>;

    /// Moves a process into the group.
    ///
    /// # Errors
    ///
    /// Fails if the PID cannot be written to `cgroup.procs`.
    fn attach(&self, group: &Path, pid: u32) -> Result<()>;

    /// Lists the PIDs currently in the group.
    ///
    /// # Errors
    ///
    /// Fails if `cgroup.procs` cannot be read.
    fn members(&self, group: &Path) -> Result<Vec<u32>>;

    /// Sends SIGKILL to every member of the group.
    ///
    /// # Errors
    ///
    /// Fails if the kill request cannot be issued.
    fn kill_members(&self, group: &Path) -> Result<()>;

    /// Attempts once to remove the group.
    ///
    /// # Errors
    ///
    /// Fails for any reason other than absence or remaining members.
    fn remove(&self, group: &Path) -> Result<Removal>;

    /// Reads current usage and pressure.
    ///
    /// # Errors
    ///
    /// Fails if the mandatory accounting files cannot be read.
    fn query_usage(&self, group: &Path) -> Result<ResourceUsage>;
}

/// Allocates per-container control groups.
#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    backend: Arc<dyn ControlGroupBackend>,
    parent: PathBuf,
    release: ReleasePolicy,
}

impl ResourceLimiter {
    /// Creates a limiter placing groups under `parent`.
    pub fn new(
        backend: Arc<dyn ControlGroupBackend>,
        parent: impl Into<PathBuf>,
        release: ReleasePolicy,
    ) -> Self {
        Self {
            backend,
            parent: parent.into(),
            release,
        }
    }

    /// Creates a limiter over the real cgroup v2 hierarchy described by `config`.
    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            Arc::new(v2::CgroupV2::new(&config.cgroup_root)),
            &config.cgroup_parent,
            config.release,
        )
    }

    /// Backend in use.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ControlGroupBackend> {
        &self.backend
    }

    /// Creates the container's group and writes every limit from `spec`.
    ///
    /// Nothing is left behind on failure: a group that was created is
    /// removed again before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`NsboxError::Cgroup`] if the hierarchy lacks the required
    /// controllers or any control-file write fails.
    pub fn allocate(&self, spec: &ContainerSpec) -> Result<CgroupHandle> {
        self.backend.prepare(&self.parent, &REQUIRED_CONTROLLERS)?;

        let group = self.parent.join(spec.id().as_str());
        self.backend.create(&group)?;

        let mut handle = CgroupHandle {
            backend: Arc::clone(&self.backend),
            group,
            limits: spec.limits().clone(),
            members: Vec::new(),
            release: self.release,
            released: false,
        };

        for limit in Limit::expand(spec.limits()) {
            if let Err(e) = self.backend.set_limit(&handle.group, limit) {
                if let Err(cleanup) = handle.release() {
                    tracing::warn!(error = %cleanup, "rollback of partially configured cgroup failed");
                }
                return Err(e);
            }
        }

        tracing::info!(
            id = %spec.id(),
            path = %handle.path().display(),
            "cgroup allocated"
        );
        Ok(handle)
    }
}

/// An allocated control group, owned by one container run.
///
/// The group is removed by [`CgroupHandle::release`]; a handle dropped
/// without being released removes its group best-effort.
#[derive(Debug)]
pub struct CgroupHandle {
    backend: Arc<dyn ControlGroupBackend>,
    group: PathBuf,
    limits: ResourceLimits,
    members: Vec<u32>,
    release: ReleasePolicy,
    released: bool,
}

impl CgroupHandle {
    /// Group path relative to the hierarchy's mount point.
    #[must_use]
    pub fn group(&self) -> &Path {
        &self.group
    }

    /// Absolute path of the group directory.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.backend.location(&self.group)
    }

    /// Limits written when the group was allocated.
    #[must_use]
    pub const fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// PIDs attached through this handle.
    #[must_use]
    pub fn members(&self) -> &[u32] {
        &self.members
    }

    /// Returns `true` once the group has been removed.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.released
    }

    /// Moves `pid` into the group.
    ///
    /// # Errors
    ///
    /// Returns [`NsboxError::Cgroup`] if the group was already released or
    /// the kernel refuses the PID.
    pub fn attach(&mut self, pid: u32) -> Result<()> {
        if self.released {
            return Err(NsboxError::cgroup(
                "attach",
                self.path(),
                "group already released",
            ));
        }
        self.backend.attach(&self.group, pid)?;
        self.members.push(pid);
        tracing::debug!(pid, path = %self.path().display(), "process attached to cgroup");
        Ok(())
    }

    /// Reads the group's current usage and pressure.
    ///
    /// # Errors
    ///
    /// Returns [`NsboxError::Cgroup`] if the accounting files cannot be read.
    pub fn usage(&self) -> Result<ResourceUsage> {
        self.backend.query_usage(&self.group)
    }

    /// Removes the group.
    ///
    /// Calling this on a group that is already gone is a no-op. While the
    /// kernel reports the group busy, any remaining members are killed and
    /// removal is retried with exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns [`NsboxError::Cgroup`] if the group is still busy after
    /// every attempt or removal fails for another reason.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        let attempts = self.release.attempts.max(1);
        for attempt in 0..attempts {
            match self.backend.remove(&self.group)? {
                Removal::Removed => {
                    tracing::info!(path = %self.path().display(), "cgroup released");
                    self.released = true;
                    return Ok(());
                }
                Removal::Absent => {
                    tracing::debug!(path = %self.path().display(), "cgroup already gone");
                    self.released = true;
                    return Ok(());
                }
                Removal::Busy => {
                    let remaining = self.backend.members(&self.group).unwrap_or_default();
                    tracing::debug!(
                        attempt,
                        remaining = remaining.len(),
                        "cgroup busy, retrying removal"
                    );
                    if !remaining.is_empty() {
                        if let Err(e) = self.backend.kill_members(&self.group) {
                            tracing::warn!(error = %e, "failed to kill remaining cgroup members");
                        }
                    }
                    if attempt + 1 < attempts {
                        std::thread::sleep(self.release.backoff(attempt));
                    }
                }
            }
        }
        tracing::warn!(path = %self.path().display(), attempts, "cgroup still busy, giving up");
        Err(NsboxError::cgroup(
            "remove",
            self.path(),
            format!("group still busy after {attempts} attempts"),
        ))
    }
}

impl Drop for CgroupHandle {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.release() {
                tracing::warn!(error = %e, "cgroup release on drop failed");
            }
        }
    }
}

/// Iterates the `key value` pairs of a flat-keyed control file.
///
/// Lines that do not hold exactly a key and an integer are skipped.
pub(crate) fn flat_keyed(content: &str) -> impl Iterator<Item = (&str, u64)> {
    content.lines().filter_map(|line| {
        let mut parts = line.split_whitespace();
        let key = parts.next()?;
        let value = parts.next()?.parse().ok()?;
        parts.next().is_none().then_some((key, value))
    })
}

#[cfg(test)]
mod tests {
    use nsbox_common::spec::Entrypoint;
    use nsbox_common::types::ContainerId;

    use super::fake::{FakeCgroupBackend, FakeOp};
    use super::*;

    fn spec(limits: ResourceLimits) -> ContainerSpec {
        ContainerSpec::builder(
            "/srv/rootfs",
            Entrypoint::Exec {
                program: "echo".into(),
                args: vec!["hello".into()],
            },
        )
        .id(ContainerId::new("c1"))
        .limits(limits)
        .build()
        .expect("valid spec")
    }

    fn limiter(backend: &Arc<FakeCgroupBackend>) -> ResourceLimiter {
        let policy = ReleasePolicy {
            attempts: 3,
            initial_backoff_ms: 0,
        };
        ResourceLimiter::new(backend.clone(), "nsbox", policy)
    }

    fn capped() -> ResourceLimits {
        ResourceLimits {
            memory_max_bytes: Some(50 * 1024 * 1024),
            cpu_quota: Some(CpuQuota::from_percent(50)),
            cpu_weight: Some(100),
        }
    }

    #[test]
    fn limits_expand_to_control_files() {
        let files: Vec<_> = Limit::expand(&capped())
            .iter()
            .map(Limit::control_file)
            .collect();
        assert_eq!(
            files,
            [
                "memory.max",
                "memory.swap.max",
                "memory.oom.group",
                "cpu.max",
                "cpu.weight"
            ]
        );
        assert!(Limit::expand(&ResourceLimits::default()).is_empty());
    }

    #[test]
    fn default_config_caps_memory_and_cpu() {
        let limits = Limit::expand(&RuntimeConfig::default().default_limits);
        let files: Vec<_> = limits.iter().map(Limit::control_file).collect();
        assert!(files.contains(&"memory.max"));
        assert!(files.contains(&"cpu.max"));
        assert!(limits.contains(&Limit::CpuMax(CpuQuota::from_percent(25))));
    }

    #[test]
    fn limit_values_use_kernel_format() {
        assert_eq!(Limit::MemoryMax(52_428_800).value(), "52428800");
        assert_eq!(Limit::OomGroup(true).value(), "1");
        assert_eq!(Limit::CpuMax(CpuQuota::from_percent(50)).value(), "50000 100000");
    }

    #[test]
    fn allocate_writes_limits_before_returning() {
        let backend = Arc::new(FakeCgroupBackend::new());
        let handle = limiter(&backend).allocate(&spec(capped())).expect("allocate");

        assert_eq!(handle.group(), Path::new("nsbox/c1"));
        let limits = backend.limits(Path::new("nsbox/c1"));
        assert!(limits.contains(&Limit::MemoryMax(50 * 1024 * 1024)));
        assert!(limits.contains(&Limit::CpuWeight(100)));
        assert!(matches!(backend.ops()[0], FakeOp::Prepare(_)));
    }

    #[test]
    fn missing_controller_fails_before_create() {
        let backend = Arc::new(FakeCgroupBackend::new().without_controller("memory"));
        let err = limiter(&backend).allocate(&spec(capped())).unwrap_err();

        assert!(err.to_string().contains("memory"));
        assert!(!backend.ops().iter().any(|op| matches!(op, FakeOp::Create(_))));
    }

    #[test]
    fn failed_limit_write_removes_group() {
        let backend = Arc::new(FakeCgroupBackend::new().fail_on("set_limit"));
        assert!(limiter(&backend).allocate(&spec(capped())).is_err());
        assert!(!backend.exists(Path::new("nsbox/c1")));
    }

    #[test]
    fn attach_records_membership() {
        let backend = Arc::new(FakeCgroupBackend::new());
        let mut handle = limiter(&backend).allocate(&spec(capped())).expect("allocate");
        handle.attach(4242).expect("attach");

        assert_eq!(handle.members(), [4242]);
        assert_eq!(
            backend.members(Path::new("nsbox/c1")).expect("members"),
            [4242]
        );
    }

    #[test]
    fn release_is_idempotent() {
        let backend = Arc::new(FakeCgroupBackend::new());
        let mut handle = limiter(&backend).allocate(&spec(capped())).expect("allocate");
        handle.release().expect("first release");
        handle.release().expect("second release is a no-op");

        assert!(handle.is_released());
        assert!(!backend.exists(Path::new("nsbox/c1")));
        assert!(handle.attach(1).is_err());
    }

    #[test]
    fn release_of_vanished_group_is_a_no_op() {
        let backend = Arc::new(FakeCgroupBackend::new());
        let mut handle = limiter(&backend).allocate(&spec(capped())).expect("allocate");
        backend.forget(Path::new("nsbox/c1"));

        handle.release().expect("absent group");
        assert!(backend.ops().iter().any(|op| matches!(op, FakeOp::Remove(_, Removal::Absent))));
    }

    #[test]
    fn release_kills_lingering_members_and_retries() {
        let backend = Arc::new(FakeCgroupBackend::new());
        let mut handle = limiter(&backend).allocate(&spec(capped())).expect("allocate");
        handle.attach(99).expect("attach");

        handle.release().expect("release after kill");
        let ops = backend.ops();
        assert!(ops.iter().any(|op| matches!(op, FakeOp::Kill(_))));
        assert!(ops.iter().any(|op| matches!(op, FakeOp::Remove(_, Removal::Removed))));
    }

    #[test]
    fn persistent_busy_group_is_reported_not_panicked() {
        let backend = Arc::new(FakeCgroupBackend::new().busy_for(10));
        let mut handle = limiter(&backend).allocate(&spec(capped())).expect("allocate");

        let err = handle.release().unwrap_err();
        assert!(err.to_string().contains("still busy"));
        assert!(!handle.is_released());
        let removals = backend
            .ops()
            .iter()
            .filter(|op| matches!(op, FakeOp::Remove(..)))
            .count();
        assert_eq!(removals, 3);
    }

    #[test]
    fn dropped_handle_releases_itself() {
        let backend = Arc::new(FakeCgroupBackend::new());
        {
            let _handle = limiter(&backend).allocate(&spec(capped())).expect("allocate");
            assert!(backend.exists(Path::new("nsbox/c1")));
        }
        assert!(!backend.exists(Path::new("nsbox/c1")));
    }

    #[test]
    fn flat_keyed_skips_malformed_lines() {
        let parsed: Vec<_> = flat_keyed("oom 1\nbroken\noom_kill 2\nx y z\n").collect();
        assert_eq!(parsed, [("oom", 1), ("oom_kill", 2)]);
    }
}
