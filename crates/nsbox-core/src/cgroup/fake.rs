//! In-memory [`ControlGroupBackend`] for tests.
//!
//! Records every operation and lets tests inject missing controllers,
//! failing operations and groups that stay busy.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use nsbox_common::error::{NsboxError, Result};

use super::{ControlGroupBackend, Limit, Removal, ResourceUsage};

/// Operation recorded by [`FakeCgroupBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum FakeOp {
    /// Controller detection and delegation for a parent group.
    Prepare(PathBuf),
    /// Group creation.
    Create(PathBuf),
    /// Limit write.
    SetLimit(PathBuf, Limit),
    /// Process attachment.
    Attach(PathBuf, u32),
    /// Kill request for all members.
    Kill(PathBuf),
    /// One removal attempt and its outcome.
    Remove(PathBuf, Removal),
}

#[derive(Debug, Default)]
struct FakeGroup {
    limits: Vec<Limit>,
    procs: Vec<u32>,
}

#[derive(Debug)]
struct FakeState {
    controllers: Vec<String>,
    groups: BTreeMap<PathBuf, FakeGroup>,
    ops: Vec<FakeOp>,
    busy_removals: u32,
    fail_on: Option<&'static str>,
    usage: ResourceUsage,
}

/// Thread-safe fake cgroup hierarchy.
#[derive(Debug)]
pub struct FakeCgroupBackend {
    state: Mutex<FakeState>,
}

impl Default for FakeCgroupBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCgroupBackend {
    /// Creates a hierarchy offering the `cpu`, `memory`, `io` and `pids` controllers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                controllers: ["cpu", "memory", "io", "pids"].map(String::from).to_vec(),
                groups: BTreeMap::new(),
                ops: Vec::new(),
                busy_removals: 0,
                fail_on: None,
                usage: ResourceUsage::default(),
            }),
        }
    }

    /// Removes a controller from the hierarchy.
    #[must_use]
    pub fn without_controller(self, name: &str) -> Self {
        self.lock().controllers.retain(|c| c != name);
        self
    }

    /// Makes the next `n` removals report the group as busy.
    #[must_use]
    pub fn busy_for(self, n: u32) -> Self {
        self.lock().busy_removals = n;
        self
    }

    /// Makes every call of the named trait method fail.
    #[must_use]
    pub fn fail_on(self, operation: &'static str) -> Self {
        self.lock().fail_on = Some(operation);
        self
    }

    /// Sets the usage returned by `query_usage`.
    #[must_use]
    pub fn with_usage(self, usage: ResourceUsage) -> Self {
        self.lock().usage = usage;
        self
    }

    /// Operations performed so far, in order.
    #[must_use]
    pub fn ops(&self) -> Vec<FakeOp> {
        self.lock().ops.clone()
    }

    /// Returns whether `group` currently exists.
    #[must_use]
    pub fn exists(&self, group: &Path) -> bool {
        self.lock().groups.contains_key(group)
    }

    /// Limits written to `group`.
    #[must_use]
    pub fn limits(&self, group: &Path) -> Vec<Limit> {
        self.lock()
            .groups
            .get(group)
            .map(|g| g.limits.clone())
            .unwrap_or_default()
    }

    /// Deletes `group` behind the limiter's back.
    pub fn forget(&self, group: &Path) {
        let _ = self.lock().groups.remove(group);
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(state: &FakeState, operation: &'static str, group: &Path) -> Result<()> {
        if state.fail_on == Some(operation) {
            return Err(NsboxError::cgroup(operation, group, "injected failure"));
        }
        Ok(())
    }
}

impl ControlGroupBackend for FakeCgroupBackend {
    fn location(&self, group: &Path) -> PathBuf {
        Path::new("/fake/cgroup").join(group)
    }

    fn prepare(&self, parent: &Path, required: &[&str]) -> Result<()> {
        let mut state = self.lock();
        state.ops.push(FakeOp::Prepare(parent.to_path_buf()));
        Self::check(&state, "prepare", parent)?;
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|r| !state.controllers.iter().any(|c| c == r))
            .collect();
        if !missing.is_empty() {
            return Err(NsboxError::cgroup(
                "detect",
                parent,
                format!("required controller(s) unavailable: {}", missing.join(", ")),
            ));
        }
        Ok(())
    }

    fn create(&self, group: &Path) -> Result<()> {
        let mut state = self.lock();
        state.ops.push(FakeOp::Create(group.to_path_buf()));
        Self::check(&state, "create", group)?;
        if state.groups.contains_key(group) {
            return Err(NsboxError::cgroup("create", group, "already exists"));
        }
        let _ = state.groups.insert(group.to_path_buf(), FakeGroup::default());
        Ok(())
    }

    fn set_limit(&self, group: &Path, limit: Limit) -> Result<()> {
        let mut state = self.lock();
        state.ops.push(FakeOp::SetLimit(group.to_path_buf(), limit));
        Self::check(&state, "set_limit", group)?;
        let entry = state
            .groups
            .get_mut(group)
            .ok_or_else(|| NsboxError::cgroup("limit", group, "no such group"))?;
        entry.limits.push(limit);
        Ok(())
    }

    fn attach(&self, group: &Path, pid: u32) -> Result<()> {
        let mut state = self.lock();
        state.ops.push(FakeOp::Attach(group.to_path_buf(), pid));
        Self::check(&state, "attach", group)?;
        let entry = state
            .groups
            .get_mut(group)
            .ok_or_else(|| NsboxError::cgroup("attach", group, "no such group"))?;
        entry.procs.push(pid);
        Ok(())
    }

    fn members(&self, group: &Path) -> Result<Vec<u32>> {
        let state = self.lock();
        Self::check(&state, "members", group)?;
        Ok(state
            .groups
            .get(group)
            .map(|g| g.procs.clone())
            .unwrap_or_default())
    }

    fn kill_members(&self, group: &Path) -> Result<()> {
        let mut state = self.lock();
        state.ops.push(FakeOp::Kill(group.to_path_buf()));
        Self::check(&state, "kill_members", group)?;
        if let Some(entry) = state.groups.get_mut(group) {
            entry.procs.clear();
        }
        Ok(())
    }

    fn remove(&self, group: &Path) -> Result<Removal> {
        let mut state = self.lock();
        Self::check(&state, "remove", group)?;
        let occupied = state.groups.get(group).map(|g| !g.procs.is_empty());
        let outcome = match occupied {
            None => Removal::Absent,
            Some(_) if state.busy_removals > 0 => {
                state.busy_removals -= 1;
                Removal::Busy
            }
            Some(true) => Removal::Busy,
            Some(false) => {
                let _ = state.groups.remove(group);
                Removal::Removed
            }
        };
        state.ops.push(FakeOp::Remove(group.to_path_buf(), outcome));
        Ok(outcome)
    }

    fn query_usage(&self, group: &Path) -> Result<ResourceUsage> {
        let state = self.lock();
        Self::check(&state, "query_usage", group)?;
        if !state.groups.contains_key(group) {
            return Err(NsboxError::cgroup("usage", group, "no such group"));
        }
        Ok(state.usage.clone())
    }
}
