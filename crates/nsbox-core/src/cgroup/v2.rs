//! Backend over the real cgroup v2 unified hierarchy.

use std::io;
use std::path::{Path, PathBuf};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use nsbox_common::error::{NsboxError, Result};

use super::{ControlGroupBackend, CpuStat, Limit, MemoryEvents, Pressure, Removal, ResourceUsage, memory};

/// Cgroup v2 hierarchy mounted at a fixed path, usually `/sys/fs/cgroup`.
#[derive(Debug, Clone)]
pub struct CgroupV2 {
    mount: PathBuf,
}

impl CgroupV2 {
    /// Creates a backend for the hierarchy mounted at `mount`.
    pub fn new(mount: impl Into<PathBuf>) -> Self {
        Self {
            mount: mount.into(),
        }
    }

    fn controllers(&self, dir: &Path) -> Result<Vec<String>> {
        let file = dir.join("cgroup.controllers");
        if !file.exists() {
            return Err(NsboxError::cgroup(
                "detect",
                &self.mount,
                "no cgroup.controllers file; the cgroup v2 unified hierarchy is not mounted here",
            ));
        }
        Ok(read(&file, "detect")?
            .split_whitespace()
            .map(str::to_owned)
            .collect())
    }

    /// Enables `required` controllers for children of `dir`.
    fn delegate(&self, dir: &Path, required: &[&str]) -> Result<()> {
        let file = dir.join("cgroup.subtree_control");
        let enabled = read(&file, "delegate")?;
        let missing: Vec<String> = required
            .iter()
            .filter(|c| !enabled.split_whitespace().any(|e| e == **c))
            .map(|c| format!("+{c}"))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        write(&file, &missing.join(" "), "delegate")?;
        tracing::debug!(path = %file.display(), controllers = ?missing, "controllers delegated");
        Ok(())
    }
}

impl ControlGroupBackend for CgroupV2 {
    fn location(&self, group: &Path) -> PathBuf {
        self.mount.join(group)
    }

    fn prepare(&self, parent: &Path, required: &[&str]) -> Result<()> {
        let available = self.controllers(&self.mount)?;
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|c| !available.iter().any(|a| a.as_str() == *c))
            .collect();
        if !missing.is_empty() {
            return Err(NsboxError::cgroup(
                "detect",
                &self.mount,
                format!("required controller(s) unavailable: {}", missing.join(", ")),
            ));
        }

        self.delegate(&self.mount, required)?;
        let parent_dir = self.location(parent);
        std::fs::create_dir_all(&parent_dir)
            .map_err(|e| NsboxError::cgroup("create", &parent_dir, e))?;
        self.delegate(&parent_dir, required)?;
        tracing::debug!(parent = %parent_dir.display(), "cgroup hierarchy prepared");
        Ok(())
    }

    fn create(&self, group: &Path) -> Result<()> {
        let dir = self.location(group);
        std::fs::create_dir(&dir).map_err(|e| NsboxError::cgroup("create", &dir, e))?;
        tracing::debug!(path = %dir.display(), "cgroup created");
        Ok(())
    }

    fn set_limit(&self, group: &Path, limit: Limit) -> Result<()> {
        let file = self.location(group).join(limit.control_file());
        if limit.is_optional() && !file.exists() {
            tracing::debug!(path = %file.display(), "optional control file absent, skipped");
            return Ok(());
        }
        let value = limit.value();
        write(&file, &value, "limit")?;
        tracing::debug!(path = %file.display(), value, "limit written");
        Ok(())
    }

    fn attach(&self, group: &Path, pid: u32) -> Result<()> {
        write(&self.location(group).join("cgroup.procs"), &pid.to_string(), "attach")
    }

    fn members(&self, group: &Path) -> Result<Vec<u32>> {
        let content = read(&self.location(group).join("cgroup.procs"), "members")?;
        Ok(content.lines().filter_map(|l| l.trim().parse().ok()).collect())
    }

    fn kill_members(&self, group: &Path) -> Result<()> {
        let kill_file = self.location(group).join("cgroup.kill");
        if kill_file.exists() {
            return write(&kill_file, "1", "kill");
        }
        // cgroup.kill arrived in 5.14; older kernels get one SIGKILL per member.
        for pid in self.members(group)? {
            let pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
            match kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => return Err(NsboxError::cgroup("kill", self.location(group), e)),
            }
        }
        Ok(())
    }

    fn remove(&self, group: &Path) -> Result<Removal> {
        let dir = self.location(group);
        match std::fs::remove_dir(&dir) {
            Ok(()) => Ok(Removal::Removed),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Removal::Absent),
            Err(e) if is_busy(&e) => Ok(Removal::Busy),
            Err(e) => Err(NsboxError::cgroup("remove", &dir, e)),
        }
    }

    fn query_usage(&self, group: &Path) -> Result<ResourceUsage> {
        let dir = self.location(group);
        let current = read(&dir.join("memory.current"), "usage")?;
        Ok(ResourceUsage {
            memory_current: memory::parse_bytes(&current).unwrap_or_default(),
            memory_peak: read_optional(&dir.join("memory.peak")).and_then(|c| memory::parse_bytes(&c)),
            memory_events: read_optional(&dir.join("memory.events"))
                .map(|c| MemoryEvents::parse(&c))
                .unwrap_or_default(),
            cpu: read_optional(&dir.join("cpu.stat"))
                .map(|c| CpuStat::parse(&c))
                .unwrap_or_default(),
            memory_pressure: read_optional(&dir.join("memory.pressure"))
                .and_then(|c| Pressure::parse(&c)),
            cpu_pressure: read_optional(&dir.join("cpu.pressure")).and_then(|c| Pressure::parse(&c)),
        })
    }
}

fn is_busy(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::ResourceBusy || err.raw_os_error() == Some(libc::EBUSY)
}

fn read(path: &Path, operation: &'static str) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| NsboxError::cgroup(operation, path, e))
}

fn read_optional(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

fn write(path: &Path, value: &str, operation: &'static str) -> Result<()> {
    std::fs::write(path, value).map_err(|e| NsboxError::cgroup(operation, path, e))
}
