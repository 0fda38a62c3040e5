//! Resource usage diagnostics.
//!
//! Reads the container's control group just before it is released, so the
//! run report can say how much memory the container used and whether the
//! kernel OOM-killed it.

use nsbox_common::error::Result;
use nsbox_common::types::ContainerId;
use nsbox_core::cgroup::{CgroupHandle, ResourceUsage};
use serde::Serialize;

/// Snapshot of a container's resource usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Container this snapshot belongs to.
    pub container_id: ContainerId,
    /// Memory currently charged, in bytes.
    pub memory_current_bytes: u64,
    /// Peak memory, in bytes, when the kernel records it.
    pub memory_peak_bytes: Option<u64>,
    /// Processes killed by the OOM killer.
    pub oom_kills: u64,
    /// Total CPU time, in microseconds.
    pub cpu_usage_usec: u64,
    /// Enforcement periods in which the container was throttled.
    pub cpu_throttled_periods: u64,
    /// Share of the last 10 seconds some task stalled on memory, in percent.
    pub memory_pressure_avg10: Option<f64>,
    /// Share of the last 10 seconds some task stalled on CPU, in percent.
    pub cpu_pressure_avg10: Option<f64>,
}

impl MetricsSnapshot {
    /// Condenses raw control-group usage.
    #[must_use]
    pub fn from_usage(container_id: ContainerId, usage: &ResourceUsage) -> Self {
        Self {
            container_id,
            memory_current_bytes: usage.memory_current,
            memory_peak_bytes: usage.memory_peak,
            oom_kills: usage.memory_events.oom_kill,
            cpu_usage_usec: usage.cpu.usage_usec,
            cpu_throttled_periods: usage.cpu.nr_throttled,
            memory_pressure_avg10: usage.memory_pressure.as_ref().map(|p| p.some.avg10),
            cpu_pressure_avg10: usage.cpu_pressure.as_ref().map(|p| p.some.avg10),
        }
    }

    /// Returns `true` if the kernel killed anything in the container.
    #[must_use]
    pub const fn oom_killed(&self) -> bool {
        self.oom_kills > 0
    }
}

/// Collects a metrics snapshot from the container's control group.
///
/// # Errors
///
/// Returns an error if the cgroup accounting files cannot be read.
pub fn collect_metrics(container_id: &ContainerId, cgroup: &CgroupHandle) -> Result<MetricsSnapshot> {
    let usage = cgroup.usage()?;
    let snapshot = MetricsSnapshot::from_usage(container_id.clone(), &usage);
    tracing::debug!(
        id = %container_id,
        memory_peak = ?snapshot.memory_peak_bytes,
        oom_kills = snapshot.oom_kills,
        cpu_usage_usec = snapshot.cpu_usage_usec,
        "metrics collected"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use nsbox_core::cgroup::{CpuStat, MemoryEvents, Pressure};

    use super::*;

    #[test]
    fn snapshot_condenses_usage() {
        let usage = ResourceUsage {
            memory_current: 1024,
            memory_peak: Some(52_428_800),
            memory_events: MemoryEvents::parse("oom 1\noom_kill 1\n"),
            cpu: CpuStat::parse("usage_usec 900\nnr_throttled 2\n"),
            memory_pressure: Pressure::parse("some avg10=12.50 avg60=0.00 avg300=0.00 total=9\n"),
            cpu_pressure: None,
        };
        let snap = MetricsSnapshot::from_usage(ContainerId::new("c1"), &usage);

        assert!(snap.oom_killed());
        assert_eq!(snap.memory_peak_bytes, Some(52_428_800));
        assert_eq!(snap.cpu_throttled_periods, 2);
        assert_eq!(snap.memory_pressure_avg10, Some(12.5));
        assert!(snap.cpu_pressure_avg10.is_none());
    }

    #[test]
    fn quiet_container_was_not_oom_killed() {
        let snap = MetricsSnapshot::from_usage(ContainerId::new("c2"), &ResourceUsage::default());
        assert!(!snap.oom_killed());
    }
}
