//! Summary of one container run.

use std::fmt;

use chrono::{DateTime, Utc};
use nsbox_common::types::{ContainerId, ExitStatus};
use serde::Serialize;

use crate::metrics::MetricsSnapshot;

/// What happened during a completed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Container identifier (also the cgroup name).
    pub id: ContainerId,
    /// Entrypoint as launched.
    pub entrypoint: String,
    /// PID 1 in the host's PID namespace.
    pub host_pid: i32,
    /// How PID 1 ended.
    pub status: ExitStatus,
    /// Exit code the runtime mirrors to its caller.
    pub exit_code: i32,
    /// Resource usage read just before the cgroup was released.
    pub metrics: Option<MetricsSnapshot>,
    /// When the launch started.
    pub started_at: DateTime<Utc>,
    /// When the exit status was collected.
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Returns `true` if the kernel OOM killer ended the container.
    #[must_use]
    pub fn oom_killed(&self) -> bool {
        self.metrics.as_ref().is_some_and(MetricsSnapshot::oom_killed)
    }

    /// Peak memory use in bytes, when known.
    #[must_use]
    pub fn memory_peak_bytes(&self) -> Option<u64> {
        self.metrics.as_ref().and_then(|m| m.memory_peak_bytes)
    }

    /// Wall-clock duration of the run in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "container {} ({}) {} after {} ms",
            self.id,
            self.entrypoint,
            self.status,
            self.duration_ms()
        )?;
        if self.oom_killed() {
            write!(f, ", OOM-killed")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn report(status: ExitStatus, oom_kills: u64) -> RunReport {
        let started_at = Utc::now();
        RunReport {
            id: ContainerId::new("c1"),
            entrypoint: "echo hello".into(),
            host_pid: 4242,
            status,
            exit_code: status.code(),
            metrics: Some(MetricsSnapshot {
                container_id: ContainerId::new("c1"),
                memory_current_bytes: 0,
                memory_peak_bytes: Some(4096),
                oom_kills,
                cpu_usage_usec: 0,
                cpu_throttled_periods: 0,
                memory_pressure_avg10: None,
                cpu_pressure_avg10: None,
            }),
            started_at,
            finished_at: started_at + Duration::milliseconds(250),
        }
    }

    #[test]
    fn summary_mentions_status_and_duration() {
        let text = report(ExitStatus::Exited(0), 0).to_string();
        assert_eq!(text, "container c1 (echo hello) exited with code 0 after 250 ms");
    }

    #[test]
    fn oom_kill_is_called_out() {
        let r = report(ExitStatus::Signaled(9), 1);
        assert!(r.oom_killed());
        assert_eq!(r.exit_code, 137);
        assert!(r.to_string().ends_with("OOM-killed"));
    }

    #[test]
    fn serialises_timestamps_as_rfc3339() {
        let json = serde_json::to_value(report(ExitStatus::Exited(0), 0)).expect("json");
        let started = json["started_at"].as_str().expect("string");
        assert!(DateTime::parse_from_rfc3339(started).is_ok());
        assert_eq!(json["status"]["exited"], 0);
    }
}
