//! CPU accounting via the cgroup v2 cpu controller.
//!
//! `cpu.max` and `cpu.weight` are written through [`super::Limit`]; this
//! module reads back `cpu.stat`.

use serde::Serialize;

use super::flat_keyed;

/// Counters from `cpu.stat`, in microseconds where applicable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuStat {
    /// Total CPU time consumed.
    pub usage_usec: u64,
    /// Time spent in user mode.
    pub user_usec: u64,
    /// Time spent in kernel mode.
    pub system_usec: u64,
    /// Enforcement periods that elapsed.
    pub nr_periods: u64,
    /// Periods in which the group was throttled.
    pub nr_throttled: u64,
    /// Total time spent throttled.
    pub throttled_usec: u64,
}

impl CpuStat {
    /// Parses the flat-keyed contents of `cpu.stat`.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut stat = Self::default();
        for (key, value) in flat_keyed(content) {
            match key {
                "usage_usec" => stat.usage_usec = value,
                "user_usec" => stat.user_usec = value,
                "system_usec" => stat.system_usec = value,
                "nr_periods" => stat.nr_periods = value,
                "nr_throttled" => stat.nr_throttled = value,
                "throttled_usec" => stat.throttled_usec = value,
                _ => {}
            }
        }
        stat
    }
}
