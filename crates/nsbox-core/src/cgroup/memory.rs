//! Memory accounting files of the cgroup v2 memory controller.
//!
//! Parses `memory.current`, `memory.peak` and `memory.events`. Limits are
//! written through [`super::Limit`].

use serde::Serialize;

use super::flat_keyed;

/// Counters from `memory.events`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryEvents {
    /// Times usage crossed `memory.high`.
    pub high: u64,
    /// Times usage hit `memory.max`.
    pub max: u64,
    /// Times the OOM killer was invoked for the group.
    pub oom: u64,
    /// Processes killed by the OOM killer.
    pub oom_kill: u64,
}

impl MemoryEvents {
    /// Parses the flat-keyed contents of `memory.events`.
    ///
    /// Unknown keys are ignored.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut events = Self::default();
        for (key, value) in flat_keyed(content) {
            match key {
                "high" => events.high = value,
                "max" => events.max = value,
                "oom" => events.oom = value,
                "oom_kill" => events.oom_kill = value,
                _ => {}
            }
        }
        events
    }

    /// Returns `true` if the kernel killed anything in the group.
    #[must_use]
    pub const fn was_oom_killed(&self) -> bool {
        self.oom_kill > 0
    }
}

/// Parses a single-value byte file such as `memory.current`.
///
/// `max` (no limit) yields `None`.
#[must_use]
pub fn parse_bytes(content: &str) -> Option<u64> {
    content.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_from_kernel_output() {
        let content = "low 0\nhigh 0\nmax 37\noom 1\noom_kill 1\noom_group_kill 1\n";
        let events = MemoryEvents::parse(content);
        assert_eq!(events.max, 37);
        assert_eq!(events.oom, 1);
        assert!(events.was_oom_killed());
    }

    #[test]
    fn empty_events_mean_no_kill() {
        assert!(!MemoryEvents::parse("").was_oom_killed());
    }

    #[test]
    fn byte_values() {
        assert_eq!(parse_bytes("52428800\n"), Some(52_428_800));
        assert_eq!(parse_bytes("max\n"), None);
    }
}
