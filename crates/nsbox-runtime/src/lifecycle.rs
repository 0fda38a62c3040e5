//! Forward-only supervisor state machine and the cleanup it implies.
//!
//! Cleanup is keyed on the highest state a launch reached, not on where
//! an error happened to surface, so a partial setup is always undone in
//! full.

use std::fmt;

use nsbox_common::error::{NsboxError, Result};
use serde::Serialize;

/// Supervisor-level launch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// Nothing allocated yet.
    Init,
    /// The isolated child exists and waits for its go signal.
    NamespaceRequested,
    /// The control group exists with limits written and the child attached.
    ResourceAllocated,
    /// The child reported a completed jail.
    Jailed,
    /// The target program replaced the bootstrap code.
    Running,
    /// The child's exit status was collected.
    Exited,
    /// Every resource was released.
    Cleaned,
    /// An unrecoverable error aborted the launch.
    FailedAborted,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::NamespaceRequested => "namespace-requested",
            Self::ResourceAllocated => "resource-allocated",
            Self::Jailed => "jailed",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Cleaned => "cleaned",
            Self::FailedAborted => "failed-aborted",
        };
        f.write_str(name)
    }
}

/// What has to be undone for a launch that reached a given state.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPlan {
    /// SIGKILL the child if it may still be alive.
    pub kill_child: bool,
    /// Collect the child's exit status.
    pub reap_child: bool,
    /// Remove the control group.
    pub release_cgroup: bool,
}

impl CleanupPlan {
    /// Plan for a launch whose highest state was `highest`.
    #[must_use]
    pub const fn for_state(highest: SupervisorState) -> Self {
        use SupervisorState as S;
        match highest {
            S::Init | S::Cleaned | S::FailedAborted => Self {
                kill_child: false,
                reap_child: false,
                release_cgroup: false,
            },
            S::NamespaceRequested => Self {
                kill_child: true,
                reap_child: true,
                release_cgroup: false,
            },
            S::ResourceAllocated | S::Jailed | S::Running => Self {
                kill_child: true,
                reap_child: true,
                release_cgroup: true,
            },
            S::Exited => Self {
                kill_child: false,
                reap_child: false,
                release_cgroup: true,
            },
        }
    }
}

/// Tracks one launch through [`SupervisorState`].
#[derive(Debug, Clone)]
pub struct Lifecycle {
    current: SupervisorState,
    highest: SupervisorState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Starts in [`SupervisorState::Init`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: SupervisorState::Init,
            highest: SupervisorState::Init,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn current(&self) -> SupervisorState {
        self.current
    }

    /// Highest progress state reached, ignoring the terminal states.
    #[must_use]
    pub const fn highest(&self) -> SupervisorState {
        self.highest
    }

    /// Moves to `next`, which must lie strictly ahead of the current state.
    ///
    /// # Errors
    ///
    /// Returns [`NsboxError::Supervision`] for a backwards or repeated
    /// transition, or any transition out of a terminal state.
    pub fn advance(&mut self, next: SupervisorState) -> Result<()> {
        let terminal = matches!(
            self.current,
            SupervisorState::Cleaned | SupervisorState::FailedAborted
        );
        if terminal || next <= self.current || next == SupervisorState::FailedAborted {
            return Err(NsboxError::Supervision {
                message: format!("invalid launch transition {} -> {next}", self.current),
            });
        }
        tracing::debug!(from = %self.current, to = %next, "launch state");
        self.current = next;
        if next != SupervisorState::Cleaned {
            self.highest = next;
        }
        Ok(())
    }

    /// Enters [`SupervisorState::FailedAborted`] from any non-terminal state.
    pub fn abort(&mut self) {
        if self.current != SupervisorState::Cleaned {
            tracing::debug!(from = %self.current, "launch aborted");
            self.current = SupervisorState::FailedAborted;
        }
    }

    /// Cleanup owed for the progress made so far.
    #[must_use]
    pub const fn cleanup_plan(&self) -> CleanupPlan {
        CleanupPlan::for_state(self.highest)
    }

    /// Marks the cleanup as done.
    ///
    /// An aborted launch stays aborted; a normal one ends in
    /// [`SupervisorState::Cleaned`].
    pub fn finish(&mut self) {
        if self.current != SupervisorState::FailedAborted {
            self.current = SupervisorState::Cleaned;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_launch_walks_every_state() {
        let mut lc = Lifecycle::new();
        for next in [
            SupervisorState::NamespaceRequested,
            SupervisorState::ResourceAllocated,
            SupervisorState::Jailed,
            SupervisorState::Running,
            SupervisorState::Exited,
        ] {
            lc.advance(next).expect("forward transition");
        }
        assert_eq!(lc.cleanup_plan(), CleanupPlan::for_state(SupervisorState::Exited));
        lc.finish();
        assert_eq!(lc.current(), SupervisorState::Cleaned);
        assert_eq!(lc.highest(), SupervisorState::Exited);
    }

    #[test]
    fn states_are_never_revisited() {
        let mut lc = Lifecycle::new();
        lc.advance(SupervisorState::Jailed).expect("skip ahead");
        assert!(lc.advance(SupervisorState::Jailed).is_err());
        assert!(lc.advance(SupervisorState::NamespaceRequested).is_err());
    }

    #[test]
    fn aborted_launch_keeps_highest_state_for_cleanup() {
        let mut lc = Lifecycle::new();
        lc.advance(SupervisorState::NamespaceRequested).expect("advance");
        lc.advance(SupervisorState::ResourceAllocated).expect("advance");
        lc.abort();

        assert_eq!(lc.current(), SupervisorState::FailedAborted);
        let plan = lc.cleanup_plan();
        assert!(plan.kill_child && plan.reap_child && plan.release_cgroup);
        assert!(lc.advance(SupervisorState::Jailed).is_err());
        lc.finish();
        assert_eq!(lc.current(), SupervisorState::FailedAborted);
    }

    #[test]
    fn child_only_launch_does_not_touch_cgroup() {
        let plan = CleanupPlan::for_state(SupervisorState::NamespaceRequested);
        assert!(plan.kill_child);
        assert!(!plan.release_cgroup);
    }

    #[test]
    fn exited_child_is_not_killed_again() {
        let plan = CleanupPlan::for_state(SupervisorState::Exited);
        assert!(!plan.kill_child);
        assert!(plan.release_cgroup);
    }

    #[test]
    fn init_owes_nothing() {
        let plan = CleanupPlan::for_state(SupervisorState::Init);
        assert!(!plan.kill_child && !plan.reap_child && !plan.release_cgroup);
    }
}
