//! The running isolated child as seen from the host.
//!
//! Waiting is the supervisor's only blocking point. It is interrupted by
//! relayed signals; once a termination request is seen the child gets a
//! grace period before it is killed outright.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use nsbox_common::error::{NsboxError, Result};
use nsbox_common::types::{ContainerState, ExitStatus};
use nsbox_core::namespace::IsolatedChild;

/// Poll interval while a killed or warned child is winding down.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A container's PID 1 and its lifecycle state.
#[derive(Debug)]
pub struct ContainerProcess {
    child: IsolatedChild,
    state: ContainerState,
}

impl ContainerProcess {
    /// Wraps a freshly created child in [`ContainerState::Created`].
    #[must_use]
    pub const fn new(child: IsolatedChild) -> Self {
        Self {
            child,
            state: ContainerState::Created,
        }
    }

    /// PID in the host's PID namespace.
    #[must_use]
    pub const fn host_pid(&self) -> Pid {
        self.child.pid()
    }

    /// PID as seen inside the container: `1` when it has its own PID namespace.
    #[must_use]
    pub fn namespace_pid(&self) -> Pid {
        if self.child.namespaces().pid {
            Pid::from_raw(1)
        } else {
            self.child.pid()
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ContainerState {
        self.state
    }

    /// Moves the process to `next`, which must lie ahead of the current state.
    ///
    /// # Errors
    ///
    /// Returns [`NsboxError::Supervision`] for a backwards transition.
    pub fn advance(&mut self, next: ContainerState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(NsboxError::Supervision {
                message: format!("container cannot go from {} to {next}", self.state),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Blocks until the child exits and returns how it ended.
    ///
    /// `pending` is polled whenever the wait is interrupted; once it
    /// reports a termination request, the child is SIGKILLed if it is
    /// still alive after `grace`.
    ///
    /// # Errors
    ///
    /// Returns [`NsboxError::Supervision`] if the child cannot be waited on.
    pub fn wait(
        &mut self,
        grace: Duration,
        pending: impl Fn() -> Option<Signal>,
    ) -> Result<ExitStatus> {
        let status = wait_for_exit(self.child.pid(), grace, pending)?;
        self.child.mark_reaped();
        self.advance(ContainerState::Exited)?;
        tracing::info!(pid = %self.child.pid(), %status, "container exited");
        Ok(status)
    }

    /// Kills and reaps the child if it may still be alive.
    pub fn terminate(&mut self) {
        self.child.terminate();
    }

    /// Returns whether the exit status has been collected.
    #[must_use]
    pub const fn is_reaped(&self) -> bool {
        self.child.is_reaped()
    }
}

/// Maps a terminal wait status to an [`ExitStatus`].
#[must_use]
pub fn exit_status(status: WaitStatus) -> Option<ExitStatus> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
        WaitStatus::Signaled(_, sig, _) => Some(ExitStatus::Signaled(sig as i32)),
        _ => None,
    }
}

/// Waits for `pid`, escalating to SIGKILL `grace` after a termination request.
pub(crate) fn wait_for_exit(
    pid: Pid,
    grace: Duration,
    pending: impl Fn() -> Option<Signal>,
) -> Result<ExitStatus> {
    let mut deadline: Option<Instant> = None;
    let mut killed = false;
    loop {
        if deadline.is_none() {
            if let Some(sig) = pending() {
                tracing::info!(%pid, signal = %sig, ?grace, "termination requested");
                deadline = Some(Instant::now() + grace);
            }
        }
        let flags = deadline.map(|_| WaitPidFlag::WNOHANG);
        match waitpid(pid, flags) {
            Ok(status) => {
                if let Some(exit) = exit_status(status) {
                    return Ok(exit);
                }
                if status == WaitStatus::StillAlive {
                    if let Some(at) = deadline {
                        if !killed && Instant::now() >= at {
                            tracing::warn!(%pid, "grace period elapsed, sending SIGKILL");
                            match kill(pid, Signal::SIGKILL) {
                                Ok(()) | Err(Errno::ESRCH) => {}
                                Err(e) => {
                                    return Err(NsboxError::Supervision {
                                        message: format!("SIGKILL {pid}: {e}"),
                                    });
                                }
                            }
                            killed = true;
                        }
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
            Err(Errno::EINTR) => {}
            Err(e) => {
                return Err(NsboxError::Supervision {
                    message: format!("waitpid({pid}): {e}"),
                });
            }
        }
    }
}
