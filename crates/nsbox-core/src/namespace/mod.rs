//! Linux namespace management for container isolation.
//!
//! The child is created by one `clone(2)` carrying every requested
//! namespace flag, so it never executes a single instruction inside the
//! host's namespaces. The per-namespace modules hold the setup each
//! namespace needs once the child is running.

pub mod mount;
pub mod network;
pub mod uts;

use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use nsbox_common::error::{NsboxError, Result};
use nsbox_common::types::NamespaceSet;

/// Translates the logical namespace set into `clone(2)` flags.
#[must_use]
pub fn clone_flags(requested: NamespaceSet) -> CloneFlags {
    let mut flags = CloneFlags::empty();
    if requested.pid {
        flags |= CloneFlags::CLONE_NEWPID;
    }
    if requested.network {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    if requested.mount {
        flags |= CloneFlags::CLONE_NEWNS;
    }
    if requested.uts {
        flags |= CloneFlags::CLONE_NEWUTS;
    }
    if requested.ipc {
        flags |= CloneFlags::CLONE_NEWIPC;
    }
    flags
}

/// Handle to a child created inside fresh namespaces.
///
/// Until [`IsolatedChild::mark_reaped`] is called the handle assumes the
/// child may still be alive; [`IsolatedChild::terminate`] kills and reaps it.
#[derive(Debug)]
pub struct IsolatedChild {
    pid: Pid,
    namespaces: NamespaceSet,
    reaped: bool,
}

impl IsolatedChild {
    /// Host-side PID of the child.
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Host-side PID as an unsigned value, as written to `cgroup.procs`.
    #[must_use]
    pub fn host_pid(&self) -> u32 {
        u32::try_from(self.pid.as_raw()).unwrap_or_default()
    }

    /// Namespaces the child was created with.
    #[must_use]
    pub const fn namespaces(&self) -> NamespaceSet {
        self.namespaces
    }

    /// Records that the child's exit status has been collected.
    pub const fn mark_reaped(&mut self) {
        self.reaped = true;
    }

    /// Returns whether the exit status has been collected.
    #[must_use]
    pub const fn is_reaped(&self) -> bool {
        self.reaped
    }

    /// Kills the child with SIGKILL and reaps it.
    ///
    /// Used to roll back a partially constructed container. Never fails:
    /// a child that is already gone is simply reaped.
    pub fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        match kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pid = %self.pid, error = %e, "failed to kill child"),
        }
        loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => {}
                Ok(status) => {
                    tracing::debug!(pid = %self.pid, ?status, "terminated child reaped");
                    break;
                }
                Err(e) => {
                    tracing::debug!(pid = %self.pid, error = %e, "terminated child already reaped");
                    break;
                }
            }
        }
        self.reaped = true;
    }
}

/// Creates a child inside the requested namespaces and runs `bootstrap` in it.
///
/// All namespace flags are applied atomically by a single `clone(2)` with
/// `SIGCHLD` as the termination signal. The child runs on `stack` with a
/// private copy of the caller's memory (no `CLONE_VM`); its return value
/// becomes its exit code unless it replaces itself with `execve(2)`.
///
/// # Errors
///
/// Returns [`NsboxError::Namespace`] when the kernel refuses the request,
/// for example for lack of privilege or an unsupported namespace type. No
/// child exists in that case.
pub fn isolate<'a>(
    requested: NamespaceSet,
    stack: &mut [u8],
    bootstrap: impl FnMut() -> isize + 'a,
) -> Result<IsolatedChild> {
    let flags = clone_flags(requested);
    let callback: nix::sched::CloneCb<'a> = Box::new(bootstrap);

    // SAFETY: without CLONE_VM the child works on its own copy of the
    // address space, so the callback's borrows stay valid there; the stack
    // buffer outlives the call in the parent and is only used by the child.
    let pid = unsafe { nix::sched::clone(callback, stack, flags, Some(libc::SIGCHLD)) }
        .map_err(|e| NsboxError::Namespace {
            message: explain_clone_error(e),
        })?;

    tracing::info!(pid = %pid, namespaces = ?requested.names(), "isolated child created");
    Ok(IsolatedChild {
        pid,
        namespaces: requested,
        reaped: false,
    })
}

fn explain_clone_error(errno: Errno) -> String {
    let hint = match errno {
        Errno::EPERM => "insufficient privilege to create namespaces",
        Errno::EINVAL => "kernel does not support one of the requested namespace types",
        Errno::ENOSPC | Errno::EUSERS => "per-user namespace limit reached",
        Errno::ENOMEM => "out of memory while creating the child",
        Errno::EAGAIN => "process limit reached",
        _ => "clone(2) failed",
    };
    format!("{hint} ({errno})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_namespaces_map_to_five_flags() {
        let flags = clone_flags(NamespaceSet::all());
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn partial_set_maps_only_requested_flags() {
        let set = NamespaceSet {
            pid: true,
            network: false,
            mount: true,
            uts: false,
            ipc: false,
        };
        assert_eq!(
            clone_flags(set),
            CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS
        );
    }

    #[test]
    fn clone_errors_explain_the_cause() {
        assert!(explain_clone_error(Errno::EPERM).contains("privilege"));
        assert!(explain_clone_error(Errno::EINVAL).contains("not support"));
    }
}
