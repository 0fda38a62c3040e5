//! Ordered jail setup inside the child's mount namespace.

use std::fmt;
use std::path::{Path, PathBuf};

use nsbox_common::error::{NsboxError, Result};

use super::mount::{self, MountTable};
use super::pivot_root;
use crate::namespace::mount::make_mounts_private;

/// One step of entering the jail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JailStep {
    /// Stop mount events propagating back to the host.
    MakePrivate,
    /// Turn the new root into a mount point.
    BindRoot,
    /// Swap the process root.
    PivotRoot,
    /// Move the working directory into the new root.
    Chdir,
    /// Mount a private `/proc`.
    MountProc,
    /// Detach and remove the parked host root.
    DetachOldRoot,
}

impl JailStep {
    /// Execution order; a step never runs before the ones listed ahead of it.
    pub const ORDER: [Self; 6] = [
        Self::MakePrivate,
        Self::BindRoot,
        Self::PivotRoot,
        Self::Chdir,
        Self::MountProc,
        Self::DetachOldRoot,
    ];

    /// Builds the jail error for this step.
    pub fn error(self, reason: impl Into<String>) -> NsboxError {
        NsboxError::Jail {
            step: self.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for JailStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MakePrivate => write!(f, "make-private"),
            Self::BindRoot => write!(f, "bind-root"),
            Self::PivotRoot => write!(f, "pivot-root"),
            Self::Chdir => write!(f, "chdir"),
            Self::MountProc => write!(f, "mount-proc"),
            Self::DetachOldRoot => write!(f, "detach-old-root"),
        }
    }
}

/// A root filesystem the calling process is about to be confined to.
///
/// Must run inside a private mount namespace, after namespace isolation
/// and before the target program is executed.
#[derive(Debug)]
pub struct Jail {
    root: PathBuf,
    mounts: MountTable,
    completed: Vec<JailStep>,
}

impl Jail {
    /// Prepares a jail rooted at the canonical path `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mounts: MountTable::new(),
            completed: Vec::new(),
        }
    }

    /// Root this jail confines to.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Steps that finished successfully.
    #[must_use]
    pub fn completed(&self) -> &[JailStep] {
        &self.completed
    }

    /// Runs every step in order.
    ///
    /// On failure the mounts created so far are detached in reverse order
    /// before the error is returned; the caller must not execute anything
    /// afterwards. On success the returned table lists the mounts that now
    /// make up the jail.
    ///
    /// # Errors
    ///
    /// Returns [`NsboxError::Jail`] naming the step that failed.
    pub fn enter(mut self) -> Result<MountTable> {
        for step in JailStep::ORDER {
            if let Err(e) = self.run(step) {
                for (mount, errno) in self.mounts.rollback() {
                    tracing::warn!(target_path = %mount.target().display(), %errno, "mount rollback failed");
                }
                return Err(e);
            }
            self.completed.push(step);
        }
        Ok(self.mounts)
    }

    fn run(&mut self, step: JailStep) -> Result<()> {
        match step {
            JailStep::MakePrivate => make_mounts_private(),
            JailStep::BindRoot => {
                let bind = mount::bind_self(&self.root)?;
                self.mounts.push(bind);
                Ok(())
            }
            JailStep::PivotRoot => {
                pivot_root::pivot(&self.root)?;
                self.mounts.rebase(&self.root);
                Ok(())
            }
            JailStep::Chdir => nix::unistd::chdir("/")
                .map_err(|e| step.error(format!("chdir(/): {e}"))),
            JailStep::MountProc => {
                let proc = mount::mount_proc(Path::new("/proc"))?;
                self.mounts.push(proc);
                Ok(())
            }
            JailStep::DetachOldRoot => pivot_root::detach_old_root(),
        }
    }
}

/// Confines the calling process to `root`.
///
/// # Errors
///
/// Returns [`NsboxError::Jail`] naming the step that failed.
pub fn enter(root: &Path) -> Result<MountTable> {
    Jail::new(root).enter()
}

#[cfg(test)]
mod tests {
    use nsbox_common::error::LaunchPhase;

    use super::*;

    #[test]
    fn steps_run_pivot_before_proc_before_detach() {
        let pos = |s| JailStep::ORDER.iter().position(|x| *x == s).expect("listed");
        assert!(pos(JailStep::BindRoot) < pos(JailStep::PivotRoot));
        assert!(pos(JailStep::PivotRoot) < pos(JailStep::Chdir));
        assert!(pos(JailStep::Chdir) < pos(JailStep::MountProc));
        assert!(pos(JailStep::MountProc) < pos(JailStep::DetachOldRoot));
        assert_eq!(JailStep::ORDER[0], JailStep::MakePrivate);
    }

    #[test]
    fn step_errors_belong_to_jail_phase() {
        let err = JailStep::MountProc.error("EPERM");
        assert_eq!(err.phase(), LaunchPhase::Jail);
        assert_eq!(err.to_string(), "jail setup failed during mount-proc: EPERM");
    }

    #[test]
    fn new_jail_has_no_completed_steps() {
        let jail = Jail::new("/srv/rootfs");
        assert_eq!(jail.root(), Path::new("/srv/rootfs"));
        assert!(jail.completed().is_empty());
    }
}
