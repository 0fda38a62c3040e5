//! Mount bookkeeping for jail setup.
//!
//! Every mount the jail creates is recorded in a [`MountTable`] so a
//! failed setup can be unwound in reverse order.

use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nsbox_common::error::Result;

use super::jail::JailStep;

/// What a [`MountPoint`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Recursive bind mount.
    Bind,
    /// Private `proc` instance.
    Proc,
}

/// A mount created during jail setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    target: PathBuf,
    kind: MountKind,
}

impl MountPoint {
    /// Records a mount at `target`.
    pub fn new(target: impl Into<PathBuf>, kind: MountKind) -> Self {
        Self {
            target: target.into(),
            kind,
        }
    }

    /// Where the mount is attached, as seen from the current root.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Kind of mount.
    #[must_use]
    pub const fn kind(&self) -> MountKind {
        self.kind
    }
}

/// Ordered record of the mounts created by one jail.
#[derive(Debug, Default)]
pub struct MountTable {
    mounts: Vec<MountPoint>,
}

impl MountTable {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self { mounts: Vec::new() }
    }

    /// Records a new mount.
    pub fn push(&mut self, mount: MountPoint) {
        self.mounts.push(mount);
    }

    /// Mounts in creation order.
    #[must_use]
    pub fn mounts(&self) -> &[MountPoint] {
        &self.mounts
    }

    /// Rewrites targets after the root moved to `new_root`.
    ///
    /// Mounts outside `new_root` are no longer reachable and are dropped.
    pub fn rebase(&mut self, new_root: &Path) {
        self.mounts.retain_mut(|m| match m.target.strip_prefix(new_root) {
            Ok(rest) => {
                m.target = Path::new("/").join(rest);
                true
            }
            Err(_) => false,
        });
    }

    /// Detaches every recorded mount in reverse creation order.
    ///
    /// The mount at `/` (the pivoted root itself) is left alone. Returns the
    /// mounts that could not be detached; the caller only logs them because
    /// the namespace is discarded with the child anyway.
    pub fn rollback(&mut self) -> Vec<(MountPoint, Errno)> {
        let mut failed = Vec::new();
        while let Some(m) = self.mounts.pop() {
            if m.target == Path::new("/") {
                continue;
            }
            if let Err(e) = umount2(m.target.as_path(), MntFlags::MNT_DETACH) {
                failed.push((m, e));
            }
        }
        failed
    }
}

/// Bind-mounts `root` onto itself so it becomes a mount point.
///
/// # Errors
///
/// Returns a jail error if `mount(2)` fails.
pub fn bind_self(root: &Path) -> Result<MountPoint> {
    mount(
        Some(root),
        root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| JailStep::BindRoot.error(format!("bind {}: {e}", root.display())))?;
    tracing::debug!(root = %root.display(), "root bind-mounted onto itself");
    Ok(MountPoint::new(root, MountKind::Bind))
}

/// Mounts a fresh `proc` at `target`, creating the directory if needed.
///
/// # Errors
///
/// Returns a jail error if the directory cannot be created or the mount fails.
pub fn mount_proc(target: &Path) -> Result<MountPoint> {
    if !target.exists() {
        std::fs::create_dir_all(target)
            .map_err(|e| JailStep::MountProc.error(format!("create {}: {e}", target.display())))?;
    }
    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| JailStep::MountProc.error(format!("mount proc on {}: {e}", target.display())))?;
    Ok(MountPoint::new(target, MountKind::Proc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MountTable {
        let mut t = MountTable::new();
        t.push(MountPoint::new("/srv/rootfs", MountKind::Bind));
        t.push(MountPoint::new("/srv/rootfs/proc", MountKind::Proc));
        t.push(MountPoint::new("/mnt/elsewhere", MountKind::Bind));
        t
    }

    #[test]
    fn rebase_maps_targets_into_new_root() {
        let mut t = table();
        t.rebase(Path::new("/srv/rootfs"));
        let targets: Vec<_> = t.mounts().iter().map(MountPoint::target).collect();
        assert_eq!(targets, [Path::new("/"), Path::new("/proc")]);
    }

    #[test]
    fn rollback_skips_root_and_reports_failures() {
        let mut t = MountTable::new();
        t.push(MountPoint::new("/", MountKind::Bind));
        t.push(MountPoint::new("/nonexistent/nsbox/a", MountKind::Proc));
        t.push(MountPoint::new("/nonexistent/nsbox/b", MountKind::Bind));

        let failed = t.rollback();
        let order: Vec<_> = failed.iter().map(|(m, _)| m.target().to_path_buf()).collect();
        assert_eq!(
            order,
            [
                PathBuf::from("/nonexistent/nsbox/b"),
                PathBuf::from("/nonexistent/nsbox/a")
            ]
        );
        assert!(t.mounts().is_empty());
    }
}
