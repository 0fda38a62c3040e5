//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`. The old root is
//! parked under [`OLD_ROOT_DIR`] and detached right after.

use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, umount2};
use nsbox_common::constants::OLD_ROOT_DIR;
use nsbox_common::error::Result;

use super::jail::JailStep;

/// Location of the parked old root, as seen from the new root.
#[must_use]
pub fn old_root_path() -> PathBuf {
    Path::new("/").join(OLD_ROOT_DIR)
}

/// Makes `new_root` the process's root, parking the old root inside it.
///
/// `new_root` must already be a mount point.
///
/// # Errors
///
/// Returns a jail error if the parking directory cannot be created or
/// `pivot_root(2)` fails. A parking directory created here is removed
/// again on failure.
pub fn pivot(new_root: &Path) -> Result<()> {
    let put_old = new_root.join(OLD_ROOT_DIR);
    let created = !put_old.exists();
    std::fs::create_dir_all(&put_old)
        .map_err(|e| JailStep::PivotRoot.error(format!("create {}: {e}", put_old.display())))?;
    if let Err(e) = nix::unistd::pivot_root(new_root, &put_old) {
        if created {
            if let Err(cleanup) = std::fs::remove_dir(&put_old) {
                tracing::warn!(path = %put_old.display(), error = %cleanup, "could not remove old-root directory");
            }
        }
        return Err(JailStep::PivotRoot.error(format!("pivot_root({}): {e}", new_root.display())));
    }
    tracing::debug!(new_root = %new_root.display(), "root pivoted");
    Ok(())
}

/// Lazily unmounts the parked old root and removes its directory.
///
/// # Errors
///
/// Returns a jail error if the old root cannot be detached or is still
/// present afterwards.
pub fn detach_old_root() -> Result<()> {
    let old = old_root_path();
    umount2(old.as_path(), MntFlags::MNT_DETACH)
        .map_err(|e| JailStep::DetachOldRoot.error(format!("umount {}: {e}", old.display())))?;
    std::fs::remove_dir(&old)
        .map_err(|e| JailStep::DetachOldRoot.error(format!("remove {}: {e}", old.display())))?;
    Ok(())
}
