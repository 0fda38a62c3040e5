//! Mount namespace isolation.
//!
//! A fresh mount namespace starts as a copy of the host's table, including
//! its propagation settings. On hosts where `/` is a shared mount, anything
//! mounted in the container would propagate back, so the whole tree is
//! made private before the jail mounts anything.

use nix::mount::{MsFlags, mount};
use nsbox_common::error::{NsboxError, Result};

/// Marks every mount in the calling process's namespace as private.
///
/// # Errors
///
/// Returns [`NsboxError::Jail`] if the remount fails.
pub fn make_mounts_private() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| NsboxError::Jail {
        step: "make-private".into(),
        reason: format!("remount / as private failed: {e}"),
    })?;
    tracing::debug!("mount propagation set to private");
    Ok(())
}
