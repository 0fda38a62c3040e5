//! Up-front check for the elevation the whole pipeline needs.
//!
//! Namespace creation, cgroup writes, and `pivot_root(2)` all require
//! administrative privilege. Checking once before anything is allocated
//! means a missing privilege never leaves half a container behind.

use nsbox_common::error::{NsboxError, Result};

/// Fails unless the calling process runs with effective UID 0.
///
/// # Errors
///
/// Returns [`NsboxError::Privilege`] when the effective UID is not root.
pub fn require_root() -> Result<()> {
    check_euid(nix::unistd::geteuid().as_raw())
}

/// Decides whether `euid` carries the privilege the runtime needs.
///
/// # Errors
///
/// Returns [`NsboxError::Privilege`] for any non-zero `euid`.
pub fn check_euid(euid: u32) -> Result<()> {
    if euid == 0 {
        tracing::debug!("running with effective uid 0");
        return Ok(());
    }
    Err(NsboxError::Privilege {
        message: format!(
            "effective uid is {euid}; namespaces, cgroups and pivot_root require root (try sudo)"
        ),
    })
}
