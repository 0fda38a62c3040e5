//! UTS namespace isolation.
//!
//! Allows the container to have its own hostname and domain name. The
//! host's hostname is untouched because the child owns a private copy.

use nsbox_common::error::{NsboxError, Result};

/// Sets the hostname inside the UTS namespace.
///
/// # Errors
///
/// Returns [`NsboxError::Namespace`] if `sethostname(2)` fails.
pub fn set_hostname(hostname: &str) -> Result<()> {
    nix::unistd::sethostname(hostname).map_err(|e| NsboxError::Namespace {
        message: format!("sethostname({hostname}) failed: {e}"),
    })?;
    tracing::debug!(hostname, "container hostname set");
    Ok(())
}
