//! Network namespace isolation.
//!
//! A new network namespace holds only a loopback interface, and that
//! interface starts down. The container is left without any other
//! connectivity; only `lo` is brought up.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nsbox_common::error::{NsboxError, Result};

/// Name of the loopback interface, NUL-terminated for `ifreq`.
const LOOPBACK: &[u8] = b"lo\0";

/// Brings the loopback interface up inside the current network namespace.
///
/// # Errors
///
/// Returns [`NsboxError::Namespace`] if the control socket cannot be
/// opened or either `ioctl(2)` fails.
pub fn bring_up_loopback() -> Result<()> {
    // SAFETY: plain socket(2) call with constant arguments.
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(loopback_error("open control socket", &io::Error::last_os_error()));
    }
    // SAFETY: `raw` was just returned by socket(2) and has no other owner.
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: `ifreq` is a plain C struct for which all-zero is valid.
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(LOOPBACK) {
        *dst = *src as libc::c_char;
    }

    // SAFETY: `ifr` is a valid, initialised ifreq naming "lo".
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut ifr) } != 0 {
        return Err(loopback_error("query flags", &io::Error::last_os_error()));
    }

    // SAFETY: SIOCGIFFLAGS filled the `ifru_flags` member of the union.
    unsafe {
        ifr.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
    }

    // SAFETY: `ifr` still names "lo" and carries the updated flags.
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as _, &ifr) } != 0 {
        return Err(loopback_error("set flags", &io::Error::last_os_error()));
    }

    tracing::debug!("loopback interface up");
    Ok(())
}

fn loopback_error(action: &str, err: &io::Error) -> NsboxError {
    NsboxError::Namespace {
        message: format!("loopback setup: {action} failed: {err}"),
    }
}
