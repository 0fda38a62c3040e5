//! Host-side signal forwarding to the container's PID 1.
//!
//! While a container runs, the supervisor catches the signals a user sends
//! it and relays them to the child instead of dying. Handlers only touch
//! atomics and call `kill(2)`, both async-signal-safe. They are installed
//! without `SA_RESTART`, so a blocking `waitpid(2)` returns `EINTR` and
//! the supervisor can notice a pending termination request.
//!
//! A PID 1 in a fresh PID namespace ignores every signal it has no
//! handler for, so a forwarded `SIGTERM` may have no effect; the
//! supervisor escalates to `SIGKILL` after its grace period.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::Pid;
use nsbox_common::error::{NsboxError, Result};
use nsbox_common::spec::SessionMode;

/// PID that caught signals are relayed to; `0` while no child exists.
static FORWARD_TARGET: AtomicI32 = AtomicI32::new(0);

/// Bit `n` set means signal `n` requests termination of the container.
static ESCALATE_MASK: AtomicU64 = AtomicU64::new(0);

/// Last termination-intent signal caught, `0` if none.
static PENDING_TERMINATION: AtomicI32 = AtomicI32::new(0);

extern "C" fn relay(sig: libc::c_int) {
    let target = FORWARD_TARGET.load(Ordering::SeqCst);
    if target > 0 {
        // SAFETY: kill(2) is async-signal-safe.
        let _ = unsafe { libc::kill(target, sig) };
    }
    if (0..64).contains(&sig) && ESCALATE_MASK.load(Ordering::SeqCst) & (1 << sig) != 0 {
        PENDING_TERMINATION.store(sig, Ordering::SeqCst);
    }
}

/// Which signals are relayed, and which of them ask for termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardPolicy {
    forwarded: Vec<Signal>,
    escalating: Vec<Signal>,
}

impl ForwardPolicy {
    /// Policy for a session mode.
    ///
    /// Batch runs relay termination intent only. Interactive sessions also
    /// relay terminal resizes, and `SIGINT` is passed to the shell without
    /// counting as a request to stop the container.
    #[must_use]
    pub fn for_mode(mode: SessionMode) -> Self {
        let termination = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP, Signal::SIGQUIT];
        match mode {
            SessionMode::Batch => Self {
                forwarded: termination.to_vec(),
                escalating: termination.to_vec(),
            },
            SessionMode::Interactive => {
                let mut forwarded = termination.to_vec();
                forwarded.push(Signal::SIGWINCH);
                Self {
                    forwarded,
                    escalating: vec![Signal::SIGTERM, Signal::SIGHUP],
                }
            }
        }
    }

    /// Signals relayed to the child.
    #[must_use]
    pub fn forwarded(&self) -> &[Signal] {
        &self.forwarded
    }

    /// Whether `sig` asks for the container to stop.
    #[must_use]
    pub fn escalates(&self, sig: Signal) -> bool {
        self.escalating.contains(&sig)
    }

    fn escalate_mask(&self) -> u64 {
        self.escalating
            .iter()
            .fold(0, |mask, sig| mask | (1_u64 << (*sig as i32)))
    }
}

/// Installed relay handlers; the previous dispositions return on drop.
///
/// Only one forwarder should exist at a time, since the relay target is
/// process-wide.
#[derive(Debug)]
pub struct SignalForwarder {
    previous: Vec<(Signal, SigAction)>,
}

impl SignalForwarder {
    /// Installs relay handlers for every signal in `policy`.
    ///
    /// Signals caught before [`SignalForwarder::set_target`] are not
    /// relayed, but termination requests among them are still recorded.
    ///
    /// # Errors
    ///
    /// Returns [`NsboxError::Supervision`] if a handler cannot be installed;
    /// handlers installed up to that point are restored.
    pub fn install(policy: &ForwardPolicy) -> Result<Self> {
        FORWARD_TARGET.store(0, Ordering::SeqCst);
        PENDING_TERMINATION.store(0, Ordering::SeqCst);
        ESCALATE_MASK.store(policy.escalate_mask(), Ordering::SeqCst);

        let action = SigAction::new(SigHandler::Handler(relay), SaFlags::empty(), SigSet::empty());
        let mut forwarder = Self {
            previous: Vec::with_capacity(policy.forwarded.len()),
        };
        for &sig in &policy.forwarded {
            // SAFETY: `relay` only performs async-signal-safe operations.
            let old = unsafe { signal::sigaction(sig, &action) }.map_err(|e| {
                NsboxError::Supervision {
                    message: format!("cannot install {sig} handler: {e}"),
                }
            })?;
            forwarder.previous.push((sig, old));
        }
        tracing::debug!(signals = ?policy.forwarded, "signal forwarding installed");
        Ok(forwarder)
    }

    /// Starts relaying caught signals to `pid`.
    pub fn set_target(&self, pid: Pid) {
        FORWARD_TARGET.store(pid.as_raw(), Ordering::SeqCst);
    }

    /// Stops relaying; used once the child has been reaped.
    pub fn clear_target(&self) {
        FORWARD_TARGET.store(0, Ordering::SeqCst);
    }

    /// Termination-intent signal caught since installation, if any.
    #[must_use]
    pub fn pending_termination(&self) -> Option<Signal> {
        match PENDING_TERMINATION.load(Ordering::SeqCst) {
            0 => None,
            raw => Signal::try_from(raw).ok(),
        }
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        FORWARD_TARGET.store(0, Ordering::SeqCst);
        ESCALATE_MASK.store(0, Ordering::SeqCst);
        for (sig, old) in self.previous.drain(..).rev() {
            // SAFETY: restores a disposition previously returned by sigaction.
            if let Err(e) = unsafe { signal::sigaction(sig, &old) } {
                tracing::warn!(signal = %sig, error = %e, "failed to restore signal handler");
            }
        }
    }
}

/// Restores default dispositions and an empty signal mask.
///
/// Called in the child before `execve(2)` so the target program does not
/// inherit the supervisor's relay handlers or any blocked signals.
///
/// # Errors
///
/// Returns [`NsboxError::Supervision`] if the signal mask cannot be cleared.
pub fn reset_for_exec() -> Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in Signal::iterator() {
        if matches!(sig, Signal::SIGKILL | Signal::SIGSTOP) {
            continue;
        }
        // SAFETY: installing SIG_DFL has no handler-safety requirements.
        // Failures are ignored: signals that cannot be caught keep their default.
        let _ = unsafe { signal::sigaction(sig, &default) };
    }
    signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None).map_err(|e| {
        NsboxError::Supervision {
            message: format!("cannot clear signal mask: {e}"),
        }
    })
}
