//! Child-side bootstrap and the child-to-supervisor status protocol.
//!
//! The child reports over a close-on-exec pipe, one JSON object per line:
//! `{"status":"jailed"}` once the jail is complete, or
//! `{"status":"failed",...}` when a setup step fails. End-of-file after
//! `jailed` means `execve(2)` succeeded and closed the pipe.
//!
//! Everything in [`child_main`] runs in the cloned child. It never
//! returns to the caller's stack frames and reports failures only through
//! the pipe.

use std::ffi::CString;
use std::fs::File;
use std::io::{BufRead, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nsbox_common::constants::{CONTAINER_HOME, CONTAINER_PATH};
use nsbox_common::error::{ExecFailure, LaunchPhase, NsboxError, Result};
use nsbox_common::spec::{Entrypoint, SessionMode};
use nsbox_common::types::NamespaceSet;
use nsbox_core::{filesystem, namespace, signal};
use serde::{Deserialize, Serialize};

use crate::workload;

/// Exit code of a child that could not finish its setup.
const SETUP_FAILED: isize = 1;

/// One status line sent from the child to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChildMessage {
    /// Root pivoted, `/proc` mounted, old root detached.
    Jailed,
    /// A setup step failed; the child exits right after sending this.
    Failed {
        /// Pipeline phase that failed.
        phase: LaunchPhase,
        /// Jail step, for jail failures.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<String>,
        /// Program and failure kind, for exec failures.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exec: Option<(String, ExecFailure)>,
        /// Underlying OS-level reason.
        reason: String,
    },
}

impl ChildMessage {
    /// Converts a setup error into its wire form.
    #[must_use]
    pub fn from_error(err: &NsboxError) -> Self {
        let (step, exec, reason) = match err {
            NsboxError::Jail { step, reason } => (Some(step.clone()), None, reason.clone()),
            NsboxError::Exec {
                program,
                kind,
                reason,
            } => (None, Some((program.clone(), *kind)), reason.clone()),
            NsboxError::Namespace { message } | NsboxError::Supervision { message } => {
                (None, None, message.clone())
            }
            other => (None, None, other.to_string()),
        };
        Self::Failed {
            phase: err.phase(),
            step,
            exec,
            reason,
        }
    }

    /// Rebuilds the supervisor-side error for a `Failed` message.
    ///
    /// Returns `None` for `Jailed`.
    #[must_use]
    pub fn into_error(self) -> Option<NsboxError> {
        let Self::Failed {
            phase,
            step,
            exec,
            reason,
        } = self
        else {
            return None;
        };
        Some(match (phase, exec) {
            (LaunchPhase::Exec, Some((program, kind))) => NsboxError::Exec {
                program,
                kind,
                reason,
            },
            (LaunchPhase::Jail, _) => NsboxError::Jail {
                step: step.unwrap_or_else(|| "unknown".into()),
                reason,
            },
            (LaunchPhase::Namespace, _) => NsboxError::Namespace { message: reason },
            (phase, _) => NsboxError::Supervision {
                message: format!("child {phase} setup failed: {reason}"),
            },
        })
    }

    /// Serialises the message as one newline-terminated JSON line.
    ///
    /// # Errors
    ///
    /// Returns [`NsboxError::Serialization`] if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Reads the next status line, or `None` at end-of-file.
///
/// # Errors
///
/// Returns [`NsboxError::Supervision`] if the pipe cannot be read, or
/// [`NsboxError::Serialization`] for a malformed line.
pub fn next_message(reader: &mut impl BufRead) -> Result<Option<ChildMessage>> {
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| NsboxError::Supervision {
            message: format!("reading child status: {e}"),
        })?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}

/// Everything the cloned child needs, prepared by the supervisor.
#[derive(Debug, Clone)]
pub struct ChildContext {
    /// Canonical root filesystem.
    pub rootfs: PathBuf,
    /// Hostname for the UTS namespace.
    pub hostname: String,
    /// What PID 1 becomes.
    pub entrypoint: Entrypoint,
    /// Terminal attachment mode.
    pub mode: SessionMode,
    /// Namespaces the child lives in.
    pub namespaces: NamespaceSet,
    /// Child's read end of the go pipe.
    pub sync_read: RawFd,
    /// Supervisor's write end of the go pipe, closed in the child.
    pub sync_write: RawFd,
    /// Supervisor's read end of the status pipe, closed in the child.
    pub status_read: RawFd,
    /// Child's write end of the status pipe.
    pub status_write: RawFd,
    /// `TERM` from the invoking environment, if set.
    pub term: Option<String>,
}

/// Body of the cloned child.
///
/// Waits for the supervisor's go byte, then sets the hostname, brings up
/// loopback, enters the jail and becomes the entrypoint. Returns only on
/// failure or when the built-in workload finishes; the value is the
/// child's exit code.
pub fn child_main(ctx: &ChildContext) -> isize {
    // Dispositions first: the relay handlers were inherited from the supervisor.
    if let Err(e) = signal::reset_for_exec() {
        send(ctx.status_write, &ChildMessage::from_error(&e));
        return SETUP_FAILED;
    }
    if let Err(e) = nix::sys::prctl::set_pdeathsig(Signal::SIGKILL) {
        send(ctx.status_write, &ChildMessage::from_error(&pdeathsig_error(e)));
        return SETUP_FAILED;
    }
    close(ctx.sync_write);
    close(ctx.status_read);

    if !wait_for_go(ctx.sync_read) {
        // Supervisor went away before attaching us to the cgroup.
        return SETUP_FAILED;
    }
    close(ctx.sync_read);

    match prepare(ctx) {
        Ok(stdin) => {
            send(ctx.status_write, &ChildMessage::Jailed);
            become_entrypoint(ctx, stdin)
        }
        Err(e) => {
            send(ctx.status_write, &ChildMessage::from_error(&e));
            SETUP_FAILED
        }
    }
}

/// Runs every setup step up to and including the jail.
///
/// Returns `/dev/null` for batch sessions, opened before the host root
/// disappears.
fn prepare(ctx: &ChildContext) -> Result<Option<File>> {
    if ctx.namespaces.uts {
        namespace::uts::set_hostname(&ctx.hostname)?;
    }
    if ctx.namespaces.network {
        namespace::network::bring_up_loopback()?;
    }
    let stdin = match ctx.mode {
        SessionMode::Batch => Some(File::open("/dev/null").map_err(|e| NsboxError::Supervision {
            message: format!("open /dev/null: {e}"),
        })?),
        SessionMode::Interactive => None,
    };
    let _mounts = filesystem::enter(&ctx.rootfs)?;
    Ok(stdin)
}

fn become_entrypoint(ctx: &ChildContext, stdin: Option<File>) -> isize {
    if let Some(null) = stdin {
        // SAFETY: both descriptors are open; dup2 atomically replaces fd 0.
        if unsafe { libc::dup2(null.as_raw_fd(), libc::STDIN_FILENO) } < 0 {
            let err = NsboxError::Supervision {
                message: format!("redirect stdin: {}", Errno::last()),
            };
            send(ctx.status_write, &ChildMessage::from_error(&err));
            return SETUP_FAILED;
        }
    }

    match &ctx.entrypoint {
        Entrypoint::Exec { program, args } => {
            let err = exec(program, args, &container_env(ctx));
            send(ctx.status_write, &ChildMessage::from_error(&err));
            SETUP_FAILED
        }
        Entrypoint::MemoryStress(plan) => {
            // No exec will close the status pipe for us.
            close(ctx.status_write);
            let code = workload::run_memory_stress(plan, &mut std::io::stdout().lock());
            isize::try_from(code).unwrap_or(SETUP_FAILED)
        }
    }
}

/// Replaces the process image; only returns on failure.
fn exec(program: &str, args: &[String], env: &[CString]) -> NsboxError {
    let path = match resolve_program(program, Path::new("/")) {
        Ok(path) => path,
        Err(e) => return e,
    };
    let to_cstring =
        |s: &str| CString::new(s).map_err(|e| exec_error(program, ExecFailure::NotExecutable, e));
    let c_path = match path.to_str().map(to_cstring) {
        Some(Ok(p)) => p,
        Some(Err(e)) => return e,
        None => return exec_error(program, ExecFailure::NotExecutable, "path is not valid UTF-8"),
    };
    let mut argv = Vec::with_capacity(args.len() + 1);
    for arg in std::iter::once(program).chain(args.iter().map(String::as_str)) {
        match to_cstring(arg) {
            Ok(c) => argv.push(c),
            Err(e) => return e,
        }
    }

    match nix::unistd::execve(&c_path, &argv, env) {
        Err(Errno::ENOENT) => exec_error(program, ExecFailure::NotFound, Errno::ENOENT),
        Err(e) => exec_error(program, ExecFailure::NotExecutable, e),
        Ok(never) => match never {},
    }
}

/// Resolves `program` against the container `PATH`, relative to `root`.
///
/// Names containing a slash are taken as paths and left for `execve(2)`
/// to judge.
///
/// # Errors
///
/// Returns [`NsboxError::Exec`] with [`ExecFailure::NotExecutable`] when a
/// file of that name exists on `PATH` but cannot be run, and
/// [`ExecFailure::NotFound`] otherwise.
pub fn resolve_program(program: &str, root: &Path) -> Result<PathBuf> {
    if program.contains('/') {
        return Ok(PathBuf::from(program));
    }
    let search: Vec<PathBuf> = CONTAINER_PATH
        .split(':')
        .map(|dir| root.join(dir.trim_start_matches('/')))
        .collect();
    let search_path = std::env::join_paths(&search).map_err(|e| exec_error(program, ExecFailure::NotFound, e))?;
    match which::which_in(program, Some(search_path), root) {
        Ok(found) => {
            let inside = found
                .strip_prefix(root)
                .map_or_else(|_| found.clone(), |rest| Path::new("/").join(rest));
            Ok(inside)
        }
        Err(_) if search.iter().any(|dir| dir.join(program).is_file()) => Err(exec_error(
            program,
            ExecFailure::NotExecutable,
            "permission denied",
        )),
        Err(e) => Err(exec_error(program, ExecFailure::NotFound, e)),
    }
}

/// Clean environment handed to the target program.
#[must_use]
pub fn container_env(ctx: &ChildContext) -> Vec<CString> {
    let mut vars = vec![
        format!("PATH={CONTAINER_PATH}"),
        format!("HOME={CONTAINER_HOME}"),
        format!("HOSTNAME={}", ctx.hostname),
    ];
    if let Some(term) = &ctx.term {
        vars.push(format!("TERM={term}"));
    }
    vars.into_iter().filter_map(|v| CString::new(v).ok()).collect()
}

fn pdeathsig_error(errno: Errno) -> NsboxError {
    NsboxError::Supervision {
        message: format!("cannot set parent death signal: {errno}"),
    }
}

fn exec_error(program: &str, kind: ExecFailure, reason: impl std::fmt::Display) -> NsboxError {
    NsboxError::Exec {
        program: program.to_string(),
        kind,
        reason: reason.to_string(),
    }
}

/// Blocks until the supervisor writes the go byte. `false` on EOF or error.
fn wait_for_go(fd: RawFd) -> bool {
    let mut byte = [0_u8; 1];
    loop {
        // SAFETY: reads at most one byte into a live one-byte buffer.
        let n = unsafe { libc::read(fd, byte.as_mut_ptr().cast(), 1) };
        match n {
            1 => return true,
            -1 if Errno::last() == Errno::EINTR => {}
            _ => return false,
        }
    }
}

fn send(fd: RawFd, message: &ChildMessage) {
    let Ok(line) = message.encode() else {
        return;
    };
    // SAFETY: `fd` is the child's open status descriptor; ManuallyDrop
    // leaves closing it to exec or exit.
    let mut pipe = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    let _ = pipe.write_all(&line);
}

fn close(fd: RawFd) {
    // SAFETY: each descriptor is closed at most once in the child.
    let _ = unsafe { libc::close(fd) };
}
