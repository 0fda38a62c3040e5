//! Unified error types for the nsbox workspace.
//!
//! Every variant belongs to exactly one [`LaunchPhase`], so a failed launch
//! can always say which step of the pipeline broke and why.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{EXIT_LAUNCH_FAILURE, EXIT_NOT_EXECUTABLE, EXIT_NOT_FOUND};

/// Step of the container-construction pipeline an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchPhase {
    /// Checks performed before anything is allocated (privilege, configuration).
    Preflight,
    /// Creation of the isolated child.
    Namespace,
    /// Control group allocation, limits, attachment, or removal.
    Cgroup,
    /// Root pivot and pseudo-filesystem mounts inside the child.
    Jail,
    /// Replacement of the bootstrap image by the target program.
    Exec,
    /// Waiting on, signalling, or reaping the container.
    Supervision,
}

impl fmt::Display for LaunchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preflight => write!(f, "preflight"),
            Self::Namespace => write!(f, "namespace"),
            Self::Cgroup => write!(f, "cgroup"),
            Self::Jail => write!(f, "jail"),
            Self::Exec => write!(f, "exec"),
            Self::Supervision => write!(f, "supervision"),
        }
    }
}

/// Why the target program could not replace the bootstrap code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecFailure {
    /// No such program inside the jail.
    NotFound,
    /// The program exists but `execve(2)` refused it.
    NotExecutable,
}

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum NsboxError {
    /// The runtime is not running with the elevation it needs.
    #[error("insufficient privilege: {message}")]
    Privilege {
        /// Description of the missing privilege.
        message: String,
    },

    /// The kernel refused the requested isolation.
    #[error("namespace isolation failed: {message}")]
    Namespace {
        /// Underlying kernel reason.
        message: String,
    },

    /// A control group operation failed.
    #[error("cgroup {operation} failed for {path}: {reason}")]
    Cgroup {
        /// Operation that failed (`create`, `attach`, `limit`, `remove`, ...).
        operation: &'static str,
        /// Control group or control file involved.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// Root pivot or mount setup failed inside the child.
    #[error("jail setup failed during {step}: {reason}")]
    Jail {
        /// Jail step that failed.
        step: String,
        /// Underlying reason.
        reason: String,
    },

    /// The target command could not be executed inside the jail.
    #[error("cannot execute {program}: {reason}")]
    Exec {
        /// Program as requested by the caller.
        program: String,
        /// Whether the program was missing or not executable.
        kind: ExecFailure,
        /// Underlying reason.
        reason: String,
    },

    /// Waiting on or signalling the container failed.
    #[error("supervision failed: {message}")]
    Supervision {
        /// Description of the failure.
        message: String,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl NsboxError {
    /// Returns the pipeline phase this error belongs to.
    #[must_use]
    pub const fn phase(&self) -> LaunchPhase {
        match self {
            Self::Privilege { .. } | Self::Config { .. } | Self::Io { .. } => {
                LaunchPhase::Preflight
            }
            Self::Namespace { .. } => LaunchPhase::Namespace,
            Self::Cgroup { .. } => LaunchPhase::Cgroup,
            Self::Jail { .. } => LaunchPhase::Jail,
            Self::Exec { .. } => LaunchPhase::Exec,
            Self::Supervision { .. } | Self::Serialization { .. } => LaunchPhase::Supervision,
        }
    }

    /// Returns the process exit code the CLI reports for this error.
    ///
    /// Launch failures share one distinguished code so callers can tell
    /// them apart from the containerized command's own failures.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Exec {
                kind: ExecFailure::NotFound,
                ..
            } => EXIT_NOT_FOUND,
            Self::Exec {
                kind: ExecFailure::NotExecutable,
                ..
            } => EXIT_NOT_EXECUTABLE,
            _ => EXIT_LAUNCH_FAILURE,
        }
    }

    /// Shorthand for a cgroup error built from an I/O failure.
    pub fn cgroup(operation: &'static str, path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::Cgroup {
            operation,
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, NsboxError>;
