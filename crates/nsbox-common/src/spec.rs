//! Immutable description of one container launch.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_HOSTNAME, SELF_TEST_STEP, SELF_TEST_TARGET};
use crate::error::{NsboxError, Result};
use crate::types::{ContainerId, NamespaceSet, ResourceLimits};

/// Longest hostname accepted by `sethostname(2)`.
const HOSTNAME_MAX: usize = 64;

/// Built-in workload that grows its memory in fixed steps.
///
/// Used by the memory self-test so enforcement can be verified without
/// any program in the root filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressPlan {
    /// Bytes allocated and touched per step.
    pub step_bytes: u64,
    /// Total the workload tries to reach before exiting successfully.
    pub target_bytes: u64,
}

impl Default for StressPlan {
    fn default() -> Self {
        Self {
            step_bytes: SELF_TEST_STEP,
            target_bytes: SELF_TEST_TARGET,
        }
    }
}

/// What the container's PID 1 becomes once the jail is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entrypoint {
    /// Replace the bootstrap image with a program from the root filesystem.
    Exec {
        /// Absolute path or bare name resolved against the container `PATH`.
        program: String,
        /// Arguments, not including `argv[0]`.
        args: Vec<String>,
    },
    /// Run the built-in memory stress workload.
    MemoryStress(StressPlan),
}

impl Entrypoint {
    /// Human-readable label for logs and reports.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Exec { program, args } if args.is_empty() => program.clone(),
            Self::Exec { program, args } => format!("{program} {}", args.join(" ")),
            Self::MemoryStress(plan) => format!(
                "memory-stress step={} target={}",
                plan.step_bytes, plan.target_bytes
            ),
        }
    }
}

/// Whether the container is attached to the invoking terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Inherit the terminal; forward resize and interrupt signals.
    Interactive,
    /// Stdin from `/dev/null`; forward termination signals only.
    Batch,
}

/// Immutable input describing one container launch.
///
/// Built once through [`ContainerSpecBuilder`] and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    id: ContainerId,
    rootfs: PathBuf,
    entrypoint: Entrypoint,
    hostname: String,
    limits: ResourceLimits,
    namespaces: NamespaceSet,
    mode: SessionMode,
}

impl ContainerSpec {
    /// Starts a builder for a spec rooted at `rootfs`.
    pub fn builder(rootfs: impl Into<PathBuf>, entrypoint: Entrypoint) -> ContainerSpecBuilder {
        ContainerSpecBuilder::new(rootfs, entrypoint)
    }

    /// Container identifier (also the cgroup name).
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Root of the minimal-userland tree.
    #[must_use]
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// What PID 1 runs.
    #[must_use]
    pub const fn entrypoint(&self) -> &Entrypoint {
        &self.entrypoint
    }

    /// Hostname set inside the UTS namespace.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Resource limits for the control group.
    #[must_use]
    pub const fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Namespaces requested for the child.
    #[must_use]
    pub const fn namespaces(&self) -> NamespaceSet {
        self.namespaces
    }

    /// Terminal attachment mode.
    #[must_use]
    pub const fn mode(&self) -> SessionMode {
        self.mode
    }
}

/// Builder for [`ContainerSpec`].
#[derive(Debug, Clone)]
pub struct ContainerSpecBuilder {
    id: Option<ContainerId>,
    rootfs: PathBuf,
    entrypoint: Entrypoint,
    hostname: String,
    limits: ResourceLimits,
    namespaces: NamespaceSet,
    mode: SessionMode,
}

impl ContainerSpecBuilder {
    fn new(rootfs: impl Into<PathBuf>, entrypoint: Entrypoint) -> Self {
        Self {
            id: None,
            rootfs: rootfs.into(),
            entrypoint,
            hostname: DEFAULT_HOSTNAME.to_string(),
            limits: ResourceLimits::default(),
            namespaces: NamespaceSet::all(),
            mode: SessionMode::Batch,
        }
    }

    /// Uses a fixed container ID instead of a generated one.
    #[must_use]
    pub fn id(mut self, id: ContainerId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the container hostname.
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Sets the resource limits.
    #[must_use]
    pub const fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Overrides the requested namespaces.
    #[must_use]
    pub const fn namespaces(mut self, namespaces: NamespaceSet) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Sets the terminal attachment mode.
    #[must_use]
    pub const fn mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Validates the inputs and freezes them into a [`ContainerSpec`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a relative root path, an empty or
    /// over-long hostname, an empty program, invalid limits, a stress plan
    /// with a zero step, or an unusable container ID.
    pub fn build(self) -> Result<ContainerSpec> {
        if !self.rootfs.is_absolute() {
            return Err(NsboxError::Config {
                message: format!("rootfs must be an absolute path: {}", self.rootfs.display()),
            });
        }
        if self.hostname.is_empty() || self.hostname.len() > HOSTNAME_MAX {
            return Err(NsboxError::Config {
                message: format!("hostname must be 1..={HOSTNAME_MAX} bytes"),
            });
        }
        match &self.entrypoint {
            Entrypoint::Exec { program, args } => {
                if program.is_empty() {
                    return Err(NsboxError::Config {
                        message: "program must not be empty".into(),
                    });
                }
                if program.contains('\0') || args.iter().any(|a| a.contains('\0')) {
                    return Err(NsboxError::Config {
                        message: "program and arguments must not contain NUL bytes".into(),
                    });
                }
            }
            Entrypoint::MemoryStress(plan) => {
                if plan.step_bytes == 0 || plan.target_bytes < plan.step_bytes {
                    return Err(NsboxError::Config {
                        message: "stress plan needs a non-zero step no larger than its target"
                            .into(),
                    });
                }
            }
        }
        self.limits.validate()?;
        let id = self.id.unwrap_or_else(ContainerId::generate);
        id.validate()?;

        Ok(ContainerSpec {
            id,
            rootfs: self.rootfs,
            entrypoint: self.entrypoint,
            hostname: self.hostname,
            limits: self.limits,
            namespaces: self.namespaces,
            mode: self.mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Entrypoint {
        Entrypoint::Exec {
            program: "echo".into(),
            args: vec!["hello".into()],
        }
    }

    #[test]
    fn builder_applies_defaults() {
        let spec = ContainerSpec::builder("/srv/rootfs", echo())
            .build()
            .expect("valid spec");
        assert_eq!(spec.hostname(), DEFAULT_HOSTNAME);
        assert_eq!(spec.mode(), SessionMode::Batch);
        assert_eq!(spec.namespaces(), NamespaceSet::all());
        assert!(spec.limits().is_unbounded());
    }

    #[test]
    fn relative_rootfs_is_rejected() {
        let err = ContainerSpec::builder("rootfs", echo()).build().unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn empty_program_is_rejected() {
        let entry = Entrypoint::Exec {
            program: String::new(),
            args: vec![],
        };
        assert!(ContainerSpec::builder("/srv/rootfs", entry).build().is_err());
    }

    #[test]
    fn long_hostname_is_rejected() {
        let result = ContainerSpec::builder("/srv/rootfs", echo())
            .hostname("h".repeat(65))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn zero_step_stress_plan_is_rejected() {
        let plan = StressPlan {
            step_bytes: 0,
            target_bytes: 10,
        };
        let result = ContainerSpec::builder("/srv/rootfs", Entrypoint::MemoryStress(plan)).build();
        assert!(result.is_err());
    }

    #[test]
    fn fixed_id_is_kept() {
        let spec = ContainerSpec::builder("/srv/rootfs", echo())
            .id(ContainerId::new("web-1"))
            .build()
            .expect("valid spec");
        assert_eq!(spec.id().as_str(), "web-1");
    }

    #[test]
    fn entrypoint_description() {
        assert_eq!(echo().describe(), "echo hello");
        let bare = Entrypoint::Exec {
            program: "/bin/sh".into(),
            args: vec![],
        };
        assert_eq!(bare.describe(), "/bin/sh");
    }
}
