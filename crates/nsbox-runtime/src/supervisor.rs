//! Host-side orchestration of one container run.
//!
//! The supervisor owns every resource a launch allocates. Each step
//! advances a [`Lifecycle`]; on success or failure the same cleanup path
//! runs, driven by the highest state the launch reached.

use std::fs::File;
use std::io::{BufReader, IsTerminal, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use chrono::Utc;
use nix::fcntl::OFlag;
use nsbox_common::config::RuntimeConfig;
use nsbox_common::constants::CHILD_STACK_SIZE;
use nsbox_common::error::{NsboxError, Result};
use nsbox_common::spec::{ContainerSpec, SessionMode};
use nsbox_common::types::{ContainerState, ExitStatus};
use nsbox_core::cgroup::{CgroupHandle, ResourceLimiter};
use nsbox_core::signal::{ForwardPolicy, SignalForwarder};
use nsbox_core::{filesystem, namespace, privilege};

use crate::bootstrap::{self, ChildContext, ChildMessage};
use crate::lifecycle::{Lifecycle, SupervisorState};
use crate::metrics;
use crate::process::ContainerProcess;
use crate::report::RunReport;

/// Privilege gate run before anything is allocated.
pub type PrivilegeCheck = fn() -> Result<()>;

/// Launches containers and supervises them until they exit.
#[derive(Debug)]
pub struct Supervisor {
    config: RuntimeConfig,
    limiter: ResourceLimiter,
    privilege: PrivilegeCheck,
}

impl Supervisor {
    /// Creates a supervisor over the real cgroup hierarchy named in `config`.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let limiter = ResourceLimiter::from_config(&config);
        Self {
            config,
            limiter,
            privilege: privilege::require_root,
        }
    }

    /// Replaces the resource limiter.
    #[must_use]
    pub fn with_limiter(mut self, limiter: ResourceLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Replaces the privilege check.
    #[must_use]
    pub fn with_privilege_check(mut self, check: PrivilegeCheck) -> Self {
        self.privilege = check;
        self
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Runs `spec` to completion.
    ///
    /// Returns the report of a container whose program ran, whatever its
    /// exit status. Every resource is released before this returns, on
    /// the error path too.
    ///
    /// # Errors
    ///
    /// Returns the error of the first launch step that failed: missing
    /// privilege, an unusable root filesystem, namespace creation, cgroup
    /// allocation, a jail step, or resolving and executing the program.
    pub fn run(&self, spec: &ContainerSpec) -> Result<RunReport> {
        let started_at = Utc::now();
        (self.privilege)()?;
        let rootfs = filesystem::validate_rootfs(spec.rootfs())?;
        if !spec.namespaces().mount {
            return Err(NsboxError::Config {
                message: "a mount namespace is required to jail the root filesystem".into(),
            });
        }
        if spec.mode() == SessionMode::Interactive && !std::io::stdin().is_terminal() {
            tracing::warn!("interactive session requested but stdin is not a terminal");
        }

        let forwarder = SignalForwarder::install(&ForwardPolicy::for_mode(spec.mode()))?;
        let mut launch = Launch::default();
        tracing::info!(
            id = %spec.id(),
            rootfs = %rootfs.display(),
            entrypoint = %spec.entrypoint().describe(),
            "launching container"
        );

        let outcome = self.launch(spec, &rootfs, &forwarder, &mut launch);
        forwarder.clear_target();
        let outcome = outcome.map(|status| {
            let metrics = launch.cgroup.as_ref().and_then(|cgroup| {
                metrics::collect_metrics(spec.id(), cgroup)
                    .map_err(|e| tracing::warn!(error = %e, "could not read resource usage"))
                    .ok()
            });
            (status, metrics)
        });
        if let Err(e) = &outcome {
            tracing::error!(id = %spec.id(), state = %launch.lifecycle.current(), error = %e, "launch failed");
            launch.lifecycle.abort();
        }
        launch.cleanup();

        let (status, metrics) = outcome?;
        let host_pid = launch
            .process
            .as_ref()
            .map_or(0, |p| p.host_pid().as_raw());
        Ok(RunReport {
            id: spec.id().clone(),
            entrypoint: spec.entrypoint().describe(),
            host_pid,
            status,
            exit_code: status.code(),
            metrics,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn launch(
        &self,
        spec: &ContainerSpec,
        rootfs: &Path,
        forwarder: &SignalForwarder,
        launch: &mut Launch,
    ) -> Result<ExitStatus> {
        let (sync_read, sync_write) = pipe()?;
        let (status_read, status_write) = pipe()?;
        abort_if_terminated(forwarder)?;

        let ctx = ChildContext {
            rootfs: rootfs.to_path_buf(),
            hostname: spec.hostname().to_string(),
            entrypoint: spec.entrypoint().clone(),
            mode: spec.mode(),
            namespaces: spec.namespaces(),
            sync_read: sync_read.as_raw_fd(),
            sync_write: sync_write.as_raw_fd(),
            status_read: status_read.as_raw_fd(),
            status_write: status_write.as_raw_fd(),
            term: std::env::var("TERM").ok(),
        };
        let mut stack = vec![0_u8; CHILD_STACK_SIZE];
        let child = namespace::isolate(spec.namespaces(), &mut stack, || {
            bootstrap::child_main(&ctx)
        })?;
        let pid = child.pid();
        launch.process = Some(ContainerProcess::new(child));
        launch.lifecycle.advance(SupervisorState::NamespaceRequested)?;
        forwarder.set_target(pid);
        drop(sync_read);
        drop(status_write);

        let cgroup = launch.cgroup.insert(self.limiter.allocate(spec)?);
        let host_pid = u32::try_from(pid.as_raw()).map_err(|_| NsboxError::Supervision {
            message: format!("invalid child pid {pid}"),
        })?;
        cgroup.attach(host_pid)?;
        launch.lifecycle.advance(SupervisorState::ResourceAllocated)?;

        abort_if_terminated(forwarder)?;
        let mut go = File::from(sync_write);
        go.write_all(&[1]).map_err(|e| NsboxError::Supervision {
            message: format!("releasing child: {e}"),
        })?;
        drop(go);

        let mut status = BufReader::new(File::from(status_read));
        let process = launch.process.as_mut().ok_or_else(|| NsboxError::Supervision {
            message: "child process missing".into(),
        })?;
        while let Some(message) = bootstrap::next_message(&mut status)? {
            match message {
                ChildMessage::Jailed => {
                    launch.lifecycle.advance(SupervisorState::Jailed)?;
                    process.advance(ContainerState::Jailed)?;
                    tracing::debug!(%pid, "child jailed");
                }
                failed @ ChildMessage::Failed { .. } => {
                    return Err(failed.into_error().unwrap_or_else(|| NsboxError::Supervision {
                        message: "child reported an unknown failure".into(),
                    }));
                }
            }
        }
        if launch.lifecycle.current() < SupervisorState::Jailed {
            return Err(NsboxError::Supervision {
                message: "child exited before completing its setup".into(),
            });
        }
        launch.lifecycle.advance(SupervisorState::Running)?;
        process.advance(ContainerState::Running)?;
        tracing::info!(id = %spec.id(), %pid, "container running");

        let status = process.wait(self.config.stop_grace(), || forwarder.pending_termination())?;
        launch.lifecycle.advance(SupervisorState::Exited)?;
        Ok(status)
    }
}

/// Resources owned by one launch, released by [`Launch::cleanup`].
#[derive(Debug, Default)]
struct Launch {
    lifecycle: Lifecycle,
    process: Option<ContainerProcess>,
    cgroup: Option<CgroupHandle>,
}

impl Launch {
    /// Undoes whatever the highest state reached requires.
    ///
    /// The child is always gone before its control group is removed.
    /// Release failures are logged, not returned: the run's own outcome
    /// is what the caller needs.
    fn cleanup(&mut self) {
        let plan = self.lifecycle.cleanup_plan();
        tracing::debug!(highest = %self.lifecycle.highest(), ?plan, "cleaning up launch");

        if let Some(process) = self.process.as_mut() {
            if (plan.kill_child || plan.reap_child) && !process.is_reaped() {
                process.terminate();
            }
        }
        // A group allocated before the lifecycle recorded it is released on drop.
        if let Some(mut cgroup) = self.cgroup.take() {
            if plan.release_cgroup {
                if let Err(e) = cgroup.release() {
                    tracing::warn!(error = %e, "cgroup left behind");
                }
            }
        }
        if let Some(process) = self.process.as_mut() {
            if process.is_reaped() && process.state() == ContainerState::Exited {
                let _ = process.advance(ContainerState::Reaped);
            }
        }
        self.lifecycle.finish();
    }
}

fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| NsboxError::Supervision {
        message: format!("pipe2: {e}"),
    })
}

fn abort_if_terminated(forwarder: &SignalForwarder) -> Result<()> {
    match forwarder.pending_termination() {
        Some(sig) => Err(NsboxError::Supervision {
            message: format!("launch interrupted by {sig}"),
        }),
        None => Ok(()),
    }
}

/// Exit code the runtime should terminate with for a run's outcome.
#[must_use]
pub fn exit_code(outcome: &Result<RunReport>) -> i32 {
    match outcome {
        Ok(report) => report.exit_code,
        Err(e) => e.exit_code(),
    }
}
