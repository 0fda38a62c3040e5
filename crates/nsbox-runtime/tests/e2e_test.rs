//! End-to-end tests for the nsbox launch pipeline.
//!
//! Covered scenarios:
//! - Privilege failure, an unusable rootfs, or a missing mount namespace
//!   is refused before any cgroup operation (no privilege needed).
//! - A clean `echo` exits 0 and removes its control group.
//! - The container's exit code becomes the runtime's.
//! - The command runs as PID 1 and sees only its own processes.
//! - A hostname change stays inside the UTS namespace.
//! - The old root is detached after the pivot.
//! - An unresolvable program maps to exit code 127.
//! - A termination request escalates to SIGKILL and still releases the group.
//! - A 50 MiB ceiling stops the memory stress workload.
//!
//! Tests marked `#[ignore]` need root, a cgroup v2 hierarchy with the
//! `memory` and `cpu` controllers, and a minimal userland whose path is
//! given in `NSBOX_TEST_ROOTFS`. Run them with
//! `sudo -E cargo test -p nsbox-runtime -- --ignored`.

#![allow(clippy::expect_used, clippy::unwrap_used, missing_docs, unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nsbox_common::config::{ReleasePolicy, RuntimeConfig};
use nsbox_common::constants::{CGROUP_V2_PATH, SELF_TEST_MEMORY_LIMIT};
use nsbox_common::error::{ExecFailure, NsboxError};
use nsbox_common::spec::{ContainerSpec, Entrypoint, SessionMode, StressPlan};
use nsbox_common::types::{ExitStatus, NamespaceSet, ResourceLimits};
use nsbox_core::cgroup::fake::{FakeCgroupBackend, FakeOp};
use nsbox_core::cgroup::{Removal, ResourceLimiter};
use nsbox_runtime::Supervisor;

fn rootfs() -> PathBuf {
    PathBuf::from(std::env::var("NSBOX_TEST_ROOTFS").expect("NSBOX_TEST_ROOTFS must point at a rootfs"))
}

fn exec(program: &str, args: &[&str]) -> Entrypoint {
    Entrypoint::Exec {
        program: program.into(),
        args: args.iter().map(ToString::to_string).collect(),
    }
}

fn batch(entrypoint: Entrypoint) -> ContainerSpec {
    ContainerSpec::builder(rootfs(), entrypoint)
        .mode(SessionMode::Batch)
        .build()
        .expect("spec")
}

fn fake_supervisor() -> (Arc<FakeCgroupBackend>, Supervisor) {
    fake_supervisor_with(RuntimeConfig::default())
}

fn fake_supervisor_with(config: RuntimeConfig) -> (Arc<FakeCgroupBackend>, Supervisor) {
    let fake = Arc::new(FakeCgroupBackend::new());
    let limiter = ResourceLimiter::new(
        fake.clone(),
        "nsbox",
        ReleasePolicy {
            attempts: 2,
            initial_backoff_ms: 0,
        },
    );
    (fake, Supervisor::new(config).with_limiter(limiter))
}

// ── Pre-flight (no privilege needed) ────────────────────────────────

#[test]
fn unprivileged_launch_touches_nothing() {
    let (fake, supervisor) = fake_supervisor();
    let supervisor = supervisor.with_privilege_check(|| nsbox_core::privilege::check_euid(1000));
    let root = tempfile::tempdir().expect("tempdir");
    let spec = ContainerSpec::builder(root.path(), exec("echo", &["hello"]))
        .build()
        .expect("spec");

    let err = supervisor.run(&spec).unwrap_err();
    assert!(matches!(err, NsboxError::Privilege { .. }));
    assert!(fake.ops().is_empty());
}

#[test]
fn rootfs_that_is_a_file_is_rejected() {
    let (fake, supervisor) = fake_supervisor();
    let supervisor = supervisor.with_privilege_check(|| Ok(()));
    let file = tempfile::NamedTempFile::new().expect("file");
    let spec = ContainerSpec::builder(file.path(), exec("echo", &[]))
        .build()
        .expect("spec");

    let err = supervisor.run(&spec).unwrap_err();
    assert_eq!(err.exit_code(), 125);
    assert!(fake.ops().is_empty());
}

#[test]
fn launch_without_mount_namespace_is_refused() {
    let (fake, supervisor) = fake_supervisor();
    let supervisor = supervisor.with_privilege_check(|| Ok(()));
    let root = tempfile::tempdir().expect("tempdir");
    let spec = ContainerSpec::builder(root.path(), exec("echo", &[]))
        .namespaces(NamespaceSet {
            mount: false,
            ..NamespaceSet::all()
        })
        .build()
        .expect("spec");

    assert!(matches!(supervisor.run(&spec), Err(NsboxError::Config { .. })));
    assert!(fake.ops().is_empty());
}

// ── Full pipeline (root) ───────────────────────────────────────────

fn cgroup_dir(spec: &ContainerSpec) -> PathBuf {
    PathBuf::from(CGROUP_V2_PATH).join("nsbox").join(spec.id().as_str())
}

#[test]
#[ignore = "needs root, cgroup v2 and NSBOX_TEST_ROOTFS"]
fn echo_exits_zero_and_leaves_no_cgroup() {
    let spec = batch(exec("echo", &["hello"]));
    let report = Supervisor::new(RuntimeConfig::default()).run(&spec).expect("run");

    assert_eq!(report.status, ExitStatus::Exited(0));
    assert_eq!(report.exit_code, 0);
    assert!(!cgroup_dir(&spec).exists());
}

#[test]
#[ignore = "needs root, cgroup v2 and NSBOX_TEST_ROOTFS"]
fn exit_code_is_mirrored() {
    let spec = batch(exec("sh", &["-c", "exit 7"]));
    let report = Supervisor::new(RuntimeConfig::default()).run(&spec).expect("run");
    assert_eq!(report.exit_code, 7);
}

#[test]
#[ignore = "needs root, cgroup v2 and NSBOX_TEST_ROOTFS"]
fn container_sees_only_its_own_processes() {
    let spec = batch(exec("sh", &["-c", "test \"$$\" = 1 && test \"$(ls /proc | grep -c '^[0-9]')\" -le 5"]));
    let report = Supervisor::new(RuntimeConfig::default()).run(&spec).expect("run");
    assert_eq!(report.status, ExitStatus::Exited(0));
}

#[test]
#[ignore = "needs root, cgroup v2 and NSBOX_TEST_ROOTFS"]
fn hostname_is_private() {
    let spec = ContainerSpec::builder(rootfs(), exec("sh", &["-c", "test \"$(cat /proc/sys/kernel/hostname)\" = sandbox"]))
        .hostname("sandbox")
        .mode(SessionMode::Batch)
        .build()
        .expect("spec");
    let report = Supervisor::new(RuntimeConfig::default()).run(&spec).expect("run");
    assert_eq!(report.status, ExitStatus::Exited(0));
    assert_ne!(nix::unistd::gethostname().expect("hostname"), "sandbox");
}

#[test]
#[ignore = "needs root, cgroup v2 and NSBOX_TEST_ROOTFS"]
fn host_root_is_unreachable() {
    let spec = batch(exec("sh", &["-c", "test ! -e /.nsbox-oldroot && test -d /proc/self"]));
    let report = Supervisor::new(RuntimeConfig::default()).run(&spec).expect("run");
    assert_eq!(report.status, ExitStatus::Exited(0));
}

#[test]
#[ignore = "needs root, cgroup v2 and NSBOX_TEST_ROOTFS"]
fn missing_program_fails_with_127() {
    let spec = batch(exec("definitely-not-installed", &[]));
    let err = Supervisor::new(RuntimeConfig::default()).run(&spec).unwrap_err();

    assert!(matches!(
        err,
        NsboxError::Exec {
            kind: ExecFailure::NotFound,
            ..
        }
    ));
    assert_eq!(err.exit_code(), 127);
    assert!(!cgroup_dir(&spec).exists());
}

#[test]
#[ignore = "needs root and NSBOX_TEST_ROOTFS"]
fn termination_request_escalates_and_releases_cgroup() {
    let (fake, supervisor) = fake_supervisor_with(RuntimeConfig {
        stop_grace_ms: 200,
        ..RuntimeConfig::default()
    });
    let spec = batch(exec("sh", &["-c", "trap '' TERM; sleep 30"]));

    // SAFETY: pthread_self has no preconditions.
    let supervising_thread = unsafe { libc::pthread_self() };
    let sender = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(500));
        // SAFETY: the supervising thread outlives this one; it joins us below.
        let _ = unsafe { libc::pthread_kill(supervising_thread, libc::SIGTERM) };
    });
    let started = Instant::now();
    let report = supervisor.run(&spec).expect("run");
    sender.join().expect("signal sender");

    assert_eq!(report.status, ExitStatus::Signaled(9));
    assert_eq!(report.exit_code, 137);
    assert!(started.elapsed() < Duration::from_secs(10));
    let group = PathBuf::from("nsbox").join(spec.id().as_str());
    assert!(!fake.exists(&group));
    assert!(fake.ops().contains(&FakeOp::Remove(group, Removal::Removed)));
}

#[test]
#[ignore = "needs root, cgroup v2 and NSBOX_TEST_ROOTFS"]
fn memory_ceiling_kills_the_stress_workload() {
    let spec = ContainerSpec::builder(rootfs(), Entrypoint::MemoryStress(StressPlan::default()))
        .limits(ResourceLimits {
            memory_max_bytes: Some(SELF_TEST_MEMORY_LIMIT),
            ..ResourceLimits::default()
        })
        .mode(SessionMode::Batch)
        .build()
        .expect("spec");
    let report = Supervisor::new(RuntimeConfig::default()).run(&spec).expect("run");

    assert_eq!(report.status, ExitStatus::Signaled(9));
    assert!(report.oom_killed());
    assert!(report.memory_peak_bytes().is_none_or(|peak| peak <= SELF_TEST_MEMORY_LIMIT));
    assert!(!cgroup_dir(&spec).exists());
}
