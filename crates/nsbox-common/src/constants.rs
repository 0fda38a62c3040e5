//! System-wide constants and default paths.

/// Application name used in log output and cgroup naming.
pub const APP_NAME: &str = "nsbox";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "nsbox";

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Parent group under which every container group is created.
pub const DEFAULT_CGROUP_PARENT: &str = "nsbox";

/// Hostname given to containers that do not ask for one.
pub const DEFAULT_HOSTNAME: &str = "nsbox";

/// Interactive shell launched by `nsbox shell`.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Search path used to resolve bare program names inside the jail.
pub const CONTAINER_PATH: &str = "/bin:/sbin:/usr/bin:/usr/sbin";

/// Home directory exported to the container's environment.
pub const CONTAINER_HOME: &str = "/root";

/// Directory (relative to the new root) that receives the old root during `pivot_root(2)`.
pub const OLD_ROOT_DIR: &str = ".nsbox-oldroot";

/// Controllers the resource limiter requires from the cgroup v2 hierarchy.
pub const REQUIRED_CONTROLLERS: [&str; 2] = ["memory", "cpu"];

/// Memory ceiling applied when neither the command line nor the config sets one.
pub const DEFAULT_MEMORY_LIMIT: u64 = 50 * MIB;

/// CPU quota, in percent of one CPU, applied when none is configured.
pub const DEFAULT_CPU_PERCENT: u32 = 25;

/// `cpu.max` period in microseconds.
pub const CPU_PERIOD_US: u64 = 100_000;

/// Highest value accepted by `cpu.weight`.
pub const CPU_WEIGHT_MAX: u64 = 10_000;

/// Grace period between a forwarded termination signal and SIGKILL.
pub const DEFAULT_STOP_GRACE_MS: u64 = 2_000;

/// Attempts made to remove a busy cgroup before giving up.
pub const DEFAULT_RELEASE_ATTEMPTS: u32 = 5;

/// First backoff delay between cgroup removal attempts; doubled each retry.
pub const DEFAULT_RELEASE_BACKOFF_MS: u64 = 20;

/// Stack size handed to `clone(2)` for the bootstrap child.
pub const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Memory ceiling used by the `memory` self-test.
pub const SELF_TEST_MEMORY_LIMIT: u64 = 50 * MIB;

/// Size the self-test workload tries to reach.
pub const SELF_TEST_TARGET: u64 = 200 * MIB;

/// Allocation step of the self-test workload.
pub const SELF_TEST_STEP: u64 = 10 * MIB;

/// Exit code reported when the launch itself failed (namespace, cgroup, jail, privilege).
pub const EXIT_LAUNCH_FAILURE: i32 = 125;

/// Exit code reported when the target exists but cannot be executed.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;

/// Exit code reported when the target cannot be found inside the jail.
pub const EXIT_NOT_FOUND: i32 = 127;

/// Offset added to a terminating signal number to form an exit code.
pub const EXIT_SIGNAL_BASE: i32 = 128;
