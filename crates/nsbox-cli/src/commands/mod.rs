//! CLI command definitions and dispatch.

pub mod memory;
pub mod run;
pub mod shell;

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use nsbox_common::config::RuntimeConfig;
use nsbox_common::spec::{ContainerSpec, Entrypoint, SessionMode};
use nsbox_common::types::{CpuQuota, ResourceLimits};
use nsbox_common::units::parse_memory;
use nsbox_runtime::{RunReport, Supervisor};

use crate::{LogFormat, output};

/// nsbox — minimal namespace and cgroup container runtime.
#[derive(Parser, Debug)]
#[command(name = "nsbox", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Pre-extracted root filesystem used as the container root.
    #[arg(long, global = true, env = "NSBOX_ROOTFS")]
    pub rootfs: Option<PathBuf>,

    /// JSON runtime configuration file.
    #[arg(long, global = true, env = "NSBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter directive, e.g. `debug` or `nsbox_core=trace` (overrides `RUST_LOG`).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Print the run report as JSON on stderr.
    #[arg(long, global = true)]
    pub json_report: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start an interactive shell inside a new container.
    Shell(shell::ShellArgs),
    /// Run one command inside a new container and mirror its exit code.
    Run(run::RunArgs),
    /// Verify memory enforcement with a workload that outgrows its ceiling.
    Memory(memory::MemoryArgs),
}

/// Per-launch overrides shared by every subcommand.
#[derive(Args, Debug, Default, Clone)]
pub struct LaunchArgs {
    /// Memory ceiling, e.g. `50MiB`, `1GiB`, or plain bytes.
    #[arg(long, value_parser = parse_memory_arg)]
    pub memory: Option<u64>,

    /// CPU bandwidth in CPUs, e.g. `0.5` or `2`.
    #[arg(long, value_parser = parse_cpus)]
    pub cpus: Option<u32>,

    /// Relative CPU weight (1-10000).
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=10_000))]
    pub cpu_weight: Option<u64>,

    /// Hostname inside the container.
    #[arg(long)]
    pub hostname: Option<String>,
}

impl LaunchArgs {
    /// Limits from the command line, unset ones left for the config.
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_max_bytes: self.memory,
            cpu_quota: self.cpus.map(CpuQuota::from_percent),
            cpu_weight: self.cpu_weight,
        }
    }
}

/// Settings resolved from the configuration file and global flags.
#[derive(Debug)]
pub struct Context {
    config: RuntimeConfig,
    rootfs: Option<PathBuf>,
    json_report: bool,
}

impl Context {
    fn load(cli: &Cli) -> anyhow::Result<Self> {
        let config = RuntimeConfig::load(cli.config.as_deref()).with_context(|| {
            format!(
                "loading configuration{}",
                cli.config
                    .as_ref()
                    .map_or_else(String::new, |p| format!(" from {}", p.display()))
            )
        })?;
        Ok(Self {
            rootfs: cli.rootfs.clone().or_else(|| config.rootfs.clone()),
            config,
            json_report: cli.json_report,
        })
    }

    /// Builds a launch description, flags taking precedence over the config.
    fn spec(
        &self,
        entrypoint: Entrypoint,
        launch: &LaunchArgs,
        mode: SessionMode,
    ) -> anyhow::Result<ContainerSpec> {
        let rootfs = self
            .rootfs
            .clone()
            .context("no root filesystem given; pass --rootfs or set NSBOX_ROOTFS")?;
        let hostname = launch
            .hostname
            .clone()
            .unwrap_or_else(|| self.config.hostname.clone());
        let spec = ContainerSpec::builder(rootfs, entrypoint)
            .hostname(hostname)
            .limits(launch.limits().or(&self.config.default_limits))
            .mode(mode)
            .build()?;
        Ok(spec)
    }

    /// Runs `spec` under a supervisor configured from this context.
    fn launch(&self, spec: &ContainerSpec) -> anyhow::Result<RunReport> {
        tracing::debug!(id = %spec.id(), limits = ?spec.limits(), "starting launch");
        let report = Supervisor::new(self.config.clone()).run(spec)?;
        output::print_report(&report, self.json_report)?;
        Ok(report)
    }
}

/// Dispatches the parsed CLI command and returns the process exit code.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the launch fails.
pub fn execute(cli: Cli) -> anyhow::Result<i32> {
    let ctx = Context::load(&cli)?;
    match cli.command {
        Command::Shell(args) => shell::execute(&ctx, &args),
        Command::Run(args) => run::execute(&ctx, args),
        Command::Memory(args) => memory::execute(&ctx, &args),
    }
}

fn parse_memory_arg(s: &str) -> Result<u64, String> {
    match parse_memory(s) {
        Some(0) => Err("memory limit must be greater than zero".into()),
        Some(bytes) => Ok(bytes),
        None => Err(format!("invalid memory size {s:?} (try 50MiB or 1GiB)")),
    }
}

/// Parses a CPU count with up to two decimals into a percentage of one CPU.
fn parse_cpus(s: &str) -> Result<u32, String> {
    let invalid = || format!("invalid CPU count {s:?} (try 0.5 or 2)");
    let (whole, frac) = s.trim().split_once('.').unwrap_or((s.trim(), ""));
    if frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let whole: u32 = whole.parse().map_err(|_| invalid())?;
    let frac: u32 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<2}").parse().map_err(|_| invalid())?
    };
    let percent = whole
        .checked_mul(100)
        .and_then(|p| p.checked_add(frac))
        .ok_or_else(invalid)?;
    if percent == 0 {
        return Err("CPU count must be greater than zero".into());
    }
    Ok(percent)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_takes_trailing_command_with_flags() {
        let cli = Cli::try_parse_from([
            "nsbox", "--rootfs", "/srv/alpine", "run", "--memory", "64MiB", "ls", "-la", "/",
        ])
        .expect("parse");
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.command, ["ls", "-la", "/"]);
        assert_eq!(args.launch.memory, Some(64 * 1024 * 1024));
        assert_eq!(cli.rootfs, Some(PathBuf::from("/srv/alpine")));
    }

    #[test]
    fn run_requires_a_command() {
        assert!(Cli::try_parse_from(["nsbox", "run"]).is_err());
    }

    #[test]
    fn cpus_accept_fractions() {
        assert_eq!(parse_cpus("0.5"), Ok(50));
        assert_eq!(parse_cpus("2"), Ok(200));
        assert_eq!(parse_cpus("1.25"), Ok(125));
        assert!(parse_cpus("0").is_err());
        assert!(parse_cpus("1.234").is_err());
        assert!(parse_cpus("-1").is_err());
        assert!(parse_cpus("lots").is_err());
    }

    #[test]
    fn zero_memory_is_rejected() {
        assert!(parse_memory_arg("0").is_err());
        assert!(parse_memory_arg("50 bananas").is_err());
        assert_eq!(parse_memory_arg("1KiB"), Ok(1024));
    }

    #[test]
    fn flags_override_config_limits() {
        let mut config = RuntimeConfig::default();
        config.default_limits.memory_max_bytes = Some(1024);
        config.default_limits.cpu_weight = Some(50);
        let ctx = Context {
            config,
            rootfs: Some(PathBuf::from("/srv/rootfs")),
            json_report: false,
        };
        let launch = LaunchArgs {
            memory: Some(4096),
            hostname: Some("box".into()),
            ..LaunchArgs::default()
        };

        let spec = ctx
            .spec(
                Entrypoint::Exec {
                    program: "true".into(),
                    args: vec![],
                },
                &launch,
                SessionMode::Batch,
            )
            .expect("spec");
        assert_eq!(spec.limits().memory_max_bytes, Some(4096));
        assert_eq!(spec.limits().cpu_weight, Some(50));
        assert_eq!(spec.hostname(), "box");
    }

    #[test]
    fn plain_run_gets_default_ceilings() {
        let cli = Cli::try_parse_from(["nsbox", "--rootfs", "/srv/rootfs", "run", "true"])
            .expect("parse");
        let ctx = Context::load(&cli).expect("context");
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };

        let spec = ctx
            .spec(
                Entrypoint::Exec {
                    program: "true".into(),
                    args: vec![],
                },
                &args.launch,
                SessionMode::Batch,
            )
            .expect("spec");
        assert_eq!(spec.limits().memory_max_bytes, Some(50 * 1024 * 1024));
        assert_eq!(spec.limits().cpu_quota, Some(CpuQuota::from_percent(25)));
    }

    #[test]
    fn missing_rootfs_is_explained() {
        let ctx = Context {
            config: RuntimeConfig::default(),
            rootfs: None,
            json_report: false,
        };
        let err = ctx
            .spec(
                Entrypoint::Exec {
                    program: "true".into(),
                    args: vec![],
                },
                &LaunchArgs::default(),
                SessionMode::Batch,
            )
            .unwrap_err();
        assert!(err.to_string().contains("--rootfs"));
    }
}
