//! `nsbox memory` — Memory enforcement self-test.
//!
//! Runs the built-in stress workload under a small ceiling. A working
//! limit gets the workload killed long before it reaches its target.

use clap::Args;
use nsbox_common::constants::{SELF_TEST_MEMORY_LIMIT, SELF_TEST_STEP, SELF_TEST_TARGET};
use nsbox_common::spec::{Entrypoint, SessionMode, StressPlan};
use nsbox_runtime::RunReport;

use super::{Context, LaunchArgs};
use crate::output::format_bytes;

/// Exit code of a failed self-test.
const SELF_TEST_FAILED: i32 = 1;

/// Arguments for the `memory` command.
#[derive(Args, Debug)]
pub struct MemoryArgs {
    /// Resource limits and hostname; the memory ceiling defaults to 50MiB.
    #[command(flatten)]
    pub launch: LaunchArgs,

    /// Total the workload tries to allocate.
    #[arg(long, value_parser = super::parse_memory_arg, default_value_t = SELF_TEST_TARGET)]
    pub target: u64,

    /// Allocation step.
    #[arg(long, value_parser = super::parse_memory_arg, default_value_t = SELF_TEST_STEP)]
    pub step: u64,
}

/// Executes the `memory` self-test.
///
/// # Errors
///
/// Returns an error if the workload could not be launched.
pub fn execute(ctx: &Context, args: &MemoryArgs) -> anyhow::Result<i32> {
    let mut launch = args.launch.clone();
    let ceiling = *launch.memory.get_or_insert(SELF_TEST_MEMORY_LIMIT);
    if ceiling >= args.target {
        anyhow::bail!(
            "memory ceiling {} must be below the workload target {}",
            format_bytes(ceiling),
            format_bytes(args.target)
        );
    }
    let plan = StressPlan {
        step_bytes: args.step,
        target_bytes: args.target,
    };
    let spec = ctx.spec(Entrypoint::MemoryStress(plan), &launch, SessionMode::Batch)?;
    let report = ctx.launch(&spec)?;

    let (passed, verdict) = verdict(&report, ceiling);
    eprintln!("{verdict}");
    Ok(if passed { 0 } else { SELF_TEST_FAILED })
}

/// Decides whether the ceiling held and describes the outcome.
fn verdict(report: &RunReport, ceiling: u64) -> (bool, String) {
    let peak = report
        .memory_peak_bytes()
        .map_or_else(|| "unknown".to_string(), format_bytes);
    match report.status.signal() {
        Some(sig) => {
            let cause = if report.oom_killed() { "OOM killer" } else { "signal" };
            (
                true,
                format!(
                    "memory self-test passed: workload stopped by {cause} (signal {sig}) under a {} ceiling, peak {peak}",
                    format_bytes(ceiling)
                ),
            )
        }
        None => (
            false,
            format!(
                "memory self-test FAILED: workload {} despite a {} ceiling, peak {peak}",
                report.status,
                format_bytes(ceiling)
            ),
        ),
    }
}
