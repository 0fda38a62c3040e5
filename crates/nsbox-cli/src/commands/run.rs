//! `nsbox run` — Run one command inside a new container.

use clap::Args;
use nsbox_common::spec::{Entrypoint, SessionMode};

use super::{Context, LaunchArgs};

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Resource limits and hostname.
    #[command(flatten)]
    pub launch: LaunchArgs,

    /// Program and its arguments; bare names are looked up on the container `PATH`.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Executes the `run` command.
///
/// Stdin is `/dev/null`; the exit code mirrors the command's.
///
/// # Errors
///
/// Returns an error if the launch fails before the command starts.
pub fn execute(ctx: &Context, args: RunArgs) -> anyhow::Result<i32> {
    let mut command = args.command.into_iter();
    let program = command
        .next()
        .ok_or_else(|| anyhow::anyhow!("no command given"))?;
    let entrypoint = Entrypoint::Exec {
        program,
        args: command.collect(),
    };
    let spec = ctx.spec(entrypoint, &args.launch, SessionMode::Batch)?;
    let report = ctx.launch(&spec)?;
    Ok(report.exit_code)
}
