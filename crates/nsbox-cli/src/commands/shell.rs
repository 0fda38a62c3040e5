//! `nsbox shell` — Interactive shell inside a new container.

use clap::Args;
use nsbox_common::constants::DEFAULT_SHELL;
use nsbox_common::spec::{Entrypoint, SessionMode};

use super::{Context, LaunchArgs};

/// Arguments for the `shell` command.
#[derive(Args, Debug)]
pub struct ShellArgs {
    /// Resource limits and hostname.
    #[command(flatten)]
    pub launch: LaunchArgs,
}

/// Executes the `shell` command.
///
/// The shell inherits the terminal. Interrupts reach the shell;
/// `SIGTERM` and `SIGHUP` end the session.
///
/// # Errors
///
/// Returns an error if the shell could not be started.
pub fn execute(ctx: &Context, args: &ShellArgs) -> anyhow::Result<i32> {
    let entrypoint = Entrypoint::Exec {
        program: DEFAULT_SHELL.to_string(),
        args: Vec::new(),
    };
    let spec = ctx.spec(entrypoint, &args.launch, SessionMode::Interactive)?;
    let report = ctx.launch(&spec)?;
    Ok(report.exit_code)
}
