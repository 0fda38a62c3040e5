//! # nsbox
//!
//! Minimal Linux container runtime: runs a command from a pre-extracted
//! root filesystem inside fresh namespaces under cgroup v2 limits.

#![allow(clippy::print_stderr)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

mod commands;
mod output;

use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use nsbox_common::constants::EXIT_LAUNCH_FAILURE;
use nsbox_common::error::NsboxError;
use tracing_subscriber::EnvFilter;

use crate::commands::Cli;

/// Log line format on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.log_level.as_deref(), cli.log_format) {
        eprintln!("nsbox: invalid log filter: {e:#}");
        return exit_with(EXIT_LAUNCH_FAILURE);
    }

    match commands::execute(cli) {
        Ok(code) => exit_with(code),
        Err(err) => {
            eprintln!("nsbox: {err:#}");
            let code = err
                .downcast_ref::<NsboxError>()
                .map_or(EXIT_LAUNCH_FAILURE, NsboxError::exit_code);
            exit_with(code)
        }
    }
}

/// Logs go to stderr; stdout belongs to the container.
fn init_tracing(level: Option<&str>, format: LogFormat) -> anyhow::Result<()> {
    let filter = match level {
        Some(directive) => EnvFilter::try_new(directive)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

fn exit_with(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
