//! `shellguard` binary.
//!
//! Diagnostics go to stderr through `tracing`; audit events go to syslog.
//! Anything meant for scripts (`status --json`, the `run` result) is written
//! to stdout as JSON.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use shellguard::{cli::Cli, cli_handler::handle_command, telemetry::AuditLogger};
use tracing::{debug, warn};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    debug!(?cli, "starting");

    let audit = AuditLogger::new().unwrap_or_else(|e| {
        warn!("Audit events will not be recorded: {}", e);
        AuditLogger::new_null()
    });

    handle_command(cli, Arc::new(audit))
}

/// `-v` raises the level one step per flag; without it `RUST_LOG` decides,
/// defaulting to warnings.
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = match verbose {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    };
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .try_init()
        .context("tracing subscriber already installed")
}
