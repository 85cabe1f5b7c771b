//! Init supervisor for PID-isolated testbed nodes
//!
//! Started as the first process of a new PID namespace, optionally with a
//! program to supervise. Exits 0 once every supervised process is gone, or
//! with `128 + signal` when terminated by a signal.

use anyhow::{Context, Result};
use clap::Parser;
use netbed::supervisor::Supervisor;
use tracing_subscriber::EnvFilter;

/// Log filter variable; defaults to `warn`.
const LOG_ENV: &str = "NETBED_INIT_LOG";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Do not put the program in its own process group
    #[arg(short = 'P', long = "no-pgrp")]
    no_pgrp: bool,

    /// Program and arguments to supervise
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    program: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut supervisor = Supervisor::install().context("installing signal handling")?;
    supervisor
        .become_reaper()
        .context("becoming the namespace reaper")?;
    if !cli.program.is_empty() {
        supervisor
            .launch(&cli.program, !cli.no_pgrp)
            .with_context(|| format!("launching {:?}", cli.program))?;
    }
    std::process::exit(supervisor.run())
}
