//! Testbed CLI
//!
//! `netbed up` builds a topology from a JSON description, keeps it running
//! until interrupted and tears it down. `netbed check` only validates.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netbed::{Runner, Topology, TopologyConfig, TopologyOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a topology and keep it up until Ctrl-C or SIGTERM
    Up {
        /// Topology description (JSON)
        #[arg(long, short)]
        config: PathBuf,

        /// Run directory, overriding the one in the description
        #[arg(long)]
        rundir: Option<PathBuf>,

        /// Init supervisor for PID-isolated nodes
        #[arg(long)]
        init: Option<PathBuf>,

        /// Namespace verification timeout in seconds
        #[arg(long, default_value_t = 30)]
        verify_timeout: u64,
    },

    /// Validate a topology description without building it
    Check {
        /// Topology description (JSON)
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Up {
            config,
            rundir,
            init,
            verify_timeout,
        } => {
            let opts = TopologyOptions {
                init,
                verify_timeout: Duration::from_secs(verify_timeout),
                rundir,
            };
            cmd_up(config, opts).await?;
        }
        Commands::Check { config } => {
            cmd_check(config).await?;
        }
    }

    Ok(())
}

async fn load(path: &Path) -> Result<TopologyConfig> {
    let config = TopologyConfig::from_file(path)
        .await
        .with_context(|| format!("loading {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(config)
}

async fn cmd_check(path: PathBuf) -> Result<()> {
    let config = load(&path).await?;
    println!(
        "{}: {} switches, {} nodes",
        path.display(),
        config.networks.len(),
        config.nodes.len()
    );
    Ok(())
}

async fn cmd_up(path: PathBuf, opts: TopologyOptions) -> Result<()> {
    let config = load(&path).await?;
    let topo = match Topology::build(config, opts).await {
        Ok(t) => t,
        Err(e) if e.is_fatal() => {
            return Err(e).context("fatal error while building the topology");
        }
        Err(e) => return Err(e).context("building the topology"),
    };

    for node in topo.nodes() {
        let addrs: Vec<String> = node
            .addrs()
            .iter()
            .map(|(ifname, addr)| match addr {
                Some(a) => format!("{}={}", ifname, a),
                None => ifname.clone(),
            })
            .collect();
        info!("{}: {}", node.name(), addrs.join(" "));
    }
    for link in topo.links() {
        info!("link {}", link);
    }
    info!("Run directory: {}", topo.rundir().path().display());
    println!("Topology is up. Press Ctrl-C to tear it down.");

    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("waiting for Ctrl-C failed: {}", e);
            }
        }
        _ = term.recv() => {}
    }

    info!("Shutting down");
    topo.teardown().await;
    Ok(())
}
