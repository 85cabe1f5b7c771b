//! Node execution backends
//!
//! Every node owns a namespace for kernel plumbing (links, addresses,
//! qdiscs). The backend decides where user commands run: in that namespace,
//! in a container joined to its network namespace, or in a VM started inside
//! it and driven through its serial console.

pub mod container;
pub mod vm;

pub use container::Container;
pub use vm::Vm;

use crate::command::{Cmd, CmdOutput, CommandError, RunOptions, Runner};
use crate::config::NodeConfig;
use crate::namespace::Namespace;
use crate::rundir::RunDir;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{node}: {what} not ready after {timeout:?}")]
    StartupTimeout {
        node: String,
        what: String,
        timeout: Duration,
    },

    #[error("{node}: {what} exited during startup")]
    Exited { node: String, what: String },

    #[error("{node}: console error: {source}")]
    Console {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{node}: {engine} cannot run this container: {reason}")]
    Engine {
        node: String,
        engine: String,
        reason: String,
    },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a node's commands run, chosen once from the declaration shape.
#[derive(Debug)]
pub enum Backend {
    Namespace,
    Container(Container),
    Vm(Vm),
}

impl Backend {
    /// Start the backend of `config` inside `ns`.
    pub async fn start(config: &NodeConfig, ns: &Namespace, rundir: &RunDir) -> Result<Self, BackendError> {
        if let Some(image) = &config.image {
            let c = Container::start(config, image, ns).await?;
            return Ok(Backend::Container(c));
        }
        if let Some(vm) = &config.vm {
            let console = rundir.console_path(&config.name)?;
            let v = Vm::start(&config.name, vm, ns, console).await?;
            return Ok(Backend::Vm(v));
        }
        Ok(Backend::Namespace)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Namespace => "namespace",
            Backend::Container(_) => "container",
            Backend::Vm(_) => "vm",
        }
    }

    /// Whether the declared workload is run by the backend itself.
    pub fn owns_workload(&self) -> bool {
        matches!(self, Backend::Container(_))
    }

    /// Route `cmd`. Host execution and the bare namespace go through `ns`.
    pub async fn run(&self, ns: &Namespace, cmd: Cmd, opts: RunOptions) -> Result<CmdOutput, CommandError> {
        if opts.host {
            return ns.run(cmd, opts).await;
        }
        match self {
            Backend::Namespace => ns.run(cmd, opts).await,
            Backend::Container(c) => c.run(cmd, opts).await,
            Backend::Vm(v) => v.run(cmd, opts).await,
        }
    }

    pub fn set_cwd(&mut self, cwd: Option<PathBuf>) {
        match self {
            Backend::Namespace => {}
            Backend::Container(c) => c.set_cwd(cwd),
            Backend::Vm(v) => v.set_cwd(cwd),
        }
    }

    pub async fn stop(&mut self) -> Result<(), BackendError> {
        match self {
            Backend::Namespace => Ok(()),
            Backend::Container(c) => c.stop().await,
            Backend::Vm(v) => v.stop().await,
        }
    }
}
