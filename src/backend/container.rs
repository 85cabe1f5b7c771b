//! Container-backed nodes
//!
//! The container joins the node's network namespace (`--network ns:<path>`),
//! so links and addresses are still configured from the namespace while user
//! commands go through `exec`. Only podman can join a namespace by path;
//! docker is found as a fallback but refused with a clear error.

use super::BackendError;
use crate::command::{Cmd, CmdOutput, CommandError, Commander, RunOptions};
use crate::config::NodeConfig;
use crate::namespace::{poll_interval, Namespace};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_GRACE_SECS: &str = "2";
const ENGINES: [&str; 2] = ["podman", "docker"];

fn is_docker(engine: &str) -> bool {
    Path::new(engine)
        .file_name()
        .is_some_and(|f| f.to_string_lossy().starts_with("docker"))
}

#[derive(Debug)]
pub struct Container {
    node: String,
    name: String,
    engine: String,
    cwd: Option<PathBuf>,
    host: Commander,
}

impl Container {
    pub async fn start(config: &NodeConfig, image: &str, ns: &Namespace) -> Result<Self, BackendError> {
        let host = Commander::host(config.name.clone());
        let engine = match &config.engine {
            Some(e) => e.clone(),
            None => host.require_executable(&ENGINES).await?.display().to_string(),
        };
        let c = Self {
            node: config.name.clone(),
            name: format!("netbed-{}", config.name),
            engine,
            cwd: config.cwd.clone(),
            host,
        };
        let args = c.run_args(image, config.cmd.as_deref(), ns.pid())?;
        info!("{}: starting container {} from {}", c.node, c.name, image);

        c.engine_cmd(&["rm", "-f", &c.name], RunOptions::default().quiet())
            .await?;
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        c.engine_cmd(&argv, RunOptions::default().raises()).await?;

        c.wait_running(STARTUP_TIMEOUT).await?;
        Ok(c)
    }

    /// Arguments of the engine's `run`, joined to the network namespace of
    /// `netns_pid` when there is one.
    pub fn run_args(&self, image: &str, cmd: Option<&str>, netns_pid: Option<i32>) -> Result<Vec<String>, BackendError> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--hostname".to_string(),
            self.node.clone(),
        ];
        if let Some(pid) = netns_pid {
            if is_docker(&self.engine) {
                return Err(BackendError::Engine {
                    node: self.node.clone(),
                    engine: self.engine.clone(),
                    reason: "joining an existing network namespace needs podman (`--network ns:`)".into(),
                });
            }
            args.push("--network".to_string());
            args.push(format!("ns:/proc/{}/ns/net", pid));
        }
        if let Some(cwd) = &self.cwd {
            args.push("-w".to_string());
            args.push(cwd.display().to_string());
        }
        args.push(image.to_string());
        if let Some(cmd) = cmd {
            args.extend(["sh".to_string(), "-c".to_string(), cmd.to_string()]);
        }
        Ok(args)
    }

    async fn engine_cmd(&self, args: &[&str], opts: RunOptions) -> Result<CmdOutput, CommandError> {
        let mut argv = vec![self.engine.as_str()];
        argv.extend_from_slice(args);
        self.host.run(Cmd::argv(argv), opts).await
    }

    async fn wait_running(&self, timeout: Duration) -> Result<(), BackendError> {
        let started = Instant::now();
        loop {
            let out = self
                .engine_cmd(&["inspect", "-f", "{{.State.Running}}", &self.name], RunOptions::default().quiet())
                .await?;
            if out.success() && out.stdout.trim() == "true" {
                debug!("{}: container {} running", self.node, self.name);
                return Ok(());
            }
            if started.elapsed() > timeout {
                return Err(BackendError::StartupTimeout {
                    node: self.node.clone(),
                    what: format!("container {}", self.name),
                    timeout,
                });
            }
            tokio::time::sleep(poll_interval(started.elapsed())).await;
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_cwd(&mut self, cwd: Option<PathBuf>) {
        self.cwd = cwd;
    }

    /// `exec` argv running `cmd` inside the container.
    pub fn exec_argv(&self, cmd: &Cmd, interactive: bool) -> Vec<String> {
        let mut argv = vec![self.engine.clone(), "exec".to_string()];
        if interactive {
            argv.push("-i".to_string());
        }
        if let Some(cwd) = &self.cwd {
            argv.push("-w".to_string());
            argv.push(cwd.display().to_string());
        }
        argv.push(self.name.clone());
        argv.extend(cmd.to_argv("sh"));
        argv
    }

    pub async fn run(&self, cmd: Cmd, opts: RunOptions) -> Result<CmdOutput, CommandError> {
        cmd.check(&self.node)?;
        let argv = self.exec_argv(&cmd, opts.stdin.is_some());
        self.host.run(Cmd::Argv(argv), opts).await
    }

    pub async fn stop(&mut self) -> Result<(), BackendError> {
        info!("{}: stopping container {}", self.node, self.name);
        self.engine_cmd(&["stop", "-t", STOP_GRACE_SECS, &self.name], RunOptions::default().quiet())
            .await?;
        self.engine_cmd(&["rm", "-f", &self.name], RunOptions::default().raises().quiet())
            .await?;
        Ok(())
    }
}
