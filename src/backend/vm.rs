//! VM-backed nodes
//!
//! qemu runs inside the node namespace with its serial port on a unix
//! socket. Commands are typed into the guest shell on that console and
//! terminated by a marker line carrying the exit status.

use super::BackendError;
use crate::command::{self, Cmd, CmdOutput, CommandError, RunOptions};
use crate::config::VmConfig;
use crate::namespace::{poll_interval, Namespace};
use crate::teardown::spawn_terminate;
use nix::sys::signal::Signal;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info};

const RC_MARKER: &str = "__NETBED_RC__";
const READY_MARKER: &str = "__NETBED_READY__";
const STOP_GRACE: Duration = Duration::from_secs(5);

/// qemu argv for `vm` with its serial port on `console`.
pub fn qemu_args(vm: &VmConfig, console: &Path) -> Vec<String> {
    let mut args = vec![
        vm.qemu.clone(),
        "-display".to_string(),
        "none".to_string(),
        "-monitor".to_string(),
        "none".to_string(),
        "-m".to_string(),
        vm.memory.to_string(),
        "-smp".to_string(),
        vm.ncpu.to_string(),
        "-serial".to_string(),
        format!("unix:{},server=on,wait=off", console.display()),
    ];
    if let Some(kernel) = &vm.kernel {
        args.push("-kernel".to_string());
        args.push(kernel.display().to_string());
        let mut append = "console=ttyS0".to_string();
        if let Some(extra) = &vm.cmdline {
            append.push(' ');
            append.push_str(extra);
        }
        args.push("-append".to_string());
        args.push(append);
    }
    if let Some(initrd) = &vm.initrd {
        args.push("-initrd".to_string());
        args.push(initrd.display().to_string());
    }
    if let Some(disk) = &vm.disk {
        args.push("-drive".to_string());
        args.push(format!("file={},if=virtio,format=raw", disk.display()));
    }
    args.extend(vm.extra_args.iter().cloned());
    args
}

/// Console line running `cmd` and reporting its status. The marker is split
/// in the typed line so the terminal echo never matches it.
pub fn console_line(cmd: &Cmd, cwd: Option<&Path>) -> String {
    let (head, tail) = RC_MARKER.split_at(RC_MARKER.len() / 2);
    let body = cmd.to_shell_line();
    let body = match cwd {
        Some(dir) => format!("cd {} && {{ {}; }}", command::shell_quote(&dir.display().to_string()), body),
        None => body,
    };
    format!("{}; echo \"{}\"\"{}$?\"\n", body, head, tail)
}

/// Split console output into the command's output and its status, once the
/// marker has arrived. The first line is the echo of what was typed.
pub fn parse_console_output(lines: &[String]) -> Option<(String, i32)> {
    let pos = lines.iter().position(|l| l.starts_with(RC_MARKER))?;
    let status = lines[pos][RC_MARKER.len()..].trim().parse().ok()?;
    let (head, _) = RC_MARKER.split_at(RC_MARKER.len() / 2);
    let echoed = lines
        .first()
        .is_some_and(|l| !l.starts_with(RC_MARKER) && l.contains(head));
    let start = usize::from(echoed);
    let out = lines[start.min(pos)..pos]
        .iter()
        .map(|l| format!("{}\n", l))
        .collect();
    Some((out, status))
}

#[derive(Debug)]
struct Console {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Console {
    async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut buf = String::new();
        if self.reader.read_line(&mut buf).await? == 0 {
            return Ok(None);
        }
        Ok(Some(buf.trim_end_matches(['\r', '\n']).replace('\r', "")))
    }
}

#[derive(Debug)]
pub struct Vm {
    node: String,
    console_path: PathBuf,
    console: Mutex<Console>,
    qemu: Option<Child>,
    cwd: Option<PathBuf>,
}

impl Vm {
    pub async fn start(node: &str, vm: &VmConfig, ns: &Namespace, console_path: PathBuf) -> Result<Self, BackendError> {
        let _ = std::fs::remove_file(&console_path);
        let argv = qemu_args(vm, &console_path);
        info!("{}: starting VM", node);
        let mut qemu = ns
            .commander()
            .spawn(&Cmd::Argv(argv), false, Stdio::null(), Stdio::null())?;

        let timeout = Duration::from_secs(vm.console_timeout);
        let started = Instant::now();
        let stream = loop {
            if let Some(status) = qemu.try_wait()? {
                debug!("{}: qemu exited with {}", node, command::exit_code(status));
                return Err(BackendError::Exited {
                    node: node.to_string(),
                    what: "qemu".to_string(),
                });
            }
            if let Ok(s) = UnixStream::connect(&console_path).await {
                break s;
            }
            if started.elapsed() > timeout {
                let _ = spawn_terminate(node.to_string(), qemu, STOP_GRACE, Some(Signal::SIGTERM)).await;
                return Err(BackendError::StartupTimeout {
                    node: node.to_string(),
                    what: "VM console".to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(poll_interval(started.elapsed())).await;
        };
        let (r, w) = stream.into_split();
        let mut console = Console {
            reader: BufReader::new(r),
            writer: w,
        };

        let remaining = timeout.saturating_sub(started.elapsed());
        let ready = tokio::time::timeout(remaining, wait_ready(&mut console)).await;
        if !matches!(ready, Ok(Ok(()))) {
            let _ = spawn_terminate(node.to_string(), qemu, STOP_GRACE, Some(Signal::SIGTERM)).await;
            return Err(match ready {
                Ok(Err(source)) => BackendError::Console {
                    node: node.to_string(),
                    source,
                },
                _ => BackendError::StartupTimeout {
                    node: node.to_string(),
                    what: "VM shell".to_string(),
                    timeout,
                },
            });
        }
        info!("{}: VM console ready", node);

        Ok(Self {
            node: node.to_string(),
            console_path,
            console: Mutex::new(console),
            qemu: Some(qemu),
            cwd: None,
        })
    }

    pub fn console_path(&self) -> &Path {
        &self.console_path
    }

    pub fn set_cwd(&mut self, cwd: Option<PathBuf>) {
        self.cwd = cwd;
    }

    /// Type `cmd` into the guest shell and collect its output. Stdout and
    /// stderr arrive merged on the console.
    pub async fn run(&self, cmd: Cmd, opts: RunOptions) -> Result<CmdOutput, CommandError> {
        cmd.check(&self.node)?;
        if opts.stdin.is_some() {
            return Err(CommandError::Unsupported {
                target: self.node.clone(),
                what: "stdin".to_string(),
            });
        }
        let line = console_line(&cmd, self.cwd.as_deref());
        let display = cmd.to_shell_line();
        let io_err = |source: std::io::Error| CommandError::Spawn {
            target: self.node.clone(),
            command: display.clone(),
            source,
        };

        let mut console = self.console.lock().await;
        let exchange = exchange(&mut console, &line);
        let (stdout, status) = match opts.timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| CommandError::Timeout {
                    target: self.node.clone(),
                    command: display.clone(),
                    timeout: limit,
                })?
                .map_err(io_err)?,
            None => exchange.await.map_err(io_err)?,
        };

        let out = CmdOutput {
            status,
            stdout,
            stderr: String::new(),
        };
        command::finish(&self.node, &display, out, &opts)
    }

    pub async fn stop(&mut self) -> Result<(), BackendError> {
        {
            let mut console = self.console.lock().await;
            let _ = console.writer.write_all(b"poweroff -f\n").await;
        }
        if let Some(qemu) = self.qemu.take() {
            info!("{}: stopping VM", self.node);
            let _ = spawn_terminate(self.node.clone(), qemu, STOP_GRACE, None).await;
        }
        let _ = std::fs::remove_file(&self.console_path);
        Ok(())
    }
}

async fn exchange(console: &mut Console, line: &str) -> std::io::Result<(String, i32)> {
    console.writer.write_all(line.as_bytes()).await?;
    let mut lines = Vec::new();
    while let Some(l) = console.read_line().await? {
        let done = l.starts_with(RC_MARKER);
        lines.push(l);
        if done {
            if let Some(parsed) = parse_console_output(&lines) {
                return Ok(parsed);
            }
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "console closed",
    ))
}

async fn wait_ready(console: &mut Console) -> std::io::Result<()> {
    let (head, tail) = READY_MARKER.split_at(READY_MARKER.len() / 2);
    let probe = format!("\necho \"{}\"\"{}\"\n", head, tail);
    loop {
        console.writer.write_all(probe.as_bytes()).await?;
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            let wait = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(wait, console.read_line()).await {
                Ok(Ok(Some(l))) if l.trim() == READY_MARKER => return Ok(()),
                Ok(Ok(Some(_))) => {}
                Ok(Ok(None)) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "console closed",
                    ))
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qemu_args() {
        let vm = VmConfig {
            kernel: Some("/boot/vmlinuz".into()),
            cmdline: Some("quiet".into()),
            disk: Some("/img/root.raw".into()),
            ..Default::default()
        };
        let args = qemu_args(&vm, Path::new("/run/netbed/vm1/console")).join(" ");
        assert!(args.starts_with("qemu-system-x86_64 -display none -monitor none -m 512 -smp 1"));
        assert!(args.contains("-serial unix:/run/netbed/vm1/console,server=on,wait=off"));
        assert!(args.contains("-kernel /boot/vmlinuz -append console=ttyS0 quiet"));
        assert!(args.ends_with("-drive file=/img/root.raw,if=virtio,format=raw"));
    }

    #[test]
    fn test_console_line_hides_marker() {
        let line = console_line(&Cmd::shell("uname -r"), None);
        assert!(!line.contains(RC_MARKER));
        assert!(line.starts_with("uname -r; echo"));
        let line = console_line(&Cmd::shell("ls"), Some(Path::new("/tmp")));
        assert!(line.starts_with("cd /tmp && { ls; }"));
    }

    #[test]
    fn test_parse_console_output() {
        let lines: Vec<String> = [
            "uname -r; echo \"__NETBE\"\"D_RC__$?\"",
            "6.1.0",
            "__NETBED_RC__0",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(parse_console_output(&lines), Some(("6.1.0\n".to_string(), 0)));

        let lines = vec!["__NETBED_RC__2".to_string()];
        assert_eq!(parse_console_output(&lines), Some((String::new(), 2)));

        let lines = vec!["partial".to_string()];
        assert_eq!(parse_console_output(&lines), None);
    }
}
