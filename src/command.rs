//! Uniform command execution
//!
//! Every entity of a testbed runs commands through the same contract: a
//! [`Cmd`] plus [`RunOptions`] yields a [`CmdOutput`] triple, or a structured
//! [`CommandError`] when raise-on-error semantics were requested. A
//! [`Commander`] prepends a composable argument prefix (for example an
//! `nsenter` invocation) so that identical call sites can target the host, a
//! namespace or a container.

use futures::future::BoxFuture;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{mpsc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Bytes of each output stream kept in debug logs.
const LOG_CLIP: usize = 512;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{target}: `{command}` exited with status {status}: {stderr}")]
    Failed {
        target: String,
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },

    #[error("{target}: `{command}` timed out after {timeout:?}")]
    Timeout {
        target: String,
        command: String,
        timeout: Duration,
    },

    #[error("{target}: `{command}` changes directory; use set_cwd instead")]
    ChangeDir { target: String, command: String },

    #[error("{target}: empty command")]
    Empty { target: String },

    #[error("{target}: failed to spawn `{command}`: {source}")]
    Spawn {
        target: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{target}: none of {candidates:?} found in PATH")]
    NotFound {
        target: String,
        candidates: Vec<String>,
    },

    #[error("{target}: {what} is not supported by this backend")]
    Unsupported { target: String, what: String },
}

impl CommandError {
    /// Exit status carried by a failed command, if any.
    pub fn status(&self) -> Option<i32> {
        match self {
            CommandError::Failed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A command: either a shell-interpreted string or an argument vector.
///
/// Argument vectors are executed directly, no shell is involved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cmd {
    Shell(String),
    Argv(Vec<String>),
}

impl Cmd {
    pub fn shell(s: impl Into<String>) -> Self {
        Cmd::Shell(s.into())
    }

    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Cmd::Argv(args.into_iter().map(Into::into).collect())
    }

    /// Reject empty argument vectors and shell strings that try to change
    /// directory. Each invocation is a fresh subprocess so a `cd` would
    /// silently do nothing.
    pub fn check(&self, target: &str) -> Result<(), CommandError> {
        match self {
            Cmd::Shell(s) if looks_like_cd(s) => Err(CommandError::ChangeDir {
                target: target.to_string(),
                command: s.clone(),
            }),
            Cmd::Argv(v) if v.is_empty() => Err(CommandError::Empty {
                target: target.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// The words to exec, with `shell` used for string commands.
    pub fn to_argv(&self, shell: &str) -> Vec<String> {
        match self {
            Cmd::Shell(s) => vec![shell.to_string(), "-c".to_string(), s.clone()],
            Cmd::Argv(v) => v.clone(),
        }
    }

    /// Render as a single shell line (argument vectors are quoted).
    pub fn to_shell_line(&self) -> String {
        match self {
            Cmd::Shell(s) => s.clone(),
            Cmd::Argv(v) => v.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" "),
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell_line())
    }
}

impl From<&str> for Cmd {
    fn from(s: &str) -> Self {
        Cmd::Shell(s.to_string())
    }
}

impl From<String> for Cmd {
    fn from(s: String) -> Self {
        Cmd::Shell(s)
    }
}

impl From<Vec<String>> for Cmd {
    fn from(v: Vec<String>) -> Self {
        Cmd::Argv(v)
    }
}

impl From<&[&str]> for Cmd {
    fn from(v: &[&str]) -> Self {
        Cmd::argv(v.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for Cmd {
    fn from(v: [&str; N]) -> Self {
        Cmd::argv(v)
    }
}

fn looks_like_cd(s: &str) -> bool {
    s.split(|c| c == ';' || c == '&' || c == '|' || c == '\n')
        .map(str::trim_start)
        .any(|seg| seg == "cd" || seg.starts_with("cd ") || seg.starts_with("cd\t"))
}

/// Quote a word for POSIX shells.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Per-invocation options.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Bytes fed to standard input.
    pub stdin: Option<Vec<u8>>,
    /// Turn a non-zero exit into `CommandError::Failed`.
    pub raises: bool,
    /// Log a warning on non-zero exit.
    pub warn: bool,
    pub timeout: Option<Duration>,
    /// Run on the unisolated host, bypassing the prefix.
    pub host: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stdin: None,
            raises: false,
            warn: true,
            timeout: None,
            host: false,
        }
    }
}

impl RunOptions {
    pub fn raises(mut self) -> Self {
        self.raises = true;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.warn = false;
        self
    }

    pub fn on_host(mut self) -> Self {
        self.host = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

/// Exit status plus captured output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Translate a process exit status; death by signal maps to `128 + signo`.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

fn clip(s: &str) -> &str {
    if s.len() <= LOG_CLIP {
        return s;
    }
    let mut end = LOG_CLIP;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Log the result and apply the raise/warn policy.
pub(crate) fn finish(
    target: &str,
    command: &str,
    output: CmdOutput,
    opts: &RunOptions,
) -> Result<CmdOutput, CommandError> {
    debug!(
        "{}: `{}` -> {} stdout={:?} stderr={:?}",
        target,
        command,
        output.status,
        clip(&output.stdout),
        clip(&output.stderr)
    );
    if output.success() {
        return Ok(output);
    }
    if opts.warn {
        warn!(
            "{}: `{}` exited with status {}: {}",
            target,
            command,
            output.status,
            output.stderr.trim()
        );
    }
    if opts.raises {
        return Err(CommandError::Failed {
            target: target.to_string(),
            command: command.to_string(),
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }
    Ok(output)
}

/// Runs commands, prepending a prefix unless host execution is requested.
#[derive(Debug)]
pub struct Commander {
    name: String,
    prefix: Vec<String>,
    cwd: Option<PathBuf>,
    shell: String,
    exec_paths: Mutex<HashMap<String, Option<PathBuf>>>,
}

impl Commander {
    /// A commander for the unisolated host.
    pub fn host(name: impl Into<String>) -> Self {
        Self::with_prefix(name, Vec::new())
    }

    pub fn with_prefix(name: impl Into<String>, prefix: Vec<String>) -> Self {
        Self {
            name: name.into(),
            prefix,
            cwd: None,
            shell: "/bin/sh".to_string(),
            exec_paths: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &[String] {
        &self.prefix
    }

    /// Replace the prefix. Callers hold `&mut self`, so no command can be in
    /// flight while this happens.
    pub fn set_prefix(&mut self, prefix: Vec<String>) {
        self.prefix = prefix;
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Working directory for host execution. Prefixed commanders encode the
    /// directory in the prefix instead, see `Namespace::set_cwd`.
    pub fn set_cwd(&mut self, cwd: Option<PathBuf>) {
        self.cwd = cwd;
    }

    pub fn set_shell(&mut self, shell: impl Into<String>) {
        self.shell = shell.into();
    }

    /// Full argv for `cmd`, honoring `host`.
    pub fn argv(&self, cmd: &Cmd, host: bool) -> Vec<String> {
        let mut argv = if host { Vec::new() } else { self.prefix.clone() };
        argv.extend(cmd.to_argv(&self.shell));
        argv
    }

    fn split_program<'v>(&self, argv: &'v [String]) -> Result<(&'v String, &'v [String]), CommandError> {
        argv.split_first().ok_or_else(|| CommandError::Empty {
            target: self.name.clone(),
        })
    }

    fn host_cwd(&self, host: bool) -> Option<&Path> {
        if host || self.prefix.is_empty() {
            self.cwd.as_deref()
        } else {
            None
        }
    }

    /// Run `cmd` and wait for it without blocking other tasks.
    pub async fn run(&self, cmd: Cmd, opts: RunOptions) -> Result<CmdOutput, CommandError> {
        cmd.check(&self.name)?;
        let argv = self.argv(&cmd, opts.host);
        let display = cmd.to_shell_line();

        let (program, args) = self.split_program(&argv)?;
        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .stdin(if opts.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = self.host_cwd(opts.host) {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            target: self.name.clone(),
            command: display.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let input = opts.stdin.clone();
        let feed = async move {
            if let (Some(mut pipe), Some(data)) = (stdin, input) {
                // The child may exit without reading everything.
                let _ = pipe.write_all(&data).await;
            }
        };
        let exchange = async move { tokio::join!(feed, child.wait_with_output()).1 };

        let output = match opts.timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(out) => out,
                Err(_) => {
                    return Err(CommandError::Timeout {
                        target: self.name.clone(),
                        command: display,
                        timeout: limit,
                    })
                }
            },
            None => exchange.await,
        }
        .map_err(|source| CommandError::Spawn {
            target: self.name.clone(),
            command: display.clone(),
            source,
        })?;

        let result = CmdOutput {
            status: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        finish(&self.name, &display, result, &opts)
    }

    /// Blocking form of [`Commander::run`] for callers outside the runtime.
    pub fn run_blocking(&self, cmd: Cmd, opts: RunOptions) -> Result<CmdOutput, CommandError> {
        cmd.check(&self.name)?;
        let argv = self.argv(&cmd, opts.host);
        let display = cmd.to_shell_line();
        let spawn_err = |source| CommandError::Spawn {
            target: self.name.clone(),
            command: display.clone(),
            source,
        };

        let (program, args) = self.split_program(&argv)?;
        let mut command = std::process::Command::new(program);
        command
            .args(args)
            .stdin(if opts.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = self.host_cwd(opts.host) {
            command.current_dir(cwd);
        }
        let mut child = command.spawn().map_err(spawn_err)?;
        let pid = child.id();

        if let (Some(mut pipe), Some(data)) = (child.stdin.take(), opts.stdin.clone()) {
            std::thread::spawn(move || {
                let _ = pipe.write_all(&data);
            });
        }

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(child.wait_with_output());
        });
        let waited = match opts.timeout {
            Some(limit) => match rx.recv_timeout(limit) {
                Ok(r) => r,
                Err(_) => {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                    return Err(CommandError::Timeout {
                        target: self.name.clone(),
                        command: display.clone(),
                        timeout: limit,
                    });
                }
            },
            None => rx
                .recv()
                .map_err(|e| std::io::Error::other(e.to_string()))
                .and_then(|r| r),
        };
        let output = waited.map_err(spawn_err)?;

        let result = CmdOutput {
            status: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        finish(&self.name, &display, result, &opts)
    }

    /// Start a long-running process in its own process group, with output
    /// sent to the given sinks. Used for workloads and VM monitors.
    pub fn spawn(
        &self,
        cmd: &Cmd,
        host: bool,
        stdout: Stdio,
        stderr: Stdio,
    ) -> Result<tokio::process::Child, CommandError> {
        cmd.check(&self.name)?;
        let argv = self.argv(cmd, host);
        debug!("{}: spawning `{}`", self.name, cmd);
        let (program, args) = self.split_program(&argv)?;
        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0);
        if let Some(cwd) = self.host_cwd(host) {
            command.current_dir(cwd);
        }
        command.spawn().map_err(|source| CommandError::Spawn {
            target: self.name.clone(),
            command: cmd.to_shell_line(),
            source,
        })
    }

    /// First absolute path found for any of `names`, memoized per instance.
    /// The lookup runs through the prefix so it reflects the target's view.
    pub async fn resolve_executable(&self, names: &[&str]) -> Option<PathBuf> {
        for name in names {
            if let Some(hit) = self.cached_path(name) {
                match hit {
                    Some(path) => return Some(path),
                    None => continue,
                }
            }
            let found = self
                .run(
                    Cmd::shell(format!("command -v {}", shell_quote(name))),
                    RunOptions::default().quiet(),
                )
                .await
                .ok()
                .filter(CmdOutput::success)
                .map(|out| out.stdout.trim().to_string())
                .filter(|p| p.starts_with('/'))
                .map(PathBuf::from);
            self.remember_path(name, found.clone());
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Like `resolve_executable`, failing with `CommandError::NotFound`.
    pub async fn require_executable(&self, names: &[&str]) -> Result<PathBuf, CommandError> {
        self.resolve_executable(names)
            .await
            .ok_or_else(|| CommandError::NotFound {
                target: self.name.clone(),
                candidates: names.iter().map(|s| s.to_string()).collect(),
            })
    }

    fn cached_path(&self, name: &str) -> Option<Option<PathBuf>> {
        self.exec_paths
            .lock()
            .ok()
            .and_then(|m| m.get(name).cloned())
    }

    fn remember_path(&self, name: &str, path: Option<PathBuf>) {
        if let Ok(mut m) = self.exec_paths.lock() {
            m.insert(name.to_string(), path);
        }
    }
}

/// The command contract shared by every entity.
///
/// Only `name` and `run` are required; the helpers cover the usual
/// status/raise/no-status flavors.
pub trait Runner: Send + Sync {
    fn name(&self) -> &str;

    fn run<'a>(&'a self, cmd: Cmd, opts: RunOptions)
        -> BoxFuture<'a, Result<CmdOutput, CommandError>>;

    /// Run on the unisolated host. Used for operations that must work even
    /// when the target's namespace is already gone.
    fn run_host<'a>(
        &'a self,
        cmd: Cmd,
        opts: RunOptions,
    ) -> BoxFuture<'a, Result<CmdOutput, CommandError>> {
        self.run(cmd, opts.on_host())
    }

    /// Status and output, never raising on non-zero exit.
    fn cmd_status<'a>(&'a self, cmd: impl Into<Cmd>) -> BoxFuture<'a, Result<CmdOutput, CommandError>>
    where
        Self: Sized,
    {
        self.run(cmd.into(), RunOptions::default())
    }

    /// Stdout of a command that must succeed.
    fn cmd_raises<'a>(&'a self, cmd: impl Into<Cmd>) -> BoxFuture<'a, Result<String, CommandError>>
    where
        Self: Sized,
    {
        let fut = self.run(cmd.into(), RunOptions::default().raises());
        Box::pin(async move { Ok(fut.await?.stdout) })
    }

    /// Stdout only; failures are swallowed without a warning.
    fn cmd_nostatus<'a>(&'a self, cmd: impl Into<Cmd>) -> BoxFuture<'a, String>
    where
        Self: Sized,
    {
        let fut = self.run(cmd.into(), RunOptions::default().quiet());
        Box::pin(async move { fut.await.map(|o| o.stdout).unwrap_or_default() })
    }
}

impl Runner for Commander {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(
        &'a self,
        cmd: Cmd,
        opts: RunOptions,
    ) -> BoxFuture<'a, Result<CmdOutput, CommandError>> {
        Box::pin(Commander::run(self, cmd, opts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cd_rejected() {
        assert!(Cmd::shell("cd /tmp").check("t").is_err());
        assert!(Cmd::shell("ls; cd /tmp && ls").check("t").is_err());
        assert!(Cmd::shell("  cd").check("t").is_err());
        assert!(Cmd::shell("echo cdrom").check("t").is_ok());
        assert!(Cmd::shell("abcd /x").check("t").is_ok());
        // argv never goes through a shell
        assert!(Cmd::argv(["cd", "/tmp"]).check("t").is_ok());
    }

    #[tokio::test]
    async fn test_empty_argv_is_an_error() {
        let c = Commander::host("h");
        let err = c
            .run(Cmd::Argv(vec![]), RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Empty { ref target } if target == "h"));
        let err = c
            .run_blocking(Cmd::Argv(vec![]), RunOptions::default())
            .unwrap_err();
        assert!(matches!(err, CommandError::Empty { .. }));
        assert!(c
            .spawn(&Cmd::Argv(vec![]), true, Stdio::null(), Stdio::null())
            .is_err());
    }

    #[test]
    fn test_prefix_composition() {
        let c = Commander::with_prefix("n1", vec!["nsenter".into(), "-t".into(), "42".into()]);
        let argv = c.argv(&Cmd::argv(["ip", "link"]), false);
        assert_eq!(argv, ["nsenter", "-t", "42", "ip", "link"]);
        let argv = c.argv(&Cmd::shell("echo hi"), true);
        assert_eq!(argv, ["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("eth0"), "eth0");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[tokio::test]
    async fn test_run_status_and_output() {
        let c = Commander::host("host");
        let out = c
            .run(Cmd::shell("echo out; echo err >&2; exit 3"), RunOptions::default().quiet())
            .await
            .expect("spawn");
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_raises_carries_output() {
        let c = Commander::host("host");
        let err = c
            .run(Cmd::shell("echo partial; exit 7"), RunOptions::default().raises().quiet())
            .await
            .unwrap_err();
        match err {
            CommandError::Failed { status, stdout, .. } => {
                assert_eq!(status, 7);
                assert_eq!(stdout.trim(), "partial");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stdin_and_argv() {
        let c = Commander::host("host");
        let out = c
            .run(Cmd::argv(["cat"]), RunOptions::default().stdin("hello"))
            .await
            .expect("cat");
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn test_timeout() {
        let c = Commander::host("host");
        let err = c
            .run(
                Cmd::argv(["sleep", "5"]),
                RunOptions::default().timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[test]
    fn test_blocking_form() {
        let c = Commander::host("host");
        let out = c
            .run_blocking(Cmd::shell("printf abc"), RunOptions::default())
            .expect("run");
        assert_eq!(out.stdout, "abc");
        let err = c
            .run_blocking(
                Cmd::argv(["sleep", "5"]),
                RunOptions::default().timeout(Duration::from_millis(100)),
            )
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_resolve_executable_memoized() {
        let c = Commander::host("host");
        let sh = c.resolve_executable(&["definitely-not-a-binary", "sh"]).await;
        assert!(sh.is_some());
        assert_eq!(c.cached_path("definitely-not-a-binary"), Some(None));
        assert_eq!(c.cached_path("sh"), Some(sh));
    }

    #[tokio::test]
    async fn test_host_cwd() {
        let mut c = Commander::host("host");
        c.set_cwd(Some(PathBuf::from("/")));
        let out = c.cmd_raises("pwd").await.expect("pwd");
        assert_eq!(out.trim(), "/");
    }
}
