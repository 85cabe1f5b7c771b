//! Namespace lifecycle
//!
//! An owned namespace is anchored by a placeholder process started through
//! `unshare` that reads its stdin and exits when the pipe closes. Commands are
//! run inside it through an `nsenter` prefix addressed by the placeholder's
//! pid. A shared namespace only builds the prefix for a pid owned elsewhere.

use crate::command::{shell_quote, Cmd, CmdOutput, CommandError, Commander, RunOptions, Runner};
use crate::supervisor::children_of;
use crate::teardown::spawn_terminate;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::{Child, ChildStdin};
use tracing::{debug, info, warn};

pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);
const SLOW_VERIFY: Duration = Duration::from_secs(2);
const RELEASE_GRACE: Duration = Duration::from_secs(2);

/// Environment variable naming the init supervisor binary.
pub const INIT_ENV: &str = "NETBED_INIT";
const INIT_NAME: &str = "netbed-init";

#[derive(Error, Debug)]
pub enum NamespaceError {
    #[error("{name}: failed to launch placeholder: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{name}: namespaces {unverified:?} not isolated after {timeout:?}")]
    VerifyTimeout {
        name: String,
        unverified: Vec<NsKind>,
        timeout: Duration,
    },

    #[error("{name}: placeholder exited with status {status} before verification")]
    PlaceholderExited { name: String, status: i32 },

    #[error("{name}: isolation breach: {detail}")]
    IsolationBreach { name: String, detail: String },

    #[error("{name}: invalid private mount {entry:?}")]
    BadMount { name: String, entry: String },

    #[error("init supervisor `{INIT_NAME}` not found (set {INIT_ENV})")]
    InitNotFound,

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NamespaceError {
    /// No partially built namespace is usable after these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NamespaceError::VerifyTimeout { .. }
                | NamespaceError::PlaceholderExited { .. }
                | NamespaceError::IsolationBreach { .. }
        )
    }
}

/// One kind of kernel namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NsKind {
    Net,
    Mount,
    Uts,
    Cgroup,
    Ipc,
    Pid,
    Time,
    User,
}

impl NsKind {
    pub const ALL: [NsKind; 8] = [
        NsKind::Net,
        NsKind::Mount,
        NsKind::Uts,
        NsKind::Cgroup,
        NsKind::Ipc,
        NsKind::Pid,
        NsKind::Time,
        NsKind::User,
    ];

    /// Entry name under `/proc/<pid>/ns/`.
    pub fn proc_name(self) -> &'static str {
        match self {
            NsKind::Net => "net",
            NsKind::Mount => "mnt",
            NsKind::Uts => "uts",
            NsKind::Cgroup => "cgroup",
            NsKind::Ipc => "ipc",
            NsKind::Pid => "pid",
            NsKind::Time => "time",
            NsKind::User => "user",
        }
    }

    /// Long option shared by `unshare` and `nsenter`.
    pub fn flag(self) -> &'static str {
        match self {
            NsKind::Net => "--net",
            NsKind::Mount => "--mount",
            NsKind::Uts => "--uts",
            NsKind::Cgroup => "--cgroup",
            NsKind::Ipc => "--ipc",
            NsKind::Pid => "--pid",
            NsKind::Time => "--time",
            NsKind::User => "--user",
        }
    }
}

impl fmt::Display for NsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

/// Requested isolation set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceKinds {
    pub net: bool,
    pub mount: bool,
    pub uts: bool,
    pub cgroup: bool,
    pub ipc: bool,
    pub pid: bool,
    pub time: bool,
    pub user: bool,
}

impl NamespaceKinds {
    pub fn none() -> Self {
        Self::default()
    }

    /// Nodes: network, mount, hostname, IPC and PID.
    pub fn node_default() -> Self {
        Self {
            net: true,
            mount: true,
            uts: true,
            ipc: true,
            pid: true,
            ..Self::default()
        }
    }

    /// The topology root hosting the bridges.
    pub fn root_default() -> Self {
        Self {
            net: true,
            mount: true,
            uts: true,
            ..Self::default()
        }
    }

    pub fn net_only() -> Self {
        Self {
            net: true,
            ..Self::default()
        }
    }

    /// Requested kinds; PID isolation implies a mount namespace for the
    /// fresh `/proc`.
    pub fn kinds(&self) -> Vec<NsKind> {
        NsKind::ALL
            .into_iter()
            .filter(|k| match k {
                NsKind::Net => self.net,
                NsKind::Mount => self.mount || self.pid,
                NsKind::Uts => self.uts,
                NsKind::Cgroup => self.cgroup,
                NsKind::Ipc => self.ipc,
                NsKind::Pid => self.pid,
                NsKind::Time => self.time,
                NsKind::User => self.user,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds().is_empty()
    }

    /// `unshare` argv launching `placeholder`, wrapped in `init` when PID
    /// isolation is requested.
    pub fn unshare_args(&self, init: Option<&Path>, placeholder: &[&str]) -> Vec<String> {
        let mut args = vec![
            "unshare".to_string(),
            "--fork".to_string(),
            "--kill-child".to_string(),
        ];
        args.extend(self.kinds().iter().map(|k| k.flag().to_string()));
        if self.pid {
            args.push("--mount-proc".to_string());
        }
        if self.user {
            args.push("--map-root-user".to_string());
            args.push("--keep-caps".to_string());
        }
        args.push("--".to_string());
        if let (true, Some(init)) = (self.pid, init) {
            args.push(init.display().to_string());
            args.push("--".to_string());
        }
        args.extend(placeholder.iter().map(|s| s.to_string()));
        args
    }

    /// `nsenter` prefix entering these kinds of the process `pid`.
    pub fn nsenter_prefix(&self, pid: i32, cwd: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "nsenter".to_string(),
            "--target".to_string(),
            pid.to_string(),
        ];
        args.extend(self.kinds().iter().map(|k| k.flag().to_string()));
        // entering a PID or time namespace only takes effect for a child
        if !self.pid && !self.time {
            args.push("--no-fork".to_string());
        }
        if self.user {
            args.push("--preserve-credentials".to_string());
        }
        if let Some(cwd) = cwd {
            args.push(format!("--wd={}", cwd.display()));
        }
        args
    }
}

/// Kinds whose identity is missing or still equal to ours.
pub fn unverified(
    requested: &[NsKind],
    ours: &HashMap<NsKind, String>,
    theirs: &HashMap<NsKind, String>,
) -> Vec<NsKind> {
    requested
        .iter()
        .copied()
        .filter(|k| match (ours.get(k), theirs.get(k)) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        })
        .collect()
}

/// Kinds that `unshare` applies to its children only, never to itself.
pub const CHILD_ONLY: [NsKind; 2] = [NsKind::Pid, NsKind::Time];

/// Verification of the placeholder may finish with only child-only kinds
/// lagging; the inner process is checked for those separately.
pub fn verification_complete(unverified: &[NsKind]) -> bool {
    unverified.iter().all(|k| CHILD_ONLY.contains(k))
}

/// Requested kinds that must be verified on the inner process.
pub fn inner_kinds(requested: &[NsKind]) -> Vec<NsKind> {
    requested.iter().copied().filter(|k| CHILD_ONLY.contains(k)).collect()
}

/// Poll interval after `elapsed`.
pub fn poll_interval(elapsed: Duration) -> Duration {
    if elapsed < Duration::from_secs(1) {
        Duration::from_millis(100)
    } else if elapsed < Duration::from_secs(10) {
        Duration::from_secs(1)
    } else {
        Duration::from_secs(3)
    }
}

/// Namespace identities of `pid` (`None` for ourselves). Unreadable entries
/// are left out.
pub fn read_ns_ids(pid: Option<i32>, kinds: &[NsKind]) -> HashMap<NsKind, String> {
    let base = match pid {
        Some(p) => format!("/proc/{}/ns", p),
        None => "/proc/self/ns".to_string(),
    };
    kinds
        .iter()
        .filter_map(|k| {
            std::fs::read_link(format!("{}/{}", base, k.proc_name()))
                .ok()
                .map(|l| (*k, l.to_string_lossy().into_owned()))
        })
        .collect()
}

/// A requested private mount.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrivateMount {
    Tmpfs(PathBuf),
    Bind { outer: PathBuf, inner: PathBuf },
}

impl PrivateMount {
    /// `"/inner"` is a tmpfs, `"/outer:/inner"` a bind mount.
    pub fn parse(entry: &str) -> Option<Self> {
        match entry.split_once(':') {
            None if !entry.is_empty() => Some(PrivateMount::Tmpfs(entry.into())),
            Some((outer, inner)) if !outer.is_empty() && !inner.is_empty() => {
                Some(PrivateMount::Bind {
                    outer: outer.into(),
                    inner: inner.into(),
                })
            }
            _ => None,
        }
    }

    fn script(&self) -> String {
        match self {
            PrivateMount::Tmpfs(p) => {
                let p = shell_quote(&p.display().to_string());
                format!("mkdir -p {p} && mount -t tmpfs tmpfs {p}")
            }
            PrivateMount::Bind { outer, inner } => {
                let o = shell_quote(&outer.display().to_string());
                let i = shell_quote(&inner.display().to_string());
                format!("mkdir -p {i} && mount --bind {o} {i}")
            }
        }
    }
}

/// Preserves the cgroup tree across the sysfs remount.
const REMOUNT_SYS: &str = "set -e; mount --make-rprivate /; \
    if [ -d /sys/fs/cgroup ]; then \
    d=$(mktemp -d); mount --rbind /sys/fs/cgroup \"$d\"; \
    mount -t sysfs sysfs /sys; mount --move \"$d\" /sys/fs/cgroup; rmdir \"$d\"; \
    else mount -t sysfs sysfs /sys; fi";

#[derive(Clone, Debug)]
pub struct NamespaceOptions {
    pub kinds: NamespaceKinds,
    /// Set the hostname when UTS isolation is requested.
    pub hostname: Option<String>,
    pub private_mounts: Vec<String>,
    pub verify_timeout: Duration,
    /// Init supervisor for PID namespaces; resolved when unset.
    pub init: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
}

impl Default for NamespaceOptions {
    fn default() -> Self {
        Self {
            kinds: NamespaceKinds::node_default(),
            hostname: None,
            private_mounts: Vec::new(),
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            init: None,
            cwd: None,
        }
    }
}

enum Handle {
    Owned { child: Child, stdin: Option<ChildStdin> },
    Shared,
    Host,
    Released,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Handle::Owned { .. } => "Owned",
            Handle::Shared => "Shared",
            Handle::Host => "Host",
            Handle::Released => "Released",
        })
    }
}

/// An owned or shared namespace plus the commander targeting it.
#[derive(Debug)]
pub struct Namespace {
    name: String,
    kinds: NamespaceKinds,
    handle: Handle,
    /// Process addressed by the prefix.
    pid: Option<i32>,
    cmd: Commander,
    ip_path: String,
}

impl Namespace {
    /// The unisolated host.
    pub fn host(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            cmd: Commander::host(name.clone()),
            name,
            kinds: NamespaceKinds::none(),
            handle: Handle::Host,
            pid: None,
            ip_path: "ip".to_string(),
        }
    }

    /// Target namespaces owned by `pid`.
    pub fn shared(name: impl Into<String>, pid: i32, kinds: NamespaceKinds) -> Self {
        let name = name.into();
        Self {
            cmd: Commander::with_prefix(name.clone(), kinds.nsenter_prefix(pid, None)),
            name,
            kinds,
            handle: Handle::Shared,
            pid: Some(pid),
            ip_path: "ip".to_string(),
        }
    }

    /// A shared handle onto this namespace.
    pub fn share(&self, name: impl Into<String>) -> Self {
        match self.pid {
            Some(pid) => {
                let mut ns = Self::shared(name, pid, self.kinds);
                ns.ip_path = self.ip_path.clone();
                ns
            }
            None => Self::host(name),
        }
    }

    /// Create and verify an owned namespace, then prepare its mounts,
    /// hostname and loopback.
    pub async fn create(name: impl Into<String>, opts: NamespaceOptions) -> Result<Self, NamespaceError> {
        let name = name.into();
        let kinds = opts.kinds;
        let requested = kinds.kinds();
        info!("Creating namespace {} ({:?})", name, requested);

        let init = if kinds.pid {
            Some(find_init(opts.init.as_deref())?)
        } else {
            None
        };
        let argv = kinds.unshare_args(init.as_deref(), &["cat"]);
        debug!("{}: launching {:?}", name, argv);

        let mut child = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| NamespaceError::Spawn {
                name: name.clone(),
                source,
            })?;
        let stdin = child.stdin.take();
        let outer_pid = child.id().map(|p| p as i32).ok_or_else(|| NamespaceError::PlaceholderExited {
            name: name.clone(),
            status: -1,
        })?;

        let mut ns = Self {
            cmd: Commander::host(name.clone()),
            name: name.clone(),
            kinds,
            handle: Handle::Owned { child, stdin },
            pid: None,
            ip_path: "ip".to_string(),
        };

        let started = Instant::now();
        let deadline = started + opts.verify_timeout;
        ns.verify(outer_pid, &requested, started, opts.verify_timeout).await?;
        let inner = ns.find_inner(outer_pid, deadline, opts.verify_timeout).await?;
        let lagging = inner_kinds(&requested);
        if !lagging.is_empty() {
            ns.verify_inner(inner, &lagging, deadline, opts.verify_timeout).await?;
        }
        if started.elapsed() > SLOW_VERIFY {
            warn!("{}: namespace verification took {:?}", name, started.elapsed());
        }

        ns.pid = Some(inner);
        ns.cmd.set_prefix(kinds.nsenter_prefix(inner, None));
        debug!("{}: namespace anchored by pid {} (inner {})", name, outer_pid, inner);

        if kinds.mount || kinds.pid {
            ns.cmd_raises(REMOUNT_SYS).await?;
        }

        if let (true, Some(hostname)) = (kinds.uts, opts.hostname.as_deref()) {
            ns.set_hostname(hostname).await?;
        }

        for entry in &opts.private_mounts {
            let mount = PrivateMount::parse(entry).ok_or_else(|| NamespaceError::BadMount {
                name: name.clone(),
                entry: entry.clone(),
            })?;
            ns.cmd_raises(mount.script()).await?;
        }

        if let Some(cwd) = opts.cwd {
            ns.set_cwd(Some(cwd));
        }

        if kinds.net {
            if let Some(ip) = ns.cmd.resolve_executable(&["ip"]).await {
                ns.ip_path = ip.display().to_string();
            }
            let ip = ns.ip_path.clone();
            ns.cmd_raises([ip.as_str(), "link", "set", "lo", "up"]).await?;
        }

        info!("Namespace {} ready", name);
        Ok(ns)
    }

    async fn verify(
        &mut self,
        outer_pid: i32,
        requested: &[NsKind],
        started: Instant,
        timeout: Duration,
    ) -> Result<(), NamespaceError> {
        let ours = read_ns_ids(None, requested);
        let mut warned = false;
        loop {
            self.check_placeholder()?;
            let theirs = read_ns_ids(Some(outer_pid), requested);
            let pending = unverified(requested, &ours, &theirs);
            if verification_complete(&pending) {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed > timeout {
                return Err(NamespaceError::VerifyTimeout {
                    name: self.name.clone(),
                    unverified: pending,
                    timeout,
                });
            }
            if elapsed > SLOW_VERIFY && !warned {
                warn!("{}: still waiting for {:?} to be isolated", self.name, pending);
                warned = true;
            }
            tokio::time::sleep(poll_interval(elapsed)).await;
        }
    }

    /// The placeholder forks once; its child is the process to enter.
    async fn find_inner(
        &mut self,
        outer_pid: i32,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<i32, NamespaceError> {
        let started = Instant::now();
        loop {
            self.check_placeholder()?;
            if let Some(pid) = children_of(outer_pid).into_iter().next() {
                return Ok(pid);
            }
            if Instant::now() > deadline {
                return Err(NamespaceError::VerifyTimeout {
                    name: self.name.clone(),
                    unverified: self.kinds.kinds(),
                    timeout,
                });
            }
            tokio::time::sleep(poll_interval(started.elapsed())).await;
        }
    }

    async fn verify_inner(
        &mut self,
        inner: i32,
        kinds: &[NsKind],
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), NamespaceError> {
        let ours = read_ns_ids(None, kinds);
        let started = Instant::now();
        loop {
            self.check_placeholder()?;
            let theirs = read_ns_ids(Some(inner), kinds);
            let pending = unverified(kinds, &ours, &theirs);
            if pending.is_empty() {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(NamespaceError::VerifyTimeout {
                    name: self.name.clone(),
                    unverified: pending,
                    timeout,
                });
            }
            tokio::time::sleep(poll_interval(started.elapsed())).await;
        }
    }

    fn check_placeholder(&mut self) -> Result<(), NamespaceError> {
        if let Handle::Owned { child, .. } = &mut self.handle {
            if let Some(status) = child.try_wait()? {
                return Err(NamespaceError::PlaceholderExited {
                    name: self.name.clone(),
                    status: crate::command::exit_code(status),
                });
            }
        }
        Ok(())
    }

    async fn set_hostname(&mut self, hostname: &str) -> Result<(), NamespaceError> {
        let outer = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.cmd_raises(["hostname", hostname]).await?;
        let after = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        if after != outer {
            return Err(NamespaceError::IsolationBreach {
                name: self.name.clone(),
                detail: format!("outer hostname changed from {:?} to {:?}", outer, after),
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kinds(&self) -> NamespaceKinds {
        self.kinds
    }

    /// Process addressed by the prefix; `None` for the host.
    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.handle, Handle::Owned { .. })
    }

    pub fn is_host(&self) -> bool {
        matches!(self.handle, Handle::Host)
    }

    pub fn ip_path(&self) -> &str {
        &self.ip_path
    }

    pub fn commander(&self) -> &Commander {
        &self.cmd
    }

    /// Prefix for commands entering only the network namespace.
    pub fn net_prefix(&self) -> Vec<String> {
        match self.pid {
            Some(pid) => NamespaceKinds::net_only().nsenter_prefix(pid, None),
            None => Vec::new(),
        }
    }

    /// Change the working directory of later commands.
    pub fn set_cwd(&mut self, cwd: Option<PathBuf>) {
        match self.pid {
            Some(pid) => {
                let prefix = self.kinds.nsenter_prefix(pid, cwd.as_deref());
                self.cmd.set_prefix(prefix);
            }
            None => self.cmd.set_cwd(cwd),
        }
    }

    /// Release the namespace. Owned namespaces close the placeholder's
    /// stdin and escalate to signals if it lingers. Never fails.
    pub async fn release(&mut self) {
        let handle = std::mem::replace(&mut self.handle, Handle::Released);
        if let Handle::Owned { child, stdin } = handle {
            drop(stdin);
            debug!("{}: releasing namespace", self.name);
            let task = spawn_terminate(self.name.clone(), child, RELEASE_GRACE, None);
            match task.await {
                Ok(Some(status)) => debug!("{}: placeholder exited with {}", self.name, status),
                Ok(None) => warn!("{}: placeholder did not exit", self.name),
                Err(e) => warn!("{}: release task failed: {}", self.name, e),
            }
        }
        self.pid = None;
    }
}

impl Runner for Namespace {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(
        &'a self,
        cmd: Cmd,
        opts: RunOptions,
    ) -> BoxFuture<'a, Result<CmdOutput, CommandError>> {
        Box::pin(self.cmd.run(cmd, opts))
    }
}

/// Locate the init supervisor: explicit path, `$NETBED_INIT`, next to the
/// running executable (or one directory up, for test harness binaries),
/// then `PATH`.
pub fn find_init(explicit: Option<&Path>) -> Result<PathBuf, NamespaceError> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Some(p) = std::env::var_os(INIT_ENV) {
        return Ok(PathBuf::from(p));
    }
    if let Ok(exe) = std::env::current_exe() {
        let candidates = exe
            .parent()
            .into_iter()
            .flat_map(|dir| [Some(dir.join(INIT_NAME)), dir.parent().map(|d| d.join(INIT_NAME))])
            .flatten();
        for c in candidates {
            if c.is_file() {
                return Ok(c);
            }
        }
    }
    std::env::var_os("PATH")
        .iter()
        .flat_map(std::env::split_paths)
        .map(|dir| dir.join(INIT_NAME))
        .find(|p| p.is_file())
        .ok_or(NamespaceError::InitNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(pairs: &[(NsKind, &str)]) -> HashMap<NsKind, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_pid_implies_mount() {
        let k = NamespaceKinds {
            pid: true,
            ..Default::default()
        };
        assert_eq!(k.kinds(), vec![NsKind::Mount, NsKind::Pid]);
    }

    #[test]
    fn test_unshare_args() {
        let k = NamespaceKinds::node_default();
        let args = k.unshare_args(Some(Path::new("/usr/bin/netbed-init")), &["cat"]);
        assert_eq!(
            args.join(" "),
            "unshare --fork --kill-child --net --mount --uts --ipc --pid --mount-proc -- \
             /usr/bin/netbed-init -- cat"
        );

        let k = NamespaceKinds {
            net: true,
            user: true,
            ..Default::default()
        };
        let args = k.unshare_args(None, &["cat"]);
        assert_eq!(
            args.join(" "),
            "unshare --fork --kill-child --net --user --map-root-user --keep-caps -- cat"
        );
    }

    #[test]
    fn test_nsenter_prefix() {
        let k = NamespaceKinds::root_default();
        assert_eq!(
            k.nsenter_prefix(42, None).join(" "),
            "nsenter --target 42 --net --mount --uts --no-fork"
        );
        let k = NamespaceKinds::node_default();
        assert_eq!(
            k.nsenter_prefix(7, Some(Path::new("/srv"))).join(" "),
            "nsenter --target 7 --net --mount --uts --ipc --pid --wd=/srv"
        );
    }

    #[test]
    fn test_unverified() {
        let requested = [NsKind::Net, NsKind::Mount, NsKind::Pid];
        let ours = ids(&[(NsKind::Net, "net:[1]"), (NsKind::Mount, "mnt:[2]"), (NsKind::Pid, "pid:[3]")]);
        let theirs = ids(&[(NsKind::Net, "net:[9]"), (NsKind::Mount, "mnt:[2]")]);
        assert_eq!(unverified(&requested, &ours, &theirs), vec![NsKind::Mount, NsKind::Pid]);
    }

    #[test]
    fn test_child_only_relaxation() {
        assert!(verification_complete(&[]));
        assert!(verification_complete(&[NsKind::Pid]));
        assert!(verification_complete(&[NsKind::Time]));
        assert!(verification_complete(&[NsKind::Pid, NsKind::Time]));
        // anything else still lagging keeps the loop going
        assert!(!verification_complete(&[NsKind::Net, NsKind::Pid]));
        assert!(!verification_complete(&[NsKind::Time, NsKind::Mount]));
        assert!(!verification_complete(&[NsKind::Net]));
    }

    #[test]
    fn test_inner_kinds() {
        let k = NamespaceKinds {
            net: true,
            time: true,
            ..Default::default()
        };
        assert_eq!(inner_kinds(&k.kinds()), vec![NsKind::Time]);
        assert_eq!(
            inner_kinds(&NamespaceKinds::node_default().kinds()),
            vec![NsKind::Pid]
        );
        assert!(inner_kinds(&NamespaceKinds::root_default().kinds()).is_empty());
        assert_eq!(
            k.nsenter_prefix(9, None).join(" "),
            "nsenter --target 9 --net --time"
        );
    }

    #[test]
    fn test_poll_backoff() {
        assert_eq!(poll_interval(Duration::from_millis(50)), Duration::from_millis(100));
        assert_eq!(poll_interval(Duration::from_secs(5)), Duration::from_secs(1));
        assert_eq!(poll_interval(Duration::from_secs(12)), Duration::from_secs(3));
    }

    #[test]
    fn test_private_mounts() {
        assert_eq!(PrivateMount::parse("/run"), Some(PrivateMount::Tmpfs("/run".into())));
        assert_eq!(
            PrivateMount::parse("/srv/r1:/etc/frr"),
            Some(PrivateMount::Bind {
                outer: "/srv/r1".into(),
                inner: "/etc/frr".into()
            })
        );
        assert_eq!(PrivateMount::parse(""), None);
        assert_eq!(PrivateMount::parse(":/x"), None);
        assert_eq!(
            PrivateMount::parse("/var/log").unwrap().script(),
            "mkdir -p /var/log && mount -t tmpfs tmpfs /var/log"
        );
    }

    #[test]
    fn test_self_ids_readable() {
        let ids = read_ns_ids(None, &[NsKind::Net]);
        assert!(ids.get(&NsKind::Net).map(|s| s.starts_with("net:")).unwrap_or(false));
    }

    #[test]
    fn test_explicit_init_wins() {
        let p = find_init(Some(Path::new("/opt/init"))).unwrap();
        assert_eq!(p, PathBuf::from("/opt/init"));
    }

    #[test]
    fn test_fatal_classification() {
        let e = NamespaceError::PlaceholderExited {
            name: "r1".into(),
            status: 1,
        };
        assert!(e.is_fatal());
        let e = NamespaceError::BadMount {
            name: "r1".into(),
            entry: String::new(),
        };
        assert!(!e.is_fatal());
    }
}
