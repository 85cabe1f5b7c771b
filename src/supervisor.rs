//! PID 1 supervisor for isolated PID namespaces
//!
//! Runs as the first process of a namespace: reaps every orphan that gets
//! re-parented to it, relays signals to all of its children and exits once
//! the supervised program and everything it left behind are gone.
//!
//! All signals except the synchronous fault class are blocked before any
//! fork and consumed through a signalfd, so no signal can arrive before it
//! is accounted for.

use nix::errno::Errno;
use nix::sys::prctl;
use nix::sys::signal::{kill, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, getpid, setpgid, ForkResult, Pid};
use std::ffi::CString;
use std::io::IsTerminal;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("System call error: {0}")]
    Nix(#[from] nix::Error),

    #[error("program argument contains a NUL byte")]
    BadArgument,
}

/// How the supervisor treats a delivered signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalClass {
    /// Relay to children, then exit once they are gone.
    TerminateAndExit,
    Ignore,
    /// Never blocked; the kernel default applies to the supervisor itself.
    AlwaysDefault,
    Child,
    Forward,
}

impl SignalClass {
    pub fn of(sig: Signal) -> Self {
        use Signal::*;
        match sig {
            SIGHUP | SIGINT | SIGQUIT | SIGTERM => SignalClass::TerminateAndExit,
            SIGTTIN | SIGTTOU => SignalClass::Ignore,
            SIGABRT | SIGBUS | SIGFPE | SIGILL | SIGSEGV | SIGSYS | SIGTRAP | SIGKILL
            | SIGSTOP => SignalClass::AlwaysDefault,
            SIGCHLD => SignalClass::Child,
            _ => SignalClass::Forward,
        }
    }
}

/// Signals consumed through the signalfd.
pub fn handled_set() -> SigSet {
    let mut set = SigSet::empty();
    for sig in Signal::iterator() {
        if SignalClass::of(sig) != SignalClass::AlwaysDefault {
            set.add(sig);
        }
    }
    set
}

/// Parent pid from the contents of `/proc/<pid>/stat`. The command name may
/// contain spaces and parentheses, so fields are counted after the last `)`.
pub fn parse_stat_ppid(stat: &str) -> Option<i32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// Pids whose parent is `ppid`, as visible in our `/proc`.
pub fn children_of(ppid: i32) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut pids: Vec<i32> = entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<i32>().ok()))
        .filter(|pid| {
            std::fs::read_to_string(format!("/proc/{}/stat", pid))
                .ok()
                .and_then(|s| parse_stat_ppid(&s))
                == Some(ppid)
        })
        .collect();
    pids.sort_unstable();
    pids
}

/// Shell-style exit code of a wait status.
pub fn translate_status(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}

/// Whether children we fork land in a different PID namespace than ours.
fn pid_namespace_forming() -> bool {
    match (
        std::fs::read_link("/proc/self/ns/pid"),
        std::fs::read_link("/proc/self/ns/pid_for_children"),
    ) {
        (Ok(a), Ok(b)) => a != b,
        _ => false,
    }
}

pub struct Supervisor {
    sfd: SignalFd,
    main_child: Option<Pid>,
    exit_requested: bool,
    exit_signal: Option<Signal>,
}

impl Supervisor {
    /// Install the parent-death guard and block handled signals into a
    /// signalfd. Must run before any fork.
    pub fn install() -> Result<Self, SupervisorError> {
        prctl::set_pdeathsig(Some(Signal::SIGKILL))?;
        let mask = handled_set();
        mask.thread_block()?;
        let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC)?;
        Ok(Self {
            sfd,
            main_child: None,
            exit_requested: false,
            exit_signal: None,
        })
    }

    /// Become the reaper of this namespace. When started as an ordinary
    /// process whose children enter a new PID namespace, fork once: the
    /// parent only relays signals and mirrors the child's exit status.
    pub fn become_reaper(&mut self) -> Result<(), SupervisorError> {
        if getpid().as_raw() == 1 {
            return Ok(());
        }
        if !pid_namespace_forming() {
            prctl::set_child_subreaper(true)?;
            debug!("acting as child subreaper");
            return Ok(());
        }
        // SAFETY: single-threaded at this point.
        match unsafe { fork() }? {
            ForkResult::Child => Ok(()),
            ForkResult::Parent { child } => {
                let code = self.mirror(child);
                std::process::exit(code)
            }
        }
    }

    /// Relay everything to `child` until it exits, returning its status.
    fn mirror(&mut self, child: Pid) -> i32 {
        loop {
            match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    if let Some(code) = translate_status(status) {
                        return code;
                    }
                }
                Err(Errno::ECHILD) => return 0,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("waitpid({}) failed: {}", child, e);
                    return 1;
                }
            }
            match self.next_signal() {
                Some(sig) if SignalClass::of(sig) == SignalClass::Child => {}
                Some(sig) if SignalClass::of(sig) == SignalClass::Ignore => {}
                Some(sig) => {
                    let _ = kill(child, sig);
                }
                None => {}
            }
        }
    }

    /// Fork and exec `program` as the supervised workload.
    pub fn launch(&mut self, program: &[String], new_pgrp: bool) -> Result<Pid, SupervisorError> {
        let argv = program
            .iter()
            .map(|a| CString::new(a.as_str()).map_err(|_| SupervisorError::BadArgument))
            .collect::<Result<Vec<_>, _>>()?;
        let Some(file) = argv.first().cloned() else {
            return Err(SupervisorError::BadArgument);
        };

        // SAFETY: single-threaded; the child only calls async-signal-safe
        // functions before exec.
        match unsafe { fork() }? {
            ForkResult::Child => {
                if new_pgrp {
                    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
                    // All signals are still blocked, so SIGTTOU cannot stop us.
                    if std::io::stdin().is_terminal() {
                        unsafe {
                            libc::tcsetpgrp(0, libc::getpid());
                        }
                    }
                }
                let _ = nix::sys::signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
                let _ = execvp(&file, &argv);
                unsafe { libc::_exit(127) }
            }
            ForkResult::Parent { child } => {
                info!("supervising {} as pid {}", program.join(" "), child);
                self.main_child = Some(child);
                Ok(child)
            }
        }
    }

    fn next_signal(&mut self) -> Option<Signal> {
        match self.sfd.read_signal() {
            Ok(Some(info)) => Signal::try_from(info.ssi_signo as i32).ok(),
            Ok(None) | Err(Errno::EINTR) => None,
            Err(e) => {
                warn!("signalfd read failed: {}", e);
                None
            }
        }
    }

    fn forward(&self, sig: Signal) {
        for pid in children_of(getpid().as_raw()) {
            debug!("forwarding {} to {}", sig, pid);
            let _ = kill(Pid::from_raw(pid), sig);
        }
    }

    fn exit_code(&self) -> i32 {
        self.exit_signal.map(|s| 128 + s as i32).unwrap_or(0)
    }

    /// Reap whatever has exited. Returns an exit code once nothing is left
    /// and exiting was requested.
    fn reap(&mut self) -> Option<i32> {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return None,
                Ok(status) => {
                    let pid = status.pid();
                    debug!("reaped {:?}: {:?}", pid, status);
                    if pid.is_some() && pid == self.main_child {
                        self.exit_requested = true;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    return self.exit_requested.then(|| self.exit_code());
                }
                Err(e) => {
                    warn!("waitpid failed: {}", e);
                    return None;
                }
            }
        }
    }

    /// Handle signals until the supervised tree is gone.
    pub fn run(&mut self) -> i32 {
        loop {
            if let Some(code) = self.reap() {
                info!("all children gone, exiting with {}", code);
                return code;
            }
            let Some(sig) = self.next_signal() else {
                continue;
            };
            match SignalClass::of(sig) {
                SignalClass::Child | SignalClass::Ignore | SignalClass::AlwaysDefault => {}
                SignalClass::TerminateAndExit => {
                    self.forward(sig);
                    self.exit_requested = true;
                    self.exit_signal = Some(sig);
                }
                SignalClass::Forward => self.forward(sig),
            }
        }
    }
}
