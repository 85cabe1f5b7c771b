//! The init supervisor, run as a plain subreaper (no PID namespace needed).

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

fn init() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_netbed-init"));
    cmd.env("NETBED_INIT_LOG", "debug").stdin(Stdio::null());
    cmd
}

#[test]
fn test_orphans_reaped_before_exit() {
    let started = Instant::now();
    let out = init()
        .args(["sh", "-c", "sleep 0.5 & echo $!; sleep 0.6 & echo $!; exit 0"])
        .stderr(Stdio::inherit())
        .output()
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(out.status.code(), Some(0));
    // the workload exits at once, the background sleeps keep init alive
    assert!(elapsed >= Duration::from_millis(400), "exited after {:?}", elapsed);

    let pids: Vec<i32> = String::from_utf8_lossy(&out.stdout)
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect();
    assert_eq!(pids.len(), 2);
    for pid in pids {
        assert!(!Path::new(&format!("/proc/{}", pid)).exists(), "pid {} left behind", pid);
    }
}

#[test]
fn test_sigterm_forwarded_and_translated() {
    let mut child = init()
        // the subshell orphans one sleep onto init before the signal arrives
        .args(["sh", "-c", "(sleep 30 &); exec sleep 30"])
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    std::thread::sleep(Duration::from_millis(300));

    let started = Instant::now();
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(child.id() as i32),
        nix::sys::signal::Signal::SIGTERM,
    )
    .unwrap();
    let status = child.wait().unwrap();

    assert_eq!(status.code(), Some(128 + libc::SIGTERM));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_exit_status_without_signal_is_zero() {
    let status = init().args(["sh", "-c", "exit 7"]).status().unwrap();
    assert_eq!(status.code(), Some(0));
}
