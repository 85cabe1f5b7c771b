//! Concurrent teardown
//!
//! Phases run strictly in order and every phase is concurrent inside:
//! links first, then nodes and switches, then the topology root. A failing
//! entity is logged once and never stops its siblings.

use crate::command::{exit_code, RunOptions, Runner};
use crate::intf::InterfaceTable;
use crate::topology::{Link, Topology};
use crate::TestbedError;
use futures::future::join_all;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Wait for `child` to exit, escalating through signals to its process
/// group: `first` (if any) immediately, then SIGTERM and SIGKILL after each
/// `grace` period. Returns the exit code, or `None` if it never exited.
pub async fn terminate(
    what: &str,
    child: &mut Child,
    grace: Duration,
    first: Option<Signal>,
) -> Option<i32> {
    let Some(pid) = child.id().map(|p| Pid::from_raw(p as i32)) else {
        // already reaped
        return child.try_wait().ok().flatten().map(exit_code);
    };
    let mut escalation = vec![Signal::SIGTERM, Signal::SIGKILL];
    if let Some(sig) = first {
        signal_group(what, pid, sig);
        match sig {
            Signal::SIGKILL => escalation.clear(),
            s => escalation.retain(|e| *e != s),
        }
    }

    let mut stages = escalation.into_iter();
    loop {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => return Some(exit_code(status)),
            Ok(Err(e)) => {
                warn!("{}: wait failed: {}", what, e);
                return None;
            }
            Err(_) => match stages.next() {
                Some(sig) => {
                    debug!("{}: still running after {:?}, sending {}", what, grace, sig);
                    signal_group(what, pid, sig);
                }
                None => {
                    warn!("{}: pid {} survived SIGKILL", what, pid);
                    return None;
                }
            },
        }
    }
}

fn signal_group(what: &str, pid: Pid, sig: Signal) {
    if killpg(pid, sig).is_err() {
        if let Err(e) = kill(pid, sig) {
            debug!("{}: signalling {} failed: {}", what, pid, e);
        }
    }
}

/// Run [`terminate`] as its own task so that cancelling the caller does not
/// abandon the escalation.
pub fn spawn_terminate(
    what: String,
    mut child: Child,
    grace: Duration,
    first: Option<Signal>,
) -> JoinHandle<Option<i32>> {
    tokio::spawn(async move { terminate(&what, &mut child, grace, first).await })
}

fn already_gone(e: &TestbedError) -> bool {
    match e {
        TestbedError::Command(c) => match c {
            crate::command::CommandError::Failed { stderr, .. } => {
                stderr.contains("Cannot find device") || stderr.contains("does not exist")
            }
            _ => false,
        },
        _ => false,
    }
}

/// Delete a veth pair from whichever endpoint still exists. Deleting one end
/// removes both, so the second end is only tried when the first fails.
pub async fn delete_veth(
    a: &dyn InterfaceTable,
    a_if: &str,
    b: &dyn InterfaceTable,
    b_if: &str,
) -> Result<(), TestbedError> {
    let del = |ifname: &str| vec!["link".to_string(), "del".to_string(), ifname.to_string()];
    let quiet = || RunOptions::default().raises().quiet();

    a.interfaces().forget_mac(a_if);
    b.interfaces().forget_mac(b_if);

    let first = a.intf_ip_cmd(a_if, del(a_if), quiet()).await;
    match first {
        Ok(_) => return Ok(()),
        Err(e) => debug!("{}: deleting {} failed: {}", a.name(), a_if, e),
    }
    match b.intf_ip_cmd(b_if, del(b_if), quiet()).await {
        Ok(_) => Ok(()),
        Err(e) => {
            let e = TestbedError::from(e);
            if already_gone(&e) {
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}

async fn delete_link(topo: &Topology, link: &Link) -> Result<(), TestbedError> {
    let (Some(a), Some(b)) = (topo.entity(&link.a.entity), topo.entity(&link.b.entity)) else {
        return Ok(());
    };
    delete_veth(a, &link.a.ifname, b, &link.b.ifname).await
}

/// Tear the whole topology down. Never fails; problems are logged.
pub async fn teardown(mut topo: Topology) {
    info!("Tearing down topology ({} links, {} nodes, {} switches)",
        topo.links.len(), topo.nodes.len(), topo.switches.len());

    let results = join_all(topo.links.iter().map(|l| delete_link(&topo, l))).await;
    for (link, res) in topo.links.iter().zip(results) {
        if let Err(e) = res {
            warn!("link {}: teardown failed: {}", link, e);
        }
    }
    topo.links.clear();
    topo.macs.clear();

    let nodes = join_all(topo.nodes.values_mut().map(|n| async move {
        let name = n.name().to_string();
        (name, n.delete().await)
    }));
    let switches = join_all(topo.switches.values_mut().map(|s| async move {
        let name = s.name().to_string();
        (name, s.delete().await)
    }));
    let (nodes, switches) = futures::join!(nodes, switches);
    for (name, res) in nodes.into_iter().chain(switches) {
        if let Err(e) = res {
            warn!("{}: teardown failed: {}", name, e);
        }
    }

    topo.root.release().await;
    info!("Topology torn down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    fn spawn(script: &str) -> Child {
        tokio::process::Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_graceful_exit() {
        let mut child = spawn("exit 4");
        let code = terminate("t", &mut child, Duration::from_secs(2), None).await;
        assert_eq!(code, Some(4));
    }

    #[tokio::test]
    async fn test_escalates_to_kill() {
        // ignores SIGTERM, so only SIGKILL ends it
        let mut child = spawn("trap '' TERM; while :; do sleep 0.05; done");
        let start = std::time::Instant::now();
        let code = terminate("t", &mut child, Duration::from_millis(200), Some(Signal::SIGTERM)).await;
        assert_eq!(code, Some(128 + Signal::SIGKILL as i32));
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_spawned_task_reports_status() {
        let child = spawn("sleep 30");
        let handle = spawn_terminate("t".into(), child, Duration::from_millis(100), Some(Signal::SIGTERM));
        let code = handle.await.unwrap();
        assert_eq!(code, Some(128 + Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_escalation_survives_cancelled_caller() {
        // the ignored SIGTERM survives exec, so only the delayed SIGKILL ends it
        let child = spawn("trap '' TERM; exec sleep 30");
        let pid = child.id().unwrap() as i32;
        let caller = async move {
            spawn_terminate("t".into(), child, Duration::from_millis(200), Some(Signal::SIGTERM)).await
        };
        assert!(tokio::time::timeout(Duration::from_millis(10), caller).await.is_err());

        let gone = || killpg(Pid::from_raw(pid), None).is_err();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !gone() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone(), "process group {} survived its cancelled caller", pid);
    }
}
