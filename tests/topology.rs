//! End-to-end topology tests. They create namespaces, bridges and qdiscs,
//! so they only run as root with NETBED_PRIV=1.

use netbed::namespace::{read_ns_ids, NsKind};
use netbed::{
    Namespace, NamespaceKinds, NamespaceOptions, Runner, Topology, TopologyConfig,
    TopologyOptions,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

fn privileged() -> bool {
    std::env::var("NETBED_PRIV")
        .map(|v| v == "1")
        .unwrap_or(false)
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("netbed=debug")
        .try_init();
}

fn options(rundir: &Path) -> TopologyOptions {
    TopologyOptions {
        init: Some(PathBuf::from(env!("CARGO_BIN_EXE_netbed-init"))),
        rundir: Some(rundir.to_path_buf()),
        ..Default::default()
    }
}

fn gone(pid: Option<i32>) -> bool {
    match pid {
        Some(pid) => !Path::new(&format!("/proc/{}", pid)).exists(),
        None => true,
    }
}

/// Average round trip in ms from ping's summary line.
fn ping_avg(output: &str) -> Option<f64> {
    let line = output.lines().find(|l| l.contains("min/avg/max"))?;
    let values = line.split('=').nth(1)?.trim();
    values.split('/').nth(1)?.trim().parse().ok()
}

const SCENARIO: &str = r#"{
    "networks": [{"name": "sw1"}],
    "nodes": [
        {"name": "r1", "connections": ["sw1"]},
        {"name": "r2", "connections": [
            "sw1",
            {"to": "r3", "name": "p2p0", "constraints": {"delay": 80000}}
        ]},
        {"name": "r3", "connections": [
            "sw1",
            {"to": "r2", "name": "p2p0", "constraints": {"delay": 40000}}
        ]}
    ]
}"#;

#[tokio::test]
async fn test_scenario_addresses_latency_and_teardown() {
    if !privileged() {
        eprintln!("Skipping privileged test (set NETBED_PRIV=1 to enable)");
        return;
    }
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let config = TopologyConfig::from_json(SCENARIO).unwrap();
    let topo = Topology::build(config, options(tmp.path())).await.unwrap();

    for (node, expected) in [("r1", "10.0.1.1/24"), ("r2", "10.0.1.2/24"), ("r3", "10.0.1.3/24")] {
        let n = topo.node(node).unwrap();
        let addr = n.addrs().get("eth0").copied().flatten().unwrap();
        assert_eq!(addr.to_string(), expected, "{}", node);
    }
    assert_eq!(topo.links().len(), 4);

    let r2 = topo.node("r2").unwrap();
    let r3 = topo.node("r3").unwrap();
    let peer = r3.addrs().get("p2p0").copied().flatten().unwrap();
    let out = r2
        .cmd_raises(format!("ping -c 5 -i 0.2 {}", peer.ip()))
        .await
        .unwrap();
    let avg = ping_avg(&out).unwrap();
    assert!((110.0..150.0).contains(&avg), "average rtt {} ms", avg);

    // the rundir tells outside tools where to enter each node
    let nspid = topo.rundir().read_nspid("r1");
    assert_eq!(nspid, topo.node("r1").unwrap().namespace().pid());

    let mut pids: Vec<Option<i32>> = topo.nodes().map(|n| n.namespace().pid()).collect();
    pids.push(topo.root().pid());
    topo.teardown().await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    for pid in pids {
        assert!(gone(pid), "namespace anchor {:?} survived teardown", pid);
    }
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_teardown_isolates_failing_node() {
    if !privileged() {
        eprintln!("Skipping privileged test (set NETBED_PRIV=1 to enable)");
        return;
    }
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let tmp = tempfile::tempdir().unwrap();
    let config = TopologyConfig::from_json(
        r#"{
            "networks": [{"name": "lan"}],
            "nodes": [
                {"name": "h1", "connections": ["lan"], "cleanup-cmd": "true"},
                {"name": "h2", "connections": ["lan"], "cleanup-cmd": "exit 1"},
                {"name": "h3", "connections": ["lan"], "cmd": "sleep 60"}
            ]
        }"#,
    )
    .unwrap();
    let topo = Topology::build(config, options(tmp.path())).await.unwrap();
    let pids: Vec<Option<i32>> = topo.nodes().map(|n| n.namespace().pid()).collect();
    assert_eq!(pids.len(), 3);

    topo.teardown().await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    for pid in pids {
        assert!(gone(pid), "namespace anchor {:?} leaked", pid);
    }
    let log = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
    let failures: Vec<&str> = log.lines().filter(|l| l.contains("teardown failed")).collect();
    assert_eq!(failures.len(), 1, "{}", log);
    assert!(failures[0].contains("h2"));
}

#[tokio::test]
async fn test_namespace_isolation() {
    if !privileged() {
        eprintln!("Skipping privileged test (set NETBED_PRIV=1 to enable)");
        return;
    }
    init_logging();
    let opts = NamespaceOptions {
        kinds: NamespaceKinds::node_default(),
        hostname: Some("iso1".to_string()),
        init: Some(PathBuf::from(env!("CARGO_BIN_EXE_netbed-init"))),
        ..Default::default()
    };
    let mut ns = Namespace::create("iso1", opts).await.unwrap();
    let pid = ns.pid().unwrap();

    let kinds = NamespaceKinds::node_default().kinds();
    let ours = read_ns_ids(None, &kinds);
    let theirs = read_ns_ids(Some(pid), &kinds);
    for kind in &kinds {
        assert_ne!(ours.get(kind), theirs.get(kind), "{} not isolated", kind);
    }
    assert!(kinds.contains(&NsKind::Pid));

    assert_eq!(ns.cmd_raises("hostname").await.unwrap().trim(), "iso1");
    let links = ns.cmd_raises("ip -o link show").await.unwrap();
    assert_eq!(links.lines().count(), 1, "{}", links);

    ns.release().await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(gone(Some(pid)));
}

#[tokio::test]
async fn test_time_isolation() {
    if !privileged() {
        eprintln!("Skipping privileged test (set NETBED_PRIV=1 to enable)");
        return;
    }
    init_logging();
    let opts = NamespaceOptions {
        kinds: NamespaceKinds {
            net: true,
            time: true,
            ..Default::default()
        },
        verify_timeout: std::time::Duration::from_secs(5),
        ..Default::default()
    };
    let mut ns = Namespace::create("time1", opts).await.unwrap();
    let pid = ns.pid().unwrap();

    let ours = read_ns_ids(None, &[NsKind::Time]);
    let theirs = read_ns_ids(Some(pid), &[NsKind::Time]);
    assert!(theirs.contains_key(&NsKind::Time));
    assert_ne!(ours.get(&NsKind::Time), theirs.get(&NsKind::Time));
    // children of a command entering the node land in its time namespace
    let seen = ns.cmd_raises("readlink /proc/self/ns/time; :").await.unwrap();
    assert_eq!(Some(seen.trim()), theirs.get(&NsKind::Time).map(String::as_str));

    ns.release().await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(gone(Some(pid)));
}
