//! Integration tests against real Linux network namespaces.
//!
//! **Requirements:** Linux with `ip netns` + `tc netem` support and
//! root / passwordless sudo. Tests skip silently when the environment
//! cannot create namespaces.
//!
//! Run:
//! ```bash
//! sudo cargo test -p proxymark-netsim --test netns -- --test-threads=1 --nocapture
//! ```

use proxymark_netsim::impairment::{impair_link, ImpairmentConfig};
use proxymark_netsim::runner::{CommandRunner, SysRunner};
use proxymark_netsim::test_util::check_privileges;
use proxymark_netsim::topology::{teardown_all, Topology};

/// Extract the ping time from iputils output
/// ("64 bytes from 10.2.1.1: icmp_seq=1 ttl=64 time=102 ms").
fn get_ping_time(output: &str) -> Option<f32> {
    for line in output.lines() {
        if let Some(idx) = line.find("time=") {
            let rest = &line[idx + 5..];
            if let Some(end) = rest.find(' ') {
                return rest[..end].parse::<f32>().ok();
            }
        }
    }
    None
}

#[test]
fn star_topology_is_reachable_and_reprovisionable() {
    if !check_privileges() {
        eprintln!("Skipping test, insufficient privileges or missing tools");
        return;
    }

    let runner = SysRunner::new();
    let topo = Topology::provision(&runner, 2, 2).expect("provision");

    // Every client and server reaches the proxy over its own link.
    for link in &topo.links {
        let peer = topo
            .servers
            .iter()
            .chain(topo.clients.iter())
            .find(|ns| ns.name == link.peer_ns)
            .expect("link peer namespace");
        let out = peer
            .exec(&runner, "ping", &["-c", "1", "-W", "1", &link.proxy_addr])
            .expect("exec ping");
        assert!(
            out.status.success(),
            "ping {} from {} failed:\n{}",
            link.proxy_addr,
            peer.name,
            String::from_utf8_lossy(&out.stderr)
        );
    }

    // Reprovisioning over the live topology must yield the identical shape.
    let again = Topology::provision(&runner, 2, 2).expect("reprovision");
    assert_eq!(topo, again);

    again.teardown(&runner);

    let listing = runner.run("ip", &["netns", "list"]).expect("netns list");
    let listing = String::from_utf8_lossy(&listing.stdout).into_owned();
    assert!(
        !listing.contains("pmk_"),
        "teardown left namespaces behind:\n{listing}"
    );
}

#[test]
fn netem_latency_is_observable_on_client_links() {
    if !check_privileges() {
        eprintln!("Skipping test, insufficient privileges or missing tools");
        return;
    }

    let runner = SysRunner::new();
    let topo = Topology::provision(&runner, 1, 1).expect("provision");

    let link = topo
        .links
        .iter()
        .find(|l| l.is_client_link())
        .expect("client link");

    let cfg = ImpairmentConfig {
        latency_ms: Some(100),
        jitter_ms: Some(10),
        loss_percent: None,
        queue_limit: Some(ImpairmentConfig::default_queue_limit(1024)),
    };
    if let Err(err) = impair_link(&runner, &topo.proxy, link, &cfg) {
        if err.to_string().contains("qdisc kind is unknown") {
            eprintln!("Skipping test, netem qdisc not available");
            teardown_all(&runner);
            return;
        }
        panic!("failed to impair link: {err}");
    }

    let client = &topo.clients[0];
    let out = client
        .exec(&runner, "ping", &["-c", "4", "-i", "0.2", &link.proxy_addr])
        .expect("exec ping");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(out.status.success(), "ping failed:\n{stdout}");

    let rtt = get_ping_time(&stdout).expect("could not parse ping time");
    // Symmetric 100ms each way: RTT must reflect at least one direction.
    assert!(
        rtt >= 95.0,
        "RTT {rtt} ms is less than the expected 100ms impairment"
    );

    topo.teardown(&runner);
}
