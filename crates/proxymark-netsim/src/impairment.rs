//! Link impairment via `tc netem`.
//!
//! Impairment is an all-or-nothing switch keyed on latency: with no latency
//! configured, no qdisc is installed at all and the remaining parameters are
//! ignored. Client↔proxy links are impaired symmetrically, with the same
//! nominal parameters on both endpoints, so the emulated path behaves the
//! same in both directions.

use std::io;

use crate::runner::CommandRunner;
use crate::topology::{Link, Namespace};

/// Shaping parameters for one link.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImpairmentConfig {
    /// Added one-way delay. `None` disables impairment entirely.
    pub latency_ms: Option<u32>,
    pub jitter_ms: Option<u32>,
    pub loss_percent: Option<f32>,
    /// netem queue limit in packets. Should comfortably exceed the offered
    /// burst so the shaping queue itself doesn't drop legitimate traffic;
    /// see [`ImpairmentConfig::default_queue_limit`].
    pub queue_limit: Option<u32>,
}

impl ImpairmentConfig {
    /// Whether any shaping will be applied.
    pub fn is_enabled(&self) -> bool {
        self.latency_ms.is_some()
    }

    /// Queue-limit convention: twice the offered request rate, so only the
    /// configured loss policy, not queue overflow, drops packets.
    pub fn default_queue_limit(offered_rps: u32) -> u32 {
        offered_rps * 2
    }
}

/// Apply (or clear) netem shaping on one interface inside a namespace.
///
/// Any existing root qdisc is removed first, best-effort. When the config is
/// disabled that removal is the whole job: the interface ends up with no
/// queueing discipline configured.
pub fn apply_impairment(
    runner: &dyn CommandRunner,
    ns: &Namespace,
    interface: &str,
    config: &ImpairmentConfig,
) -> io::Result<()> {
    let _ = ns.exec(runner, "tc", &["qdisc", "del", "dev", interface, "root"]);

    let Some(latency) = config.latency_ms else {
        return Ok(());
    };

    let mut args_storage: Vec<String> = vec![
        "qdisc".into(),
        "add".into(),
        "dev".into(),
        interface.into(),
        "root".into(),
        "netem".into(),
    ];

    if let Some(limit) = config.queue_limit {
        args_storage.push("limit".into());
        args_storage.push(limit.to_string());
    }

    args_storage.push("delay".into());
    args_storage.push(format!("{latency}ms"));
    if let Some(jitter) = config.jitter_ms {
        if jitter > 0 {
            args_storage.push(format!("{jitter}ms"));
        }
    }

    if let Some(loss) = config.loss_percent {
        if loss > 0.0 {
            args_storage.push("loss".into());
            args_storage.push(format!("{loss}%"));
        }
    }

    let args: Vec<&str> = args_storage.iter().map(|s| s.as_str()).collect();
    let output = ns.exec(runner, "tc", &args)?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "failed to apply tc netem on {}/{interface}: {}\nCommand: tc {}",
            ns.name,
            String::from_utf8_lossy(&output.stderr),
            args.join(" ")
        )));
    }

    Ok(())
}

/// Apply the same nominal impairment to both endpoints of a link.
pub fn impair_link(
    runner: &dyn CommandRunner,
    proxy: &Namespace,
    link: &Link,
    config: &ImpairmentConfig,
) -> io::Result<()> {
    apply_impairment(runner, proxy, &link.proxy_iface, config)?;

    let peer = Namespace {
        name: link.peer_ns.clone(),
        role: link.peer_role,
    };
    apply_impairment(runner, &peer, &link.peer_iface, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RecordingRunner;
    use crate::topology::{Role, Topology};

    fn client_link(topo: &Topology) -> &Link {
        topo.links.iter().find(|l| l.is_client_link()).unwrap()
    }

    #[test]
    fn disabled_config_installs_no_qdisc() {
        let runner = RecordingRunner::new();
        let topo = Topology::provision(&runner, 1, 1).unwrap();

        let cfg = ImpairmentConfig {
            latency_ms: None,
            jitter_ms: Some(10),
            loss_percent: Some(1.0),
            queue_limit: Some(2048),
        };
        impair_link(&runner, &topo.proxy, client_link(&topo), &cfg).unwrap();

        let adds: Vec<_> = runner
            .lines()
            .into_iter()
            .filter(|l| l.contains("qdisc add"))
            .collect();
        assert!(adds.is_empty(), "qdisc installed despite latency unset: {adds:?}");
    }

    #[test]
    fn both_endpoints_get_identical_parameters() {
        let runner = RecordingRunner::new();
        let topo = Topology::provision(&runner, 1, 1).unwrap();

        let cfg = ImpairmentConfig {
            latency_ms: Some(30),
            jitter_ms: Some(5),
            loss_percent: Some(0.5),
            queue_limit: Some(2048),
        };
        impair_link(&runner, &topo.proxy, client_link(&topo), &cfg).unwrap();

        let adds: Vec<_> = runner
            .lines()
            .into_iter()
            .filter(|l| l.contains("qdisc add"))
            .collect();
        assert_eq!(adds.len(), 2);

        for line in &adds {
            assert!(line.contains("limit 2048"));
            assert!(line.contains("delay 30ms 5ms"));
            assert!(line.contains("loss 0.5%"));
        }
        assert!(adds[0].contains("pmk_proxy"));
        assert!(adds[0].contains("vc1p"));
        assert!(adds[1].contains("pmk_cli1"));
        assert!(adds[1].contains("vc1c"));
    }

    #[test]
    fn existing_qdisc_is_cleared_first() {
        let runner = RecordingRunner::new();
        let topo = Topology::provision(&runner, 1, 1).unwrap();
        let ns = Namespace {
            name: "pmk_cli1".into(),
            role: Role::Client(1),
        };

        let cfg = ImpairmentConfig {
            latency_ms: Some(10),
            ..Default::default()
        };
        apply_impairment(&runner, &ns, "vc1c", &cfg).unwrap();
        drop(topo);

        let lines = runner.lines();
        let del = lines
            .iter()
            .position(|l| l.contains("qdisc del dev vc1c root"))
            .expect("no qdisc del issued");
        let add = lines
            .iter()
            .position(|l| l.contains("qdisc add dev vc1c"))
            .unwrap();
        assert!(del < add);
    }

    #[test]
    fn queue_limit_convention_tracks_offered_load() {
        assert_eq!(ImpairmentConfig::default_queue_limit(1024), 2048);
    }
}
