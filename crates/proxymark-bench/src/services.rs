//! Service lifecycle: the proxy under test and its backend servers.
//!
//! Commands, ports, and the marker document come from a [`ServiceSpec`]
//! rendered by an external collaborator (the same one that writes the
//! proxy/server configuration files and the self-signed certificate
//! bundle). This module only starts each service inside its owning
//! namespace, waits out the readiness grace, and stops everything
//! idempotently at the end of the run. Services outlive all trials; they
//! are drained between trials, never restarted.

use std::time::{Duration, Instant};

use proxymark_netsim::runner::{CommandRunner, ManagedChild};
use proxymark_netsim::topology::Topology;

use crate::affinity::CpuPlan;
use crate::config::BenchConfig;

/// Commands and interface parameters for the services under test.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// argv for the proxy process (run inside the proxy namespace).
    pub proxy_command: Vec<String>,
    /// argv template for backend server `i`; `{index}` is substituted.
    pub server_command: Vec<String>,
    /// argv template for one load worker; `{url}`, `{duration}` and
    /// `{rate}` are substituted.
    pub client_command: Vec<String>,
    /// Marker string the backend document must contain, byte-exact.
    pub marker: String,
    /// Proxy plaintext listener.
    pub http_port: u16,
    /// Proxy TLS listener (the measured path).
    pub https_port: u16,
    /// Backend plaintext listener.
    pub server_port: u16,
    /// Grace period for listeners to bind after spawn.
    pub ready_grace: Duration,
    /// Additional grace when the crypto-offload engine is enabled; such
    /// engines initialize asynchronously after the process starts.
    pub offload_grace: Duration,
}

impl ServiceSpec {
    /// Default spec: nginx proxy/backends driven by wrk workers, with the
    /// configuration files expected in the working directory (written by
    /// the external config generator).
    pub fn from_config(config: &BenchConfig) -> Self {
        Self {
            proxy_command: argv(&["nginx", "-c", "proxymark-proxy.conf", "-g", "daemon off;"]),
            server_command: argv(&[
                "nginx",
                "-c",
                "proxymark-server{index}.conf",
                "-g",
                "daemon off;",
            ]),
            client_command: argv(&[
                "wrk", "-t", "1", "-c", "8", "-d", "{duration}s", "-R", "{rate}", "{url}",
            ]),
            marker: "proxymark-ok".to_string(),
            http_port: 8080,
            https_port: 8443,
            server_port: 8000,
            ready_grace: Duration::from_secs(2),
            offload_grace: if config.use_hw_offload {
                Duration::from_secs(3)
            } else {
                Duration::ZERO
            },
        }
    }

    /// Substitute `{placeholder}` occurrences in an argv template.
    pub fn substitute(template: &[String], vars: &[(&str, String)]) -> Vec<String> {
        template
            .iter()
            .map(|arg| {
                let mut arg = arg.clone();
                for (key, value) in vars {
                    arg = arg.replace(key, value);
                }
                arg
            })
            .collect()
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Starts and stops the proxy/backend processes.
pub struct ServiceManager;

struct NamedChild {
    ns: String,
    child: Box<dyn ManagedChild>,
}

/// Handle over all running services. Stop is idempotent and also runs on
/// drop so an aborted run never leaks processes.
pub struct ServiceHandle {
    children: Vec<NamedChild>,
    stopped: bool,
}

impl ServiceManager {
    /// Spawn the proxy in its namespace and one backend per server
    /// namespace, then wait out the readiness grace.
    pub fn start(
        runner: &dyn CommandRunner,
        topology: &Topology,
        spec: &ServiceSpec,
        cpu_plan: Option<&CpuPlan>,
    ) -> anyhow::Result<ServiceHandle> {
        let mut children = Vec::with_capacity(1 + topology.servers.len());

        let proxy_argv = spec.proxy_command.clone();
        let cpus = cpu_plan.map(|p| p.proxy_cpus());
        children.push(spawn_in_ns(
            runner,
            &topology.proxy.name,
            cpus.as_deref(),
            &proxy_argv,
        )?);
        tracing::info!(ns = %topology.proxy.name, "proxy started");

        for (idx, server) in topology.servers.iter().enumerate() {
            let i = idx as u16 + 1;
            let argv = ServiceSpec::substitute(
                &spec.server_command,
                &[("{index}", i.to_string())],
            );
            let cpus = cpu_plan.map(|p| p.server_cpu(i).to_string());
            children.push(spawn_in_ns(runner, &server.name, cpus.as_deref(), &argv)?);
        }
        tracing::info!(servers = topology.servers.len(), "backend servers started");

        let grace = spec.ready_grace + spec.offload_grace;
        if !grace.is_zero() {
            tracing::debug!(grace_ms = grace.as_millis() as u64, "waiting for listeners");
            std::thread::sleep(grace);
        }

        Ok(ServiceHandle {
            children,
            stopped: false,
        })
    }
}

/// Spawn `argv` inside a namespace, optionally pinned with `taskset -c`.
fn spawn_in_ns(
    runner: &dyn CommandRunner,
    ns: &str,
    cpus: Option<&str>,
    argv: &[String],
) -> anyhow::Result<NamedChild> {
    let mut full: Vec<&str> = vec!["netns", "exec", ns];
    if let Some(cpus) = cpus {
        full.extend_from_slice(&["taskset", "-c", cpus]);
    }
    full.extend(argv.iter().map(String::as_str));

    let child = runner
        .spawn("ip", &full)
        .map_err(|e| anyhow::anyhow!("failed to start {:?} in {ns}: {e}", argv.first()))?;
    Ok(NamedChild {
        ns: ns.to_string(),
        child,
    })
}

impl ServiceHandle {
    /// Signal-and-wait shutdown of every service. Safe to call repeatedly
    /// and when services already exited.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        for named in &mut self.children {
            let pid = named.child.id();
            if pid != 0 {
                // SAFETY: pid is our own child's process ID; the worst case
                // for a stale pid is ESRCH, which kill reports as -1.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }

            match wait_with_timeout(named.child.as_mut(), Duration::from_secs(5)) {
                Ok(()) => tracing::debug!(ns = %named.ns, "service exited cleanly"),
                Err(e) => {
                    tracing::warn!(ns = %named.ns, error = %e, "service didn't exit cleanly, killing");
                    let _ = named.child.kill();
                    let _ = named.child.wait();
                }
            }
        }

        tracing::info!("services stopped");
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Poll-wait for a child with a deadline.
fn wait_with_timeout(child: &mut dyn ManagedChild, timeout: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(_status) => return Ok(()),
            None => {
                if Instant::now() >= deadline {
                    anyhow::bail!("timeout waiting for child process");
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}
