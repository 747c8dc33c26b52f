//! Pre-measurement verification.
//!
//! Two layers: environment preconditions checked before anything is
//! provisioned (CPU budget for pinning, crypto-offload kernel module), and
//! end-to-end reachability checks run once services are up: plaintext from
//! the proxy to every backend, plaintext and TLS from every client to the
//! proxy. Any failure here is fatal for the whole run; benchmarking a
//! broken topology would only produce convincing nonsense.

use std::path::Path;

use thiserror::Error;

use proxymark_netsim::runner::CommandRunner;
use proxymark_netsim::topology::{Namespace, Topology};

use crate::config::BenchConfig;
use crate::services::ServiceSpec;

/// Kernel module backing the crypto-acceleration engine.
const OFFLOAD_MODULE: &str = "intel_qat";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreflightError {
    #[error("hardware offload requested but kernel module `{0}` is not loaded (/sys/module/{0} missing)")]
    OffloadUnavailable(String),
    #[error(
        "cpu pinning requires {required} logical processors \
         ({proxy} for proxy threads + {servers} for servers + {clients} for clients), \
         but only {available} are available"
    )]
    InsufficientCores {
        required: usize,
        proxy: usize,
        servers: usize,
        clients: usize,
        available: usize,
    },
}

/// Environment preconditions; must pass before any topology is created.
pub fn preflight(config: &BenchConfig) -> Result<(), PreflightError> {
    if config.use_hw_offload && !Path::new("/sys/module").join(OFFLOAD_MODULE).exists() {
        return Err(PreflightError::OffloadUnavailable(OFFLOAD_MODULE.into()));
    }

    if config.use_cpu_pinning {
        let sys = sysinfo::System::new_all();
        require_cores(config, sys.cpus().len())?;
    }

    Ok(())
}

/// Core-budget check, factored out so the arithmetic is testable without
/// depending on the host the tests run on.
pub(crate) fn require_cores(config: &BenchConfig, available: usize) -> Result<(), PreflightError> {
    let proxy = config.proxy_threads as usize;
    let servers = config.server_count as usize;
    let clients = config.client_count as usize;
    let required = proxy + servers + clients;

    if available < required {
        return Err(PreflightError::InsufficientCores {
            required,
            proxy,
            servers,
            clients,
            available,
        });
    }
    Ok(())
}

/// All reachability failures of one check pass.
#[derive(Debug, Error)]
#[error("sanity checks failed:\n  {}", reasons.join("\n  "))]
pub struct SanityFailure {
    pub reasons: Vec<String>,
}

/// Verify every path the benchmark depends on, collecting all failures
/// instead of stopping at the first.
pub fn check_reachability(
    runner: &dyn CommandRunner,
    topology: &Topology,
    config: &BenchConfig,
    spec: &ServiceSpec,
) -> Result<(), SanityFailure> {
    let mut reasons = Vec::new();

    // Proxy must see the marker document on every backend, plaintext.
    for server in &topology.servers {
        let Some(link) = topology.link_for(server.role) else {
            reasons.push(format!("{}: no link to proxy", server.role));
            continue;
        };
        let url = format!("http://{}:{}/", link.peer_addr, spec.server_port);
        if let Err(why) = fetch_marker(runner, &topology.proxy, &["-s", "--max-time", "5"], &url, spec)
        {
            reasons.push(format!("proxy -> {} plaintext: {why}", server.role));
        }
    }

    // Every client must see the proxy over both plaintext and TLS. The TLS
    // fetch pins the negotiated protocol version; certificate validation is
    // relaxed because the bundle is synthetic and self-signed.
    for client in &topology.clients {
        let Some(link) = topology.link_for(client.role) else {
            reasons.push(format!("{}: no link to proxy", client.role));
            continue;
        };

        let url = format!("http://{}:{}/", link.proxy_addr, spec.http_port);
        if let Err(why) = fetch_marker(runner, client, &["-s", "--max-time", "5"], &url, spec) {
            reasons.push(format!("{} -> proxy plaintext: {why}", client.role));
        }

        let url = format!("https://{}:{}/", link.proxy_addr, spec.https_port);
        let mut flags = vec!["-s", "-k", "--max-time", "5", config.tls_version.curl_flag()];
        if let Some(cipher) = &config.tls_cipher {
            flags.push("--ciphers");
            flags.push(cipher);
        }
        if let Err(why) = fetch_marker(runner, client, &flags, &url, spec) {
            reasons.push(format!(
                "{} -> proxy tls{}: {why}",
                client.role, config.tls_version
            ));
        }
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(SanityFailure { reasons })
    }
}

/// Fetch `url` from inside `ns` and require the marker document.
fn fetch_marker(
    runner: &dyn CommandRunner,
    ns: &Namespace,
    flags: &[&str],
    url: &str,
    spec: &ServiceSpec,
) -> Result<(), String> {
    let mut args: Vec<&str> = flags.to_vec();
    args.push(url);

    let output = ns
        .exec(runner, "curl", &args)
        .map_err(|e| format!("curl failed to run: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "fetch of {url} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    let body = String::from_utf8_lossy(&output.stdout);
    if !body.contains(&spec.marker) {
        return Err(format!(
            "document from {url} is missing marker {:?}",
            spec.marker
        ));
    }
    Ok(())
}
