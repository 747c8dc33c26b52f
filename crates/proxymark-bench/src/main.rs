use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use proxymark_bench::affinity::CpuPlan;
use proxymark_bench::bench;
use proxymark_bench::cleanup::CleanupGuard;
use proxymark_bench::config::{BenchConfig, TlsVersion, WorkerFailurePolicy};
use proxymark_bench::report;
use proxymark_bench::sanity;
use proxymark_bench::services::{ServiceManager, ServiceSpec};
use proxymark_bench::stats::RunningStats;
use proxymark_netsim::impairment::impair_link;
use proxymark_netsim::runner::{CommandRunner, SysRunner};
use proxymark_netsim::topology::Topology;

/// Set from the signal handler, polled between run phases.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    // SAFETY: the handler only performs an atomic store.
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

/// Throughput benchmark for a TLS-terminating reverse proxy, run in an
/// isolated network-namespace topology. Requires root (or passwordless
/// sudo) for namespace and qdisc manipulation.
#[derive(Debug, Parser)]
#[command(name = "proxymark", version, about)]
struct Cli {
    /// TOML profile with the run configuration; flags below override it.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable the crypto-acceleration engine.
    #[arg(long)]
    hw_offload: bool,

    /// Pin proxy threads, servers, and clients to disjoint CPU ranges.
    #[arg(long)]
    cpu_pinning: bool,

    /// Number of repeated trials.
    #[arg(long, value_name = "N")]
    trials: Option<u32>,

    /// Duration of each trial (and of the drain between trials), seconds.
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,

    #[arg(long, value_name = "VERSION")]
    tls_version: Option<TlsVersion>,

    /// Restrict the TLS path to a single cipher.
    #[arg(long, value_name = "CIPHER")]
    tls_cipher: Option<String>,

    #[arg(long, value_name = "N")]
    servers: Option<u16>,

    #[arg(long, value_name = "N")]
    clients: Option<u16>,

    /// Offered request rate per client worker.
    #[arg(long, value_name = "RPS")]
    rate: Option<u32>,

    #[arg(long, value_name = "N")]
    proxy_threads: Option<u16>,

    /// Added one-way latency on client links; enables impairment.
    #[arg(long, value_name = "MS")]
    latency: Option<u32>,

    #[arg(long, value_name = "MS")]
    jitter: Option<u32>,

    #[arg(long, value_name = "PCT")]
    loss: Option<f32>,

    /// netem queue limit override (default: 2x the offered rate).
    #[arg(long, value_name = "PKTS")]
    queue_limit: Option<u32>,

    /// What to do with a worker that produces no throughput figure.
    #[arg(long, value_name = "POLICY")]
    worker_failure: Option<WorkerFailurePolicy>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<BenchConfig> {
        let mut cfg = match &self.config {
            Some(path) => BenchConfig::from_profile(path)?,
            None => BenchConfig::default(),
        };

        if self.hw_offload {
            cfg.use_hw_offload = true;
        }
        if self.cpu_pinning {
            cfg.use_cpu_pinning = true;
        }
        if let Some(v) = self.trials {
            cfg.num_trials = v;
        }
        if let Some(v) = self.duration {
            cfg.trial_duration_secs = v;
        }
        if let Some(v) = self.tls_version {
            cfg.tls_version = v;
        }
        if let Some(v) = self.tls_cipher {
            cfg.tls_cipher = Some(v);
        }
        if let Some(v) = self.servers {
            cfg.server_count = v;
        }
        if let Some(v) = self.clients {
            cfg.client_count = v;
        }
        if let Some(v) = self.rate {
            cfg.offered_rps = v;
        }
        if let Some(v) = self.proxy_threads {
            cfg.proxy_threads = v;
        }
        if let Some(v) = self.latency {
            cfg.network_latency_ms = Some(v);
        }
        if let Some(v) = self.jitter {
            cfg.network_jitter_ms = Some(v);
        }
        if let Some(v) = self.loss {
            cfg.network_loss_percent = Some(v);
        }
        if let Some(v) = self.queue_limit {
            cfg.network_queue_limit = Some(v);
        }
        if let Some(v) = self.worker_failure {
            cfg.worker_failure_policy = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_config()?;
    run(&config)
}

fn run(config: &BenchConfig) -> anyhow::Result<()> {
    sanity::preflight(config)?;
    install_signal_handlers();

    let runner: Arc<dyn CommandRunner> = Arc::new(SysRunner::new());
    let mut guard = CleanupGuard::new(Arc::clone(&runner));

    let topology = Topology::provision(runner.as_ref(), config.server_count, config.client_count)
        .context("topology provisioning failed")?;

    let impairment = config.impairment();
    if impairment.is_enabled() {
        for link in topology.links.iter().filter(|l| l.is_client_link()) {
            impair_link(runner.as_ref(), &topology.proxy, link, &impairment)
                .with_context(|| format!("impairing link to {}", link.peer_ns))?;
        }
        tracing::info!(
            latency_ms = impairment.latency_ms.unwrap_or(0),
            links = config.client_count,
            "client links impaired"
        );
    }

    let cpu_plan = config.use_cpu_pinning.then(|| CpuPlan::new(config));
    if let Some(plan) = &cpu_plan {
        tracing::info!(affinity = %plan.summary(), "cpu pinning enabled");
    }

    let spec = ServiceSpec::from_config(config);
    let services = ServiceManager::start(runner.as_ref(), &topology, &spec, cpu_plan.as_ref())
        .context("service startup failed")?;
    guard.register_services(services);

    sanity::check_reachability(runner.as_ref(), &topology, config, &spec)?;
    tracing::info!("sanity checks passed, starting measurement");

    let aggregates = bench::run_trials(
        &runner,
        &topology,
        config,
        &spec,
        cpu_plan.as_ref(),
        &INTERRUPTED,
    )?;

    let mut stats = RunningStats::new();
    for aggregate in &aggregates {
        stats.push(*aggregate);
    }
    let stddev = match stats.sample_stddev() {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(trials = aggregates.len(), "{e}");
            None
        }
    };

    guard.run();
    print!("{}", report::render(config, cpu_plan.as_ref(), stats.mean(), stddev));
    Ok(())
}
