//! Run configuration.
//!
//! One immutable [`BenchConfig`] is resolved before provisioning begins and
//! passed by reference to every component; there is no ambient mutable
//! configuration. A TOML profile may seed the values; command-line flags
//! override individual fields on top.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use proxymark_netsim::impairment::ImpairmentConfig;

/// Negotiated TLS protocol version for the encrypted path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
pub enum TlsVersion {
    #[serde(rename = "1.2")]
    #[value(name = "1.2")]
    V1_2,
    #[serde(rename = "1.3")]
    #[value(name = "1.3")]
    V1_3,
}

impl TlsVersion {
    /// The curl flag selecting this protocol version.
    pub fn curl_flag(&self) -> &'static str {
        match self {
            TlsVersion::V1_2 => "--tlsv1.2",
            TlsVersion::V1_3 => "--tlsv1.3",
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::V1_2 => write!(f, "1.2"),
            TlsVersion::V1_3 => write!(f, "1.3"),
        }
    }
}

/// What to do with a load worker whose output yields no throughput figure.
///
/// The historical behaviour is `Exclude`: the trial aggregate becomes a sum
/// over *successful* workers only. That changes the aggregate's meaning, so
/// it is explicit and configurable here rather than silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WorkerFailurePolicy {
    /// Warn and leave the worker out of the trial aggregate.
    Exclude,
    /// Warn and count the worker as zero throughput.
    Zero,
    /// Abort the whole run.
    Fatal,
}

/// Immutable configuration for one benchmark invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    /// Enable the crypto-acceleration engine (adds startup grace).
    pub use_hw_offload: bool,
    /// Pin each role to a disjoint, contiguous range of logical CPUs.
    pub use_cpu_pinning: bool,
    /// Number of repeated trials feeding the statistics.
    pub num_trials: u32,
    /// Length of each load burst, and of the drain between bursts.
    pub trial_duration_secs: u64,
    pub tls_version: TlsVersion,
    /// Optional cipher restriction for the encrypted path.
    pub tls_cipher: Option<String>,
    pub server_count: u16,
    pub client_count: u16,
    /// Offered request rate per client worker.
    pub offered_rps: u32,
    pub proxy_threads: u16,
    /// Added one-way latency on client links. Unset disables impairment
    /// entirely (jitter, loss, and queue limit are then ignored).
    pub network_latency_ms: Option<u32>,
    pub network_jitter_ms: Option<u32>,
    pub network_loss_percent: Option<f32>,
    /// netem queue limit override; defaults to `offered_rps * 2`.
    pub network_queue_limit: Option<u32>,
    pub worker_failure_policy: WorkerFailurePolicy,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            use_hw_offload: false,
            use_cpu_pinning: false,
            num_trials: 10,
            trial_duration_secs: 60,
            tls_version: TlsVersion::V1_3,
            tls_cipher: None,
            server_count: 8,
            client_count: 16,
            offered_rps: 1024,
            proxy_threads: 4,
            network_latency_ms: None,
            network_jitter_ms: None,
            network_loss_percent: None,
            network_queue_limit: None,
            worker_failure_policy: WorkerFailurePolicy::Exclude,
        }
    }
}

impl BenchConfig {
    /// Load a TOML profile. Missing fields fall back to the defaults.
    pub fn from_profile(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config profile {}: {e}", path.display()))?;
        let cfg: BenchConfig = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("invalid config profile {}: {e}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_trials == 0 {
            anyhow::bail!("num_trials must be at least 1");
        }
        if self.trial_duration_secs == 0 {
            anyhow::bail!("trial_duration_secs must be at least 1");
        }
        if self.server_count == 0 || self.client_count == 0 {
            anyhow::bail!("server_count and client_count must be at least 1");
        }
        if self.offered_rps == 0 {
            anyhow::bail!("offered_rps must be at least 1");
        }
        if self.proxy_threads == 0 {
            anyhow::bail!("proxy_threads must be at least 1");
        }
        Ok(())
    }

    /// Shaping parameters for client links, or a disabled config when
    /// `network_latency_ms` is unset.
    pub fn impairment(&self) -> ImpairmentConfig {
        match self.network_latency_ms {
            None => ImpairmentConfig::default(),
            Some(latency) => ImpairmentConfig {
                latency_ms: Some(latency),
                jitter_ms: self.network_jitter_ms,
                loss_percent: self.network_loss_percent,
                queue_limit: Some(
                    self.network_queue_limit
                        .unwrap_or_else(|| ImpairmentConfig::default_queue_limit(self.offered_rps)),
                ),
            },
        }
    }
}
