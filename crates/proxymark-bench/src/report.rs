//! Final run report.
//!
//! Plain text, fixed ordering: run parameters, the optional impairment and
//! affinity summaries, a blank line, then the two result figures.

use std::fmt::Write as _;

use crate::affinity::CpuPlan;
use crate::config::BenchConfig;

/// Render the report. `stddev` is `None` when it is undefined (single
/// trial); the line is still printed so the layout stays fixed.
pub fn render(
    config: &BenchConfig,
    cpu_plan: Option<&CpuPlan>,
    mean: f64,
    stddev: Option<f64>,
) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "{} test runs of {} seconds each",
        config.num_trials, config.trial_duration_secs
    );
    let _ = writeln!(out, "{} proxy threads", config.proxy_threads);
    let _ = writeln!(
        out,
        "{} servers, {} clients at {} requests per second",
        config.server_count, config.client_count, config.offered_rps
    );

    let impairment = config.impairment();
    if let Some(latency) = impairment.latency_ms {
        let _ = writeln!(
            out,
            "network impairment: {latency}ms latency, {}ms jitter, {}% loss, queue limit {}",
            impairment.jitter_ms.unwrap_or(0),
            impairment.loss_percent.unwrap_or(0.0),
            impairment.queue_limit.unwrap_or(0),
        );
    }

    if let Some(plan) = cpu_plan {
        let _ = writeln!(out, "cpu affinity: {}", plan.summary());
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Requests Per Second (mean): {mean:.2}");
    match stddev {
        Some(s) => {
            let _ = writeln!(out, "stddev: {s:.2}");
        }
        None => {
            let _ = writeln!(out, "stddev: undefined (single trial)");
        }
    }

    out
}
