//! Benchmark orchestration.
//!
//! Each trial fans out one load worker per client namespace, all launched as
//! close to simultaneously as scheduling allows, then joins them all before
//! anything is collected. A worker that hangs blocks the trial, but every
//! worker is handed an explicit time bound so the barrier always resolves.
//! Between trials the proxy is drained: a full trial duration of silence so
//! steady-state connection teardown on the long-lived proxy cannot bleed
//! into the next measurement. Trials are never pipelined.
//!
//! The interrupt flag is polled before each launch, after each barrier, and
//! throughout each drain. An interrupt raised mid-trial therefore takes
//! effect once the trial's own time bound expires; the wait is bounded
//! because every worker is handed an explicit duration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use proxymark_netsim::runner::CommandRunner;
use proxymark_netsim::topology::Topology;

use crate::affinity::CpuPlan;
use crate::config::{BenchConfig, WorkerFailurePolicy};
use crate::services::ServiceSpec;

/// Result of one load worker within one trial.
struct WorkerOutcome {
    client: String,
    throughput: Option<f64>,
    detail: String,
}

/// Run all `num_trials` trials and return one aggregate throughput figure
/// per trial. `interrupt` is polled between phases; once set, the run stops
/// with an error and the caller's cleanup takes over.
pub fn run_trials(
    runner: &Arc<dyn CommandRunner>,
    topology: &Topology,
    config: &BenchConfig,
    spec: &ServiceSpec,
    cpu_plan: Option<&CpuPlan>,
    interrupt: &AtomicBool,
) -> anyhow::Result<Vec<f64>> {
    let commands = worker_commands(topology, config, spec, cpu_plan)?;
    let mut aggregates = Vec::with_capacity(config.num_trials as usize);

    for trial in 1..=config.num_trials {
        if interrupt.load(Ordering::Relaxed) {
            anyhow::bail!("interrupted before trial {trial}");
        }

        tracing::info!(trial, of = config.num_trials, "launching trial");
        let outcomes = launch_and_join(runner, &commands);
        if interrupt.load(Ordering::Relaxed) {
            anyhow::bail!("interrupted during trial {trial}");
        }
        let aggregate = collect(trial, &outcomes, config.worker_failure_policy)?;
        tracing::info!(trial, requests_per_sec = aggregate, "trial complete");
        aggregates.push(aggregate);

        if trial < config.num_trials {
            drain(config.trial_duration_secs, interrupt)
                .map_err(|e| anyhow::anyhow!("{e} after trial {trial}"))?;
        }
    }

    Ok(aggregates)
}

/// Pre-built `ip netns exec ...` argv for every client worker. Built once;
/// identical across trials.
fn worker_commands(
    topology: &Topology,
    config: &BenchConfig,
    spec: &ServiceSpec,
    cpu_plan: Option<&CpuPlan>,
) -> anyhow::Result<Vec<(String, Vec<String>)>> {
    topology
        .clients
        .iter()
        .enumerate()
        .map(|(idx, client)| {
            let j = idx as u16 + 1;
            // Each client drives the proxy endpoint on its own link.
            let link = topology.link_for(client.role).ok_or_else(|| {
                anyhow::anyhow!("topology has no link between {} and the proxy", client.role)
            })?;
            let url = format!("https://{}:{}/", link.proxy_addr, spec.https_port);

            let load_argv = ServiceSpec::substitute(
                &spec.client_command,
                &[
                    ("{url}", url),
                    ("{duration}", config.trial_duration_secs.to_string()),
                    ("{rate}", config.offered_rps.to_string()),
                ],
            );

            let mut argv: Vec<String> =
                vec!["netns".into(), "exec".into(), client.name.clone()];
            if let Some(plan) = cpu_plan {
                argv.push("taskset".into());
                argv.push("-c".into());
                argv.push(plan.client_cpu(j).to_string());
            }
            argv.extend(load_argv);

            Ok((client.name.clone(), argv))
        })
        .collect()
}

/// Fan out one thread per worker and join them all: the trial barrier.
fn launch_and_join(
    runner: &Arc<dyn CommandRunner>,
    commands: &[(String, Vec<String>)],
) -> Vec<WorkerOutcome> {
    let handles: Vec<_> = commands
        .iter()
        .map(|(client, argv)| {
            let runner = Arc::clone(runner);
            let client = client.clone();
            let argv = argv.clone();
            thread::spawn(move || run_worker(runner.as_ref(), client, &argv))
        })
        .collect();

    handles
        .into_iter()
        .zip(commands)
        .map(|(handle, (client, _))| match handle.join() {
            Ok(outcome) => outcome,
            Err(_) => WorkerOutcome {
                client: client.clone(),
                throughput: None,
                detail: "worker thread panicked".into(),
            },
        })
        .collect()
}

/// Run one load worker to completion and parse its throughput line.
fn run_worker(runner: &dyn CommandRunner, client: String, argv: &[String]) -> WorkerOutcome {
    let args: Vec<&str> = argv.iter().map(String::as_str).collect();
    match runner.run("ip", &args) {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            match parse_requests_per_sec(&stdout) {
                Some(rps) => WorkerOutcome {
                    client,
                    throughput: Some(rps),
                    detail: String::new(),
                },
                None => WorkerOutcome {
                    client,
                    throughput: None,
                    detail: if output.status.success() {
                        "no parseable throughput line in worker output".into()
                    } else {
                        format!(
                            "load worker exited with {}: {}",
                            output.status,
                            String::from_utf8_lossy(&output.stderr).trim()
                        )
                    },
                },
            }
        }
        Err(e) => WorkerOutcome {
            client,
            throughput: None,
            detail: format!("failed to launch load worker: {e}"),
        },
    }
}

/// Sum the per-worker figures into the trial aggregate, applying the
/// configured policy to workers that produced nothing usable.
fn collect(
    trial: u32,
    outcomes: &[WorkerOutcome],
    policy: WorkerFailurePolicy,
) -> anyhow::Result<f64> {
    let mut sum = 0.0;
    for outcome in outcomes {
        match outcome.throughput {
            Some(rps) => sum += rps,
            None => match policy {
                WorkerFailurePolicy::Exclude => {
                    tracing::warn!(
                        trial,
                        client = %outcome.client,
                        detail = %outcome.detail,
                        "excluding worker from trial aggregate"
                    );
                }
                WorkerFailurePolicy::Zero => {
                    tracing::warn!(
                        trial,
                        client = %outcome.client,
                        detail = %outcome.detail,
                        "counting failed worker as zero throughput"
                    );
                }
                WorkerFailurePolicy::Fatal => {
                    anyhow::bail!(
                        "trial {trial}: worker in {} produced no throughput ({})",
                        outcome.client,
                        outcome.detail
                    );
                }
            },
        }
    }
    Ok(sum)
}

/// Idle period equal to one trial duration. Polled so an operator abort
/// doesn't have to wait out the sleep.
fn drain(duration_secs: u64, interrupt: &AtomicBool) -> anyhow::Result<()> {
    tracing::debug!(secs = duration_secs, "draining proxy connections");
    let deadline = std::time::Instant::now() + Duration::from_secs(duration_secs);
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        if interrupt.load(Ordering::Relaxed) {
            anyhow::bail!("interrupted during drain");
        }
        thread::sleep(remaining.min(Duration::from_millis(200)));
    }
}

/// Extract the figure from a load-generator summary line such as
/// `Requests/sec:   9916.67`.
fn parse_requests_per_sec(output: &str) -> Option<f64> {
    for line in output.lines() {
        if let Some(rest) = line.trim_start().strip_prefix("Requests/sec") {
            let value = rest.trim_start_matches(':').trim();
            if let Ok(v) = value.parse::<f64>() {
                return Some(v);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxymark_netsim::runner::{RecordingRunner, ScriptedOutput};
    use std::sync::atomic::AtomicU32;

    fn fast_config(num_trials: u32, clients: u16) -> BenchConfig {
        BenchConfig {
            num_trials,
            trial_duration_secs: 0,
            server_count: 1,
            client_count: clients,
            ..Default::default()
        }
    }

    fn quick_spec() -> ServiceSpec {
        let mut spec = ServiceSpec::from_config(&BenchConfig::default());
        spec.ready_grace = Duration::ZERO;
        spec
    }

    fn wrk_runner(per_worker: f64) -> Arc<dyn CommandRunner> {
        Arc::new(RecordingRunner::with_script(move |_, args| {
            if args.contains(&"wrk") {
                ScriptedOutput::ok(format!("Running 60s test\nRequests/sec:  {per_worker}\n"))
            } else {
                ScriptedOutput::ok("")
            }
        }))
    }

    #[test]
    fn parses_summary_lines() {
        assert_eq!(
            parse_requests_per_sec("Latency 1ms\nRequests/sec:   9916.67\n"),
            Some(9916.67)
        );
        assert_eq!(parse_requests_per_sec("  Requests/sec: 10\n"), Some(10.0));
        assert_eq!(parse_requests_per_sec("Requests/sec: oops\n"), None);
        assert_eq!(parse_requests_per_sec("Transfer/sec: 1MB\n"), None);
    }

    #[test]
    fn aggregate_sums_all_workers_per_trial() {
        let runner = wrk_runner(123.45);
        let config = fast_config(3, 4);
        let topo = Topology::provision(runner.as_ref(), 1, 4).unwrap();

        let interrupt = AtomicBool::new(false);
        let aggs = run_trials(&runner, &topo, &config, &quick_spec(), None, &interrupt).unwrap();

        assert_eq!(aggs.len(), 3);
        for agg in aggs {
            assert!((agg - 4.0 * 123.45).abs() < 1e-9);
        }
    }

    #[test]
    fn workers_target_their_own_link_address() {
        let recorder = Arc::new(RecordingRunner::with_script(|_, args| {
            if args.contains(&"wrk") {
                ScriptedOutput::ok("Requests/sec: 1.0\n")
            } else {
                ScriptedOutput::ok("")
            }
        }));
        let runner: Arc<dyn CommandRunner> = recorder.clone();
        let config = fast_config(1, 2);
        let topo = Topology::provision(runner.as_ref(), 1, 2).unwrap();

        let interrupt = AtomicBool::new(false);
        run_trials(&runner, &topo, &config, &quick_spec(), None, &interrupt).unwrap();

        let wrk_lines: Vec<_> = recorder
            .lines()
            .into_iter()
            .filter(|l| l.contains("wrk"))
            .collect();
        assert_eq!(wrk_lines.len(), 2);
        assert!(wrk_lines
            .iter()
            .any(|l| l.contains("pmk_cli1") && l.contains("https://10.2.1.1:8443/")));
        assert!(wrk_lines
            .iter()
            .any(|l| l.contains("pmk_cli2") && l.contains("https://10.2.2.1:8443/")));
    }

    #[test]
    fn trials_never_overlap() {
        // Stateful script: each worker invocation returns an increasing
        // value, so each trial aggregate reveals exactly which invocations
        // it summed. Overlapping trials would mix the sequences.
        let counter = AtomicU32::new(0);
        let runner: Arc<dyn CommandRunner> =
            Arc::new(RecordingRunner::with_script(move |_, args| {
                if args.contains(&"wrk") {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    ScriptedOutput::ok(format!("Requests/sec: {n}\n"))
                } else {
                    ScriptedOutput::ok("")
                }
            }));
        let config = fast_config(2, 2);
        let topo = Topology::provision(runner.as_ref(), 1, 2).unwrap();

        let interrupt = AtomicBool::new(false);
        let aggs = run_trials(&runner, &topo, &config, &quick_spec(), None, &interrupt).unwrap();

        // Trial 1 consumed invocations {1,2}, trial 2 {3,4}.
        assert_eq!(aggs, vec![3.0, 7.0]);
    }

    #[test]
    fn drain_separates_trials() {
        let runner = wrk_runner(1.0);
        let config = BenchConfig {
            trial_duration_secs: 1,
            ..fast_config(2, 1)
        };
        let topo = Topology::provision(runner.as_ref(), 1, 1).unwrap();

        let interrupt = AtomicBool::new(false);
        let start = std::time::Instant::now();
        run_trials(&runner, &topo, &config, &quick_spec(), None, &interrupt).unwrap();

        // Two instant trials with one full drain between them.
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn unparseable_worker_is_excluded_with_policy_exclude() {
        let runner: Arc<dyn CommandRunner> =
            Arc::new(RecordingRunner::with_script(|_, args| {
                if !args.contains(&"wrk") {
                    ScriptedOutput::ok("")
                } else if args.contains(&"pmk_cli2") {
                    ScriptedOutput::fail(137, "Killed")
                } else {
                    ScriptedOutput::ok("Requests/sec: 500\n")
                }
            }));
        let config = fast_config(1, 3);
        let topo = Topology::provision(runner.as_ref(), 1, 3).unwrap();

        let interrupt = AtomicBool::new(false);
        let aggs = run_trials(&runner, &topo, &config, &quick_spec(), None, &interrupt).unwrap();
        assert_eq!(aggs, vec![1000.0]);
    }

    #[test]
    fn unparseable_worker_aborts_with_policy_fatal() {
        let runner: Arc<dyn CommandRunner> =
            Arc::new(RecordingRunner::with_script(|_, args| {
                if args.contains(&"wrk") {
                    ScriptedOutput::ok("garbage with no summary")
                } else {
                    ScriptedOutput::ok("")
                }
            }));
        let config = BenchConfig {
            worker_failure_policy: WorkerFailurePolicy::Fatal,
            ..fast_config(1, 1)
        };
        let topo = Topology::provision(runner.as_ref(), 1, 1).unwrap();

        let interrupt = AtomicBool::new(false);
        let err =
            run_trials(&runner, &topo, &config, &quick_spec(), None, &interrupt).unwrap_err();
        assert!(err.to_string().contains("pmk_cli1"));
    }

    #[test]
    fn missing_client_link_is_an_error_not_an_empty_target() {
        let recorder = Arc::new(RecordingRunner::new());
        let runner: Arc<dyn CommandRunner> = recorder.clone();
        let config = fast_config(1, 2);
        let mut topo = Topology::provision(runner.as_ref(), 1, 2).unwrap();
        // Sever client2 from the proxy; no worker may target a blank address.
        topo.links.pop();

        let interrupt = AtomicBool::new(false);
        let err =
            run_trials(&runner, &topo, &config, &quick_spec(), None, &interrupt).unwrap_err();
        assert!(err.to_string().contains("client2"));
        // The run failed while building commands; no worker ever launched.
        assert!(!recorder.lines().iter().any(|l| l.contains("wrk")));
    }

    #[test]
    fn interrupt_raised_mid_trial_aborts_after_the_barrier() {
        static FLAG: AtomicBool = AtomicBool::new(false);
        FLAG.store(false, Ordering::SeqCst);

        // The flag flips while the first trial's workers are running, as a
        // signal handler would.
        let runner: Arc<dyn CommandRunner> =
            Arc::new(RecordingRunner::with_script(|_, args| {
                if args.contains(&"wrk") {
                    FLAG.store(true, Ordering::SeqCst);
                    ScriptedOutput::ok("Requests/sec: 1.0\n")
                } else {
                    ScriptedOutput::ok("")
                }
            }));
        let config = fast_config(3, 1);
        let topo = Topology::provision(runner.as_ref(), 1, 1).unwrap();

        let err = run_trials(&runner, &topo, &config, &quick_spec(), None, &FLAG).unwrap_err();
        assert!(err.to_string().contains("during trial 1"));
    }

    #[test]
    fn interrupt_stops_before_next_trial() {
        let runner = wrk_runner(1.0);
        let config = fast_config(5, 1);
        let topo = Topology::provision(runner.as_ref(), 1, 1).unwrap();

        let interrupt = AtomicBool::new(true);
        let err =
            run_trials(&runner, &topo, &config, &quick_spec(), None, &interrupt).unwrap_err();
        assert!(err.to_string().contains("interrupted"));
    }

    #[test]
    fn pinning_assigns_distinct_client_cores() {
        let runner = wrk_runner(1.0);
        let config = BenchConfig {
            use_cpu_pinning: true,
            proxy_threads: 2,
            ..fast_config(1, 2)
        };
        let plan = CpuPlan::new(&config);
        let topo = Topology::provision(runner.as_ref(), 1, 2).unwrap();

        let commands = worker_commands(&topo, &config, &quick_spec(), Some(&plan)).unwrap();
        // proxy threads 0-1, server core 2, clients 3 and 4
        assert!(commands[0].1.join(" ").contains("taskset -c 3"));
        assert!(commands[1].1.join(" ").contains("taskset -c 4"));
    }
}
