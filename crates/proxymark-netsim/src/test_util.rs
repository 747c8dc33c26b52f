use crate::runner::{CommandRunner, SysRunner};

/// Check whether namespace-based integration tests can run here: `ip netns`
/// must work through the same runner the tests themselves use. Returns
/// `false` when the environment cannot support namespace manipulation (no
/// root, no sudo, or no `ip` tool).
pub fn check_privileges() -> bool {
    runner_can_manage_namespaces(&SysRunner::new())
}

/// Probe `runner` for namespace access. Factored out so the probe path can
/// be asserted against a recording runner.
pub fn runner_can_manage_namespaces(runner: &dyn CommandRunner) -> bool {
    match runner.run("ip", &["netns", "list"]) {
        Ok(o) => o.status.success(),
        Err(_) => false,
    }
}
