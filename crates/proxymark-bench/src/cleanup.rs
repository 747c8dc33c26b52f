//! Scoped cleanup of everything the run materializes.
//!
//! A [`CleanupGuard`] is constructed the moment provisioning begins and
//! fires exactly once on every exit path: normal completion, fatal error,
//! or operator interrupt. Cleanup is best-effort: resources that are
//! already gone never turn a successful run into a failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use proxymark_netsim::runner::CommandRunner;
use proxymark_netsim::topology::teardown_all;

use crate::services::ServiceHandle;

pub struct CleanupGuard {
    runner: Arc<dyn CommandRunner>,
    services: Option<ServiceHandle>,
    done: AtomicBool,
}

impl CleanupGuard {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            services: None,
            done: AtomicBool::new(false),
        }
    }

    /// Hand the running services to the guard so they are stopped before
    /// their namespaces disappear.
    pub fn register_services(&mut self, handle: ServiceHandle) {
        self.services = Some(handle);
    }

    /// Stop services, then remove all harness namespaces. Subsequent calls
    /// (including the one from drop) are no-ops.
    pub fn run(&mut self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut services) = self.services.take() {
            services.stop();
        }
        teardown_all(self.runner.as_ref());
        tracing::info!("cleanup complete");
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.run();
    }
}
