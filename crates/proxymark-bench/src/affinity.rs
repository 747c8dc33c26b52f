//! Per-role CPU affinity planning.
//!
//! When pinning is enabled, each role type gets a disjoint, contiguous
//! range of logical processors (proxy first, then servers, then clients) so
//! no two roles contend for the same core during measurement. Ranges are
//! rendered as `taskset -c` arguments.

use crate::config::BenchConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuPlan {
    proxy_threads: usize,
    server_count: usize,
    client_count: usize,
}

impl CpuPlan {
    pub fn new(config: &BenchConfig) -> Self {
        Self {
            proxy_threads: config.proxy_threads as usize,
            server_count: config.server_count as usize,
            client_count: config.client_count as usize,
        }
    }

    /// Logical processors the plan needs in total.
    pub fn required_cores(&self) -> usize {
        self.proxy_threads + self.server_count + self.client_count
    }

    /// `taskset -c` range for the proxy process.
    pub fn proxy_cpus(&self) -> String {
        range_str(0, self.proxy_threads)
    }

    /// Core for backend server `i` (1-based).
    pub fn server_cpu(&self, i: u16) -> usize {
        self.proxy_threads + (i as usize - 1)
    }

    /// Core for client worker `j` (1-based).
    pub fn client_cpu(&self, j: u16) -> usize {
        self.proxy_threads + self.server_count + (j as usize - 1)
    }

    /// Human-readable range summary for the report.
    pub fn summary(&self) -> String {
        format!(
            "proxy {}, servers {}, clients {}",
            range_str(0, self.proxy_threads),
            range_str(self.proxy_threads, self.server_count),
            range_str(self.proxy_threads + self.server_count, self.client_count),
        )
    }
}

fn range_str(start: usize, len: usize) -> String {
    if len == 1 {
        format!("{start}")
    } else {
        format!("{start}-{}", start + len - 1)
    }
}
