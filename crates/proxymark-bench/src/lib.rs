//! Reproducible throughput benchmarking of a TLS-terminating reverse proxy.
//!
//! The harness provisions an isolated star topology of network namespaces,
//! starts the proxy and its backends, verifies every path end to end, then
//! drives repeated barrier-synchronized load trials and reports mean and
//! sample standard deviation of the aggregate throughput.

pub mod affinity;
pub mod bench;
pub mod cleanup;
pub mod config;
pub mod report;
pub mod sanity;
pub mod services;
pub mod stats;
