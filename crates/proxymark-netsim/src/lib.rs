//! Network topology toolkit for the proxymark benchmark harness.
//!
//! Provides Linux network namespace management, veth star topologies with
//! deterministic addressing, `tc netem` impairment application, and a
//! command-runner capability with real and recording variants so the rest
//! of the harness can be tested without namespace privileges.

pub mod impairment;
pub mod runner;
pub mod test_util;
pub mod topology;
