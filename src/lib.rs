//! SDN control plane for a programmable-switch fabric: spanning tree,
//! idempotent rule install, and a telemetry-digest reaction loop.

pub mod arp;
pub mod config;
pub mod digest;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod rules;
pub mod schema;
pub mod session;
pub mod topology;
pub mod transport;
pub mod upload;
