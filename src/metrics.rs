//! Observability surface: every per-flow and per-fabric quantity published
//! as `metrics` crate gauges/counters. Labels carry switch/tunnel identity
//! instead of a shared map, keeping this module lock-free.

use metrics::{counter, gauge};

use crate::digest::DigestRecord;

/// Static topology-shape gauges, set once at startup.
pub fn publish_topology_shape(num_switches: usize, num_ports: usize, switch_links: usize, host_connections: usize) {
    gauge!("fabric_num_switches").set(num_switches as f64);
    gauge!("fabric_num_ports").set(num_ports as f64);
    gauge!("fabric_switch_links").set(switch_links as f64);
    gauge!("fabric_host_connections").set(host_connections as f64);
}

/// Plan-level gauges, refreshed on every successful configuration upload.
pub fn publish_plan_shape(num_routes: usize, num_wl_nodes: usize, num_classifier_entries: usize) {
    gauge!("fabric_plan_routes").set(num_routes as f64);
    gauge!("fabric_plan_wl_nodes").set(num_wl_nodes as f64);
    gauge!("fabric_plan_classifier_entries").set(num_classifier_entries as f64);
}

/// Per-digest gauges. Labeled by switch and tunnel id so values for
/// different flows don't overwrite each other.
pub fn publish_digest_metrics(
    switch: &str,
    record: &DigestRecord,
    sending_rate: f64,
    throughput: f64,
    overhead_ns: u64,
    inter_switch_hop: bool,
) {
    let switch = switch.to_string();
    let tunnel_id = record.tunnel_id.to_string();

    gauge!("fabric_queue_depth", "switch" => switch.clone(), "tunnel_id" => tunnel_id.clone()).set(record.queue_depth as f64);
    if inter_switch_hop {
        gauge!("fabric_queue_time_ns", "switch" => switch.clone(), "tunnel_id" => tunnel_id.clone()).set(record.queue_time_ns as f64);
        gauge!("fabric_switch_time_ns", "switch" => switch.clone(), "tunnel_id" => tunnel_id.clone()).set(record.switch_time_ns as f64);
    }
    gauge!("fabric_interarrival_ns", "switch" => switch.clone(), "tunnel_id" => tunnel_id.clone()).set(record.interarrival_ns as f64);
    gauge!("fabric_packet_length_bytes", "switch" => switch.clone(), "tunnel_id" => tunnel_id.clone()).set(record.packet_length_bytes as f64);
    gauge!("fabric_sending_rate", "switch" => switch.clone(), "tunnel_id" => tunnel_id.clone()).set(sending_rate);
    gauge!("fabric_throughput_bps", "switch" => switch.clone(), "tunnel_id" => tunnel_id.clone()).set(throughput);
    gauge!("fabric_total_byte_count", "switch" => switch.clone(), "tunnel_id" => tunnel_id.clone()).set(record.byte_count as f64);
    gauge!("fabric_total_packet_count", "switch" => switch.clone(), "tunnel_id" => tunnel_id.clone()).set(record.packet_count as f64);
    gauge!("fabric_last_digest_timestamp_ns", "switch" => switch.clone(), "tunnel_id" => tunnel_id.clone()).set(record.digest_timestamp_ns as f64);
    gauge!("fabric_overhead_ns", "switch" => switch.clone(), "tunnel_id" => tunnel_id.clone()).set(overhead_ns as f64);
    gauge!("fabric_weak_learner_flag", "switch" => switch.clone(), "tunnel_id" => tunnel_id.clone()).set(record.is_wl as f64);
    gauge!("fabric_ismalicious_flow", "switch" => switch.clone(), "tunnel_id" => tunnel_id.clone()).set(record.is_malicious as f64);
}

/// Incremented once per switch that installs a reactive block.
pub fn publish_malicious_flow(switch: &str, tunnel_id: u64) {
    counter!("fabric_malicious_flow_total", "switch" => switch.to_string(), "tunnel_id" => tunnel_id.to_string()).increment(1);
}

/// Tracks whether a session is currently open, used by the orchestrator's
/// readiness reporting.
pub fn publish_session_state(switch: &str, open: bool) {
    gauge!("fabric_session_open", "switch" => switch.to_string()).set(if open { 1.0 } else { 0.0 });
}
