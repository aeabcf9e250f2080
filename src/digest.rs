//! Decode per-flow telemetry digests, derive metrics, and trigger reactive
//! blocking of malicious flows.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use crate::error::PlanMismatch;
use crate::plan::Plan;
use crate::report::ReportRow;
use crate::rules::{locate_ingress_switch, RuleEngine, TunnelId};
use crate::session::SwitchSession;
use crate::transport::DataplaneChannel;

/// Ordered digest fields.
#[derive(Debug, Clone, Copy)]
pub struct DigestRecord {
    pub tunnel_id: u64,
    pub in_port: u32,
    pub switch_time_ns: u64,
    pub queue_depth: u32,
    pub interarrival_ns: u64,
    pub packet_length_bytes: u32,
    pub queue_time_ns: u64,
    pub digest_timestamp_ns: u64,
    pub byte_count: u64,
    pub packet_count: u64,
    pub is_wl: u8,
    pub is_malicious: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub protocol: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Other(u8),
}

impl From<u8> for Protocol {
    fn from(v: u8) -> Self {
        match v {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            other => Protocol::Other(other),
        }
    }
}

/// `(switch, tunnel_id)`-keyed flow state.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowState {
    pub last_digest_timestamp_ns: u64,
    pub last_byte_count: u64,
}

/// Derived metrics for one digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct DerivedMetrics {
    pub sending_rate: f64,
    pub delta_time_ns: u64,
    pub throughput_bps: f64,
    pub overhead_ns: u64,
}

/// Parses a field-order byte buffer into a [`DigestRecord`]. All fields
/// are big-endian unsigned integers.
pub fn decode_digest_record(buf: &[u8]) -> Option<DigestRecord> {
    let mut cursor = Cursor(buf);
    Some(DigestRecord {
        tunnel_id: cursor.take_u64()?,
        in_port: cursor.take_u32()?,
        switch_time_ns: cursor.take_u64()?,
        queue_depth: cursor.take_u32()?,
        interarrival_ns: cursor.take_u64()?,
        packet_length_bytes: cursor.take_u32()?,
        queue_time_ns: cursor.take_u64()?,
        digest_timestamp_ns: cursor.take_u64()?,
        byte_count: cursor.take_u64()?,
        packet_count: cursor.take_u64()?,
        is_wl: cursor.take_u8()?,
        is_malicious: cursor.take_u8()?,
        src_port: cursor.take_u16()?,
        dst_port: cursor.take_u16()?,
        src_ip: cursor.take_bytes4()?,
        dst_ip: cursor.take_bytes4()?,
        protocol: cursor.take_u8()?,
    })
}

struct Cursor<'a>(&'a [u8]);

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.0.len() < n {
            return None;
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Some(head)
    }

    fn take_u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Option<u16> {
        Some(u16::from_be_bytes(self.take(2)?.try_into().ok()?))
    }

    fn take_u32(&mut self) -> Option<u32> {
        Some(u32::from_be_bytes(self.take(4)?.try_into().ok()?))
    }

    fn take_u64(&mut self) -> Option<u64> {
        Some(u64::from_be_bytes(self.take(8)?.try_into().ok()?))
    }

    fn take_bytes4(&mut self) -> Option<[u8; 4]> {
        self.take(4)?.try_into().ok()
    }
}

impl DigestRecord {
    pub fn src_ip_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_ip)
    }

    pub fn dst_ip_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_ip)
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::from(self.protocol)
    }
}

/// Previous-hop inference: the `in_port` on egress digests carries the
/// numeric id of the previous switch by dataplane convention.
pub fn previous_switch_name(in_port: u32) -> String {
    format!("s{in_port}")
}

pub fn ingressed_from_host(current_switch: &str, previous_switch: &str) -> bool {
    current_switch == previous_switch
}

/// Per-(switch, tunnel_id) flow table, owned by one switch's dispatcher
/// task so cross-switch concurrency never touches it.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: HashMap<u64, FlowState>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive `delta_time`/`throughput` from the previous observation for
    /// this tunnel, update the stored state, and return the derived
    /// metrics. First observation yields zero for both.
    pub fn observe(&mut self, tunnel_id: u64, record: &DigestRecord) -> (f64, u64, f64) {
        let sending_rate = if record.interarrival_ns > 0 {
            1_000_000_000.0 / record.interarrival_ns as f64
        } else {
            0.0
        };

        let state = self.flows.entry(tunnel_id).or_insert(FlowState::default());
        let (delta_time, throughput) = if state.last_digest_timestamp_ns == 0 {
            (0u64, 0.0)
        } else {
            let delta_time = record.digest_timestamp_ns.saturating_sub(state.last_digest_timestamp_ns);
            let delta_bytes = record.byte_count.saturating_sub(state.last_byte_count);
            let throughput = if delta_time > 0 {
                8.0 * delta_bytes as f64 / (delta_time as f64 / 1_000_000_000.0)
            } else {
                0.0
            };
            (delta_time, throughput)
        };

        state.last_digest_timestamp_ns = record.digest_timestamp_ns;
        state.last_byte_count = record.byte_count;

        (sending_rate, delta_time, throughput)
    }
}

/// Processes digests for one switch: derives metrics, publishes them,
/// and triggers reactive blocking.
pub struct DigestProcessor<C: DataplaneChannel> {
    pub switch: String,
    flows: FlowTable,
    report_tx: tokio::sync::mpsc::Sender<ReportRow>,
    _marker: std::marker::PhantomData<C>,
}

impl<C: DataplaneChannel + 'static> DigestProcessor<C> {
    pub fn new(switch: String, report_tx: tokio::sync::mpsc::Sender<ReportRow>) -> Self {
        Self {
            switch,
            flows: FlowTable::new(),
            report_tx,
            _marker: std::marker::PhantomData,
        }
    }

    /// Process one digest-list entry.
    pub async fn handle_digest(
        &mut self,
        rules: &mut RuleEngine<C>,
        session_for_ingress: impl Fn(&str) -> Option<Arc<SwitchSession<C>>>,
        plan: &Plan,
        raw: &[u8],
        received_at: Instant,
        now: Instant,
    ) -> Result<(), PlanMismatch> {
        let Some(record) = decode_digest_record(raw) else {
            tracing::warn!(switch = %self.switch, "dropping undersized digest record");
            return Ok(());
        };

        let (sending_rate, delta_time, throughput) = self.flows.observe(record.tunnel_id, &record);
        let overhead_ns = now.saturating_duration_since(received_at).as_nanos() as u64;

        let previous_switch = previous_switch_name(record.in_port);
        let from_host = ingressed_from_host(&self.switch, &previous_switch);
        crate::metrics::publish_digest_metrics(&self.switch, &record, sending_rate, throughput, overhead_ns, !from_host);

        let row = ReportRow {
            switch: self.switch.clone(),
            tunnel_id: record.tunnel_id,
            src_ip: record.src_ip_addr().to_string(),
            dst_ip: record.dst_ip_addr().to_string(),
            src_port: record.src_port,
            dst_port: record.dst_port,
            protocol: record.protocol,
            sending_rate,
            throughput,
            overhead_ns,
            is_malicious: record.is_malicious == 1,
        };
        if self.report_tx.try_send(row).is_err() {
            tracing::debug!(switch = %self.switch, "report queue full, dropping row");
        }

        if record.is_malicious == 1 {
            crate::metrics::publish_malicious_flow(&self.switch, record.tunnel_id);

            let tunnel = TunnelId(record.tunnel_id);
            match locate_ingress_switch(plan, tunnel) {
                Some((ingress, _path)) => {
                    if let Some(session) = session_for_ingress(&ingress) {
                        if let Err(e) = rules.install_block(session.as_ref(), tunnel).await {
                            tracing::warn!(switch = %ingress, tunnel_id = record.tunnel_id, error = %e, "failed to install reactive block");
                        }
                    } else {
                        tracing::warn!(switch = %ingress, "no session for ingress switch, cannot install block");
                    }
                }
                None => {
                    tracing::warn!(tunnel_id = record.tunnel_id, "malicious flow references unknown tunnel id");
                    return Err(PlanMismatch(record.tunnel_id));
                }
            }
        }

        let _ = delta_time;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_record(tunnel_id: u64, digest_ts: u64, byte_count: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&tunnel_id.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes()); // in_port
        buf.extend_from_slice(&0u64.to_be_bytes()); // switch_time_ns
        buf.extend_from_slice(&0u32.to_be_bytes()); // queue_depth
        buf.extend_from_slice(&1_000_000u64.to_be_bytes()); // interarrival_ns
        buf.extend_from_slice(&64u32.to_be_bytes()); // packet_length
        buf.extend_from_slice(&0u64.to_be_bytes()); // queue_time_ns
        buf.extend_from_slice(&digest_ts.to_be_bytes());
        buf.extend_from_slice(&byte_count.to_be_bytes());
        buf.extend_from_slice(&1u64.to_be_bytes()); // packet_count
        buf.push(0); // is_wl
        buf.push(0); // is_malicious
        buf.extend_from_slice(&54321u16.to_be_bytes());
        buf.extend_from_slice(&12345u16.to_be_bytes());
        buf.extend_from_slice(&[10, 0, 1, 1]);
        buf.extend_from_slice(&[10, 0, 1, 4]);
        buf.push(6);
        buf
    }

    #[test]
    fn decodes_all_17_fields_in_order() {
        let buf = encode_record(1234, 1_000_000, 1000);
        let record = decode_digest_record(&buf).unwrap();
        assert_eq!(record.tunnel_id, 1234);
        assert_eq!(record.src_ip, [10, 0, 1, 1]);
        assert_eq!(record.protocol(), Protocol::Tcp);
    }

    #[test]
    fn throughput_formula_is_eight_times_delta_bytes_over_delta_time() {
        // delta_bytes=1250, delta_t=1e6ns -> throughput = 8*1250/1e-3 = 1e7 bits/s.
        let mut flows = FlowTable::new();
        let first = encode_record(1234, 1_000_000, 1000);
        let second = encode_record(1234, 2_000_000, 2250);

        let r1 = decode_digest_record(&first).unwrap();
        let (_, dt0, tp0) = flows.observe(1234, &r1);
        assert_eq!(dt0, 0);
        assert_eq!(tp0, 0.0);

        let r2 = decode_digest_record(&second).unwrap();
        let (_, dt1, tp1) = flows.observe(1234, &r2);
        assert_eq!(dt1, 1_000_000);
        assert!((tp1 - 1.0e7).abs() < 1e-6);
    }

    #[test]
    fn sending_rate_is_zero_for_zero_interarrival() {
        let mut buf = encode_record(1, 0, 0);
        // interarrival_ns occupies bytes [20..28) in this layout.
        buf[20..28].copy_from_slice(&0u64.to_be_bytes());
        let record = decode_digest_record(&buf).unwrap();
        let mut flows = FlowTable::new();
        let (rate, _, _) = flows.observe(1, &record);
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn previous_hop_inference_detects_host_ingress() {
        assert_eq!(previous_switch_name(3), "s3");
        assert!(ingressed_from_host("s3", &previous_switch_name(3)));
        assert!(!ingressed_from_host("s4", &previous_switch_name(3)));
    }
}
