//! Idempotent upsert rule engine and batch installers.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RuleError;
use crate::plan::Plan;
use crate::schema::{
    build_multicast_entry, encode_be, BuildTableEntry, CanonicalValue, MatchValue, MulticastEntry,
    MulticastReplica, Schema, TableEntry,
};
use crate::session::SwitchSession;
use crate::topology::{SpanningTree, Topology};
use crate::transport::{DataplaneChannel, UpdateKind};

/// Outcome of a batch installer:
/// every entry is attempted even after an earlier one fails, and the
/// overall success flag is `false` if anything failed.
#[derive(Debug, Default, Clone)]
pub struct BatchReport {
    pub attempted: usize,
    pub inserted: usize,
    pub modified: usize,
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn all_ok(&self) -> bool {
        self.failed.is_empty()
    }

    fn record_success(&mut self, kind: UpdateKind) {
        self.attempted += 1;
        match kind {
            UpdateKind::Insert => self.inserted += 1,
            UpdateKind::Modify => self.modified += 1,
            UpdateKind::Delete => {}
        }
    }

    fn record_failure(&mut self, label: impl Into<String>, err: impl std::fmt::Display) {
        self.attempted += 1;
        self.failed.push((label.into(), err.to_string()));
    }

    fn merge(&mut self, other: BatchReport) {
        self.attempted += other.attempted;
        self.inserted += other.inserted;
        self.modified += other.modified;
        self.failed.extend(other.failed);
    }
}

/// Canonicalized view of a desired table entry's match fields, used for
/// upsert equality.
fn canonical_matches(schema: &Schema, table_name: &str, entry: &TableEntry) -> Vec<CanonicalValue> {
    entry
        .matches
        .iter()
        .map(|(field_id, value)| {
            let field = schema
                .table(crate::schema::NameOrId::Name(table_name))
                .ok()
                .and_then(|t| t.match_fields.iter().find(|f| f.id == *field_id))
                .cloned();
            match field {
                Some(field) => crate::schema::canonicalize(&field, value),
                None => match value {
                    MatchValue::Exact(b) | MatchValue::Lpm { addr: b, .. } => {
                        crate::schema::canonicalize_bytes("", b)
                    }
                    MatchValue::Ternary { value, .. } | MatchValue::Range { low: value, .. } => {
                        crate::schema::canonicalize_bytes("", value)
                    }
                },
            }
        })
        .collect()
}

fn canonical_matches_wire(
    schema: &Schema,
    table_name: &str,
    wire: &crate::transport::TableEntryWire,
) -> Vec<CanonicalValue> {
    wire.matches
        .iter()
        .map(|m| {
            use crate::transport::MatchWire;
            let (field_id, bytes) = match m {
                MatchWire::Exact { field_id, value } => (*field_id, value.clone()),
                MatchWire::Lpm { field_id, addr, .. } => (*field_id, addr.clone()),
                MatchWire::Ternary { field_id, value, .. } => (*field_id, value.clone()),
                MatchWire::Range { field_id, low, .. } => (*field_id, low.clone()),
            };
            let field = schema
                .table(crate::schema::NameOrId::Name(table_name))
                .ok()
                .and_then(|t| t.match_fields.iter().find(|f| f.id == field_id))
                .cloned();
            match field {
                Some(field) => crate::schema::canonicalize_bytes(&field.name, &bytes),
                None => crate::schema::canonicalize_bytes("", &bytes),
            }
        })
        .collect()
}

/// Idempotent upsert (read-compare-insert-or-modify) engine over table
/// entries.
pub struct RuleEngine<C: DataplaneChannel> {
    pub schema: Arc<Schema>,
    color_index: HashMap<String, u32>,
}

impl<C: DataplaneChannel + 'static> RuleEngine<C> {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            color_index: HashMap::new(),
        }
    }

    /// Read current entries of `table`, canonicalize, compare to the
    /// desired entry, and issue INSERT or MODIFY.
    pub async fn upsert_entry(
        &self,
        session: &SwitchSession<C>,
        table_name: &str,
        desired: &TableEntry,
    ) -> Result<UpdateKind, RuleError> {
        let current = session.read_table_entries(Some(desired.table_id)).await?;
        let desired_canon = canonical_matches(&self.schema, table_name, desired);

        let existing = current
            .iter()
            .find(|e| canonical_matches_wire(&self.schema, table_name, e) == desired_canon);

        let kind = if existing.is_some() {
            UpdateKind::Modify
        } else {
            UpdateKind::Insert
        };

        session.write_table_entry(kind, desired).await?;
        Ok(kind)
    }

    async fn upsert_or_record(
        &self,
        session: &SwitchSession<C>,
        table_name: &str,
        desired: &TableEntry,
        label: impl Into<String>,
        report: &mut BatchReport,
    ) {
        match self.upsert_entry(session, table_name, desired).await {
            Ok(kind) => report.record_success(kind),
            Err(e) => {
                let label = label.into();
                tracing::warn!(table = table_name, %label, error = %e, "upsert failed, continuing batch");
                report.record_failure(label, e);
            }
        }
    }

    /// Forwarding: LPM /32 on destination IPv4 -> `ipv4_forward(dstMac, outPort)`
    ///.
    pub async fn install_forwarding(
        &self,
        session: &SwitchSession<C>,
        routes: &[(std::net::Ipv4Addr, [u8; 6], u32)],
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for (dst_ip, dst_mac, out_port) in routes {
            let entry = match self.schema.build_table_entry(BuildTableEntry {
                table: "ipv4_lpm",
                matches: vec![(
                    "hdr.ipv4.dstAddr",
                    MatchValue::Lpm {
                        addr: dst_ip.octets().to_vec(),
                        prefix_len: 32,
                    },
                )],
                action: Some("ipv4_forward"),
                action_params: vec![
                    ("dstAddr", mac_to_u128(*dst_mac)),
                    ("port", *out_port as u128),
                ],
                priority: None,
                is_default: false,
            }) {
                Ok(e) => e,
                Err(e) => {
                    report.record_failure(dst_ip.to_string(), e);
                    continue;
                }
            };
            self.upsert_or_record(session, "ipv4_lpm", &entry, dst_ip.to_string(), &mut report)
                .await;
        }
        report
    }

    /// ARP reply/flood per `(ingress_port, eth_src, eth_dst)`
    ///.
    pub async fn install_arp_reply(
        &self,
        session: &SwitchSession<C>,
        ingress_port: u32,
        eth_src: [u8; 6],
        eth_dst: [u8; 6],
        reply_port: Option<u32>,
    ) -> Result<UpdateKind, RuleError> {
        let entry = if let Some(port) = reply_port {
            self.schema.build_table_entry(BuildTableEntry {
                table: "arp_exact",
                matches: vec![
                    ("standard_metadata.ingress_port", MatchValue::Exact(encode_be(ingress_port as u128, 9)?)),
                    ("hdr.ethernet.srcAddr", MatchValue::Exact(eth_src.to_vec())),
                    ("hdr.ethernet.dstAddr", MatchValue::Exact(eth_dst.to_vec())),
                ],
                action: Some("arp_reply"),
                action_params: vec![("port", port as u128)],
                priority: None,
                is_default: false,
            })?
        } else {
            self.schema.build_table_entry(BuildTableEntry {
                table: "arp_exact",
                matches: vec![
                    ("standard_metadata.ingress_port", MatchValue::Exact(encode_be(ingress_port as u128, 9)?)),
                    ("hdr.ethernet.srcAddr", MatchValue::Exact(eth_src.to_vec())),
                    ("hdr.ethernet.dstAddr", MatchValue::Exact(eth_dst.to_vec())),
                ],
                action: Some("flooding"),
                action_params: vec![],
                priority: None,
                is_default: false,
            })?
        };

        self.upsert_entry(session, "arp_exact", &entry).await
    }

    /// Tunnel path for `[s0..sn]` with tunnel id T. `next_hop_port`/
    /// `host_port` are resolved by the caller (the orchestrator, which
    /// owns the topology).
    pub async fn install_tunnel_path(
        &self,
        session_for: impl Fn(&str) -> Option<Arc<SwitchSession<C>>>,
        path: &[String],
        tunnel_id: TunnelId,
        dst_ip: std::net::Ipv4Addr,
        switch_port: impl Fn(&str, &str) -> Option<u32>,
        host_port: impl Fn(&str) -> Option<u32>,
        dst_mac: [u8; 6],
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let Some(first) = path.first() else {
            return report;
        };

        // s0: LPM on dst IPv4 -> tunnel_ingress(dst_id=T).
        if let Some(session) = session_for(first) {
            match self.schema.build_table_entry(BuildTableEntry {
                table: "ipv4_lpm",
                matches: vec![(
                    "hdr.ipv4.dstAddr",
                    MatchValue::Lpm {
                        addr: dst_ip.octets().to_vec(),
                        prefix_len: 32,
                    },
                )],
                action: Some("myTunnel_ingress"),
                action_params: vec![("dst_id", tunnel_id.0 as u128)],
                priority: None,
                is_default: false,
            }) {
                Ok(entry) => {
                    self.upsert_or_record(&session, "ipv4_lpm", &entry, format!("{first}:ingress"), &mut report)
                        .await
                }
                Err(e) => report.record_failure(format!("{first}:ingress"), e),
            }
        } else {
            report.record_failure(format!("{first}:ingress"), "session unavailable");
        }

        // s1..sn: exact on tunnel.dst_id=T.
        for (idx, switch) in path.iter().enumerate().skip(1) {
            let Some(session) = session_for(switch) else {
                report.record_failure(format!("{switch}:transit"), "session unavailable");
                continue;
            };

            let is_last = idx == path.len() - 1;
            let action_entry = if is_last {
                host_port(switch).map(|port| ("myTunnel_egress", vec![("dstAddr", mac_to_u128(dst_mac)), ("port", port as u128)]))
            } else {
                let next = &path[idx + 1];
                switch_port(switch, next).map(|port| ("myTunnel_forward", vec![("port", port as u128)]))
            };

            let Some((action, params)) = action_entry else {
                report.record_failure(format!("{switch}:port-lookup"), "no next-hop/host port");
                continue;
            };

            match self.schema.build_table_entry(BuildTableEntry {
                table: "myTunnel_exact",
                matches: vec![("tunnel.dst_id", MatchValue::Exact(encode_be(tunnel_id.0 as u128, 32).unwrap_or_default()))],
                action: Some(action),
                action_params: params,
                priority: None,
                is_default: false,
            }) {
                Ok(entry) => {
                    self.upsert_or_record(&session, "myTunnel_exact", &entry, format!("{switch}:{action}"), &mut report)
                        .await
                }
                Err(e) => report.record_failure(format!("{switch}:{action}"), e),
            }
        }

        report
    }

    /// WL marking: color assignment + ingress-port-range WL/no-WL rule
    /// pair.
    pub async fn install_wl_marking(
        &mut self,
        session: &SwitchSession<C>,
        switch: &str,
        is_wl: bool,
        ingress_port_range: (u32, u32),
    ) -> BatchReport {
        let mut report = BatchReport::default();

        if is_wl {
            let next = self.color_index.len() as u32;
            let color = *self.color_index.entry(switch.to_string()).or_insert(next);

            match self.schema.build_table_entry(BuildTableEntry {
                table: "color_table",
                matches: vec![("meta.color", MatchValue::Exact(encode_be(color as u128, 8).unwrap_or_default()))],
                action: Some("set_color"),
                action_params: vec![("color", color as u128)],
                priority: None,
                is_default: false,
            }) {
                Ok(entry) => self.upsert_or_record(session, "color_table", &entry, "color", &mut report).await,
                Err(e) => report.record_failure("color", e),
            }

            match self.schema.build_table_entry(BuildTableEntry {
                table: "WL_table",
                matches: vec![(
                    "standard_metadata.ingress_port",
                    MatchValue::Range {
                        low: encode_be(ingress_port_range.0 as u128, 9).unwrap_or_default(),
                        high: encode_be(ingress_port_range.1 as u128, 9).unwrap_or_default(),
                    },
                )],
                action: Some("WL_action"),
                action_params: vec![],
                priority: Some(1),
                is_default: false,
            }) {
                Ok(entry) => self.upsert_or_record(session, "WL_table", &entry, "wl-range", &mut report).await,
                Err(e) => report.record_failure("wl-range", e),
            }
        } else {
            match self.schema.build_table_entry(BuildTableEntry {
                table: "WL_table",
                matches: vec![(
                    "standard_metadata.ingress_port",
                    MatchValue::Range {
                        low: encode_be(ingress_port_range.0 as u128, 9).unwrap_or_default(),
                        high: encode_be(ingress_port_range.1 as u128, 9).unwrap_or_default(),
                    },
                )],
                action: Some("no_WL_action"),
                action_params: vec![],
                priority: Some(1),
                is_default: false,
            }) {
                Ok(entry) => self.upsert_or_record(session, "WL_table", &entry, "no-wl-range", &mut report).await,
                Err(e) => report.record_failure("no-wl-range", e),
            }
        }

        report
    }

    /// Classifier entries on a WL switch, one per `(table, action,
    /// match_fields, action_params)` tuple from the plan. Table names
    /// starting with `level` use the `{node_id, prevFeature, isTrue}`
    /// match schema.
    pub async fn install_classifier_entries(
        &self,
        session: &SwitchSession<C>,
        entries: &[crate::plan::ClassifierEntry],
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for (i, e) in entries.iter().enumerate() {
            if !e.table.starts_with("level") {
                report.record_failure(format!("entry-{i}"), "table name does not start with `level`");
                continue;
            }
            if e.match_fields.len() != 3 {
                report.record_failure(format!("entry-{i}"), "expected 3 match fields (node_id, prevFeature, isTrue)");
                continue;
            }

            let (action, action_params): (&str, Vec<(&str, u128)>) = match e.action.as_str() {
                "CheckFeature" => (
                    "CheckFeature",
                    vec![
                        ("node_id", e.match_fields[0] as u128),
                        ("f_inout", e.action_params.first().copied().unwrap_or(0) as u128),
                        ("threshold", e.action_params.get(1).copied().unwrap_or(0) as u128),
                    ],
                ),
                "SetClass" => (
                    "SetClass",
                    vec![
                        ("node_id", e.match_fields[0] as u128),
                        ("class", e.action_params.first().copied().unwrap_or(0) as u128),
                    ],
                ),
                "NoAction" => ("NoAction", vec![]),
                other => {
                    report.record_failure(format!("entry-{i}"), format!("unknown classifier action `{other}`"));
                    continue;
                }
            };

            let built = self.schema.build_table_entry(BuildTableEntry {
                table: &e.table,
                matches: vec![
                    ("meta.node_id", MatchValue::Exact(encode_be(e.match_fields[0] as u128, 16).unwrap_or_default())),
                    ("meta.prevFeature", MatchValue::Exact(encode_be(e.match_fields[1] as u128, 16).unwrap_or_default())),
                    ("meta.isTrue", MatchValue::Exact(encode_be(e.match_fields[2] as u128, 1).unwrap_or_default())),
                ],
                action: Some(action),
                action_params,
                priority: None,
                is_default: false,
            });

            match built {
                Ok(entry) => self.upsert_or_record(session, &e.table, &entry, format!("entry-{i}"), &mut report).await,
                Err(e) => report.record_failure(format!("entry-{i}"), e),
            }
        }
        report
    }

    /// Reactive block: exact `tunnel.dst_id=T -> drop()` at the path's
    /// first switch.
    pub async fn install_block(
        &self,
        session: &SwitchSession<C>,
        tunnel_id: TunnelId,
    ) -> Result<UpdateKind, RuleError> {
        let entry = self.schema.build_table_entry(BuildTableEntry {
            table: "myTunnel_exact",
            matches: vec![("tunnel.dst_id", MatchValue::Exact(encode_be(tunnel_id.0 as u128, 32)?))],
            action: Some("drop"),
            action_params: vec![],
            priority: None,
            is_default: false,
        })?;
        self.upsert_entry(session, "myTunnel_exact", &entry).await
    }
}

fn mac_to_u128(mac: [u8; 6]) -> u128 {
    let mut acc: u128 = 0;
    for b in mac {
        acc = (acc << 8) | b as u128;
    }
    acc
}

/// Tunnel id: path encoded as base-10 concatenation of switch ids in
/// visit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelId(pub u64);

impl TunnelId {
    /// `tunnel_id([p0..pn]) = int(concat(p_i))`.
    pub fn from_path(path: &[u32]) -> Self {
        let digits: String = path.iter().map(|id| id.to_string()).collect();
        TunnelId(digits.parse().unwrap_or(0))
    }
}

/// Locate the path (and its ingress switch) whose encoded tunnel id equals
/// `tunnel_id`, for the reactive-block installer.
pub fn locate_ingress_switch(plan: &Plan, tunnel_id: TunnelId) -> Option<(String, Vec<String>)> {
    for route in plan.routes.values() {
        let path_ids: Vec<u32> = route.switch_path_ids();
        if TunnelId::from_path(&path_ids) == tunnel_id {
            return route.path.first().cloned().map(|first| (first, route.path.clone()));
        }
    }
    None
}

/// Program the single fabric-wide multicast group (id = 1) from the
/// spanning tree: the tree's "all ports" set is written to it directly.
pub fn fabric_multicast_entry(tree: &SpanningTree, topology: &Topology, switch: &str) -> MulticastEntry {
    let ports = tree.replica_ports(topology, switch);
    build_multicast_entry(
        1,
        ports
            .into_iter()
            .map(|port| MulticastReplica { port, instance: 1 })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_id_is_base_ten_concatenation() {
        assert_eq!(TunnelId::from_path(&[1, 3, 5]).0, 135);
        assert_eq!(TunnelId::from_path(&[3, 1, 2]).0, 312);
    }

    #[test]
    fn reverse_path_reverses_digit_concatenation() {
        let forward = TunnelId::from_path(&[1, 2, 3, 4]);
        let reverse = TunnelId::from_path(&[4, 3, 2, 1]);
        assert_eq!(forward.0, 1234);
        assert_eq!(reverse.0, 4321);
    }

    #[test]
    fn batch_report_tracks_partial_failure() {
        let mut report = BatchReport::default();
        report.record_success(UpdateKind::Insert);
        report.record_failure("bad-entry", "boom");
        assert_eq!(report.attempted, 2);
        assert!(!report.all_ok());
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Invariant 3: `tunnel_id(path)` is the base-10 concatenation of the
        /// path's switch ids, and is deterministic for a given path.
        #[test]
        fn tunnel_id_matches_digit_concatenation(path in prop::collection::vec(1u32..1000, 1..6)) {
            let expected: u64 = path
                .iter()
                .map(|id| id.to_string())
                .collect::<String>()
                .parse()
                .unwrap_or(0);
            prop_assert_eq!(TunnelId::from_path(&path).0, expected);
            prop_assert_eq!(TunnelId::from_path(&path).0, TunnelId::from_path(&path).0);
        }

        /// Reversing a path reverses the digit concatenation, so forward and
        /// reverse tunnels never collide except for palindromic paths.
        /// Single-digit ids keep "reverse the path" equivalent to "reverse
        /// the decimal string" (multi-digit ids would break that equivalence
        /// without affecting the underlying determinism invariant above).
        #[test]
        fn reversed_path_yields_reversed_digits(path in prop::collection::vec(1u32..10, 2..6)) {
            let mut reversed = path.clone();
            reversed.reverse();

            let forward_digits: String = path.iter().map(|id| id.to_string()).collect();
            let reverse_digits: String = forward_digits.chars().rev().collect();
            let expected_reverse: u64 = reverse_digits.parse().unwrap_or(0);

            prop_assert_eq!(TunnelId::from_path(&reversed).0, expected_reverse);
        }
    }
}
