//! L2 learning from punted ARP frames. State lives inside the owning
//! switch's dispatcher task — no shared map across switches, so it is
//! lock-free by structure.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::rules::RuleEngine;
use crate::schema::{build_multicast_entry, MulticastReplica};
use crate::session::SwitchSession;
use crate::transport::DataplaneChannel;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

#[derive(Debug, Clone, Copy)]
pub struct PacketInFrame {
    pub ingress_port: u32,
    pub ether_type: u16,
    pub eth_src: [u8; 6],
    pub eth_dst: [u8; 6],
}

impl PacketInFrame {
    /// Parse a punted Ethernet frame and its packet-in metadata. Metadata
    /// id `1` carries the ingress port as a big-endian integer.
    pub fn from_wire(payload: &[u8], metadata: &[(u32, Vec<u8>)]) -> Option<Self> {
        if payload.len() < 14 {
            return None;
        }
        let mut eth_dst = [0u8; 6];
        let mut eth_src = [0u8; 6];
        eth_dst.copy_from_slice(&payload[0..6]);
        eth_src.copy_from_slice(&payload[6..12]);
        let ether_type = u16::from_be_bytes([payload[12], payload[13]]);

        let ingress_port = metadata
            .iter()
            .find(|(id, _)| *id == 1)
            .map(|(_, bytes)| bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))?;

        Some(PacketInFrame { ingress_port, ether_type, eth_src, eth_dst })
    }
}

/// Per-switch ARP learning state.
#[derive(Debug, Default)]
pub struct ArpLearner {
    /// `mac -> ingress-port`.
    port_map: BTreeMap<[u8; 6], u32>,
    /// `ingress-port -> src-mac -> [installed-dst-mac]`.
    arp_rules: BTreeMap<u32, BTreeMap<[u8; 6], BTreeSet<[u8; 6]>>>,
    /// Ports currently excluded from the flood multicast group, by the
    /// in-port they were excluded for.
    flood_exclusions: BTreeSet<u32>,
}

impl ArpLearner {
    pub fn new() -> Self {
        Self::default()
    }

    fn already_installed(&self, ingress_port: u32, src: [u8; 6], dst: [u8; 6]) -> bool {
        self.arp_rules
            .get(&ingress_port)
            .and_then(|m| m.get(&src))
            .is_some_and(|dsts| dsts.contains(&dst))
    }

    fn mark_installed(&mut self, ingress_port: u32, src: [u8; 6], dst: [u8; 6]) {
        self.arp_rules
            .entry(ingress_port)
            .or_default()
            .entry(src)
            .or_default()
            .insert(dst);
    }

    /// Handle one packet-in. `switch` is the name of the owning switch,
    /// used for the multicast group id (the fixed fabric-wide group, id = 1).
    pub async fn handle_packet_in<C: DataplaneChannel + 'static>(
        &mut self,
        rules: &RuleEngine<C>,
        session: &Arc<SwitchSession<C>>,
        frame: PacketInFrame,
        host_ip: impl Fn([u8; 6]) -> Option<std::net::Ipv4Addr>,
        tree_and_topology_ports: impl Fn() -> Vec<u32>,
    ) {
        if !matches!(frame.ether_type, ETHERTYPE_IPV4 | ETHERTYPE_ARP) {
            return;
        }

        // 1. Learn src-mac -> ingress-port if unseen.
        self.port_map.entry(frame.eth_src).or_insert(frame.ingress_port);

        if frame.eth_dst == BROADCAST_MAC {
            // 2. Broadcast: install flood rule once per (ingress_port, src_mac).
            if !self.already_installed(frame.ingress_port, frame.eth_src, BROADCAST_MAC) {
                if let Err(e) = rules
                    .install_arp_reply(session, frame.ingress_port, frame.eth_src, frame.eth_dst, None)
                    .await
                {
                    tracing::warn!(switch = %session.name, error = %e, "failed to install flood rule");
                } else {
                    self.mark_installed(frame.ingress_port, frame.eth_src, BROADCAST_MAC);
                }
            }

            self.flood_exclusions.insert(frame.ingress_port);
            let ports: Vec<u32> = tree_and_topology_ports()
                .into_iter()
                .filter(|p| *p != frame.ingress_port)
                .collect();
            let entry = build_multicast_entry(
                1,
                ports.into_iter().map(|port| MulticastReplica { port, instance: 1 }).collect(),
            );
            if let Err(e) = session
                .write_multicast_entry(crate::transport::UpdateKind::Modify, &entry)
                .await
            {
                tracing::warn!(switch = %session.name, error = %e, "failed to update multicast group");
            }

            let payload = build_arp_reply_payload(frame);
            let metadata = vec![];
            let packet_out = rules.schema.build_packet_out(payload, metadata);
            if let Err(e) = session.send_packet_out(&packet_out).await {
                tracing::warn!(switch = %session.name, error = %e, "failed to send packet-out");
            }
            return;
        }

        // 3. Known destination: direct reply rule + symmetric reverse rule,
        // plus matching ipv4_forward entries on each side.
        if let Some(&dst_port) = self.port_map.get(&frame.eth_dst) {
            if !self.already_installed(frame.ingress_port, frame.eth_src, frame.eth_dst) {
                if let Err(e) = rules
                    .install_arp_reply(session, frame.ingress_port, frame.eth_src, frame.eth_dst, Some(dst_port))
                    .await
                {
                    tracing::warn!(switch = %session.name, error = %e, "failed to install arp reply");
                } else {
                    self.mark_installed(frame.ingress_port, frame.eth_src, frame.eth_dst);
                }
            }

            if !self.already_installed(dst_port, frame.eth_dst, frame.eth_src) {
                if let Err(e) = rules
                    .install_arp_reply(session, dst_port, frame.eth_dst, frame.eth_src, Some(frame.ingress_port))
                    .await
                {
                    tracing::warn!(switch = %session.name, error = %e, "failed to install reverse arp reply");
                } else {
                    self.mark_installed(dst_port, frame.eth_dst, frame.eth_src);
                }
            }

            if let (Some(src_ip), Some(dst_ip)) = (host_ip(frame.eth_src), host_ip(frame.eth_dst)) {
                let _ = rules
                    .install_forwarding(session, &[(dst_ip, frame.eth_dst, dst_port)])
                    .await;
                let _ = rules
                    .install_forwarding(session, &[(src_ip, frame.eth_src, frame.ingress_port)])
                    .await;
            }
        }
    }
}

/// Build a minimal ARP-reply/flood packet-out payload. The exact on-wire
/// shape is device-defined; this only needs to be opaque bytes forwarded
/// through [`crate::schema::Schema::build_packet_out`].
fn build_arp_reply_payload(frame: PacketInFrame) -> Vec<u8> {
    let mut payload = Vec::with_capacity(14);
    payload.extend_from_slice(&frame.eth_dst);
    payload.extend_from_slice(&frame.eth_src);
    payload.extend_from_slice(&frame.ether_type.to_be_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_non_ipv4_non_arp_ethertypes() {
        let learner = ArpLearner::new();
        // Just exercise the ethertype gate directly; the full async path is
        // covered by the orchestrator-level integration test.
        assert!(!matches!(0x86dd, ETHERTYPE_IPV4 | ETHERTYPE_ARP));
        assert_eq!(learner.port_map.len(), 0);
    }

    #[test]
    fn tracks_one_installed_rule_per_in_port_src_dst_tuple() {
        let mut learner = ArpLearner::new();
        assert!(!learner.already_installed(1, [1; 6], BROADCAST_MAC));
        learner.mark_installed(1, [1; 6], BROADCAST_MAC);
        assert!(learner.already_installed(1, [1; 6], BROADCAST_MAC));
        assert!(!learner.already_installed(2, [1; 6], BROADCAST_MAC));
    }
}
