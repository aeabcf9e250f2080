//! Declared topology and the deterministic switch-only spanning tree.

use std::collections::{BTreeMap, VecDeque};

use serde::Deserialize;

use crate::error::ConsistencyWarning;

pub type SwitchId = String;
pub type HostId = String;
pub type Port = u32;

/// Host-marker prefix used to distinguish host nodes from switches in the
/// declared topology.
pub const HOST_PREFIX: &str = "h";

#[derive(Debug, Clone, Deserialize)]
pub struct TopologyDoc {
    pub hosts: Vec<HostDoc>,
    pub switches: Vec<String>,
    pub links: Vec<LinkDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostDoc {
    pub name: String,
    pub mac: String,
    pub ip: std::net::Ipv4Addr,
    /// Switch this host is attached to, and the local port on that switch.
    pub switch: String,
    pub port: Port,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkDoc {
    pub a: String,
    pub a_port: Port,
    pub b: String,
    pub b_port: Port,
}

#[derive(Debug, Clone, Copy)]
pub struct HostInfo {
    pub mac: [u8; 6],
    pub ip: std::net::Ipv4Addr,
}

/// Immutable, loaded-once topology with derived lookup maps.
#[derive(Debug, Clone)]
pub struct Topology {
    pub switches: Vec<SwitchId>,
    pub switch_neighbors: BTreeMap<SwitchId, BTreeMap<SwitchId, Port>>,
    pub host_ports: BTreeMap<SwitchId, Port>,
    pub hosts: BTreeMap<HostId, HostInfo>,
    pub host_switch: BTreeMap<HostId, SwitchId>,
    /// Declaration order of `doc.hosts`, used to resolve the 1-based
    /// numeric host references a plan upload uses.
    pub host_order: Vec<HostId>,
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = s.split(':');
    for slot in out.iter_mut() {
        let part = parts.next()?;
        *slot = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

impl Topology {
    /// Parse a declared topology, validating link symmetry: if A lists B on
    /// port p, B must list A on some port q — violations warn and continue
    /// rather than fail load.
    pub fn from_doc(doc: TopologyDoc) -> (Self, Vec<ConsistencyWarning>) {
        let mut switch_neighbors: BTreeMap<SwitchId, BTreeMap<SwitchId, Port>> = doc
            .switches
            .iter()
            .map(|s| (s.clone(), BTreeMap::new()))
            .collect();
        let mut warnings = Vec::new();

        for link in &doc.links {
            switch_neighbors
                .entry(link.a.clone())
                .or_default()
                .insert(link.b.clone(), link.a_port);
            switch_neighbors
                .entry(link.b.clone())
                .or_default()
                .insert(link.a.clone(), link.b_port);
        }

        // Validate symmetry: for every a->b port, b must list a on some port.
        let snapshot = switch_neighbors.clone();
        for (a, neighbors) in &snapshot {
            for b in neighbors.keys() {
                if !snapshot.get(b).is_some_and(|n| n.contains_key(a)) {
                    warnings.push(ConsistencyWarning::MissingReversePort {
                        a: a.clone(),
                        a_port: neighbors[b],
                        b: b.clone(),
                    });
                }
            }
        }

        let mut host_ports = BTreeMap::new();
        let mut hosts = BTreeMap::new();
        let mut host_switch = BTreeMap::new();
        let mut host_order = Vec::new();

        for host in doc.hosts {
            let mac = parse_mac(&host.mac).unwrap_or([0; 6]);
            host_ports.insert(host.switch.clone(), host.port);
            host_switch.insert(host.name.clone(), host.switch);
            host_order.push(host.name.clone());
            hosts.insert(host.name, HostInfo { mac, ip: host.ip });
        }

        let switches = doc.switches;

        (
            Topology {
                switches,
                switch_neighbors,
                host_ports,
                hosts,
                host_switch,
                host_order,
            },
            warnings,
        )
    }

    /// Resolve a route endpoint: either the host's declared name, or its
    /// 1-based position in the topology document's host list (the
    /// convention an uploaded plan's `routes` keys use).
    pub fn resolve_host(&self, host_ref: &str) -> Option<HostId> {
        if let Ok(idx) = host_ref.parse::<usize>() {
            if let Some(name) = idx.checked_sub(1).and_then(|i| self.host_order.get(i)) {
                return Some(name.clone());
            }
        }
        self.hosts.contains_key(host_ref).then(|| host_ref.to_string())
    }

    pub fn host_port(&self, switch: &str) -> Option<Port> {
        self.host_ports.get(switch).copied()
    }

    pub fn switch_port(&self, from: &str, to: &str) -> Option<Port> {
        self.switch_neighbors.get(from)?.get(to).copied()
    }

    /// Reverse lookup used by ARP learning to resolve a learned MAC back to
    /// its declared host IP, matching the `ipv4_forward` entries installed
    /// on each side.
    pub fn host_ip_by_mac(&self, mac: [u8; 6]) -> Option<std::net::Ipv4Addr> {
        self.hosts.values().find(|h| h.mac == mac).map(|h| h.ip)
    }

    /// Ports observed for `switch` across declared links and its host
    /// attachment, used to size the weak-learner ingress-port range.
    pub fn port_range(&self, switch: &str) -> (Port, Port) {
        let mut ports: Vec<Port> = self
            .switch_neighbors
            .get(switch)
            .map(|n| n.values().copied().collect())
            .unwrap_or_default();
        if let Some(host_port) = self.host_port(switch) {
            ports.push(host_port);
        }
        let max = ports.into_iter().max().unwrap_or(0);
        (0, max)
    }
}

/// Switch-only BFS spanning tree. Representation is
/// symmetric: `tree[a][b]` is defined iff `tree[b][a]` is.
#[derive(Debug, Clone, Default)]
pub struct SpanningTree {
    pub edges: BTreeMap<SwitchId, BTreeMap<SwitchId, Port>>,
    pub root: Option<SwitchId>,
}

impl SpanningTree {
    /// Build the deterministic BFS tree: root = lexicographically smallest
    /// switch, sorted-order frontier expansion, skip edges missing a
    /// reverse port, warn on unreached switches.
    pub fn build(topology: &Topology) -> (Self, Vec<ConsistencyWarning>) {
        let mut warnings = Vec::new();
        let mut edges: BTreeMap<SwitchId, BTreeMap<SwitchId, Port>> = BTreeMap::new();

        let Some(root) = topology.switches.iter().min().cloned() else {
            return (SpanningTree::default(), warnings);
        };

        let mut visited: std::collections::BTreeSet<SwitchId> = std::collections::BTreeSet::new();
        visited.insert(root.clone());

        let mut queue: VecDeque<(SwitchId, SwitchId, Port)> = VecDeque::new();
        if let Some(neighbors) = topology.switch_neighbors.get(&root) {
            for (child, port) in neighbors {
                queue.push_back((root.clone(), child.clone(), *port));
            }
        }

        while let Some((parent, child, port)) = queue.pop_front() {
            if visited.contains(&child) {
                continue;
            }

            let Some(reverse_port) = topology.switch_port(&child, &parent) else {
                warnings.push(ConsistencyWarning::MissingReversePort {
                    a: parent.clone(),
                    a_port: port,
                    b: child.clone(),
                });
                continue;
            };

            edges.entry(parent.clone()).or_default().insert(child.clone(), port);
            edges.entry(child.clone()).or_default().insert(parent.clone(), reverse_port);
            visited.insert(child.clone());

            if let Some(neighbors) = topology.switch_neighbors.get(&child) {
                for (grandchild, next_port) in neighbors {
                    if !visited.contains(grandchild) {
                        queue.push_back((child.clone(), grandchild.clone(), *next_port));
                    }
                }
            }
        }

        for switch in &topology.switches {
            if !visited.contains(switch) {
                warnings.push(ConsistencyWarning::UnreachableSwitch(switch.clone()));
            }
        }

        (SpanningTree { edges, root: Some(root) }, warnings)
    }

    /// Per-switch multicast replica set: the tree output doubles as the
    /// multicast replica set, `{tree(s).values} ∪ {host_port(s)}`.
    pub fn replica_ports(&self, topology: &Topology, switch: &str) -> Vec<Port> {
        let mut ports: Vec<Port> = self
            .edges
            .get(switch)
            .map(|m| m.values().copied().collect())
            .unwrap_or_default();

        if let Some(host_port) = topology.host_port(switch) {
            ports.push(host_port);
        }

        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> Topology {
        // s1 - s2 - s3
        //  \         /
        //   \_______s4
        // s5 connected only to s1.
        let doc = TopologyDoc {
            hosts: vec![],
            switches: vec!["s1", "s2", "s3", "s4", "s5"]
                .into_iter()
                .map(String::from)
                .collect(),
            links: vec![
                LinkDoc { a: "s1".into(), a_port: 1, b: "s2".into(), b_port: 1 },
                LinkDoc { a: "s2".into(), a_port: 2, b: "s3".into(), b_port: 1 },
                LinkDoc { a: "s3".into(), a_port: 2, b: "s4".into(), b_port: 1 },
                LinkDoc { a: "s1".into(), a_port: 2, b: "s4".into(), b_port: 2 },
                LinkDoc { a: "s1".into(), a_port: 3, b: "s5".into(), b_port: 1 },
            ],
        };
        Topology::from_doc(doc).0
    }

    #[test]
    fn tree_is_symmetric_and_connected() {
        let topo = fixture();
        let (tree, warnings) = SpanningTree::build(&topo);
        assert!(warnings.is_empty());
        assert_eq!(tree.root.as_deref(), Some("s1"));

        for (a, neighbors) in &tree.edges {
            for b in neighbors.keys() {
                assert!(
                    tree.edges.get(b).is_some_and(|n| n.contains_key(a)),
                    "tree not symmetric for {a}-{b}"
                );
            }
        }

        // Every switch is spanned exactly once.
        let reached: std::collections::BTreeSet<_> = tree.edges.keys().cloned().collect();
        assert_eq!(reached.len(), topo.switches.len());
    }

    #[test]
    fn recorded_ports_match_declared_direction() {
        let topo = fixture();
        let (tree, _) = SpanningTree::build(&topo);
        for (a, neighbors) in &tree.edges {
            for (b, port) in neighbors {
                assert_eq!(topo.switch_port(a, b), Some(*port));
            }
        }
    }

    #[test]
    fn missing_reverse_port_warns_and_is_skipped() {
        let doc = TopologyDoc {
            hosts: vec![],
            switches: vec!["s1".into(), "s2".into()],
            links: vec![],
        };
        let (mut topo, _) = Topology::from_doc(doc);
        // Inject a one-directional edge directly, bypassing symmetric insert.
        topo.switch_neighbors
            .get_mut("s1")
            .unwrap()
            .insert("s2".into(), 7);

        let (tree, warnings) = SpanningTree::build(&topo);
        assert!(tree.edges.get("s1").map(|n| n.is_empty()).unwrap_or(true));
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConsistencyWarning::MissingReversePort { .. })));
    }

    #[test]
    fn multicast_replicas_dedup_tree_and_host_ports() {
        let doc = TopologyDoc {
            hosts: vec![HostDoc {
                name: "h1".into(),
                mac: "aa:bb:cc:dd:ee:ff".into(),
                ip: "10.0.1.1".parse().unwrap(),
                switch: "s1".into(),
                port: 3,
            }],
            switches: vec!["s1".into(), "s2".into()],
            links: vec![LinkDoc {
                a: "s1".into(),
                a_port: 1,
                b: "s2".into(),
                b_port: 1,
            }],
        };
        let (topo, _) = Topology::from_doc(doc);
        let (tree, _) = SpanningTree::build(&topo);
        assert_eq!(tree.replica_ports(&topo, "s1"), vec![1, 3]);
    }

    #[test]
    fn resolve_host_prefers_numeric_declaration_order() {
        let doc = TopologyDoc {
            hosts: vec![
                HostDoc {
                    name: "h4".into(),
                    mac: "aa:aa:aa:aa:aa:01".into(),
                    ip: "10.0.0.4".parse().unwrap(),
                    switch: "s1".into(),
                    port: 3,
                },
                HostDoc {
                    name: "h1".into(),
                    mac: "aa:aa:aa:aa:aa:02".into(),
                    ip: "10.0.0.1".parse().unwrap(),
                    switch: "s2".into(),
                    port: 3,
                },
            ],
            switches: vec!["s1".into(), "s2".into()],
            links: vec![],
        };
        let (topo, _) = Topology::from_doc(doc);

        // "1" is the first declared host (named "h4"), not the host named "h1".
        assert_eq!(topo.resolve_host("1").as_deref(), Some("h4"));
        assert_eq!(topo.resolve_host("2").as_deref(), Some("h1"));
        // A declared name still resolves directly.
        assert_eq!(topo.resolve_host("h1").as_deref(), Some("h1"));
        // Out of range, and unknown names, resolve to nothing.
        assert_eq!(topo.resolve_host("3"), None);
        assert_eq!(topo.resolve_host("h9"), None);
    }
}

#[cfg(test)]
mod proptests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;

    /// A random connected switch graph: a spanning tree of `n` switches
    /// (each new switch linked to an earlier one) plus extra cross edges,
    /// so every generated topology satisfies invariant 2's precondition
    /// ("declared topology is connected") by construction.
    fn connected_topology(n: usize) -> impl Strategy<Value = Topology> {
        let switches: Vec<String> = (0..n).map(|i| format!("s{i}")).collect();
        let parents = prop::collection::vec(0..n.max(1), n.saturating_sub(1));
        let extra_edges = prop::collection::vec((0..n.max(1), 0..n.max(1), 1u32..50), 0..n);

        (parents, extra_edges).prop_map(move |(parents, extra)| {
            let mut links = Vec::new();
            let mut port_counter = 1u32;
            for (child_idx, parent_idx) in parents.into_iter().enumerate() {
                let child = child_idx + 1;
                let parent = parent_idx % child; // always an earlier switch
                links.push(LinkDoc {
                    a: switches[parent].clone(),
                    a_port: port_counter,
                    b: switches[child].clone(),
                    b_port: port_counter + 1,
                });
                port_counter += 2;
            }
            for (a_idx, b_idx, _) in extra {
                if a_idx == b_idx || a_idx >= n || b_idx >= n {
                    continue;
                }
                links.push(LinkDoc {
                    a: switches[a_idx].clone(),
                    a_port: port_counter,
                    b: switches[b_idx].clone(),
                    b_port: port_counter + 1,
                });
                port_counter += 2;
            }

            let doc = TopologyDoc {
                hosts: vec![],
                switches: switches.clone(),
                links,
            };
            Topology::from_doc(doc).0
        })
    }

    proptest! {
        /// Invariants 1-2: the built tree is symmetric and spans every
        /// declared switch when the declared graph is connected.
        #[test]
        fn spanning_tree_is_symmetric_and_spans_every_switch(topo in (2usize..8).prop_flat_map(connected_topology)) {
            let (tree, warnings) = SpanningTree::build(&topo);
            prop_assert!(warnings.is_empty());

            for (a, neighbors) in &tree.edges {
                for b in neighbors.keys() {
                    prop_assert!(tree.edges.get(b).is_some_and(|n| n.contains_key(a)));
                }
            }

            let reached: BTreeSet<_> = tree.edges.keys().cloned().collect();
            prop_assert_eq!(reached.len(), topo.switches.len());
        }

        /// Building the tree twice from the same topology yields the same
        /// edges.
        #[test]
        fn spanning_tree_build_is_deterministic(topo in (1usize..8).prop_flat_map(connected_topology)) {
            let (first, _) = SpanningTree::build(&topo);
            let (second, _) = SpanningTree::build(&topo);
            prop_assert_eq!(first.edges, second.edges);
            prop_assert_eq!(first.root, second.root);
        }
    }
}
