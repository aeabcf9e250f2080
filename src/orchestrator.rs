//! Six-step startup sequence and lifetime owner of sessions, tree, and plan:
//! load topology, connect + arbitrate every switch, push pipeline +
//! subscribe digests, build the tree and program the fabric multicast
//! group, start per-switch receive loops, then serve configuration
//! uploads.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use backoff::ExponentialBackoffBuilder;
use tokio::sync::{mpsc, watch, Mutex};

use crate::arp::{ArpLearner, PacketInFrame};
use crate::config::Cli;
use crate::digest::DigestProcessor;
use crate::plan::{Plan, RawUploadPayload};
use crate::rules::{fabric_multicast_entry, RuleEngine};
use crate::schema::Schema;
use crate::session::{InboundQueue, SwitchSession};
use crate::topology::{SpanningTree, Topology, TopologyDoc};
use crate::transport::{FramedTcpChannel, InboundMessage, UpdateKind};

const DIGEST_NAME: &str = "congestion_digest_t";
const RECONNECT_MAX_ELAPSED: Duration = Duration::from_secs(30);

/// Derive the fixed `(device_id, address)` pair for a switch name:
/// `s{i+1} -> 127.0.0.1:{50050+i+1}`.
fn switch_endpoint(name: &str) -> Option<(u64, SocketAddr)> {
    let n: u64 = name.trim_start_matches('s').parse().ok()?;
    let addr = format!("127.0.0.1:{}", 50050 + n).parse().ok()?;
    Some((n, addr))
}

async fn connect_with_backoff(name: &str, addr: SocketAddr) -> anyhow::Result<FramedTcpChannel> {
    let policy = ExponentialBackoffBuilder::default()
        .with_max_elapsed_time(Some(RECONNECT_MAX_ELAPSED))
        .build();

    backoff::future::retry(policy, || async {
        FramedTcpChannel::connect(addr).await.map_err(|e| {
            tracing::debug!(switch = %name, %addr, error = %e, "connect failed, retrying");
            backoff::Error::transient(e)
        })
    })
    .await
    .map_err(|e| anyhow::anyhow!("failed to connect to {name} at {addr}: {e}"))
}

pub struct Orchestrator {
    pub schema: Arc<Schema>,
    pub topology: Arc<Topology>,
    pub tree: Arc<SpanningTree>,
    sessions: HashMap<String, Arc<SwitchSession<FramedTcpChannel>>>,
    rules: Mutex<RuleEngine<FramedTcpChannel>>,
    plan: ArcSwap<Plan>,
    report_tx: mpsc::Sender<crate::report::ReportRow>,
    shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
    /// Steps 1-4 of the startup sequence: load topology, connect every
    /// switch session, push the pipeline + subscribe digests, build the
    /// tree and program the fabric-wide multicast group.
    pub async fn bootstrap(cli: &Cli) -> anyhow::Result<Arc<Self>> {
        let topology_doc: TopologyDoc = serde_json::from_slice(&tokio::fs::read(&cli.topology).await?)?;
        let (topology, warnings) = Topology::from_doc(topology_doc);
        for w in &warnings {
            tracing::warn!(%w, "topology consistency warning");
        }

        let schema_doc = serde_json::from_slice(&tokio::fs::read(&cli.schema).await?)?;
        let schema = Arc::new(Schema::from_doc(schema_doc));

        let schema_blob = tokio::fs::read(&cli.schema).await?;
        let device_config_blob = tokio::fs::read(&cli.device_config).await?;

        let mut sessions = HashMap::new();
        for switch in &topology.switches {
            let Some((device_id, addr)) = switch_endpoint(switch) else {
                tracing::warn!(switch, "switch name does not match the `s<N>` convention, skipping");
                continue;
            };

            let channel = connect_with_backoff(switch, addr).await?;
            let (session, queue) = SwitchSession::new(switch.clone(), device_id, schema.clone(), channel);
            session.open().await?;
            crate::metrics::publish_session_state(switch, true);
            session
                .push_pipeline(schema_blob.clone(), device_config_blob.clone())
                .await?;

            if let Ok(entry) = schema.build_digest_entry(DIGEST_NAME) {
                if let Err(e) = session.write_digest_entry(UpdateKind::Insert, &entry).await {
                    tracing::warn!(switch, error = %e, "failed to subscribe to digest");
                }
            } else {
                tracing::warn!(switch, digest = DIGEST_NAME, "digest not present in schema, skipping subscription");
            }

            let session = Arc::new(session);
            sessions.insert(switch.clone(), (session, queue));
        }

        let (tree, warnings) = SpanningTree::build(&topology);
        for w in &warnings {
            tracing::warn!(%w, "spanning-tree consistency warning");
        }

        for (switch, (session, _queue)) in &sessions {
            let entry = fabric_multicast_entry(&tree, &topology, switch);
            if let Err(e) = session.write_multicast_entry(UpdateKind::Insert, &entry).await {
                tracing::warn!(switch, error = %e, "failed to program fabric multicast group");
            }
        }

        crate::metrics::publish_topology_shape(
            topology.switches.len(),
            topology.switch_neighbors.values().map(|n| n.len()).sum(),
            topology.switch_neighbors.values().map(|n| n.len()).sum::<usize>() / 2,
            topology.host_ports.len(),
        );

        let report_tx = crate::report::spawn_report_writer(cli.report_path.clone());
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        let topology = Arc::new(topology);
        let tree = Arc::new(tree);

        let mut queues = HashMap::new();
        let mut session_map = HashMap::new();
        for (name, (session, queue)) in sessions {
            queues.insert(name.clone(), queue);
            session_map.insert(name, session);
        }

        let orchestrator = Arc::new(Orchestrator {
            schema: schema.clone(),
            topology: topology.clone(),
            tree: tree.clone(),
            sessions: session_map,
            rules: Mutex::new(RuleEngine::new(schema)),
            plan: ArcSwap::from_pointee(Plan::default()),
            report_tx,
            shutdown_tx,
        });

        // Step 5: start the per-switch receive loops.
        orchestrator.clone().spawn_receive_loops(queues);

        Ok(orchestrator)
    }

    /// Step 5: one reader task + one dispatcher task per switch.
    fn spawn_receive_loops(self: Arc<Self>, queues: HashMap<String, InboundQueue>) {
        for (name, session) in &self.sessions {
            let session = session.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let reader_name = name.clone();
            tokio::spawn(async move {
                session.run_reader(&mut shutdown_rx).await;
                crate::metrics::publish_session_state(&reader_name, false);
                tracing::info!(switch = %reader_name, "reader task exited");
            });
        }

        for (name, mut queue) in queues {
            let this = self.clone();
            tokio::spawn(async move {
                let mut arp_learner = ArpLearner::new();
                let mut digest_processor = DigestProcessor::<FramedTcpChannel>::new(name.clone(), this.report_tx.clone());

                loop {
                    let Some(received) = queue.next_inbound(Duration::from_secs(2)).await else {
                        if *this.shutdown_tx.borrow() {
                            return;
                        }
                        continue;
                    };

                    this.dispatch_inbound(&name, &mut arp_learner, &mut digest_processor, received).await;
                }
            });
        }
    }

    async fn dispatch_inbound(
        &self,
        switch: &str,
        arp_learner: &mut ArpLearner,
        digest_processor: &mut DigestProcessor<FramedTcpChannel>,
        received: crate::session::ReceivedMessage,
    ) {
        let Some(session) = self.sessions.get(switch) else {
            return;
        };

        match received.message {
            InboundMessage::PacketIn { payload, metadata } => {
                let Some(frame) = PacketInFrame::from_wire(&payload, &metadata) else {
                    return;
                };
                let rules = self.rules.lock().await;
                let topology_for_host_ip = self.topology.clone();
                let topology_for_ports = self.topology.clone();
                let tree = self.tree.clone();
                let switch_owned = switch.to_string();
                arp_learner
                    .handle_packet_in(
                        &rules,
                        session,
                        frame,
                        move |mac| topology_for_host_ip.host_ip_by_mac(mac),
                        move || tree.replica_ports(&topology_for_ports, &switch_owned),
                    )
                    .await;
            }
            InboundMessage::DigestList { digest_id: _, data } => {
                let plan = self.plan.load_full();
                let mut rules = self.rules.lock().await;
                for raw in data {
                    let now = Instant::now();
                    if let Err(e) = digest_processor
                        .handle_digest(
                            &mut rules,
                            |name| self.sessions.get(name).cloned(),
                            &plan,
                            &raw,
                            received.received_at,
                            now,
                        )
                        .await
                    {
                        tracing::warn!(switch, error = %e, "digest referenced an unknown tunnel id");
                    }
                }
            }
        }
    }

    /// Invoked by the configuration-upload HTTP boundary: normalize the
    /// payload, program tunnel paths, weak-learner marking, and classifier
    /// entries, then swap in the new plan atomically.
    pub async fn apply_plan(&self, raw: RawUploadPayload) -> anyhow::Result<()> {
        let plan = Plan::from_raw(raw);
        let mut rules = self.rules.lock().await;

        for (route, reverse_path) in plan.directional_tunnels() {
            let Some(dst_host) = self
                .topology
                .resolve_host(&route.dst_host)
                .and_then(|name| self.topology.hosts.get(&name).copied())
            else {
                tracing::warn!(dst = %route.dst_host, "unknown destination host, skipping tunnel");
                continue;
            };
            let Some(src_host) = self
                .topology
                .resolve_host(&route.src_host)
                .and_then(|name| self.topology.hosts.get(&name).copied())
            else {
                tracing::warn!(src = %route.src_host, "unknown source host, skipping reverse tunnel");
                continue;
            };

            let forward_ids = route.switch_path_ids();
            let forward_tunnel = crate::rules::TunnelId::from_path(&forward_ids);
            let report = rules
                .install_tunnel_path(
                    |name| self.sessions.get(name).cloned(),
                    &route.path,
                    forward_tunnel,
                    dst_host.ip,
                    |a, b| self.topology.switch_port(a, b),
                    |s| self.topology.host_port(s),
                    dst_host.mac,
                )
                .await;
            if !report.all_ok() {
                tracing::warn!(tunnel_id = forward_tunnel.0, failed = report.failed.len(), "tunnel install had partial failures");
            }

            let reverse_ids: Vec<u32> = reverse_path.iter().filter_map(|s| s.trim_start_matches('s').parse().ok()).collect();
            let reverse_tunnel = crate::rules::TunnelId::from_path(&reverse_ids);
            let report = rules
                .install_tunnel_path(
                    |name| self.sessions.get(name).cloned(),
                    &reverse_path,
                    reverse_tunnel,
                    src_host.ip,
                    |a, b| self.topology.switch_port(a, b),
                    |s| self.topology.host_port(s),
                    src_host.mac,
                )
                .await;
            if !report.all_ok() {
                tracing::warn!(tunnel_id = reverse_tunnel.0, failed = report.failed.len(), "reverse tunnel install had partial failures");
            }
        }

        for (switch, session) in &self.sessions {
            let Some(node_id) = switch.trim_start_matches('s').parse::<u32>().ok() else {
                continue;
            };
            let is_wl = plan.wl_nodes.contains(&node_id);
            let range = self.topology.port_range(switch);
            let report = rules.install_wl_marking(session, switch, is_wl, range).await;
            if !report.all_ok() {
                tracing::warn!(switch, is_wl, "weak-learner marking had partial failures");
            }
        }

        for (switch, entries) in &plan.classifier_entries {
            if let Some(session) = self.sessions.get(switch) {
                let report = rules.install_classifier_entries(session, entries).await;
                if !report.all_ok() {
                    tracing::warn!(switch, failed = report.failed.len(), "classifier install had partial failures");
                }
            } else {
                tracing::warn!(switch, "classifier entries reference unknown switch");
            }
        }

        crate::metrics::publish_plan_shape(
            plan.routes.len(),
            plan.wl_nodes.len(),
            plan.classifier_entries.values().map(|v| v.len()).sum(),
        );

        self.plan.store(Arc::new(plan));
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
