//! keel-node: entry point for a keel cluster node.
//!
//! Loads config, opens the log store, builds the ring and membership,
//! wires the coordinator and hinted handoff, spawns the background loops,
//! then serves the HTTP endpoints until ctrl-c.

use keel_common::{MembershipView, Node, NodeState, PlacementView};
use keel_kv::{Coordinator, HandoffBuffer, QuorumConfig};
use keel_membership::detector::StateChangeFn;
use keel_membership::{FailureDetector, GossipProtocol, MembershipTable};
use keel_net::{ApiContext, HttpTransport};
use keel_ring::HashRing;
use keel_storage::LogStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    keel_metrics::init_tracing();

    // First CLI arg is the YAML config path.
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = keel_config::load_from_file(std::path::Path::new(&config_path)).unwrap_or_else(
        |e| {
            tracing::warn!(
                "failed to load config from {}: {}, using defaults",
                config_path,
                e
            );
            keel_config::load_from_str("node:\n  id: keel-node\n")
                .expect("hardcoded default config must parse")
        },
    );

    let self_node = Node::new(
        config.node.id.clone(),
        config.node.address.clone(),
        config.node.port,
        config.node.gossip_port,
    );
    tracing::info!(
        "node {} starting: rpc {}, gossip {}",
        self_node.id,
        self_node.rpc_addr(),
        self_node.gossip_addr()
    );
    tracing::info!(
        "replication: N={} R={} W={}, {} virtual node(s)",
        config.replication.replication_factor,
        config.replication.read_quorum,
        config.replication.write_quorum,
        config.replication.virtual_nodes
    );

    // Storage engine.
    let store = Arc::new(RwLock::new(LogStore::open(
        &config.storage.data_dir,
        config.storage.sync_writes,
    )?));
    {
        let s = store.read().await;
        tracing::info!("storage ready: {} key(s) loaded", s.key_count());
    }

    // Placement ring, seeded with self.
    let ring = Arc::new(HashRing::new(config.replication.virtual_nodes));
    ring.add_node(&config.node.id);

    // Membership: the detector's transitions drive ring membership.
    let table = Arc::new(MembershipTable::new(self_node));
    let ring_on_transition = ring.clone();
    let on_state_change: Arc<StateChangeFn> = Arc::new(move |node_id, old, new| {
        tracing::info!("node {}: {} -> {}", node_id, old, new);
        keel_metrics::metrics()
            .membership_transitions
            .with_label_values(&[&new.to_string()])
            .inc();
        match new {
            NodeState::Dead => ring_on_transition.remove_node(node_id),
            NodeState::Alive => ring_on_transition.add_node(node_id),
            NodeState::Suspect => {}
        }
    });
    let detector = Arc::new(
        FailureDetector::new(table.clone(), config.suspect_timeout(), config.dead_timeout())
            .with_state_change(on_state_change),
    );

    // Gossip endpoint; peers discovered alive join the ring immediately.
    let gossip_addr: SocketAddr =
        format!("{}:{}", config.node.address, config.node.gossip_port).parse()?;
    let ring_on_discovery = ring.clone();
    let gossip = Arc::new(
        GossipProtocol::bind(
            gossip_addr,
            table.clone(),
            detector.clone(),
            config.seeds.clone(),
        )
        .await?
        .with_discover_hook(Arc::new(move |node: &Node| {
            if node.state == NodeState::Alive {
                ring_on_discovery.add_node(&node.id);
            }
        })),
    );
    if !config.seeds.is_empty() {
        tracing::info!("gossiping to {} seed(s) at startup", config.seeds.len());
    }

    // Hinted handoff.
    let handoff = config.handoff.enabled.then(|| {
        Arc::new(HandoffBuffer::new(
            config.handoff.hint_max_size,
            config.hint_max_age(),
        ))
    });

    // Coordinator over the view traits.
    let transport = Arc::new(HttpTransport::new(
        config.node.id.clone(),
        config.request_timeout(),
    ));
    let placement: Arc<dyn PlacementView> = ring.clone();
    let membership: Arc<dyn MembershipView> = table.clone();
    let mut coordinator = Coordinator::new(
        config.node.id.clone(),
        store.clone(),
        placement,
        membership,
        transport.clone(),
        QuorumConfig {
            replication_factor: config.replication.replication_factor,
            read_quorum: config.replication.read_quorum,
            write_quorum: config.replication.write_quorum,
            request_timeout: config.request_timeout(),
            read_repair: config.replication.read_repair,
        },
    );
    if let Some(ref buffer) = handoff {
        coordinator = coordinator.with_handoff(buffer.clone());
    }
    let coordinator = Arc::new(coordinator);

    // Background loops, all joined on shutdown.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    tasks.push(detector.clone().spawn(shutdown_rx.clone()));
    tasks.push(
        gossip
            .clone()
            .spawn_send_loop(config.gossip_interval(), shutdown_rx.clone()),
    );
    tasks.push(gossip.clone().spawn_receive_loop(shutdown_rx.clone()));

    if let Some(ref buffer) = handoff {
        let view: Arc<dyn MembershipView> = table.clone();
        tasks.push(keel_kv::handoff::spawn_replay_loop(
            buffer.clone(),
            view,
            transport.clone(),
            config.handoff_interval(),
            shutdown_rx.clone(),
        ));
        tasks.push(keel_kv::handoff::spawn_sweep_loop(
            buffer.clone(),
            shutdown_rx.clone(),
        ));
    }

    if config.storage.compact_interval_secs > 0 {
        let store = store.clone();
        let mut rx = shutdown_rx.clone();
        let period = Duration::from_secs(config.storage.compact_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let mut s = store.write().await;
                        if let Err(e) = s.compact() {
                            tracing::warn!("compaction failed: {}", e);
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        }));
    }

    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
            .parse()
            .expect("valid metrics address");
        tokio::spawn(async move {
            if let Err(e) = keel_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    // HTTP endpoints (replication + client shim).
    let listener =
        TcpListener::bind(format!("{}:{}", config.node.address, config.node.port)).await?;
    let ctx = ApiContext {
        coordinator,
        store: store.clone(),
    };
    let server = tokio::spawn(keel_net::serve(ctx, listener, shutdown_rx.clone()));

    tracing::info!("node {} is ready", config.node.id);
    tokio::signal::ctrl_c().await?;
    tracing::info!("received ctrl-c, shutting down");

    shutdown_tx.send(true).ok();
    for task in tasks {
        let _ = task.await;
    }
    let _ = server.await;

    let mut s = store.write().await;
    if let Err(e) = s.close() {
        tracing::warn!("error closing store: {}", e);
    }
    tracing::info!("shutdown complete");
    Ok(())
}
