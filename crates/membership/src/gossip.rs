//! Gossip dissemination over a connectionless UDP channel.
//!
//! Every `gossip_interval` the node sends its full membership digest to
//! one peer chosen uniformly at random; received datagrams count as a
//! heartbeat from the sender and are merged into the local table. Lost
//! datagrams are expected and never retransmitted at this layer.

use crate::detector::FailureDetector;
use crate::table::{MemberDigest, MembershipTable};
use keel_common::{unix_millis, Node};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::interval;

/// Single-datagram ceiling; larger messages are dropped by the sender.
pub const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

/// The gossip wire format, serialized as a single JSON datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    pub from_node: String,
    pub members: HashMap<String, MemberDigest>,
    pub timestamp: u64,
}

/// Hook invoked for members first learned through gossip.
pub type DiscoverFn = dyn Fn(&Node) + Send + Sync;

pub struct GossipProtocol {
    socket: Arc<UdpSocket>,
    table: Arc<MembershipTable>,
    detector: Arc<FailureDetector>,
    /// Bootstrap targets (`host:gossip_port`), used until peers are known.
    seeds: Vec<String>,
    on_discover: Option<Arc<DiscoverFn>>,
}

impl std::fmt::Debug for GossipProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipProtocol")
            .field("seeds", &self.seeds)
            .finish_non_exhaustive()
    }
}

impl GossipProtocol {
    /// Bind the UDP endpoint.
    pub async fn bind(
        addr: SocketAddr,
        table: Arc<MembershipTable>,
        detector: Arc<FailureDetector>,
        seeds: Vec<String>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!("gossip listening on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            table,
            detector,
            seeds,
            on_discover: None,
        })
    }

    /// Register the discovery hook. Runs outside the table lock.
    pub fn with_discover_hook(mut self, f: Arc<DiscoverFn>) -> Self {
        self.on_discover = Some(f);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn build_message(&self) -> GossipMessage {
        GossipMessage {
            from_node: self.table.self_id().to_string(),
            members: self.table.digest(),
            timestamp: unix_millis(),
        }
    }

    /// Encode a message, refusing anything that will not fit a datagram.
    fn encode_message(msg: &GossipMessage) -> Option<Vec<u8>> {
        let data = match serde_json::to_vec(msg) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("failed to serialize gossip message: {}", e);
                return None;
            }
        };
        if data.len() > MAX_DATAGRAM_BYTES {
            tracing::warn!(
                "gossip message of {} bytes exceeds datagram limit; dropping",
                data.len()
            );
            return None;
        }
        Some(data)
    }

    /// One outbound round: pick a target and send the digest.
    pub async fn gossip_once(&self) {
        let target = self.pick_target();
        let Some(target) = target else { return };

        let Some(data) = Self::encode_message(&self.build_message()) else {
            return;
        };

        match self.socket.send_to(&data, target.as_str()).await {
            Ok(_) => keel_metrics::metrics().gossip_sent.inc(),
            Err(e) => tracing::debug!("failed to send gossip to {}: {}", target, e),
        }
    }

    /// A random known peer's gossip address, or a random seed while no
    /// peers are known yet.
    fn pick_target(&self) -> Option<String> {
        use rand::seq::SliceRandom;

        let peers: Vec<String> = self
            .table
            .members()
            .into_iter()
            .filter(|m| m.node.id != self.table.self_id())
            .map(|m| m.node.gossip_addr())
            .collect();

        let mut rng = rand::thread_rng();
        if peers.is_empty() {
            self.seeds.choose(&mut rng).cloned()
        } else {
            peers.choose(&mut rng).cloned()
        }
    }

    /// Process one received datagram.
    fn handle_datagram(&self, data: &[u8]) {
        keel_metrics::metrics().gossip_received.inc();
        let msg: GossipMessage = match serde_json::from_slice(data) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("invalid gossip datagram: {}", e);
                return;
            }
        };

        self.detector.record_heartbeat(&msg.from_node);
        let outcome = self.table.merge(&msg.members);

        for node in &outcome.discovered {
            tracing::info!("discovered member {} at {} via gossip", node.id, node.gossip_addr());
            if let Some(cb) = &self.on_discover {
                cb(node);
            }
        }
        if outcome.refuted {
            tracing::info!(
                "refuted suspicion of self; incarnation now {}",
                self.table.local_incarnation()
            );
        }
        tracing::debug!(
            "gossip from {}: merged {} member(s)",
            msg.from_node,
            msg.members.len()
        );
    }

    /// Spawn the periodic sender.
    pub fn spawn_send_loop(
        self: Arc<Self>,
        gossip_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let proto = self;
        tokio::spawn(async move {
            let mut tick = interval(gossip_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => proto.gossip_once().await,
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("gossip send loop stopped");
        })
    }

    /// Spawn the datagram receiver.
    pub fn spawn_receive_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let proto = self;
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
            loop {
                tokio::select! {
                    result = proto.socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, _from)) => proto.handle_datagram(&buf[..len]),
                            Err(e) => {
                                tracing::warn!("gossip receive error: {}", e);
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("gossip receive loop stopped");
        })
    }
}
