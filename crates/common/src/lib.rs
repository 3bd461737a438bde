//! keel-common: shared types for the keel key-value store.
//!
//! Provides the cluster [`Node`] descriptor, the durable [`Record`] unit,
//! consistency levels, and the read-only view traits that break the
//! dependency cycles between the coordinator, the placement ring, and
//! the membership subsystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Health state of a cluster node as seen by the local failure detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Alive => write!(f, "alive"),
            NodeState::Suspect => write!(f, "suspect"),
            NodeState::Dead => write!(f, "dead"),
        }
    }
}

/// A peer in the cluster. The `id` is stable for the lifetime of a process
/// and globally unique across the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// Host or IP, without a port.
    pub address: String,
    /// Replication RPC (HTTP) port.
    pub port: u16,
    /// Gossip UDP port.
    pub gossip_port: u16,
    pub state: NodeState,
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        gossip_port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            gossip_port,
            state: NodeState::Alive,
        }
    }

    /// `host:port` for the replication RPC endpoint.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// `host:port` for the gossip datagram endpoint.
    pub fn gossip_addr(&self) -> String {
        format!("{}:{}", self.address, self.gossip_port)
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// The smallest durable unit: an opaque key/value pair with the timestamp
/// used as the total-order tiebreaker across replicas. A tombstone is a
/// record with `is_deleted = true` and an empty value; it participates in
/// ordering exactly like a live record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: i64,
    pub is_deleted: bool,
}

impl Record {
    pub fn new(key: Vec<u8>, value: Vec<u8>, timestamp: i64) -> Self {
        Self {
            key,
            value,
            timestamp,
            is_deleted: false,
        }
    }

    pub fn tombstone(key: Vec<u8>, timestamp: i64) -> Self {
        Self {
            key,
            value: Vec::new(),
            timestamp,
            is_deleted: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Consistency
// ---------------------------------------------------------------------------

/// Per-request consistency level; resolved against the configured
/// replication factor N and the R/W quorums by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    One,
    Quorum,
    All,
}

impl ConsistencyLevel {
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "one" => Self::One,
            "all" => Self::All,
            _ => Self::Quorum,
        }
    }
}

// ---------------------------------------------------------------------------
// View traits
// ---------------------------------------------------------------------------

/// Read-only view of the placement ring.
///
/// Returns the ordered preference list for a key: up to `n` distinct node
/// ids. An empty list means no nodes are known (bootstrap, or every peer
/// removed); callers surface that as a placement error.
pub trait PlacementView: Send + Sync {
    fn preference_list(&self, key: &[u8], n: usize) -> Vec<String>;
}

/// Read-only view of cluster membership, for state queries and address
/// lookup during replica dispatch.
pub trait MembershipView: Send + Sync {
    /// Full descriptor for a node, with its current state.
    fn member(&self, node_id: &str) -> Option<Node>;

    fn is_alive(&self, node_id: &str) -> bool {
        matches!(
            self.member(node_id).map(|n| n.state),
            Some(NodeState::Alive)
        )
    }
}

// ---------------------------------------------------------------------------
// Clock helpers
// ---------------------------------------------------------------------------

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Nanoseconds since the Unix epoch; the write-path timestamp source.
pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_display() {
        assert_eq!(NodeState::Alive.to_string(), "alive");
        assert_eq!(NodeState::Suspect.to_string(), "suspect");
        assert_eq!(NodeState::Dead.to_string(), "dead");
    }

    #[test]
    fn test_node_state_serde_lowercase() {
        let json = serde_json::to_string(&NodeState::Suspect).unwrap();
        assert_eq!(json, "\"suspect\"");
        let back: NodeState = serde_json::from_str("\"dead\"").unwrap();
        assert_eq!(back, NodeState::Dead);
    }

    #[test]
    fn test_node_addresses() {
        let node = Node::new("n1", "10.0.0.7", 8080, 7946);
        assert_eq!(node.rpc_addr(), "10.0.0.7:8080");
        assert_eq!(node.gossip_addr(), "10.0.0.7:7946");
        assert_eq!(node.state, NodeState::Alive);
    }

    #[test]
    fn test_record_constructors() {
        let rec = Record::new(b"k".to_vec(), b"v".to_vec(), 42);
        assert!(!rec.is_deleted);
        assert_eq!(rec.timestamp, 42);

        let tomb = Record::tombstone(b"k".to_vec(), 43);
        assert!(tomb.is_deleted);
        assert!(tomb.value.is_empty());
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let rec = Record::new(vec![0x00, 0xff, 0x7f], b"value".to_vec(), 123_456_789);
        let json = serde_json::to_string(&rec).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(rec, back);
    }

    #[test]
    fn test_consistency_from_str() {
        assert_eq!(
            ConsistencyLevel::from_str_config("one"),
            ConsistencyLevel::One
        );
        assert_eq!(
            ConsistencyLevel::from_str_config("ALL"),
            ConsistencyLevel::All
        );
        assert_eq!(
            ConsistencyLevel::from_str_config("anything-else"),
            ConsistencyLevel::Quorum
        );
    }

    #[test]
    fn test_unix_clocks_advance() {
        let a = unix_nanos();
        let b = unix_nanos();
        assert!(b >= a);
        assert!(unix_millis() > 0);
    }
}
