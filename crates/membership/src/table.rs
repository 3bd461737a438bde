//! The membership table: everything this node believes about its peers.

use keel_common::{unix_millis, MembershipView, Node, NodeState};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::RwLock;

/// Metadata tracked per cluster member.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub node: Node,
    /// Wall-clock milliseconds of the freshest evidence this peer was up.
    pub last_seen_ms: u64,
    /// Incarnation number; used to prefer fresher facts over stale ones.
    pub incarnation: u64,
}

/// The projection of a member carried inside gossip datagrams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDigest {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub gossip_port: u16,
    pub state: NodeState,
    pub last_seen: u64,
}

/// Result of merging a received membership map.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Members this node had never heard of.
    pub discovered: Vec<Node>,
    /// True when the message claimed this node was suspect or dead and
    /// the local incarnation was bumped to refute it.
    pub refuted: bool,
}

#[derive(Debug)]
struct TableState {
    members: HashMap<String, MemberInfo>,
    local_incarnation: u64,
}

/// Map of node id to member info. The self entry is always present,
/// always alive, and never ages out.
#[derive(Debug)]
pub struct MembershipTable {
    self_id: String,
    state: RwLock<TableState>,
}

impl MembershipTable {
    pub fn new(self_node: Node) -> Self {
        let self_id = self_node.id.clone();
        let mut members = HashMap::new();
        members.insert(
            self_id.clone(),
            MemberInfo {
                node: self_node,
                last_seen_ms: unix_millis(),
                incarnation: 1,
            },
        );
        Self {
            self_id,
            state: RwLock::new(TableState {
                members,
                local_incarnation: 1,
            }),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn local_incarnation(&self) -> u64 {
        self.state
            .read()
            .expect("membership lock poisoned")
            .local_incarnation
    }

    /// Register a peer directly (seed configuration, tests). Returns
    /// false if the peer was already known.
    pub fn insert(&self, node: Node) -> bool {
        let mut state = self.state.write().expect("membership lock poisoned");
        if state.members.contains_key(&node.id) {
            return false;
        }
        state.members.insert(
            node.id.clone(),
            MemberInfo {
                node,
                last_seen_ms: unix_millis(),
                incarnation: 1,
            },
        );
        true
    }

    /// Administrative removal. The self entry cannot be removed.
    pub fn remove(&self, node_id: &str) {
        if node_id == self.self_id {
            return;
        }
        let mut state = self.state.write().expect("membership lock poisoned");
        state.members.remove(node_id);
    }

    pub fn member_info(&self, node_id: &str) -> Option<MemberInfo> {
        self.state
            .read()
            .expect("membership lock poisoned")
            .members
            .get(node_id)
            .cloned()
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.state
            .read()
            .expect("membership lock poisoned")
            .members
            .values()
            .cloned()
            .collect()
    }

    pub fn alive_members(&self) -> Vec<MemberInfo> {
        self.state
            .read()
            .expect("membership lock poisoned")
            .members
            .values()
            .filter(|m| m.node.state == NodeState::Alive)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .expect("membership lock poisoned")
            .members
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a direct heartbeat from `node_id`: freshen `last_seen` and
    /// revive the peer if it was suspect or dead. Returns the transition
    /// when the state changed.
    pub fn record_heartbeat(&self, node_id: &str) -> Option<(NodeState, NodeState)> {
        let mut state = self.state.write().expect("membership lock poisoned");
        let member = state.members.get_mut(node_id)?;
        member.last_seen_ms = unix_millis();
        if member.node.state != NodeState::Alive {
            let old = member.node.state;
            member.node.state = NodeState::Alive;
            member.incarnation += 1;
            return Some((old, NodeState::Alive));
        }
        None
    }

    /// One failure-detection sweep: transition peers whose heartbeat
    /// silence exceeds the thresholds. Self is skipped. Returns the
    /// transitions that occurred.
    pub fn check(
        &self,
        suspect_timeout_ms: u64,
        dead_timeout_ms: u64,
    ) -> Vec<(String, NodeState, NodeState)> {
        let now = unix_millis();
        let mut transitions = Vec::new();
        let mut state = self.state.write().expect("membership lock poisoned");

        for (id, member) in state.members.iter_mut() {
            if *id == self.self_id {
                continue;
            }
            let elapsed = now.saturating_sub(member.last_seen_ms);
            match member.node.state {
                NodeState::Alive if elapsed > suspect_timeout_ms => {
                    member.node.state = NodeState::Suspect;
                    transitions.push((id.clone(), NodeState::Alive, NodeState::Suspect));
                }
                NodeState::Suspect if elapsed > dead_timeout_ms => {
                    member.node.state = NodeState::Dead;
                    transitions.push((id.clone(), NodeState::Suspect, NodeState::Dead));
                }
                // Dead peers stay dead until a heartbeat revives them.
                _ => {}
            }
        }
        transitions
    }

    /// Merge a received membership map. Unknown ids are inserted with the
    /// supplied state; known ids advance `last_seen` and address only when
    /// the digest is fresher. A worse state never overwrites a better one.
    /// A digest claiming *this* node is suspect or dead is refuted by
    /// bumping the local incarnation.
    pub fn merge(&self, digests: &HashMap<String, MemberDigest>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut state = self.state.write().expect("membership lock poisoned");

        for (id, digest) in digests {
            if *id == self.self_id {
                if digest.state != NodeState::Alive {
                    state.local_incarnation += 1;
                    let inc = state.local_incarnation;
                    if let Some(me) = state.members.get_mut(&self.self_id) {
                        me.incarnation = inc;
                        me.node.state = NodeState::Alive;
                        me.last_seen_ms = unix_millis();
                    }
                    outcome.refuted = true;
                }
                continue;
            }

            match state.members.entry(id.clone()) {
                Entry::Vacant(slot) => {
                    let node = Node {
                        id: digest.id.clone(),
                        address: digest.address.clone(),
                        port: digest.port,
                        gossip_port: digest.gossip_port,
                        state: digest.state,
                    };
                    slot.insert(MemberInfo {
                        node: node.clone(),
                        last_seen_ms: digest.last_seen,
                        incarnation: 1,
                    });
                    outcome.discovered.push(node);
                }
                Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    if digest.last_seen > existing.last_seen_ms {
                        existing.last_seen_ms = digest.last_seen;
                        existing.node.address = digest.address.clone();
                        existing.node.port = digest.port;
                        existing.node.gossip_port = digest.gossip_port;
                    }
                }
            }
        }
        outcome
    }

    /// Project the table into the digest map carried by gossip.
    pub fn digest(&self) -> HashMap<String, MemberDigest> {
        let state = self.state.read().expect("membership lock poisoned");
        state
            .members
            .iter()
            .map(|(id, m)| {
                (
                    id.clone(),
                    MemberDigest {
                        id: id.clone(),
                        address: m.node.address.clone(),
                        port: m.node.port,
                        gossip_port: m.node.gossip_port,
                        state: m.node.state,
                        last_seen: m.last_seen_ms,
                    },
                )
            })
            .collect()
    }
}

impl MembershipView for MembershipTable {
    fn member(&self, node_id: &str) -> Option<Node> {
        self.member_info(node_id).map(|m| m.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> Node {
        Node::new(id, "127.0.0.1", 8080, 7946)
    }

    fn digest_of(n: &Node, state: NodeState, last_seen: u64) -> MemberDigest {
        MemberDigest {
            id: n.id.clone(),
            address: n.address.clone(),
            port: n.port,
            gossip_port: n.gossip_port,
            state,
            last_seen,
        }
    }

    #[test]
    fn test_self_always_present() {
        let table = MembershipTable::new(node("me"));
        assert_eq!(table.len(), 1);
        let me = table.member_info("me").unwrap();
        assert_eq!(me.node.state, NodeState::Alive);
        assert_eq!(table.self_id(), "me");
    }

    #[test]
    fn test_insert_and_remove() {
        let table = MembershipTable::new(node("me"));
        assert!(table.insert(node("peer")));
        assert!(!table.insert(node("peer")));
        assert_eq!(table.len(), 2);

        table.remove("peer");
        assert_eq!(table.len(), 1);

        table.remove("me");
        assert_eq!(table.len(), 1, "self entry must survive removal");
    }

    #[test]
    fn test_heartbeat_revives() {
        let table = MembershipTable::new(node("me"));
        table.insert(node("peer"));

        // Force the peer to dead via the detector sweep.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t1 = table.check(1, 1_000_000);
        assert_eq!(t1, vec![("peer".into(), NodeState::Alive, NodeState::Suspect)]);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t2 = table.check(1, 1);
        assert_eq!(t2, vec![("peer".into(), NodeState::Suspect, NodeState::Dead)]);

        let transition = table.record_heartbeat("peer").unwrap();
        assert_eq!(transition, (NodeState::Dead, NodeState::Alive));
        assert_eq!(
            table.member_info("peer").unwrap().node.state,
            NodeState::Alive
        );
    }

    #[test]
    fn test_heartbeat_from_alive_is_quiet() {
        let table = MembershipTable::new(node("me"));
        table.insert(node("peer"));
        assert!(table.record_heartbeat("peer").is_none());
        assert!(table.record_heartbeat("unknown").is_none());
    }

    #[test]
    fn test_check_skips_self() {
        let table = MembershipTable::new(node("me"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(table.check(1, 1).is_empty());
        assert_eq!(
            table.member_info("me").unwrap().node.state,
            NodeState::Alive
        );
    }

    #[test]
    fn test_dead_needs_two_sweeps() {
        // alive -> dead always passes through suspect, even when the
        // silence already exceeds the dead threshold.
        let table = MembershipTable::new(node("me"));
        table.insert(node("peer"));
        std::thread::sleep(std::time::Duration::from_millis(10));

        let first = table.check(1, 1);
        assert_eq!(first[0].2, NodeState::Suspect);
        let second = table.check(1, 1);
        assert_eq!(second[0].2, NodeState::Dead);
    }

    #[test]
    fn test_merge_discovers_unknown_members() {
        let table = MembershipTable::new(node("me"));
        let peer = node("peer");
        let mut digests = HashMap::new();
        digests.insert(
            "peer".to_string(),
            digest_of(&peer, NodeState::Alive, unix_millis()),
        );

        let outcome = table.merge(&digests);
        assert_eq!(outcome.discovered.len(), 1);
        assert_eq!(outcome.discovered[0].id, "peer");
        assert!(!outcome.refuted);
        assert!(table.member_info("peer").is_some());
    }

    #[test]
    fn test_merge_fresher_advances_stale_ignored() {
        let table = MembershipTable::new(node("me"));
        table.insert(node("peer"));
        let known = table.member_info("peer").unwrap();

        // Stale digest: older last_seen, different address. Ignored.
        let mut stale_peer = node("peer");
        stale_peer.address = "10.9.9.9".into();
        let mut digests = HashMap::new();
        digests.insert(
            "peer".to_string(),
            digest_of(&stale_peer, NodeState::Alive, known.last_seen_ms.saturating_sub(10_000)),
        );
        table.merge(&digests);
        assert_eq!(table.member_info("peer").unwrap().node.address, "127.0.0.1");

        // Fresher digest advances last_seen and address.
        let mut fresh_peer = node("peer");
        fresh_peer.address = "10.1.2.3".into();
        digests.insert(
            "peer".to_string(),
            digest_of(&fresh_peer, NodeState::Alive, known.last_seen_ms + 10_000),
        );
        table.merge(&digests);
        let updated = table.member_info("peer").unwrap();
        assert_eq!(updated.node.address, "10.1.2.3");
        assert_eq!(updated.last_seen_ms, known.last_seen_ms + 10_000);
    }

    #[test]
    fn test_merge_never_downgrades_state() {
        let table = MembershipTable::new(node("me"));
        table.insert(node("peer"));

        let mut digests = HashMap::new();
        digests.insert(
            "peer".to_string(),
            digest_of(&node("peer"), NodeState::Dead, unix_millis() + 60_000),
        );
        table.merge(&digests);
        assert_eq!(
            table.member_info("peer").unwrap().node.state,
            NodeState::Alive,
            "gossip must not kill a locally-alive peer"
        );
    }

    #[test]
    fn test_merge_refutes_suspicion_of_self() {
        let table = MembershipTable::new(node("me"));
        assert_eq!(table.local_incarnation(), 1);

        let mut digests = HashMap::new();
        digests.insert(
            "me".to_string(),
            digest_of(&node("me"), NodeState::Suspect, unix_millis()),
        );
        let outcome = table.merge(&digests);
        assert!(outcome.refuted);
        assert_eq!(table.local_incarnation(), 2);
        assert_eq!(
            table.member_info("me").unwrap().node.state,
            NodeState::Alive
        );
    }

    #[test]
    fn test_digest_projection() {
        let table = MembershipTable::new(node("me"));
        table.insert(node("peer"));

        let digest = table.digest();
        assert_eq!(digest.len(), 2);
        let me = &digest["me"];
        assert_eq!(me.state, NodeState::Alive);
        assert_eq!(me.gossip_port, 7946);
        assert!(me.last_seen > 0);
    }

    #[test]
    fn test_membership_view() {
        let table = MembershipTable::new(node("me"));
        table.insert(node("peer"));

        let view: &dyn MembershipView = &table;
        assert!(view.is_alive("peer"));
        assert!(!view.is_alive("stranger"));
        assert_eq!(view.member("peer").unwrap().rpc_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_alive_members_filter() {
        let table = MembershipTable::new(node("me"));
        table.insert(node("peer"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        table.check(1, 1_000_000);

        let alive: Vec<String> = table
            .alive_members()
            .into_iter()
            .map(|m| m.node.id)
            .collect();
        assert_eq!(alive, vec!["me".to_string()]);
    }
}
