//! Consistent-hash placement ring with virtual tokens.
//!
//! Each physical node contributes V tokens derived from
//! `hash("{id}#vnode{i}")`. A key is owned by the first token at or after
//! its hash, wrapping around; the preference list walks forward from
//! there collecting distinct nodes.
//!
//! The hash is the first 8 bytes (big-endian) of a SHA-1 digest. It is a
//! global constant of the system: every peer must use the same function
//! or token layouts will disagree.

use keel_common::PlacementView;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::RwLock;

/// A virtual token: one of V positions a physical node occupies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualToken {
    pub hash: u64,
    pub node_id: String,
    pub vnode_index: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("no nodes in ring")]
    NoNodes,
}

/// 64-bit ring position for arbitrary bytes.
pub fn ring_hash(data: &[u8]) -> u64 {
    let digest = Sha1::digest(data);
    u64::from_be_bytes(digest[0..8].try_into().expect("8-byte prefix"))
}

#[derive(Debug, Default)]
struct RingState {
    /// All tokens, sorted by hash. Stable sort keeps insertion order on
    /// equal hashes, so collisions resolve to the earlier-inserted token.
    tokens: Vec<VirtualToken>,
    /// node id -> that node's token hashes.
    node_tokens: HashMap<String, Vec<u64>>,
}

/// Consistent hash ring. Many readers, single writer.
#[derive(Debug)]
pub struct HashRing {
    state: RwLock<RingState>,
    virtual_count: u32,
}

impl HashRing {
    pub fn new(virtual_nodes: u32) -> Self {
        let virtual_count = if virtual_nodes < 1 { 150 } else { virtual_nodes };
        Self {
            state: RwLock::new(RingState::default()),
            virtual_count,
        }
    }

    /// Add a physical node with V virtual tokens. Adding a node that is
    /// already present is a no-op.
    pub fn add_node(&self, node_id: &str) {
        let mut state = self.state.write().expect("ring lock poisoned");
        if state.node_tokens.contains_key(node_id) {
            return;
        }

        let mut hashes = Vec::with_capacity(self.virtual_count as usize);
        for i in 0..self.virtual_count {
            let vnode_key = format!("{}#vnode{}", node_id, i);
            let h = ring_hash(vnode_key.as_bytes());
            state.tokens.push(VirtualToken {
                hash: h,
                node_id: node_id.to_string(),
                vnode_index: i,
            });
            hashes.push(h);
        }
        state.node_tokens.insert(node_id.to_string(), hashes);
        state.tokens.sort_by_key(|t| t.hash);
    }

    /// Remove a physical node and all its tokens. Removing an unknown
    /// node is a no-op.
    pub fn remove_node(&self, node_id: &str) {
        let mut state = self.state.write().expect("ring lock poisoned");
        if state.node_tokens.remove(node_id).is_none() {
            return;
        }
        state.tokens.retain(|t| t.node_id != node_id);
    }

    /// The node owning `key`.
    pub fn node_for(&self, key: &[u8]) -> Result<String, RingError> {
        let state = self.state.read().expect("ring lock poisoned");
        if state.tokens.is_empty() {
            return Err(RingError::NoNodes);
        }
        let h = ring_hash(key);
        let idx = Self::successor_index(&state.tokens, h);
        Ok(state.tokens[idx].node_id.clone())
    }

    /// Up to `n` distinct nodes for `key`, walking forward from the
    /// key's position. Shorter than `n` when the ring has fewer nodes.
    pub fn preference_list(&self, key: &[u8], n: usize) -> Result<Vec<String>, RingError> {
        let state = self.state.read().expect("ring lock poisoned");
        if state.tokens.is_empty() {
            return Err(RingError::NoNodes);
        }

        let h = ring_hash(key);
        let start = Self::successor_index(&state.tokens, h);

        let mut nodes = Vec::with_capacity(n);
        for i in 0..state.tokens.len() {
            if nodes.len() >= n {
                break;
            }
            let token = &state.tokens[(start + i) % state.tokens.len()];
            if !nodes.contains(&token.node_id) {
                nodes.push(token.node_id.clone());
            }
        }
        Ok(nodes)
    }

    /// All tokens, sorted by hash.
    pub fn tokens(&self) -> Vec<VirtualToken> {
        self.state
            .read()
            .expect("ring lock poisoned")
            .tokens
            .clone()
    }

    /// All physical node ids.
    pub fn all_nodes(&self) -> Vec<String> {
        self.state
            .read()
            .expect("ring lock poisoned")
            .node_tokens
            .keys()
            .cloned()
            .collect()
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.state
            .read()
            .expect("ring lock poisoned")
            .node_tokens
            .contains_key(node_id)
    }

    /// Number of physical nodes.
    pub fn len(&self) -> usize {
        self.state
            .read()
            .expect("ring lock poisoned")
            .node_tokens
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest token index with hash >= h, wrapping past the end.
    fn successor_index(tokens: &[VirtualToken], h: u64) -> usize {
        let idx = tokens.partition_point(|t| t.hash < h);
        if idx >= tokens.len() {
            0
        } else {
            idx
        }
    }
}

impl PlacementView for HashRing {
    fn preference_list(&self, key: &[u8], n: usize) -> Vec<String> {
        HashRing::preference_list(self, key, n).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::Rng;

    fn ring_with(nodes: &[&str], vnodes: u32) -> HashRing {
        let ring = HashRing::new(vnodes);
        for n in nodes {
            ring.add_node(n);
        }
        ring
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(ring_hash(b"hello"), ring_hash(b"hello"));
        assert_ne!(ring_hash(b"hello"), ring_hash(b"world"));
    }

    #[test]
    fn test_empty_ring_errors() {
        let ring = HashRing::new(16);
        assert!(matches!(ring.node_for(b"k"), Err(RingError::NoNodes)));
        assert!(matches!(
            ring.preference_list(b"k", 3),
            Err(RingError::NoNodes)
        ));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_single_node_owns_everything() {
        let ring = ring_with(&["only"], 16);
        for i in 0..100 {
            let key = format!("key-{}", i);
            assert_eq!(ring.node_for(key.as_bytes()).unwrap(), "only");
        }
    }

    #[test]
    fn test_token_count_per_node() {
        let ring = ring_with(&["a", "b"], 32);
        assert_eq!(ring.tokens().len(), 64);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let ring = ring_with(&["a"], 16);
        ring.add_node("a");
        assert_eq!(ring.tokens().len(), 16);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let ring = ring_with(&["a"], 16);
        ring.remove_node("never-added");
        assert_eq!(ring.tokens().len(), 16);
        assert!(ring.has_node("a"));
    }

    #[test]
    fn test_remove_node_drops_all_its_tokens() {
        let ring = ring_with(&["a", "b", "c"], 16);
        ring.remove_node("b");
        assert_eq!(ring.tokens().len(), 32);
        assert!(!ring.has_node("b"));
        assert!(ring.tokens().iter().all(|t| t.node_id != "b"));
    }

    #[test]
    fn test_tokens_sorted() {
        let ring = ring_with(&["a", "b", "c"], 64);
        let tokens = ring.tokens();
        for pair in tokens.windows(2) {
            assert!(pair[0].hash <= pair[1].hash);
        }
    }

    #[test]
    fn test_preference_list_distinct_and_bounded() {
        let ring = ring_with(&["a", "b", "c"], 32);

        let pref = ring.preference_list(b"some-key", 3).unwrap();
        assert_eq!(pref.len(), 3);
        let mut dedup = pref.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 3, "preference list must be distinct");

        // Asking for more nodes than exist yields a shorter list.
        let pref = ring.preference_list(b"some-key", 5).unwrap();
        assert_eq!(pref.len(), 3);
    }

    #[test]
    fn test_preference_list_starts_at_owner() {
        let ring = ring_with(&["a", "b", "c"], 32);
        for i in 0..50 {
            let key = format!("key-{}", i);
            let owner = ring.node_for(key.as_bytes()).unwrap();
            let pref = ring.preference_list(key.as_bytes(), 3).unwrap();
            assert_eq!(pref[0], owner);
        }
    }

    #[test]
    fn test_placement_independent_of_insertion_order() {
        let mut node_ids: Vec<String> = (0..8).map(|i| format!("node-{}", i)).collect();

        let ring_a = HashRing::new(32);
        for n in &node_ids {
            ring_a.add_node(n);
        }

        let mut rng = rand::thread_rng();
        node_ids.shuffle(&mut rng);
        let ring_b = HashRing::new(32);
        for n in &node_ids {
            ring_b.add_node(n);
        }

        for i in 0..500 {
            let key = format!("key-{}", i);
            assert_eq!(
                ring_a.preference_list(key.as_bytes(), 3).unwrap(),
                ring_b.preference_list(key.as_bytes(), 3).unwrap(),
                "preference list differs for {}",
                key
            );
        }
    }

    #[test]
    fn test_stability_on_node_join() {
        let ring = ring_with(&["n0", "n1", "n2", "n3", "n4"], 64);

        let keys: Vec<String> = (0..1000).map(|i| format!("key-{}", i)).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|k| ring.node_for(k.as_bytes()).unwrap())
            .collect();

        ring.add_node("n5");

        let moved = keys
            .iter()
            .zip(&before)
            .filter(|(k, prev)| ring.node_for(k.as_bytes()).unwrap() != **prev)
            .count();

        // Ideally ~1/6 of keys move to the new node; assert a loose bound.
        assert!(
            moved as f64 <= 0.5 * keys.len() as f64,
            "too many keys moved on join: {}/{}",
            moved,
            keys.len()
        );
        assert!(moved > 0, "a join should take over some keys");
    }

    #[test]
    fn test_distribution_roughly_balanced() {
        let ring = ring_with(&["a", "b", "c", "d"], 128);
        let mut counts: std::collections::HashMap<String, usize> = Default::default();
        let mut rng = rand::thread_rng();

        for _ in 0..4000 {
            let key: [u8; 16] = rng.gen();
            *counts.entry(ring.node_for(&key).unwrap()).or_default() += 1;
        }

        for (node, count) in &counts {
            assert!(
                *count > 400,
                "node {} owns suspiciously few keys: {}",
                node,
                count
            );
        }
    }

    #[test]
    fn test_removal_reassigns_to_survivors() {
        let ring = ring_with(&["a", "b", "c"], 64);
        ring.remove_node("a");

        for i in 0..200 {
            let key = format!("key-{}", i);
            let owner = ring.node_for(key.as_bytes()).unwrap();
            assert_ne!(owner, "a");
        }
    }

    #[test]
    fn test_placement_view_empty_ring() {
        let ring = HashRing::new(16);
        let view: &dyn PlacementView = &ring;
        assert!(view.preference_list(b"k", 3).is_empty());
    }
}
