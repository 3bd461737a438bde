//! Failure detector: periodic sweep of the membership table plus the
//! heartbeat entry point used by the gossip receive path.

use crate::table::MembershipTable;
use keel_common::NodeState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

/// Fired on every state transition as `(node_id, old, new)`.
pub type StateChangeFn = dyn Fn(&str, NodeState, NodeState) + Send + Sync;

const DETECTION_INTERVAL: Duration = Duration::from_secs(1);

pub struct FailureDetector {
    table: Arc<MembershipTable>,
    suspect_timeout: Duration,
    dead_timeout: Duration,
    on_change: Option<Arc<StateChangeFn>>,
}

impl std::fmt::Debug for FailureDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureDetector")
            .field("suspect_timeout", &self.suspect_timeout)
            .field("dead_timeout", &self.dead_timeout)
            .finish_non_exhaustive()
    }
}

impl FailureDetector {
    pub fn new(
        table: Arc<MembershipTable>,
        suspect_timeout: Duration,
        dead_timeout: Duration,
    ) -> Self {
        Self {
            table,
            suspect_timeout,
            dead_timeout,
            on_change: None,
        }
    }

    /// Register the state-change callback. Must be set before the loops
    /// start; the callback runs outside the table lock.
    pub fn with_state_change(mut self, f: Arc<StateChangeFn>) -> Self {
        self.on_change = Some(f);
        self
    }

    /// Record a direct heartbeat; revives suspect or dead peers.
    pub fn record_heartbeat(&self, node_id: &str) {
        if let Some((old, new)) = self.table.record_heartbeat(node_id) {
            tracing::info!("node {} revived: {} -> {}", node_id, old, new);
            if let Some(cb) = &self.on_change {
                cb(node_id, old, new);
            }
        }
    }

    /// One detection sweep over the table.
    pub fn check_members(&self) {
        let transitions = self.table.check(
            self.suspect_timeout.as_millis() as u64,
            self.dead_timeout.as_millis() as u64,
        );
        for (node_id, old, new) in transitions {
            match new {
                NodeState::Suspect => {
                    tracing::warn!("node {} marked suspect (no heartbeat)", node_id)
                }
                NodeState::Dead => tracing::warn!("node {} marked dead (no heartbeat)", node_id),
                NodeState::Alive => {}
            }
            if let Some(cb) = &self.on_change {
                cb(&node_id, old, new);
            }
        }
    }

    pub fn node_state(&self, node_id: &str) -> Option<NodeState> {
        self.table.member_info(node_id).map(|m| m.node.state)
    }

    /// Spawn the periodic detection loop. The loop drains on shutdown.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let detector = self;
        tokio::spawn(async move {
            let mut tick = interval(DETECTION_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => detector.check_members(),
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("failure detector stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_common::Node;
    use std::sync::Mutex;

    fn setup(suspect_ms: u64, dead_ms: u64) -> (Arc<MembershipTable>, FailureDetector) {
        let table = Arc::new(MembershipTable::new(Node::new(
            "me",
            "127.0.0.1",
            8080,
            7946,
        )));
        let detector = FailureDetector::new(
            table.clone(),
            Duration::from_millis(suspect_ms),
            Duration::from_millis(dead_ms),
        );
        (table, detector)
    }

    #[test]
    fn test_lifecycle_alive_suspect_dead() {
        let (table, detector) = setup(1, 1);
        table.insert(Node::new("peer", "127.0.0.1", 8081, 7947));

        std::thread::sleep(Duration::from_millis(10));
        detector.check_members();
        assert_eq!(detector.node_state("peer"), Some(NodeState::Suspect));

        detector.check_members();
        assert_eq!(detector.node_state("peer"), Some(NodeState::Dead));

        // Dead stays dead across further sweeps.
        detector.check_members();
        assert_eq!(detector.node_state("peer"), Some(NodeState::Dead));
    }

    #[test]
    fn test_heartbeat_prevents_suspicion() {
        let (table, detector) = setup(50, 100);
        table.insert(Node::new("peer", "127.0.0.1", 8081, 7947));

        detector.record_heartbeat("peer");
        detector.check_members();
        assert_eq!(detector.node_state("peer"), Some(NodeState::Alive));
    }

    #[test]
    fn test_revival_from_dead() {
        let (table, detector) = setup(1, 1);
        table.insert(Node::new("peer", "127.0.0.1", 8081, 7947));
        std::thread::sleep(Duration::from_millis(10));
        detector.check_members();
        detector.check_members();
        assert_eq!(detector.node_state("peer"), Some(NodeState::Dead));

        detector.record_heartbeat("peer");
        assert_eq!(detector.node_state("peer"), Some(NodeState::Alive));
    }

    #[test]
    fn test_callback_sees_every_transition() {
        let transitions: Arc<Mutex<Vec<(String, NodeState, NodeState)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = transitions.clone();

        let (table, detector) = setup(1, 1);
        let detector = detector.with_state_change(Arc::new(move |id, old, new| {
            sink.lock().unwrap().push((id.to_string(), old, new));
        }));
        table.insert(Node::new("peer", "127.0.0.1", 8081, 7947));

        std::thread::sleep(Duration::from_millis(10));
        detector.check_members();
        detector.check_members();
        detector.record_heartbeat("peer");

        let seen = transitions.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("peer".to_string(), NodeState::Alive, NodeState::Suspect),
                ("peer".to_string(), NodeState::Suspect, NodeState::Dead),
                ("peer".to_string(), NodeState::Dead, NodeState::Alive),
            ]
        );
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let (_table, detector) = setup(1000, 2000);
        let detector = Arc::new(detector);
        let (tx, rx) = watch::channel(false);

        let handle = detector.spawn(rx);
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
