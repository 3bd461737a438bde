//! Hinted handoff: per-target queues of writes that missed a replica,
//! replayed when the target comes back alive.
//!
//! The buffer prefers recent hints over old ones: a full queue evicts its
//! oldest entry, and an age sweep drops hints past `max_age`. Lost hints
//! are acceptable; read repair will eventually converge the replica.

use crate::transport::ReplicationTransport;
use keel_common::{unix_millis, MembershipView, Record};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

/// A hint is discarded after this many failed delivery attempts.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 10;

/// Per-RPC deadline during replay.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Period of the expiry sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A deferred write destined for a specific target node. Carries the
/// full record: delivery must preserve the original timestamp so the
/// merge at the target still respects last-writer-wins.
#[derive(Debug, Clone)]
pub struct Hint {
    pub target_node_id: String,
    pub record: Record,
    pub created_at_ms: u64,
    pub attempts: u32,
}

/// In-memory buffer of per-target FIFO hint queues.
#[derive(Debug)]
pub struct HandoffBuffer {
    queues: Mutex<HashMap<String, VecDeque<Hint>>>,
    max_size: usize,
    max_age: Duration,
}

impl HandoffBuffer {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            max_size,
            max_age,
        }
    }

    /// Queue a record for later delivery to `target`. A full queue
    /// evicts its oldest hint first.
    pub fn store(&self, target: &str, record: Record) {
        let mut queues = self.queues.lock().expect("handoff lock poisoned");
        let queue = queues.entry(target.to_string()).or_default();

        if queue.len() >= self.max_size {
            queue.pop_front();
            keel_metrics::metrics().hints_dropped.inc();
        }
        queue.push_back(Hint {
            target_node_id: target.to_string(),
            record,
            created_at_ms: unix_millis(),
            attempts: 0,
        });
        keel_metrics::metrics().hints_stored.inc();
        tracing::debug!("stored hint for node {}", target);
    }

    /// All targets with pending hints.
    pub fn targets(&self) -> Vec<String> {
        self.queues
            .lock()
            .expect("handoff lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Copy of the queue for `target`, in delivery order.
    pub fn hints_for(&self, target: &str) -> Vec<Hint> {
        self.queues
            .lock()
            .expect("handoff lock poisoned")
            .get(target)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retire the hint for `(target, key)` after successful delivery.
    pub fn remove(&self, target: &str, key: &[u8]) {
        let mut queues = self.queues.lock().expect("handoff lock poisoned");
        if let Some(queue) = queues.get_mut(target) {
            queue.retain(|h| h.record.key != key);
            if queue.is_empty() {
                queues.remove(target);
            }
        }
    }

    /// Bump the attempt counter for `(target, key)`. Returns the new
    /// count, or zero when the hint is gone.
    pub fn increment_attempts(&self, target: &str, key: &[u8]) -> u32 {
        let mut queues = self.queues.lock().expect("handoff lock poisoned");
        if let Some(queue) = queues.get_mut(target) {
            for hint in queue.iter_mut() {
                if hint.record.key == key {
                    hint.attempts += 1;
                    return hint.attempts;
                }
            }
        }
        0
    }

    /// Total pending hints across all targets.
    pub fn count(&self) -> usize {
        self.queues
            .lock()
            .expect("handoff lock poisoned")
            .values()
            .map(VecDeque::len)
            .sum()
    }

    /// Drop hints older than `max_age`. Returns the number dropped.
    pub fn purge_expired(&self) -> usize {
        let now = unix_millis();
        let max_age_ms = self.max_age.as_millis() as u64;
        let mut dropped = 0;

        let mut queues = self.queues.lock().expect("handoff lock poisoned");
        queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|h| now.saturating_sub(h.created_at_ms) <= max_age_ms);
            dropped += before - queue.len();
            !queue.is_empty()
        });

        if dropped > 0 {
            keel_metrics::metrics().hints_dropped.inc_by(dropped as u64);
            tracing::info!("expired {} hint(s)", dropped);
        }
        dropped
    }
}

/// One replay cycle: deliver pending hints to every target currently
/// alive in the membership view.
pub async fn replay_once<T: ReplicationTransport>(
    buffer: &HandoffBuffer,
    membership: &Arc<dyn MembershipView>,
    transport: &Arc<T>,
) {
    for target_id in buffer.targets() {
        if !membership.is_alive(&target_id) {
            tracing::debug!("hint target {} not alive, skipping", target_id);
            continue;
        }
        let Some(target) = membership.member(&target_id) else {
            continue;
        };

        for hint in buffer.hints_for(&target_id) {
            let delivery = tokio::time::timeout(
                DELIVERY_TIMEOUT,
                transport.replicate(&target, &hint.record, true),
            )
            .await;

            match delivery {
                Ok(Ok(())) => {
                    buffer.remove(&target_id, &hint.record.key);
                    keel_metrics::metrics().hints_delivered.inc();
                    tracing::debug!("delivered hint to node {}", target_id);
                }
                Ok(Err(e)) => {
                    let attempts = buffer.increment_attempts(&target_id, &hint.record.key);
                    if attempts > MAX_DELIVERY_ATTEMPTS {
                        buffer.remove(&target_id, &hint.record.key);
                        keel_metrics::metrics().hints_dropped.inc();
                        tracing::warn!(
                            "giving up on hint to node {} after {} attempts: {}",
                            target_id,
                            attempts,
                            e
                        );
                    } else {
                        tracing::debug!("hint delivery to {} failed: {}", target_id, e);
                    }
                    // Leave the rest of this target's queue for the next cycle.
                    break;
                }
                Err(_) => {
                    let attempts = buffer.increment_attempts(&target_id, &hint.record.key);
                    if attempts > MAX_DELIVERY_ATTEMPTS {
                        buffer.remove(&target_id, &hint.record.key);
                        keel_metrics::metrics().hints_dropped.inc();
                        tracing::warn!(
                            "giving up on hint to node {} after {} timeouts",
                            target_id,
                            attempts
                        );
                    }
                    break;
                }
            }
        }
    }
}

/// Spawn the periodic replay loop.
pub fn spawn_replay_loop<T: ReplicationTransport>(
    buffer: Arc<HandoffBuffer>,
    membership: Arc<dyn MembershipView>,
    transport: Arc<T>,
    replay_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(replay_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => replay_once(&buffer, &membership, &transport).await,
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("handoff replay loop stopped");
    })
}

/// Spawn the periodic expiry sweep.
pub fn spawn_sweep_loop(
    buffer: Arc<HandoffBuffer>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => { buffer.purge_expired(); }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("handoff sweep loop stopped");
    })
}
