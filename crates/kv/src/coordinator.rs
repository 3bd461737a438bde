//! The coordinator: routes a client operation to the key's preference
//! list, performs the parallel local and remote I/O, counts acks against
//! the quorum, picks the freshest value, and triggers read repair.
//!
//! Writes return as soon as the required acks arrive; dispatches still in
//! flight keep running, and any that fail deposit a hint for their target.
//! Replica errors never reach the client — they are counted as missing
//! acks and the operation either succeeds or fails as a whole.

use crate::handoff::HandoffBuffer;
use crate::transport::ReplicationTransport;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use keel_common::{unix_nanos, ConsistencyLevel, MembershipView, PlacementView, Record};
use keel_storage::{LogStore, StorageError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Quorum and replication configuration.
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    /// Replication factor (N): length of the preference list.
    pub replication_factor: usize,
    /// Required read responses under `quorum` consistency.
    pub read_quorum: usize,
    /// Required write acks under `quorum` consistency.
    pub write_quorum: usize,
    /// Deadline for the whole operation.
    pub request_timeout: Duration,
    /// Whether reads asynchronously repair stale replicas.
    pub read_repair: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("no nodes available for placement")]
    RingEmpty,
    #[error("quorum not reached: need {needed}, got {got}")]
    QuorumFailed { needed: usize, got: usize },
    #[error("key not found")]
    NotFound,
}

/// What one replica said during a read.
#[derive(Debug, Clone)]
enum ReadOutcome {
    Found(Record),
    /// The replica answered but has no live version (absent or tombstoned).
    Absent,
    /// No usable answer: RPC error, storage error, or unknown address.
    Failed,
}

/// Distributed KV coordinator.
///
/// Generic over `T: ReplicationTransport` for testability — deployment
/// uses the HTTP transport in `keel-net`; unit tests use mocks. The ring
/// and membership are injected behind their read-only view traits.
pub struct Coordinator<T: ReplicationTransport> {
    local_id: String,
    store: Arc<RwLock<LogStore>>,
    placement: Arc<dyn PlacementView>,
    membership: Arc<dyn MembershipView>,
    transport: Arc<T>,
    handoff: Option<Arc<HandoffBuffer>>,
    config: QuorumConfig,
}

impl<T: ReplicationTransport> std::fmt::Debug for Coordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("local_id", &self.local_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: ReplicationTransport> Coordinator<T> {
    pub fn new(
        local_id: impl Into<String>,
        store: Arc<RwLock<LogStore>>,
        placement: Arc<dyn PlacementView>,
        membership: Arc<dyn MembershipView>,
        transport: Arc<T>,
        config: QuorumConfig,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            store,
            placement,
            membership,
            transport,
            handoff: None,
            config,
        }
    }

    /// Attach the hinted-handoff buffer.
    pub fn with_handoff(mut self, buffer: Arc<HandoffBuffer>) -> Self {
        self.handoff = Some(buffer);
        self
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    // -----------------------------------------------------------------------
    // PUT / DELETE
    // -----------------------------------------------------------------------

    /// Store a value, stamped with the coordinator's wall clock, and wait
    /// for the required number of replica acks.
    pub async fn put(
        &self,
        key: &[u8],
        value: Vec<u8>,
        level: ConsistencyLevel,
    ) -> Result<(), KvError> {
        keel_metrics::metrics().kv_puts.inc();
        let _timer = keel_metrics::start_kv_timer("put");

        let record = Record::new(key.to_vec(), value, unix_nanos());
        self.fan_out_write(record, self.write_required(level)).await
    }

    /// Delete a key by replicating a tombstone.
    pub async fn delete(&self, key: &[u8], level: ConsistencyLevel) -> Result<(), KvError> {
        keel_metrics::metrics().kv_deletes.inc();
        let _timer = keel_metrics::start_kv_timer("delete");

        let record = Record::tombstone(key.to_vec(), unix_nanos());
        self.fan_out_write(record, self.write_required(level)).await
    }

    // -----------------------------------------------------------------------
    // GET
    // -----------------------------------------------------------------------

    /// Read a key: fan out to the preference list, require R found
    /// responses, return the freshest value, and asynchronously repair
    /// replicas holding older data or none.
    pub async fn get(
        &self,
        key: &[u8],
        level: ConsistencyLevel,
    ) -> Result<(Vec<u8>, i64), KvError> {
        keel_metrics::metrics().kv_gets.inc();
        let _timer = keel_metrics::start_kv_timer("get");

        let pref = self
            .placement
            .preference_list(key, self.config.replication_factor);
        if pref.is_empty() {
            return Err(KvError::RingEmpty);
        }
        let required = self.read_required(level);

        let deadline = tokio::time::Instant::now() + self.config.request_timeout;
        let mut futs = FuturesUnordered::new();
        for node_id in &pref {
            futs.push(self.dispatch_read(node_id.clone(), key.to_vec()));
        }

        let mut responses: Vec<(String, ReadOutcome)> = Vec::new();
        while let Some(result) = tokio::time::timeout_at(deadline, futs.next())
            .await
            .ok()
            .flatten()
        {
            if let Ok(resp) = result {
                responses.push(resp);
            }
        }

        let found: Vec<&Record> = responses
            .iter()
            .filter_map(|(_, outcome)| match outcome {
                ReadOutcome::Found(rec) => Some(rec),
                _ => None,
            })
            .collect();

        // A replica's "not found" counts as an absence, not a quorum ack.
        if found.len() < required {
            return Err(KvError::NotFound);
        }

        let winner = found
            .iter()
            .max_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| a.value.cmp(&b.value))
            })
            .copied()
            .cloned()
            .expect("found is non-empty");

        if self.config.read_repair {
            self.spawn_read_repair(pref, winner.clone(), responses);
        }

        Ok((winner.value, winner.timestamp))
    }

    // -----------------------------------------------------------------------
    // Internal: write fan-out
    // -----------------------------------------------------------------------

    async fn fan_out_write(&self, record: Record, required: usize) -> Result<(), KvError> {
        let pref = self
            .placement
            .preference_list(&record.key, self.config.replication_factor);
        if pref.is_empty() {
            return Err(KvError::RingEmpty);
        }

        let deadline = tokio::time::Instant::now() + self.config.request_timeout;
        let mut futs = FuturesUnordered::new();
        for node_id in &pref {
            futs.push(self.dispatch_write(node_id.clone(), record.clone()));
        }

        let mut acks = 0usize;
        while let Some(result) = tokio::time::timeout_at(deadline, futs.next())
            .await
            .ok()
            .flatten()
        {
            if matches!(result, Ok(true)) {
                acks += 1;
                if acks >= required {
                    // Remaining dispatches keep running; failures among
                    // them still deposit hints.
                    return Ok(());
                }
            }
        }

        // Acked writes are not rolled back; the caller is expected to retry.
        Err(KvError::QuorumFailed {
            needed: required,
            got: acks,
        })
    }

    /// One replica write. Local entries go to the log store; remote
    /// entries go through the transport. Any failure (RPC error, dead or
    /// unknown target) deposits a hint for the target.
    fn dispatch_write(&self, node_id: String, record: Record) -> tokio::task::JoinHandle<bool> {
        if node_id == self.local_id {
            let store = self.store.clone();
            tokio::spawn(async move {
                let mut s = store.write().await;
                let result = if record.is_deleted {
                    s.delete(&record.key, record.timestamp)
                } else {
                    s.put(&record.key, &record.value, record.timestamp)
                };
                match result {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("local write failed: {}", e);
                        false
                    }
                }
            })
        } else {
            let membership = self.membership.clone();
            let transport = self.transport.clone();
            let handoff = self.handoff.clone();
            tokio::spawn(async move {
                let outcome = match membership.member(&node_id) {
                    Some(target) if target.state == keel_common::NodeState::Alive => transport
                        .replicate(&target, &record, false)
                        .await
                        .map_err(|e| e.to_string()),
                    Some(target) => Err(format!("target is {}", target.state)),
                    None => Err("no address known".to_string()),
                };
                match outcome {
                    Ok(()) => {
                        keel_metrics::metrics().replications_sent.inc();
                        true
                    }
                    Err(reason) => {
                        tracing::debug!("replica write to {} failed: {}", node_id, reason);
                        if let Some(buffer) = handoff {
                            buffer.store(&node_id, record);
                        }
                        false
                    }
                }
            })
        }
    }

    // -----------------------------------------------------------------------
    // Internal: read dispatch
    // -----------------------------------------------------------------------

    fn dispatch_read(
        &self,
        node_id: String,
        key: Vec<u8>,
    ) -> tokio::task::JoinHandle<(String, ReadOutcome)> {
        if node_id == self.local_id {
            let store = self.store.clone();
            tokio::spawn(async move {
                let outcome = {
                    let s = store.read().await;
                    match s.get(&key) {
                        Ok((value, ts)) => ReadOutcome::Found(Record::new(key, value, ts)),
                        Err(StorageError::NotFound) | Err(StorageError::Tombstoned) => {
                            ReadOutcome::Absent
                        }
                        Err(e) => {
                            tracing::warn!("local read failed: {}", e);
                            ReadOutcome::Failed
                        }
                    }
                };
                (node_id, outcome)
            })
        } else {
            let membership = self.membership.clone();
            let transport = self.transport.clone();
            tokio::spawn(async move {
                let outcome = match membership.member(&node_id) {
                    Some(target) => match transport.fetch(&target, &key).await {
                        Ok(Some(rec)) if !rec.is_deleted => ReadOutcome::Found(rec),
                        Ok(_) => ReadOutcome::Absent,
                        Err(e) => {
                            tracing::debug!("replica read from {} failed: {}", node_id, e);
                            ReadOutcome::Failed
                        }
                    },
                    None => ReadOutcome::Failed,
                };
                (node_id, outcome)
            })
        }
    }

    // -----------------------------------------------------------------------
    // Internal: read repair
    // -----------------------------------------------------------------------

    /// Push the winning record, with its original timestamp, to every
    /// preference-list peer that returned older data or none. Runs in
    /// the background; failures are logged, never surfaced.
    fn spawn_read_repair(
        &self,
        pref: Vec<String>,
        winner: Record,
        responses: Vec<(String, ReadOutcome)>,
    ) {
        let local_id = self.local_id.clone();
        let store = self.store.clone();
        let membership = self.membership.clone();
        let transport = self.transport.clone();

        tokio::spawn(async move {
            keel_metrics::metrics().read_repairs.inc();
            let outcomes: HashMap<String, ReadOutcome> = responses.into_iter().collect();

            for node_id in pref {
                let stale = match outcomes.get(&node_id) {
                    Some(ReadOutcome::Found(rec)) => rec.timestamp < winner.timestamp,
                    Some(ReadOutcome::Absent) | Some(ReadOutcome::Failed) | None => true,
                };
                if !stale {
                    continue;
                }

                if node_id == local_id {
                    let mut s = store.write().await;
                    let behind = match s.get(&winner.key) {
                        Ok((_, ts)) => ts < winner.timestamp,
                        Err(_) => true,
                    };
                    if behind {
                        if let Err(e) = s.put(&winner.key, &winner.value, winner.timestamp) {
                            tracing::warn!("local read repair failed: {}", e);
                        }
                    }
                } else if let Some(target) = membership.member(&node_id) {
                    if let Err(e) = transport.replicate(&target, &winner, false).await {
                        tracing::debug!("read repair to {} failed: {}", node_id, e);
                    }
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Quorum resolution
    // -----------------------------------------------------------------------

    fn write_required(&self, level: ConsistencyLevel) -> usize {
        match level {
            ConsistencyLevel::One => 1,
            ConsistencyLevel::Quorum => self.config.write_quorum,
            ConsistencyLevel::All => self.config.replication_factor,
        }
    }

    fn read_required(&self, level: ConsistencyLevel) -> usize {
        match level {
            ConsistencyLevel::One => 1,
            ConsistencyLevel::Quorum => self.config.read_quorum,
            ConsistencyLevel::All => self.config.replication_factor,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
