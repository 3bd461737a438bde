//! Abstraction over node-to-node replication RPCs.
//!
//! A trait in the domain crate with the HTTP implementation in
//! `keel-net`; tests substitute in-memory fakes.

use keel_common::{Node, Record};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("rpc failed: {0}")]
    RpcFailed(String),
    #[error("rpc timed out")]
    Timeout,
}

/// Transport for replica writes and reads.
///
/// `replicate` applies the record at the target *as-is*, preserving the
/// supplied timestamp; receipt is terminal (the target never re-fans-out).
/// `fetch` returns the target's latest record for the key, or `None` for
/// absent and tombstoned keys.
#[async_trait::async_trait]
pub trait ReplicationTransport: Send + Sync + 'static {
    async fn replicate(
        &self,
        target: &Node,
        record: &Record,
        is_handoff: bool,
    ) -> Result<(), TransportError>;

    async fn fetch(&self, target: &Node, key: &[u8]) -> Result<Option<Record>, TransportError>;
}
