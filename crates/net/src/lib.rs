//! HTTP networking layer for keel.
//!
//! Provides:
//! - the wire types for the internal replication RPC
//! - `serve`: the node's HTTP endpoints — peer-facing replication routes
//!   backed by the local log store, plus the thin client shim over the
//!   coordinator
//! - `HttpTransport`: the `ReplicationTransport` implementation peers use
//!   to reach each other

pub mod server;
pub mod transport;

use keel_common::Record;
use serde::{Deserialize, Serialize};

pub use server::{serve, ApiContext};
pub use transport::HttpTransport;

/// Payload of `POST /internal/replicate`. The target applies the entry
/// as-is, preserving the supplied timestamp, and never re-fans-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub entry: Record,
    pub from_node: String,
    pub is_handoff: bool,
}

/// Response to a replication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
