//! Replication layer for keel: the coordinator that turns a client
//! operation into a quorum fan-out, the hinted-handoff buffer for writes
//! that missed a replica, and vector clocks for causal versioning.

pub mod coordinator;
pub mod handoff;
pub mod transport;
pub mod vclock;

pub use coordinator::{Coordinator, KvError, QuorumConfig};
pub use handoff::{HandoffBuffer, Hint};
pub use transport::{ReplicationTransport, TransportError};
pub use vclock::{ClockOrdering, VectorClock};
