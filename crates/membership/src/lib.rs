//! Cluster membership for keel: heartbeat table, failure detector, and
//! gossip dissemination over UDP.
//!
//! Peer state follows alive -> suspect -> dead on heartbeat silence; any
//! received heartbeat revives. State transitions fire a callback so the
//! node wiring can add and remove peers on the placement ring.

pub mod detector;
pub mod gossip;
pub mod table;

pub use detector::FailureDetector;
pub use gossip::{GossipMessage, GossipProtocol, MAX_DATAGRAM_BYTES};
pub use table::{MemberDigest, MemberInfo, MembershipTable};
