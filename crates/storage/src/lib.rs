//! Storage engine for keel: a single append-only log file with an
//! in-memory key index.
//!
//! Every write is appended as a CRC-framed entry; the index maps each key
//! to the offset of its latest entry. On startup the index is rebuilt by
//! scanning the log, truncating any torn or corrupt tail.

pub mod engine;
pub mod index;
pub mod record;

pub use engine::{LogStore, StorageError, StoreStats};
pub use index::{Index, IndexEntry};
