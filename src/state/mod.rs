//! Persistent state for deployed stacks.
//!
//! The state store records, per logical name, what was last applied and what
//! the provider reported back. Node outcomes are written as they happen so an
//! interrupted run resumes from the last durable write.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    HistoryEntry, HistoryOperation, NodeRecord, RecordChange, RecordStatus, STATE_VERSION,
    Snapshot,
};
