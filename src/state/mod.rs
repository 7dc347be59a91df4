//! State management for the reconciliation engine.
//!
//! This module persists the observed state: the last-known remote attributes
//! of every managed resource, keyed by logical name, plus a bounded history
//! of operations and an advisory lock.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{ensure_takeable, generate_holder_id, holder_or_generated, LockInfo, LOCK_EXPIRY_SECS};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{HistoryEntry, ObservedState, Operation, ResourceState, STATE_VERSION};
