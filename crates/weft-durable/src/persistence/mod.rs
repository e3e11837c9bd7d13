//! Snapshot persistence
//!
//! The [`SnapshotStore`] trait is the coordinator's only view of durable
//! state. [`InMemorySnapshotStore`] is the reference implementation and the
//! process-wide default.

mod memory;
mod store;

pub use memory::InMemorySnapshotStore;
pub use store::{
    ListQuery, LockAcquire, OwnerToken, SnapshotStore, SnapshotSummary, StoreError,
};
