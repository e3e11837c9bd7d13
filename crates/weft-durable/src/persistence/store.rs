//! SnapshotStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::snapshot::WorkflowSnapshot;

/// Error type for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Snapshot not found
    #[error("snapshot not found: {0}")]
    NotFound(String),

    /// Backend failure (I/O, connection, ...)
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The store does not implement this optional operation
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

/// Opaque handle proving ownership of a cross-process advisory lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerToken(String);

impl OwnerToken {
    pub fn random() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Result of probing a store for its advisory lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquire {
    /// The store does not implement locking; proceed without one
    Unsupported,

    /// Another owner holds the lock
    Busy,

    /// Lock acquired; the token is required to release
    Acquired(OwnerToken),
}

/// Query for [`SnapshotStore::list`]
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub prefix: Option<String>,
    pub limit: Option<usize>,
}

/// One entry of a [`SnapshotStore::list`] result
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotSummary {
    pub id: String,
    pub updated_at: DateTime<Utc>,
}

/// Store for workflow snapshots
///
/// The coordinator requires only `save`/`load`/`delete`/`list`; locking and
/// bulk operations are probed through the default methods, so a minimal
/// backend implements four methods. Implementations must be thread-safe.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Persist a snapshot under the workflow id, replacing any previous one
    async fn save(&self, id: &str, snapshot: &WorkflowSnapshot) -> Result<(), StoreError>;

    /// Load the snapshot for a workflow id, or `None` if absent
    async fn load(&self, id: &str) -> Result<Option<WorkflowSnapshot>, StoreError>;

    /// Delete the snapshot for a workflow id; absent ids are not an error
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// List stored snapshots
    async fn list(&self, query: ListQuery) -> Result<Vec<SnapshotSummary>, StoreError>;

    /// Release backend resources
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Try to take the cross-process advisory lock for a workflow id.
    ///
    /// Stores without locking keep the default, which reports
    /// [`LockAcquire::Unsupported`] and lets the coordinator proceed on the
    /// in-process guard alone.
    async fn try_acquire(&self, id: &str) -> Result<LockAcquire, StoreError> {
        let _ = id;
        Ok(LockAcquire::Unsupported)
    }

    /// Release a lock taken by [`SnapshotStore::try_acquire`]
    async fn release(&self, id: &str, token: OwnerToken) -> Result<(), StoreError> {
        let _ = (id, token);
        Ok(())
    }

    /// Bulk-delete every snapshot (optional fast path)
    async fn clear(&self) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("clear"))
    }
}
