//! In-memory implementation of SnapshotStore

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use super::store::{
    ListQuery, LockAcquire, OwnerToken, SnapshotStore, SnapshotSummary, StoreError,
};
use crate::snapshot::WorkflowSnapshot;

struct Stored {
    snapshot: WorkflowSnapshot,
    updated_at: DateTime<Utc>,
}

/// In-memory implementation of [`SnapshotStore`].
///
/// The reference store, also used as the process-wide default via
/// [`InMemorySnapshotStore::global`]. Supports the optional advisory lock,
/// which for a single process mirrors the coordinator's in-process guard but
/// exercises the same code path a cross-process backend would.
///
/// # Example
///
/// ```
/// use weft_durable::InMemorySnapshotStore;
///
/// let store = InMemorySnapshotStore::new();
/// assert_eq!(store.snapshot_count(), 0);
/// ```
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Stored>>,
    locks: Mutex<HashMap<String, OwnerToken>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide default store used when no store is configured
    pub fn global() -> Arc<Self> {
        static GLOBAL: Lazy<Arc<InMemorySnapshotStore>> =
            Lazy::new(|| Arc::new(InMemorySnapshotStore::new()));
        GLOBAL.clone()
    }

    /// Number of stored snapshots
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().len()
    }

    /// Whether persisted state exists for a workflow id
    pub fn has_state(&self, id: &str) -> bool {
        self.snapshots.read().contains_key(id)
    }

    /// Whether the advisory lock for an id is currently held
    pub fn is_locked(&self, id: &str) -> bool {
        self.locks.lock().contains_key(id)
    }
}

impl Default for InMemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, id: &str, snapshot: &WorkflowSnapshot) -> Result<(), StoreError> {
        self.snapshots.write().insert(
            id.to_string(),
            Stored {
                snapshot: snapshot.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<WorkflowSnapshot>, StoreError> {
        Ok(self.snapshots.read().get(id).map(|s| s.snapshot.clone()))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.snapshots.write().remove(id);
        Ok(())
    }

    async fn list(&self, query: ListQuery) -> Result<Vec<SnapshotSummary>, StoreError> {
        let snapshots = self.snapshots.read();
        let mut summaries: Vec<SnapshotSummary> = snapshots
            .iter()
            .filter(|(id, _)| match &query.prefix {
                Some(prefix) => id.starts_with(prefix.as_str()),
                None => true,
            })
            .map(|(id, stored)| SnapshotSummary {
                id: id.clone(),
                updated_at: stored.updated_at,
            })
            .collect();

        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(limit) = query.limit {
            summaries.truncate(limit);
        }

        Ok(summaries)
    }

    async fn try_acquire(&self, id: &str) -> Result<LockAcquire, StoreError> {
        let mut locks = self.locks.lock();
        if locks.contains_key(id) {
            return Ok(LockAcquire::Busy);
        }

        let token = OwnerToken::random();
        locks.insert(id.to_string(), token.clone());
        Ok(LockAcquire::Acquired(token))
    }

    async fn release(&self, id: &str, token: OwnerToken) -> Result<(), StoreError> {
        let mut locks = self.locks.lock();
        match locks.get(id) {
            Some(held) if *held == token => {
                locks.remove(id);
                Ok(())
            }
            Some(_) => Err(StoreError::Backend(format!(
                "lock for '{id}' held by a different owner"
            ))),
            None => Ok(()),
        }
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.snapshots.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> WorkflowSnapshot {
        WorkflowSnapshot::new("wf-1", 1)
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let store = InMemorySnapshotStore::new();

        assert!(store.load("wf-1").await.unwrap().is_none());

        store.save("wf-1", &snapshot()).await.unwrap();
        assert!(store.has_state("wf-1"));
        assert!(store.load("wf-1").await.unwrap().is_some());

        store.delete("wf-1").await.unwrap();
        assert!(!store.has_state("wf-1"));
    }

    #[tokio::test]
    async fn test_delete_absent_is_ok() {
        let store = InMemorySnapshotStore::new();
        store.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_with_prefix_and_limit() {
        let store = InMemorySnapshotStore::new();
        store.save("order-1", &snapshot()).await.unwrap();
        store.save("order-2", &snapshot()).await.unwrap();
        store.save("billing-1", &snapshot()).await.unwrap();

        let orders = store
            .list(ListQuery {
                prefix: Some("order-".to_string()),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].id, "order-1");

        let limited = store
            .list(ListQuery {
                prefix: None,
                limit: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_round_trip() {
        let store = InMemorySnapshotStore::new();

        let token = match store.try_acquire("wf-1").await.unwrap() {
            LockAcquire::Acquired(token) => token,
            other => panic!("expected acquire, got {other:?}"),
        };
        assert!(store.is_locked("wf-1"));

        assert_eq!(store.try_acquire("wf-1").await.unwrap(), LockAcquire::Busy);

        store.release("wf-1", token).await.unwrap();
        assert!(!store.is_locked("wf-1"));
    }

    #[tokio::test]
    async fn test_release_with_wrong_token_fails() {
        let store = InMemorySnapshotStore::new();
        let _token = store.try_acquire("wf-1").await.unwrap();

        let result = store.release("wf-1", OwnerToken::random()).await;
        assert!(result.is_err());
        assert!(store.is_locked("wf-1"));
    }

    #[tokio::test]
    async fn test_clear() {
        let store = InMemorySnapshotStore::new();
        store.save("a", &snapshot()).await.unwrap();
        store.save("b", &snapshot()).await.unwrap();

        store.clear().await.unwrap();
        assert_eq!(store.snapshot_count(), 0);
    }
}
