//! In-memory implementation of StreamStore

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::warn;

use super::{StreamError, StreamItem, StreamMetadata, StreamStore, Subscriber, Subscription};

struct StreamState {
    items: Vec<StreamItem>,
    metadata: StreamMetadata,
    subscribers: HashMap<u64, Subscriber>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            metadata: StreamMetadata {
                length: 0,
                closed: false,
                created_at: Utc::now(),
                last_write_at: None,
                closed_at: None,
            },
            subscribers: HashMap::new(),
        }
    }
}

type StreamKey = (String, String);

/// In-memory implementation of [`StreamStore`].
///
/// Streams are created implicitly on first append or subscription.
pub struct InMemoryStreamStore {
    streams: Arc<RwLock<HashMap<StreamKey, StreamState>>>,
    next_subscriber: AtomicU64,
}

impl InMemoryStreamStore {
    pub fn new() -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            next_subscriber: AtomicU64::new(0),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    fn key(workflow_id: &str, namespace: &str) -> StreamKey {
        (workflow_id.to_string(), namespace.to_string())
    }
}

impl Default for InMemoryStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StreamStore for InMemoryStreamStore {
    async fn append(
        &self,
        workflow_id: &str,
        namespace: &str,
        item: StreamItem,
    ) -> Result<(), StreamError> {
        // Fan-out happens outside the lock so a subscriber reading the
        // store back cannot deadlock.
        let subscribers: Vec<Subscriber> = {
            let mut streams = self.streams.write();
            let state = streams
                .entry(Self::key(workflow_id, namespace))
                .or_insert_with(StreamState::new);

            if state.metadata.closed {
                return Err(StreamError::Closed(namespace.to_string()));
            }
            if item.position != state.metadata.length {
                return Err(StreamError::Backend(format!(
                    "non-dense position {} (expected {})",
                    item.position, state.metadata.length
                )));
            }

            state.items.push(item.clone());
            state.metadata.length += 1;
            state.metadata.last_write_at = Some(Utc::now());
            state.subscribers.values().cloned().collect()
        };

        for subscriber in subscribers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| subscriber(&item))).is_err() {
                warn!(namespace, "stream subscriber panicked");
            }
        }

        Ok(())
    }

    async fn read(
        &self,
        workflow_id: &str,
        namespace: &str,
        start_index: u64,
        limit: Option<usize>,
    ) -> Result<Vec<StreamItem>, StreamError> {
        let streams = self.streams.read();
        let Some(state) = streams.get(&Self::key(workflow_id, namespace)) else {
            return Ok(Vec::new());
        };

        let start = (start_index as usize).min(state.items.len());
        let end = match limit {
            Some(limit) => (start + limit).min(state.items.len()),
            None => state.items.len(),
        };

        Ok(state.items[start..end].to_vec())
    }

    async fn metadata(
        &self,
        workflow_id: &str,
        namespace: &str,
    ) -> Result<Option<StreamMetadata>, StreamError> {
        Ok(self
            .streams
            .read()
            .get(&Self::key(workflow_id, namespace))
            .map(|state| state.metadata.clone()))
    }

    async fn close_stream(&self, workflow_id: &str, namespace: &str) -> Result<(), StreamError> {
        let mut streams = self.streams.write();
        let state = streams
            .entry(Self::key(workflow_id, namespace))
            .or_insert_with(StreamState::new);

        if !state.metadata.closed {
            state.metadata.closed = true;
            state.metadata.closed_at = Some(Utc::now());
        }
        Ok(())
    }

    fn subscribe(
        &self,
        workflow_id: &str,
        namespace: &str,
        subscriber: Subscriber,
    ) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let key = Self::key(workflow_id, namespace);

        self.streams
            .write()
            .entry(key.clone())
            .or_insert_with(StreamState::new)
            .subscribers
            .insert(id, subscriber);

        let streams = self.streams.clone();
        Subscription::new(move || {
            if let Some(state) = streams.write().get_mut(&key) {
                state.subscribers.remove(&id);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn item(position: u64, value: serde_json::Value) -> StreamItem {
        StreamItem {
            value,
            position,
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let store = InMemoryStreamStore::new();
        store.append("wf", "out", item(0, json!("a"))).await.unwrap();
        store.append("wf", "out", item(1, json!("b"))).await.unwrap();

        let items = store.read("wf", "out", 0, None).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].value, json!("b"));

        let tail = store.read("wf", "out", 1, None).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].position, 1);
    }

    #[tokio::test]
    async fn test_append_rejects_non_dense_positions() {
        let store = InMemoryStreamStore::new();
        store.append("wf", "out", item(0, json!(1))).await.unwrap();

        let result = store.append("wf", "out", item(5, json!(2))).await;
        assert!(matches!(result, Err(StreamError::Backend(_))));
    }

    #[tokio::test]
    async fn test_closed_stream_rejects_appends() {
        let store = InMemoryStreamStore::new();
        store.append("wf", "out", item(0, json!(1))).await.unwrap();
        store.close_stream("wf", "out").await.unwrap();

        let result = store.append("wf", "out", item(1, json!(2))).await;
        assert!(matches!(result, Err(StreamError::Closed(_))));

        let meta = store.metadata("wf", "out").await.unwrap().unwrap();
        assert!(meta.closed);
        assert_eq!(meta.length, 1);
        assert!(meta.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_metadata_absent_for_unknown_stream() {
        let store = InMemoryStreamStore::new();
        assert!(store.metadata("wf", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscribers_receive_appends_synchronously() {
        let store = InMemoryStreamStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let subscriber_seen = seen.clone();
        let subscription = store.subscribe(
            "wf",
            "out",
            Arc::new(move |item: &StreamItem| subscriber_seen.lock().push(item.value.clone())),
        );

        store.append("wf", "out", item(0, json!("x"))).await.unwrap();
        assert_eq!(seen.lock().as_slice(), &[json!("x")]);

        subscription.unsubscribe();
        store.append("wf", "out", item(1, json!("y"))).await.unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_subscriber_panic_is_swallowed() {
        let store = InMemoryStreamStore::new();
        let _subscription = store.subscribe(
            "wf",
            "out",
            Arc::new(|_: &StreamItem| panic!("broken subscriber")),
        );

        store.append("wf", "out", item(0, json!(1))).await.unwrap();
        assert_eq!(store.read("wf", "out", 0, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_streams_are_namespaced() {
        let store = InMemoryStreamStore::new();
        store.append("wf", "a", item(0, json!(1))).await.unwrap();
        store.append("wf", "b", item(0, json!(2))).await.unwrap();

        assert_eq!(store.read("wf", "a", 0, None).await.unwrap().len(), 1);
        assert_eq!(store.read("wf", "b", 0, None).await.unwrap().len(), 1);
        assert_eq!(store.stream_count(), 2);
    }
}
