//! Stream reader

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::Instant;

use super::{StreamError, StreamItem, StreamStore};

/// Polling behavior of a [`StreamReader`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Delay between polls when no new items are available
    pub poll_interval: Duration,

    /// Give up after this long without any new item
    pub poll_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            poll_timeout: Duration::from_secs(30),
        }
    }
}

/// One observation from a reader
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent<T> {
    /// The next item of the stream
    Item { value: T, position: u64 },

    /// The stream is closed and fully drained; `position` is its final
    /// length
    Ended { position: u64 },
}

/// Typed pull reader for one `(workflow_id, namespace)` stream.
///
/// Polls the store with a bounded interval and timeout. For push
/// consumption, subscribe on the store directly and keep the returned
/// guard alive.
pub struct StreamReader<T> {
    store: Arc<dyn StreamStore>,
    workflow_id: String,
    namespace: String,
    position: u64,
    buffer: VecDeque<StreamItem>,
    config: ReaderConfig,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> StreamReader<T> {
    pub fn new(
        store: Arc<dyn StreamStore>,
        workflow_id: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            workflow_id: workflow_id.into(),
            namespace: namespace.into(),
            position: 0,
            buffer: VecDeque::new(),
            config: ReaderConfig::default(),
            _marker: PhantomData,
        }
    }

    pub fn with_config(mut self, config: ReaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Resume reading from a known position
    pub fn with_start_index(mut self, start_index: u64) -> Self {
        self.position = start_index;
        self
    }

    fn decode(&self, item: StreamItem) -> Result<ReaderEvent<T>, StreamError> {
        let position = item.position;
        let value = serde_json::from_value(item.value)
            .map_err(|e| StreamError::Serialization(e.to_string()))?;
        Ok(ReaderEvent::Item { value, position })
    }

    /// Await the next item, the end of the stream, or a poll timeout
    pub async fn next(&mut self) -> Result<ReaderEvent<T>, StreamError> {
        if let Some(item) = self.buffer.pop_front() {
            return self.decode(item);
        }

        let deadline = Instant::now() + self.config.poll_timeout;
        loop {
            let items = self
                .store
                .read(&self.workflow_id, &self.namespace, self.position, None)
                .await?;

            if !items.is_empty() {
                self.position += items.len() as u64;
                self.buffer.extend(items);
                let item = self.buffer.pop_front().expect("buffer is non-empty");
                return self.decode(item);
            }

            let metadata = self
                .store
                .metadata(&self.workflow_id, &self.namespace)
                .await?;
            if let Some(metadata) = metadata {
                if metadata.closed && self.position >= metadata.length {
                    return Ok(ReaderEvent::Ended {
                        position: metadata.length,
                    });
                }
            }

            if Instant::now() >= deadline {
                return Err(StreamError::PollTimeout(self.config.poll_timeout));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{InMemoryStreamStore, StreamWriter};

    fn fast_config() -> ReaderConfig {
        ReaderConfig {
            poll_interval: Duration::from_millis(5),
            poll_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_reads_items_then_end_marker() {
        let store = Arc::new(InMemoryStreamStore::new());
        let writer = StreamWriter::<String>::open(store.clone(), "wf", "out")
            .await
            .unwrap();
        writer.write(&"a".to_string()).await.unwrap();
        writer.write(&"b".to_string()).await.unwrap();
        writer.close().await.unwrap();

        let mut reader = StreamReader::<String>::new(store, "wf", "out").with_config(fast_config());

        assert_eq!(
            reader.next().await.unwrap(),
            ReaderEvent::Item {
                value: "a".to_string(),
                position: 0
            }
        );
        assert_eq!(
            reader.next().await.unwrap(),
            ReaderEvent::Item {
                value: "b".to_string(),
                position: 1
            }
        );
        assert_eq!(reader.next().await.unwrap(), ReaderEvent::Ended { position: 2 });
    }

    #[tokio::test]
    async fn test_start_index_resume() {
        let store = Arc::new(InMemoryStreamStore::new());
        let writer = StreamWriter::<i32>::open(store.clone(), "wf", "out")
            .await
            .unwrap();
        for n in 0..4 {
            writer.write(&n).await.unwrap();
        }
        writer.close().await.unwrap();

        let mut reader = StreamReader::<i32>::new(store, "wf", "out")
            .with_config(fast_config())
            .with_start_index(2);

        assert_eq!(
            reader.next().await.unwrap(),
            ReaderEvent::Item {
                value: 2,
                position: 2
            }
        );
    }

    #[tokio::test]
    async fn test_reader_waits_for_concurrent_writer() {
        let store = Arc::new(InMemoryStreamStore::new());
        let writer_store = store.clone();

        let write_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let writer = StreamWriter::<i32>::open(writer_store, "wf", "out")
                .await
                .unwrap();
            writer.write(&42).await.unwrap();
            writer.close().await.unwrap();
        });

        let mut reader = StreamReader::<i32>::new(store, "wf", "out").with_config(fast_config());
        assert_eq!(
            reader.next().await.unwrap(),
            ReaderEvent::Item {
                value: 42,
                position: 0
            }
        );
        write_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_timeout_on_silent_stream() {
        let store = Arc::new(InMemoryStreamStore::new());
        let mut reader = StreamReader::<i32>::new(store, "wf", "silent").with_config(ReaderConfig {
            poll_interval: Duration::from_millis(5),
            poll_timeout: Duration::from_millis(30),
        });

        assert!(matches!(
            reader.next().await,
            Err(StreamError::PollTimeout(_))
        ));
    }
}
