//! Namespaced streams over a pluggable store
//!
//! A workflow can fan data out through append-only streams identified by
//! `(workflow_id, namespace)`. The [`StreamWriter`] assigns dense positions
//! and fans items out to in-process subscribers; the [`StreamReader`] either
//! polls the store or consumes the subscription feed, and observes a
//! definitive end once the stream is closed and drained. The
//! [`FlowController`] provides count-based backpressure between the two.

mod flow;
mod memory;
mod reader;
mod writer;

pub use flow::{FlowController, FlowState};
pub use memory::InMemoryStreamStore;
pub use reader::{ReaderConfig, ReaderEvent, StreamReader};
pub use writer::StreamWriter;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One item of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamItem {
    pub value: serde_json::Value,

    /// Dense, strictly increasing, assigned by the writer
    pub position: u64,

    pub ts: DateTime<Utc>,
}

/// Metadata tracked per stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub length: u64,

    pub closed: bool,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_write_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub closed_at: Option<DateTime<Utc>>,
}

/// Error type for stream operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// Writes were attempted after close
    #[error("stream '{0}' is closed")]
    Closed(String),

    /// Backend failure
    #[error("stream backend error: {0}")]
    Backend(String),

    /// Item value failed to encode or decode
    #[error("stream serialization error: {0}")]
    Serialization(String),

    /// A polling reader saw no new items within its timeout
    #[error("timed out waiting for stream items after {0:?}")]
    PollTimeout(std::time::Duration),
}

/// Push subscriber callback
pub type Subscriber = Arc<dyn Fn(&StreamItem) + Send + Sync>;

/// Guard for an active subscription; dropping it unsubscribes
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Store for stream items, keyed by `(workflow_id, namespace)`
///
/// Positions are dense and monotonic; `append` must be serialized per
/// stream (the writer guarantees this for its own stream). Implementations
/// must be thread-safe.
#[async_trait::async_trait]
pub trait StreamStore: Send + Sync + 'static {
    /// Append an item; rejects writes to closed streams and non-dense
    /// positions
    async fn append(
        &self,
        workflow_id: &str,
        namespace: &str,
        item: StreamItem,
    ) -> Result<(), StreamError>;

    /// Read items starting at `start_index`, up to `limit` when given
    async fn read(
        &self,
        workflow_id: &str,
        namespace: &str,
        start_index: u64,
        limit: Option<usize>,
    ) -> Result<Vec<StreamItem>, StreamError>;

    /// Metadata for a stream, or `None` if it was never written
    async fn metadata(
        &self,
        workflow_id: &str,
        namespace: &str,
    ) -> Result<Option<StreamMetadata>, StreamError>;

    /// Mark a stream closed; further appends fail
    async fn close_stream(&self, workflow_id: &str, namespace: &str) -> Result<(), StreamError>;

    /// Register an in-process subscriber, called synchronously on each
    /// append
    fn subscribe(&self, workflow_id: &str, namespace: &str, subscriber: Subscriber)
        -> Subscription;
}
