//! Stream writer

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use super::{StreamError, StreamItem, StreamStore};
use crate::event::{EventKind, EventSink};

/// Typed writer for one `(workflow_id, namespace)` stream.
///
/// The writer owns position assignment: positions are dense and strictly
/// increasing. Writes are serialized through the writer; in-process
/// subscribers are fanned out synchronously by the store during append.
pub struct StreamWriter<T> {
    store: Arc<dyn StreamStore>,
    workflow_id: String,
    namespace: String,
    next_position: tokio::sync::Mutex<u64>,
    closed: AtomicBool,
    sink: Option<EventSink>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> StreamWriter<T> {
    /// Open a writer, resuming position assignment from the stored length.
    ///
    /// Fails if the stream was already closed.
    pub async fn open(
        store: Arc<dyn StreamStore>,
        workflow_id: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Result<Self, StreamError> {
        let workflow_id = workflow_id.into();
        let namespace = namespace.into();

        let metadata = store.metadata(&workflow_id, &namespace).await?;
        if let Some(metadata) = &metadata {
            if metadata.closed {
                return Err(StreamError::Closed(namespace));
            }
        }
        let next = metadata.map(|m| m.length).unwrap_or(0);

        Ok(Self {
            store,
            workflow_id,
            namespace,
            next_position: tokio::sync::Mutex::new(next),
            closed: AtomicBool::new(false),
            sink: None,
            _marker: PhantomData,
        })
    }

    /// Emit `stream_*` lifecycle events through the given sink
    pub fn with_events(mut self, sink: EventSink) -> Self {
        sink.emit(EventKind::StreamOpened {
            namespace: self.namespace.clone(),
        });
        self.sink = Some(sink);
        self
    }

    /// Append a value, returning its assigned position
    pub async fn write(&self, value: &T) -> Result<u64, StreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed(self.namespace.clone()));
        }

        let json =
            serde_json::to_value(value).map_err(|e| StreamError::Serialization(e.to_string()))?;

        // The position lock is held across the append so concurrent writers
        // on one handle stay dense.
        let mut position = self.next_position.lock().await;
        let item = StreamItem {
            value: json,
            position: *position,
            ts: Utc::now(),
        };
        self.store
            .append(&self.workflow_id, &self.namespace, item)
            .await?;
        let assigned = *position;
        *position += 1;
        Ok(assigned)
    }

    /// Close the stream; further writes fail. Idempotent.
    pub async fn close(&self) -> Result<(), StreamError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store
            .close_stream(&self.workflow_id, &self.namespace)
            .await?;

        if let Some(sink) = &self.sink {
            let length = *self.next_position.lock().await;
            sink.emit(EventKind::StreamClosed {
                namespace: self.namespace.clone(),
                length,
            });
        }
        Ok(())
    }

    /// Close immediately without waiting for readers, recording a reason
    pub async fn abort(&self, reason: impl Into<String>) -> Result<(), StreamError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store
            .close_stream(&self.workflow_id, &self.namespace)
            .await?;

        if let Some(sink) = &self.sink {
            sink.emit(EventKind::StreamAborted {
                namespace: self.namespace.clone(),
                reason: reason.into(),
            });
        }
        Ok(())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}
