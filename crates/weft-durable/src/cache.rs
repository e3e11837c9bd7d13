//! Step outcome cache adapter
//!
//! A side-store for step outcomes indexed by step key. Steps opt in with a
//! TTL; a cached outcome short-circuits the step the same way a snapshot
//! replay does, but with expiry instead of run-scoped durability.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use crate::snapshot::StepRecord;

/// Cache adapter for keyed step outcomes.
///
/// TTL resolution: a per-entry TTL overrides the adapter's default; `None`
/// falls back to the default; an adapter without a default keeps entries
/// until evicted.
#[async_trait]
pub trait StepCache: Send + Sync + 'static {
    /// Fetch a live entry, or `None` if absent or expired
    async fn get(&self, key: &str) -> Option<StepRecord>;

    /// Store an entry, optionally overriding the default TTL
    async fn set(&self, key: &str, record: StepRecord, ttl: Option<Duration>);

    /// Whether a live entry exists
    async fn has(&self, key: &str) -> bool;

    /// Remove an entry; returns whether one was present
    async fn delete(&self, key: &str) -> bool;

    /// Remove every entry
    async fn clear(&self);
}

struct Entry {
    record: StepRecord,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory [`StepCache`] with an LRU bound and TTL expiry
pub struct InMemoryStepCache {
    entries: Mutex<LruCache<String, Entry>>,
    default_ttl: Option<Duration>,
}

impl InMemoryStepCache {
    /// Create a cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            default_ttl: None,
        }
    }

    /// Set the TTL applied when an entry does not carry its own
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Number of entries, including any not yet evicted expired ones
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl StepCache for InMemoryStepCache {
    async fn get(&self, key: &str) -> Option<StepRecord> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.pop(key);
                None
            }
            Some(entry) => Some(entry.record.clone()),
            None => None,
        }
    }

    async fn set(&self, key: &str, record: StepRecord, ttl: Option<Duration>) {
        let ttl = ttl.or(self.default_ttl);
        let entry = Entry {
            record,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.entries.lock().put(key.to_string(), entry);
    }

    async fn has(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    async fn delete(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    async fn clear(&self) {
        self.entries.lock().clear();
    }
}
