//! The durable coordinator
//!
//! [`run_durable`] layers checkpointed replay onto the step runtime:
//! it loads the persisted snapshot, installs hooks that memoize keyed steps
//! and persist after each one, enforces single execution (in-process set +
//! optional cross-process advisory lock), gates on the application schema
//! version, and separates success teardown from failure-preserves-state
//! resume semantics.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use weft_core::Outcome;

use crate::cache::StepCache;
use crate::cancel::CancelSignal;
use crate::error::{
    ConcurrencyScope, ConcurrentExecution, Halt, PersistenceError, VersionMismatch, WorkflowError,
};
use crate::event::{EventKind, EventSink, Observer, RunEvent};
use crate::hooks::{Replay, RunHooks, StepReport};
use crate::persistence::{
    InMemorySnapshotStore, LockAcquire, OwnerToken, SnapshotStore, StoreError,
};
use crate::runtime::{execute, ErrorCallback, RunConfig};
use crate::snapshot::{RunStatus, WorkflowSnapshot};
use crate::step::Step;

/// Process-wide set of workflow ids currently executing.
///
/// Guards against two runs of the same id in this process; the
/// cross-process guard is the store's advisory lock.
static ACTIVE_WORKFLOWS: Lazy<DashSet<String>> = Lazy::new(DashSet::new);

/// Resolution chosen by an `on_version_mismatch` handler
pub enum VersionDecision {
    /// Delete the stored snapshot and start fresh
    Clear,

    /// Fail the run with [`VersionMismatch`] (the default)
    Reject,

    /// Proceed with a migrated snapshot; its metadata version is rewritten
    /// to the requested one
    Migrate(WorkflowSnapshot),
}

type VersionHandler = Arc<dyn Fn(u32, u32) -> VersionDecision + Send + Sync>;
type PanicMapper<E> = Arc<dyn Fn(&str) -> E + Send + Sync>;

/// Configuration for a durable workflow run
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use weft_durable::{DurableOptions, InMemorySnapshotStore};
///
/// let store = Arc::new(InMemorySnapshotStore::new());
/// let options: DurableOptions<String> = DurableOptions::new("order-123")
///     .with_store(store)
///     .with_version(2);
/// ```
pub struct DurableOptions<E> {
    pub(crate) id: String,
    pub(crate) store: Arc<dyn SnapshotStore>,
    pub(crate) version: u32,
    pub(crate) on_version_mismatch: Option<VersionHandler>,
    pub(crate) allow_concurrent: bool,
    pub(crate) cancel: CancelSignal,
    pub(crate) observers: Vec<Observer>,
    pub(crate) context: Option<serde_json::Value>,
    pub(crate) catch_unexpected: Option<PanicMapper<E>>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) cache: Option<Arc<dyn StepCache>>,
    pub(crate) workflow_id: Option<String>,
}

impl<E> DurableOptions<E> {
    /// Options for the workflow with the given persistent id, on the
    /// process-wide in-memory store
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            store: InMemorySnapshotStore::global(),
            version: 1,
            on_version_mismatch: None,
            allow_concurrent: false,
            cancel: CancelSignal::new(),
            observers: Vec::new(),
            context: None,
            catch_unexpected: None,
            on_error: None,
            cache: None,
            workflow_id: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = store;
        self
    }

    /// Declare the application schema version (default 1)
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Decide what to do when the stored version differs from the
    /// requested one; called as `handler(stored, requested)`
    pub fn on_version_mismatch(
        mut self,
        handler: impl Fn(u32, u32) -> VersionDecision + Send + Sync + 'static,
    ) -> Self {
        self.on_version_mismatch = Some(Arc::new(handler));
        self
    }

    /// Skip the single-execution guards.
    ///
    /// Concurrent writers to the same workflow id are then the caller's
    /// problem.
    pub fn allow_concurrent(mut self) -> Self {
        self.allow_concurrent = true;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_event(mut self, observer: impl Fn(&RunEvent) + Send + Sync + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Correlation value attached to every emitted event
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Map step panics to the typed error instead of wrapping them
    pub fn catch_unexpected(mut self, mapper: impl Fn(&str) -> E + Send + Sync + 'static) -> Self {
        self.catch_unexpected = Some(Arc::new(mapper));
        self
    }

    /// Observe step errors as they surface
    pub fn on_error(
        mut self,
        callback: impl Fn(&serde_json::Value, Option<&str>, Option<&serde_json::Value>)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Side cache consulted by steps that declare a TTL
    pub fn with_cache(mut self, cache: Arc<dyn StepCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Override the identifier used on the event stream (defaults to `id`)
    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }
}

/// Coordinator hooks: memoize from the snapshot, persist after every keyed
/// step
struct DurableHooks {
    store: Arc<dyn SnapshotStore>,
    store_id: String,
    snapshot: Mutex<WorkflowSnapshot>,
    sink: EventSink,
}

impl DurableHooks {
    async fn persist(&self, snapshot: &WorkflowSnapshot) {
        match self.store.save(&self.store_id, snapshot).await {
            Ok(()) => self.sink.emit(EventKind::PersistSuccess {
                steps: snapshot.steps.len(),
            }),
            Err(e) => {
                warn!(workflow_id = %self.store_id, error = %e, "failed to persist snapshot");
                self.sink.emit(EventKind::PersistError {
                    reason: e.to_string(),
                });
            }
        }
    }
}

#[async_trait]
impl RunHooks for DurableHooks {
    async fn replay(&self, step_key: &str) -> Replay {
        match self.snapshot.lock().steps.get(step_key) {
            Some(record) => Replay::Cached(record.clone()),
            None => Replay::Miss,
        }
    }

    async fn after_step(&self, step_key: &str, report: StepReport) {
        // step_complete has already been emitted at this point; observers
        // may briefly see a completed step that is not yet durably saved.
        let snapshot = {
            let mut snapshot = self.snapshot.lock();
            match report {
                StepReport::Record(record) if record.ok => {
                    snapshot.record_step(step_key, record)
                }
                StepReport::Record(_) => {
                    // Failed steps are not memoized: their ops re-execute
                    // on resume. The failure is preserved through the
                    // finalize save, not as a step entry.
                    snapshot.execution.current_step_id = Some(step_key.to_string());
                    snapshot.execution.last_updated = chrono::Utc::now();
                    return;
                }
                StepReport::Lossy { reason } => snapshot.record_lossy(step_key, reason),
            }
            snapshot.clone()
        };
        self.persist(&snapshot).await;
    }
}

/// Whether persisted state exists for a workflow id
pub async fn has_state(store: &dyn SnapshotStore, id: &str) -> Result<bool, StoreError> {
    Ok(store.load(id).await?.is_some())
}

/// Run a workflow with checkpointed replay.
///
/// Steps already present in the stored snapshot are not re-executed; their
/// recorded outcomes replay verbatim. On success the snapshot is deleted;
/// on failure or cancellation it is preserved so a later run resumes after
/// the last completed step.
#[instrument(skip_all, fields(workflow_id = %options.id))]
pub async fn run_durable<T, E, F, Fut>(
    options: DurableOptions<E>,
    body: F,
) -> Outcome<T, WorkflowError<E>>
where
    T: Serialize + DeserializeOwned,
    E: Serialize + DeserializeOwned,
    F: FnOnce(Step<E>) -> Fut,
    Fut: Future<Output = Result<T, Halt<E>>>,
{
    let store_id = options.id.clone();
    let store = options.store.clone();

    // Single-execution guards: in-process set first, then the store's
    // advisory lock when it has one.
    let mut in_process_guard = false;
    let mut owner_token: Option<OwnerToken> = None;

    if !options.allow_concurrent {
        if !ACTIVE_WORKFLOWS.insert(store_id.clone()) {
            return Outcome::err(WorkflowError::ConcurrentExecution(ConcurrentExecution {
                workflow_id: store_id,
                reason: ConcurrencyScope::InProcess,
            }));
        }
        in_process_guard = true;

        match store.try_acquire(&store_id).await {
            Ok(LockAcquire::Acquired(token)) => owner_token = Some(token),
            Ok(LockAcquire::Unsupported) => {}
            Ok(LockAcquire::Busy) => {
                ACTIVE_WORKFLOWS.remove(&store_id);
                return Outcome::err(WorkflowError::ConcurrentExecution(ConcurrentExecution {
                    workflow_id: store_id,
                    reason: ConcurrencyScope::CrossProcess,
                }));
            }
            Err(e) => {
                ACTIVE_WORKFLOWS.remove(&store_id);
                return Outcome::err(WorkflowError::Persistence(PersistenceError::Lock {
                    reason: e.to_string(),
                }));
            }
        }
    }

    let result = run_locked(options, body).await;

    if in_process_guard {
        ACTIVE_WORKFLOWS.remove(&store_id);
    }
    if let Some(token) = owner_token {
        if let Err(e) = store.release(&store_id, token).await {
            warn!(workflow_id = %store_id, error = %e, "failed to release workflow lock");
        }
    }

    result
}

async fn run_locked<T, E, F, Fut>(
    options: DurableOptions<E>,
    body: F,
) -> Outcome<T, WorkflowError<E>>
where
    T: Serialize + DeserializeOwned,
    E: Serialize + DeserializeOwned,
    F: FnOnce(Step<E>) -> Fut,
    Fut: Future<Output = Result<T, Halt<E>>>,
{
    let store_id = options.id.clone();
    let event_id = options
        .workflow_id
        .clone()
        .unwrap_or_else(|| store_id.clone());
    let store = options.store.clone();

    // Hydrate: load, validate, gate on the application version.
    let loaded = match store.load(&store_id).await {
        Ok(loaded) => loaded,
        Err(e) => {
            return Outcome::err(WorkflowError::Persistence(PersistenceError::Load {
                reason: e.to_string(),
            }))
        }
    };

    let mut snapshot = match loaded {
        Some(snapshot) => {
            if let Err(e) = snapshot.validate() {
                return Outcome::err(WorkflowError::Persistence(e));
            }

            let stored = snapshot.stored_version();
            if stored == options.version {
                debug!(workflow_id = %store_id, steps = snapshot.steps.len(), "resuming from snapshot");
                snapshot
            } else {
                let decision = match &options.on_version_mismatch {
                    Some(handler) => handler(stored, options.version),
                    None => VersionDecision::Reject,
                };
                match decision {
                    VersionDecision::Reject => {
                        return Outcome::err(WorkflowError::VersionMismatch(
                            VersionMismatch::new(store_id, stored, options.version),
                        ));
                    }
                    VersionDecision::Clear => {
                        info!(workflow_id = %store_id, stored, requested = options.version,
                              "clearing snapshot on version mismatch");
                        if let Err(e) = store.delete(&store_id).await {
                            return Outcome::err(WorkflowError::Persistence(
                                PersistenceError::Delete {
                                    reason: e.to_string(),
                                },
                            ));
                        }
                        WorkflowSnapshot::new(&store_id, options.version)
                    }
                    VersionDecision::Migrate(mut migrated) => {
                        info!(workflow_id = %store_id, stored, requested = options.version,
                              "migrated snapshot on version mismatch");
                        migrated.set_version(options.version);
                        migrated
                    }
                }
            }
        }
        None => WorkflowSnapshot::new(&store_id, options.version),
    };
    snapshot.mark(RunStatus::Running);

    let sink = EventSink::new(
        event_id.clone(),
        options.context.clone(),
        options.observers.clone(),
    );
    let hooks = Arc::new(DurableHooks {
        store: store.clone(),
        store_id: store_id.clone(),
        snapshot: Mutex::new(snapshot),
        sink,
    });

    let config = RunConfig {
        workflow_id: event_id,
        cancel: options.cancel.clone(),
        hooks: hooks.clone() as Arc<dyn RunHooks>,
        observers: options.observers,
        context: options.context,
        catch_unexpected: options.catch_unexpected,
        on_error: options.on_error,
        cache: options.cache,
    };

    let outcome = execute(config, body).await;

    // Finalize: success deletes, failure and cancellation preserve.
    match &outcome {
        Outcome::Ok(_) => {
            if let Err(e) = store.delete(&store_id).await {
                // Stale state would poison the next resume; surfacing the
                // delete failure outranks returning the business value.
                warn!(workflow_id = %store_id, error = %e, "failed to delete snapshot after success");
                return Outcome::err(WorkflowError::Persistence(PersistenceError::Delete {
                    reason: e.to_string(),
                }));
            }
            debug!(workflow_id = %store_id, "workflow completed, snapshot deleted");
            outcome
        }
        Outcome::Err(failure) => {
            let status = if failure.error.is_cancelled() {
                RunStatus::Cancelled
            } else {
                RunStatus::Failed
            };
            let final_snapshot = {
                let mut snapshot = hooks.snapshot.lock();
                snapshot.mark(status);
                snapshot.clone()
            };
            hooks.persist(&final_snapshot).await;
            outcome
        }
    }
}
