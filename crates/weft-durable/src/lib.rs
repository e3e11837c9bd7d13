//! # Weft Durable Workflow Engine
//!
//! A library for expressing multi-step asynchronous business processes as
//! straight-line code while the engine provides typed error handling,
//! per-step identity, memoized replay across process restarts,
//! cancellation, retry with backoff and timeout, and bounded fan-out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       run_durable                           │
//! │  (locking, snapshot hydration, version gate, finalize)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ RunHooks
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   execute + Step handle                     │
//! │  (step identity, retry/timeout/cancel, scopes, events)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              SnapshotStore / StreamStore / StepCache        │
//! │  (pluggable backends; in-memory reference implementations)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use weft_core::Outcome;
//! use weft_durable::{run_durable, DurableOptions};
//!
//! # #[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
//! # struct OrderError(String);
//! # async fn fetch_user(id: &str) -> Outcome<String, OrderError> { Outcome::ok(id.to_string()) }
//! # tokio_test::block_on(async {
//! let result = run_durable::<_, OrderError, _, _>(
//!     DurableOptions::new("order-123"),
//!     |step| async move {
//!         let user = step.run("fetch-user", || fetch_user("123")).await?;
//!         Ok(user)
//!     },
//! )
//! .await;
//!
//! assert_eq!(result.value().as_deref(), Some("123"));
//! # });
//! ```

pub mod cache;
pub mod cancel;
pub mod durable;
pub mod error;
pub mod event;
pub mod hooks;
pub mod persistence;
pub mod runtime;
pub mod snapshot;
pub mod step;
pub mod stream;

/// Prelude for common imports
pub mod prelude {
    pub use crate::cache::{InMemoryStepCache, StepCache};
    pub use crate::cancel::CancelSignal;
    pub use crate::durable::{has_state, run_durable, DurableOptions, VersionDecision};
    pub use crate::error::{
        Cancelled, ConcurrencyScope, ConcurrentExecution, Halt, PersistenceError, StepTimeout,
        UnexpectedError, VersionMismatch, WorkflowError,
    };
    pub use crate::event::{EventKind, RunEvent, ScopeKind};
    pub use crate::persistence::{InMemorySnapshotStore, SnapshotStore};
    pub use crate::runtime::{execute, RunConfig};
    pub use crate::snapshot::{StepRecord, WorkflowSnapshot};
    pub use crate::step::{Backoff, RetryPolicy, Step, StepOptions};
    pub use crate::stream::{
        FlowController, InMemoryStreamStore, StreamReader, StreamStore, StreamWriter,
    };
    pub use weft_core::Outcome;
}

// Re-export key types at crate root
pub use cache::{InMemoryStepCache, StepCache};
pub use cancel::CancelSignal;
pub use durable::{has_state, run_durable, DurableOptions, VersionDecision};
pub use error::{
    Cancelled, ConcurrencyScope, ConcurrentExecution, FailureKind, FailureOrigin, Halt,
    PersistenceError, StepMeta, StepTimeout, UnexpectedCause, UnexpectedError, VersionMismatch,
    WorkflowError,
};
pub use event::{EventKind, EventSink, RunEvent, ScopeKind};
pub use hooks::{Replay, RunHooks, StepReport};
pub use persistence::{
    InMemorySnapshotStore, ListQuery, LockAcquire, OwnerToken, SnapshotStore, SnapshotSummary,
    StoreError,
};
pub use runtime::{execute, RunConfig};
pub use snapshot::{
    ExecutionInfo, RunStatus, SnapshotMetadata, SnapshotWarning, StepRecord, WorkflowSnapshot,
    FORMAT_VERSION,
};
pub use step::{Backoff, RetryFailure, RetryPolicy, Step, StepOptions};
pub use stream::{
    FlowController, FlowState, InMemoryStreamStore, ReaderConfig, ReaderEvent, StreamError,
    StreamItem, StreamMetadata, StreamReader, StreamStore, StreamWriter, Subscriber, Subscription,
};
