//! Run events for observers
//!
//! The runtime emits a typed event log consumable by `on_event` observers.
//! Events are informational: observer callbacks run synchronously during
//! emission, are never awaited, and a panicking observer is isolated and
//! logged rather than unwinding into the workflow.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::snapshot::StepRecord;

/// Kind of fan-out scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Parallel,
    Race,
    AllSettled,
}

impl std::fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parallel => write!(f, "parallel"),
            Self::Race => write!(f, "race"),
            Self::AllSettled => write!(f, "all_settled"),
        }
    }
}

/// Payload of a [`RunEvent`]
///
/// Errors are carried pre-serialized so the event stream stays uniform over
/// every workflow's business error type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // =========================================================================
    // Workflow Lifecycle
    // =========================================================================
    WorkflowStart,

    WorkflowSuccess,

    WorkflowError {
        error: serde_json::Value,
    },

    WorkflowCancelled {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        reason: Option<String>,
    },

    // =========================================================================
    // Step Lifecycle
    // =========================================================================
    StepStart {
        step_id: String,
    },

    StepSuccess {
        step_id: String,
    },

    StepError {
        step_id: String,
        error: serde_json::Value,
    },

    /// Step terminated by workflow cancellation
    StepAborted {
        step_id: String,
    },

    /// Keyed step settled; emitted exactly once with the recorded outcome
    StepComplete {
        step_id: String,
        key: String,
        record: StepRecord,
    },

    StepCacheHit {
        step_id: String,
        key: String,
    },

    StepCacheMiss {
        step_id: String,
        key: String,
    },

    /// Conditional step whose guard was false
    StepSkipped {
        step_id: String,
    },

    /// Emitted before each additional attempt
    StepRetry {
        step_id: String,
        attempt: u32,
        delay_ms: u64,
    },

    /// Emitted once when every attempt has failed
    StepRetriesExhausted {
        step_id: String,
        attempts: u32,
    },

    StepTimeout {
        step_id: String,
        timeout_ms: u64,
        attempt: u32,
    },

    // =========================================================================
    // Scopes
    // =========================================================================
    ScopeStart {
        scope_id: Uuid,
        kind: ScopeKind,
        name: String,
    },

    ScopeEnd {
        scope_id: Uuid,
        kind: ScopeKind,
        name: String,
        duration_ms: u64,
        /// For race scopes, the step id of the first success inside
        #[serde(skip_serializing_if = "Option::is_none", default)]
        winner_id: Option<String>,
    },

    // =========================================================================
    // Coordinator Hooks
    // =========================================================================
    PersistSuccess {
        steps: usize,
    },

    PersistError {
        reason: String,
    },

    // =========================================================================
    // Streams
    // =========================================================================
    StreamOpened {
        namespace: String,
    },

    StreamClosed {
        namespace: String,
        length: u64,
    },

    StreamAborted {
        namespace: String,
        reason: String,
    },
}

impl EventKind {
    /// The step id if this is a step-scoped event
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepStart { step_id }
            | Self::StepSuccess { step_id }
            | Self::StepError { step_id, .. }
            | Self::StepAborted { step_id }
            | Self::StepComplete { step_id, .. }
            | Self::StepCacheHit { step_id, .. }
            | Self::StepCacheMiss { step_id, .. }
            | Self::StepSkipped { step_id }
            | Self::StepRetry { step_id, .. }
            | Self::StepRetriesExhausted { step_id, .. }
            | Self::StepTimeout { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    /// True for the terminal workflow events
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowSuccess | Self::WorkflowError { .. } | Self::WorkflowCancelled { .. }
        )
    }
}

/// An emitted event with its envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Identifier of the emitting workflow's event stream
    pub workflow_id: String,

    /// Emission time
    pub at: DateTime<Utc>,

    /// Caller-supplied correlation value, attached to every event
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub context: Option<serde_json::Value>,

    #[serde(flatten)]
    pub kind: EventKind,
}

/// Observer callback registered via `on_event`
pub type Observer = Arc<dyn Fn(&RunEvent) + Send + Sync>;

/// Synchronous fan-out of run events to registered observers
#[derive(Clone)]
pub struct EventSink {
    workflow_id: String,
    context: Option<serde_json::Value>,
    observers: Arc<Vec<Observer>>,
}

impl EventSink {
    pub fn new(
        workflow_id: impl Into<String>,
        context: Option<serde_json::Value>,
        observers: Vec<Observer>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            context,
            observers: Arc::new(observers),
        }
    }

    /// Emit an event to every observer.
    ///
    /// Observer panics are swallowed: the event stream is diagnostics, and a
    /// broken observer must not fail the workflow.
    pub fn emit(&self, kind: EventKind) {
        if self.observers.is_empty() {
            return;
        }

        let event = RunEvent {
            workflow_id: self.workflow_id.clone(),
            at: Utc::now(),
            context: self.context.clone(),
            kind,
        };

        for observer in self.observers.iter() {
            if std::panic::catch_unwind(AssertUnwindSafe(|| observer(&event))).is_err() {
                warn!(workflow_id = %self.workflow_id, "event observer panicked");
            }
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }
}
