//! Failure taxonomy for workflow runs
//!
//! Errors fall into two families: typed business errors (the `E` the caller
//! threads through [`crate::step::Step`]) and engine errors (timeout,
//! cancellation, persistence, ...). Both surface through the
//! [`WorkflowError`] union at the run boundary; user code in a workflow body
//! only ever sees [`Halt`], the early-exit carrier moved by `?`.

use serde::{Deserialize, Serialize};
use weft_core::Cause;

/// Where a step failure originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOrigin {
    /// The op returned a typed `Err`
    Returned,

    /// The op panicked
    Panicked,

    /// The op's raw untyped error was mapped to a typed error
    Raw,
}

/// Classification of a recorded failure, used to reconstruct the right
/// error shape during replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A typed business error
    Business,

    /// A step deadline elapsed
    Timeout,

    /// An unmapped panic
    Unexpected,
}

/// Bookkeeping attached to a recorded step outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StepMeta {
    /// Where the failure originated (absent for successes)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub origin: Option<FailureOrigin>,

    /// Failure classification (absent for successes)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure: Option<FailureKind>,

    /// How many attempts the step took
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub attempts: Option<u32>,

    /// Wall-clock duration of the final attempt
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_ms: Option<u64>,
}

/// A step deadline elapsed.
///
/// Surfaced on the typed error channel directly, never wrapped in
/// [`UnexpectedError`], so callers can always detect timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("step '{step_id}' timed out after {timeout_ms}ms (attempt {attempt})")]
pub struct StepTimeout {
    /// Id of the step whose deadline elapsed
    pub step_id: String,

    /// Persistence key of the step, when keyed
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub step_key: Option<String>,

    /// The deadline in milliseconds
    pub timeout_ms: u64,

    /// Attempt number the deadline applied to (1-based)
    pub attempt: u32,
}

/// The workflow's cancellation signal fired
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default, thiserror::Error)]
#[error("workflow was cancelled")]
pub struct Cancelled {
    /// Reason captured from the signal, if one was supplied
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,

    /// The most recent keyed step when the signal fired
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_step_key: Option<String>,
}

/// Detail of an [`UnexpectedError`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnexpectedCause {
    /// A step op panicked and no `catch_unexpected` mapper was configured
    StepFailure {
        origin: FailureOrigin,
        step_id: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        panic_message: Option<String>,
    },

    /// The workflow body panicked outside any step
    UncaughtPanic { message: String },
}

/// Canonical wrapper for panics that were not typed-mapped by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("unexpected workflow failure")]
pub struct UnexpectedError {
    pub cause: UnexpectedCause,
}

/// Stored and requested workflow versions disagree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct VersionMismatch {
    pub workflow_id: String,
    pub stored_version: u32,
    pub requested_version: u32,
    /// Remediation guidance
    pub message: String,
}

impl VersionMismatch {
    pub fn new(workflow_id: impl Into<String>, stored: u32, requested: u32) -> Self {
        let workflow_id = workflow_id.into();
        let message = format!(
            "workflow '{workflow_id}' was stored with version {stored} but version {requested} \
             was requested; bump the requested version, supply an on_version_mismatch handler, \
             or clear the stored snapshot"
        );
        Self {
            workflow_id,
            stored_version: stored,
            requested_version: requested,
            message,
        }
    }
}

/// Which guard rejected a concurrent run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyScope {
    /// The process-wide active set already holds this workflow id
    InProcess,

    /// The store's advisory lock is held by another process
    CrossProcess,
}

/// Another run of the same workflow id is already executing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("workflow '{workflow_id}' is already running ({reason:?})")]
pub struct ConcurrentExecution {
    pub workflow_id: String,
    pub reason: ConcurrencyScope,
}

/// Snapshot load/save/delete/validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PersistenceError {
    #[error("failed to load snapshot: {reason}")]
    Load { reason: String },

    #[error("failed to save snapshot: {reason}")]
    Save { reason: String },

    #[error("failed to delete snapshot: {reason}")]
    Delete { reason: String },

    #[error("invalid snapshot: {reason}")]
    Invalid { reason: String },

    #[error("failed to acquire cross-process lock: {reason}")]
    Lock { reason: String },
}

/// Union of every failure a workflow run can resolve with.
///
/// Business errors pass through as [`WorkflowError::Step`]; everything else
/// is an engine error. The `cause` of the underlying failure travels on the
/// enclosing [`weft_core::Failure`], not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowError<E> {
    /// A step surfaced a typed business error
    Step { error: E },

    Timeout(StepTimeout),

    Cancelled(Cancelled),

    Unexpected(UnexpectedError),

    VersionMismatch(VersionMismatch),

    ConcurrentExecution(ConcurrentExecution),

    Persistence(PersistenceError),
}

impl<E> WorkflowError<E> {
    /// The typed business error, if this is a step failure
    pub fn step_error(&self) -> Option<&E> {
        match self {
            Self::Step { error } => Some(error),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl<E: std::fmt::Debug> std::fmt::Display for WorkflowError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Step { error } => write!(f, "step failed: {error:?}"),
            Self::Timeout(e) => write!(f, "{e}"),
            Self::Cancelled(e) => write!(f, "{e}"),
            Self::Unexpected(e) => write!(f, "{e}"),
            Self::VersionMismatch(e) => write!(f, "{e}"),
            Self::ConcurrentExecution(e) => write!(f, "{e}"),
            Self::Persistence(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::fmt::Debug> std::error::Error for WorkflowError<E> {}

/// Early-exit carrier that unwinds a workflow body to the run boundary.
///
/// Every step method returns `Result<T, Halt<E>>`; propagating with `?`
/// terminates the workflow on the first failure while the body still reads
/// as straight-line code. The run boundary converts a `Halt` back into an
/// `Outcome` failure, so a halt can never be silently swallowed.
#[derive(Debug, Clone)]
pub struct Halt<E> {
    pub(crate) kind: HaltKind<E>,
}

#[derive(Debug, Clone)]
pub(crate) enum HaltKind<E> {
    Failed {
        error: E,
        cause: Option<Cause>,
        step_id: Option<String>,
        origin: FailureOrigin,
    },
    Timeout {
        info: StepTimeout,
    },
    Cancelled(Cancelled),
    Unexpected {
        error: UnexpectedError,
        cause: Option<Cause>,
    },
}

impl<E> Halt<E> {
    /// Fail the workflow with a typed business error, outside any step
    pub fn fail(error: E) -> Self {
        Self {
            kind: HaltKind::Failed {
                error,
                cause: None,
                step_id: None,
                origin: FailureOrigin::Returned,
            },
        }
    }

    /// Fail the workflow with a typed business error carrying a cause
    pub fn fail_with_cause(error: E, cause: Cause) -> Self {
        Self {
            kind: HaltKind::Failed {
                error,
                cause: Some(cause),
                step_id: None,
                origin: FailureOrigin::Returned,
            },
        }
    }

    /// The typed business error, if this halt carries one
    pub fn business_error(&self) -> Option<&E> {
        match &self.kind {
            HaltKind::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, HaltKind::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, HaltKind::Cancelled(_))
    }
}
