//! The run boundary
//!
//! [`execute`] runs a workflow body against a [`RunConfig`], converting the
//! body's early-exit [`Halt`] into the final [`Outcome`]. The durable
//! coordinator layers on top of this entry point; calling it directly gives
//! an ephemeral run with no persistence.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use weft_core::{Cause, Failure, Outcome};

use crate::cache::StepCache;
use crate::cancel::CancelSignal;
use crate::error::{Halt, HaltKind, UnexpectedCause, UnexpectedError, WorkflowError};
use crate::event::{EventKind, EventSink, Observer, RunEvent};
use crate::hooks::{NoopHooks, RunHooks};
use crate::step::{ScopeFrame, Step};

pub(crate) type PanicMapper<E> = Arc<dyn Fn(&str) -> E + Send + Sync>;

/// Callback invoked when a step surfaces an error: `(error, step_id, context)`
pub type ErrorCallback =
    Arc<dyn Fn(&serde_json::Value, Option<&str>, Option<&serde_json::Value>) + Send + Sync>;

/// Configuration for one workflow run
pub struct RunConfig<E> {
    pub(crate) workflow_id: String,
    pub(crate) cancel: CancelSignal,
    pub(crate) hooks: Arc<dyn RunHooks>,
    pub(crate) observers: Vec<Observer>,
    pub(crate) context: Option<serde_json::Value>,
    pub(crate) catch_unexpected: Option<PanicMapper<E>>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) cache: Option<Arc<dyn StepCache>>,
}

impl<E> RunConfig<E> {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            cancel: CancelSignal::new(),
            hooks: Arc::new(NoopHooks),
            observers: Vec::new(),
            context: None,
            catch_unexpected: None,
            on_error: None,
            cache: None,
        }
    }

    /// Share a cancellation signal with the caller
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Install coordinator hooks (replay, persistence)
    pub fn with_hooks(mut self, hooks: Arc<dyn RunHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Register an event observer; may be called multiple times
    pub fn on_event(mut self, observer: impl Fn(&RunEvent) + Send + Sync + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Correlation value attached to every emitted event
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Map step panics to the typed error instead of wrapping them in
    /// [`UnexpectedError`]. A panic inside the mapper itself propagates to
    /// the caller of [`execute`] unchanged.
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
}

/// Shared state of one run, owned by the [`Step`] handle
pub(crate) struct RunCore<E> {
    pub(crate) sink: EventSink,
    pub(crate) cancel: CancelSignal,
    pub(crate) hooks: Arc<dyn RunHooks>,
    pub(crate) cache: Option<Arc<dyn StepCache>>,
    pub(crate) catch_unexpected: Option<PanicMapper<E>>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) context: Option<serde_json::Value>,
    pub(crate) ids: Mutex<HashSet<String>>,
    pub(crate) scopes: Mutex<Vec<ScopeFrame>>,
    pub(crate) last_step_key: Mutex<Option<String>>,
    /// Set before a deliberate panic (programmer error, broken mapper) so
    /// the run boundary re-raises it instead of wrapping it
    pub(crate) bypass_panic: AtomicBool,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Serialize a value for the event stream, degrading to `null` rather than
/// failing the workflow over a diagnostic
pub(crate) fn to_event_value<V: Serialize>(value: &V) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Run a workflow body to completion.
///
/// The body receives a [`Step`] handle and returns `Result<T, Halt<E>>`;
/// step failures move out through `?` and are converted back into a typed
/// [`Outcome`] here. `execute` never panics on behalf of the workflow;
/// the only panics that escape are programmer errors (step identity) and
/// one raised by a user-supplied `catch_unexpected` mapper.
pub async fn execute<T, E, F, Fut>(config: RunConfig<E>, body: F) -> Outcome<T, WorkflowError<E>>
where
    E: Serialize,
    F: FnOnce(Step<E>) -> Fut,
    Fut: std::future::Future<Output = Result<T, Halt<E>>>,
{
    let core = Arc::new(RunCore {
        sink: EventSink::new(config.workflow_id.clone(), config.context.clone(), config.observers),
        cancel: config.cancel,
        hooks: config.hooks,
        cache: config.cache,
        catch_unexpected: config.catch_unexpected,
        on_error: config.on_error,
        context: config.context,
        ids: Mutex::new(HashSet::new()),
        scopes: Mutex::new(Vec::new()),
        last_step_key: Mutex::new(None),
        bypass_panic: AtomicBool::new(false),
    });

    core.sink.emit(EventKind::WorkflowStart);
    core.hooks.before_start().await;

    let step = Step::new(core.clone());
    let settled = AssertUnwindSafe(body(step)).catch_unwind().await;

    match settled {
        Ok(Ok(value)) => {
            core.sink.emit(EventKind::WorkflowSuccess);
            Outcome::Ok(value)
        }
        Ok(Err(halt)) => finish_halt(&core, halt),
        Err(payload) => {
            if core.bypass_panic.load(Ordering::SeqCst) {
                std::panic::resume_unwind(payload);
            }

            let message = panic_message(payload.as_ref());
            debug!(workflow_id = core.sink.workflow_id(), %message, "workflow body panicked");
            let error = UnexpectedError {
                cause: UnexpectedCause::UncaughtPanic {
                    message: message.clone(),
                },
            };
            core.sink.emit(EventKind::WorkflowError {
                error: to_event_value(&error),
            });
            Outcome::Err(Failure {
                error: WorkflowError::Unexpected(error),
                cause: Some(Cause::String(message)),
            })
        }
    }
}

fn finish_halt<T, E: Serialize>(
    core: &RunCore<E>,
    halt: Halt<E>,
) -> Outcome<T, WorkflowError<E>> {
    match halt.kind {
        HaltKind::Failed {
            error,
            cause,
            step_id,
            ..
        } => {
            let error_value = to_event_value(&error);
            core.sink.emit(EventKind::WorkflowError {
                error: error_value.clone(),
            });
            // Step-raised failures already invoked on_error at settle time;
            // a body-level Halt::fail has no step to do so.
            if step_id.is_none() {
                if let Some(on_error) = &core.on_error {
                    on_error(&error_value, None, core.context.as_ref());
                }
            }
            Outcome::Err(Failure {
                error: WorkflowError::Step { error },
                cause,
            })
        }
        HaltKind::Timeout { info } => {
            core.sink.emit(EventKind::WorkflowError {
                error: to_event_value(&info),
            });
            Outcome::err(WorkflowError::Timeout(info))
        }
        HaltKind::Cancelled(cancelled) => {
            core.sink.emit(EventKind::WorkflowCancelled {
                reason: cancelled.reason.clone(),
            });
            Outcome::err(WorkflowError::Cancelled(cancelled))
        }
        HaltKind::Unexpected { error, cause } => {
            core.sink.emit(EventKind::WorkflowError {
                error: to_event_value(&error),
            });
            Outcome::Err(Failure {
                error: WorkflowError::Unexpected(error),
                cause,
            })
        }
    }
}
