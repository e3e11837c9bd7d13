//! The step handle
//!
//! A workflow body receives a [`Step`] and expresses its work as identified
//! steps. Every step method returns `Result<T, Halt<E>>`: on success the
//! unwrapped value, on failure an early-exit carrier the body propagates
//! with `?`. Keyed steps (the default) are memoized by the coordinator and
//! replayed verbatim on resume.

mod options;
mod scope;

pub use options::{Backoff, RetryFailure, RetryPolicy, StepOptions};
pub(crate) use scope::ScopeFrame;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use weft_core::{Cause, Outcome};

use crate::error::{
    Cancelled, FailureKind, FailureOrigin, Halt, HaltKind, StepMeta, StepTimeout, UnexpectedCause,
    UnexpectedError,
};
use crate::event::EventKind;
use crate::hooks::{Replay, StepReport};
use crate::runtime::{panic_message, to_event_value, RunCore};
use crate::snapshot::StepRecord;

/// Handle through which a workflow body runs its steps.
///
/// Cheap to clone; clones share the run's state, so branches of a fan-out
/// can each capture their own handle.
///
/// # Step identity
///
/// Every step takes a mandatory id, unique within the run. An empty or
/// duplicate id is a programmer error and panics immediately, bypassing the
/// workflow's typed error channel. The id doubles as the persistence key
/// unless [`StepOptions::with_key`] overrides it.
pub struct Step<E> {
    pub(crate) core: Arc<RunCore<E>>,
}

impl<E> Clone for Step<E> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

/// Result of driving an op future once, with panics contained
enum Driven<T, E2> {
    Done(Outcome<T, E2>),
    Panicked(String),
}

async fn drive<T, E2>(fut: impl Future<Output = Outcome<T, E2>>) -> Driven<T, E2> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcome) => Driven::Done(outcome),
        Err(payload) => Driven::Panicked(panic_message(payload.as_ref())),
    }
}

/// Classified result of one attempt, with the error already in the
/// workflow's type
enum Attempt<T, E> {
    Success(T),
    Failed {
        error: E,
        cause: Option<Cause>,
        origin: FailureOrigin,
    },
    Panicked {
        message: String,
    },
    TimedOut(StepTimeout),
    Cancelled,
}

/// Outcome of the pre-flight for a step
enum Prepared<T, E> {
    /// A recorded outcome was replayed; the step body must not run
    Replay(Result<T, Halt<E>>),

    /// Run the body under this key (`None` for transient steps)
    Fresh { key: Option<String> },
}

struct StepCtx<'a> {
    id: &'a str,
    key: Option<String>,
    ttl: Option<Duration>,
    attempts: u32,
    started: Instant,
}

impl<E> Step<E> {
    pub(crate) fn new(core: Arc<RunCore<E>>) -> Self {
        Self { core }
    }

    fn register_id(&self, id: &str) {
        if id.is_empty() {
            self.core.bypass_panic.store(true, Ordering::SeqCst);
            panic!("step id must be a non-empty string");
        }
        if !self.core.ids.lock().insert(id.to_string()) {
            self.core.bypass_panic.store(true, Ordering::SeqCst);
            panic!("duplicate step id '{id}' within one workflow run");
        }
    }

    fn cancelled_halt(&self) -> Halt<E> {
        Halt {
            kind: HaltKind::Cancelled(Cancelled {
                reason: self.core.cancel.reason(),
                last_step_key: self.core.last_step_key.lock().clone(),
            }),
        }
    }

    /// Record a success against the innermost race scope still missing a
    /// winner
    fn note_success(&self, step_id: &str) {
        let mut scopes = self.core.scopes.lock();
        for frame in scopes.iter_mut().rev() {
            if frame.kind == crate::event::ScopeKind::Race && frame.winner_id.is_none() {
                frame.winner_id = Some(step_id.to_string());
                break;
            }
        }
    }

    // =========================================================================
    // Analysis markers, transparent at runtime
    // =========================================================================

    /// Label a value for external analysis tooling; identity at runtime
    pub fn label<V>(&self, name: &str, value: V) -> V {
        let _ = name;
        value
    }

    /// Mark a branch point for external analysis tooling; identity at runtime
    pub fn branch<V>(&self, name: &str, value: V) -> V {
        let _ = name;
        value
    }

    /// Mark a branch arm for external analysis tooling; identity at runtime
    pub fn arm<V>(&self, name: &str, value: V) -> V {
        let _ = name;
        value
    }

    /// Declare a data dependency for external analysis tooling; identity at
    /// runtime
    pub fn dep<V>(&self, id: &str, value: V) -> V {
        let _ = id;
        value
    }
}

impl<E> Step<E>
where
    E: Serialize + DeserializeOwned,
{
    // =========================================================================
    // Pre-flight and settlement
    // =========================================================================

    async fn prepare<T: DeserializeOwned>(
        &self,
        id: &str,
        opts: &StepOptions,
    ) -> Result<Prepared<T, E>, Halt<E>> {
        self.register_id(id);

        if self.core.cancel.is_cancelled() {
            return Err(self.cancelled_halt());
        }

        let key = if opts.transient {
            None
        } else {
            Some(opts.key.clone().unwrap_or_else(|| id.to_string()))
        };
        if let Some(key) = &key {
            *self.core.last_step_key.lock() = Some(key.clone());
        }

        self.core.sink.emit(EventKind::StepStart {
            step_id: id.to_string(),
        });

        if let Some(k) = &key {
            match self.core.hooks.replay(k).await {
                Replay::Cached(record) => {
                    self.core.sink.emit(EventKind::StepCacheHit {
                        step_id: id.to_string(),
                        key: k.clone(),
                    });
                    return Ok(Prepared::Replay(self.replay_record(id, k, record)));
                }
                Replay::Miss => {
                    self.core.sink.emit(EventKind::StepCacheMiss {
                        step_id: id.to_string(),
                        key: k.clone(),
                    });
                }
                Replay::Untracked => {
                    // No memo table; fall back to the TTL cache when the
                    // step opted in.
                    if opts.ttl.is_some() {
                        if let Some(cache) = &self.core.cache {
                            if let Some(record) = cache.get(k).await {
                                self.core.sink.emit(EventKind::StepCacheHit {
                                    step_id: id.to_string(),
                                    key: k.clone(),
                                });
                                return Ok(Prepared::Replay(self.replay_record(id, k, record)));
                            }
                            self.core.sink.emit(EventKind::StepCacheMiss {
                                step_id: id.to_string(),
                                key: k.clone(),
                            });
                        }
                    }
                }
            }
        }

        Ok(Prepared::Fresh { key })
    }

    /// Replay a recorded outcome verbatim: same events, same value or the
    /// same early-exit, without invoking the op
    fn replay_record<T: DeserializeOwned>(
        &self,
        id: &str,
        key: &str,
        record: StepRecord,
    ) -> Result<T, Halt<E>> {
        if record.ok {
            return match serde_json::from_value::<T>(record.value_or_null()) {
                Ok(value) => {
                    self.note_success(id);
                    self.core.sink.emit(EventKind::StepSuccess {
                        step_id: id.to_string(),
                    });
                    self.core.sink.emit(EventKind::StepComplete {
                        step_id: id.to_string(),
                        key: key.to_string(),
                        record,
                    });
                    Ok(value)
                }
                Err(e) => Err(self.corrupt_record(id, format!(
                    "recorded value for step '{key}' failed to decode: {e}"
                ))),
            };
        }

        let error_value = record.error.clone().unwrap_or(serde_json::Value::Null);
        self.core.sink.emit(EventKind::StepError {
            step_id: id.to_string(),
            error: error_value.clone(),
        });
        if let Some(on_error) = &self.core.on_error {
            on_error(&error_value, Some(id), self.core.context.as_ref());
        }
        self.core.sink.emit(EventKind::StepComplete {
            step_id: id.to_string(),
            key: key.to_string(),
            record: record.clone(),
        });

        let meta = record.meta.clone().unwrap_or_default();
        let halt = match meta.failure.unwrap_or(FailureKind::Business) {
            FailureKind::Timeout => match serde_json::from_value::<StepTimeout>(error_value) {
                Ok(info) => Halt {
                    kind: HaltKind::Timeout { info },
                },
                Err(e) => self.corrupt_record(id, format!(
                    "recorded timeout for step '{key}' failed to decode: {e}"
                )),
            },
            FailureKind::Unexpected => {
                match serde_json::from_value::<UnexpectedError>(error_value) {
                    Ok(error) => Halt {
                        kind: HaltKind::Unexpected {
                            error,
                            cause: record.cause,
                        },
                    },
                    Err(e) => self.corrupt_record(id, format!(
                        "recorded failure for step '{key}' failed to decode: {e}"
                    )),
                }
            }
            FailureKind::Business => match serde_json::from_value::<E>(error_value) {
                Ok(error) => Halt {
                    kind: HaltKind::Failed {
                        error,
                        cause: record.cause,
                        step_id: Some(id.to_string()),
                        origin: meta.origin.unwrap_or(FailureOrigin::Returned),
                    },
                },
                Err(e) => self.corrupt_record(id, format!(
                    "recorded error for step '{key}' failed to decode: {e}"
                )),
            },
        };
        Err(halt)
    }

    fn corrupt_record(&self, id: &str, message: String) -> Halt<E> {
        Halt {
            kind: HaltKind::Unexpected {
                error: UnexpectedError {
                    cause: UnexpectedCause::StepFailure {
                        origin: FailureOrigin::Returned,
                        step_id: id.to_string(),
                        panic_message: Some(message.clone()),
                    },
                },
                cause: Some(Cause::String(message)),
            },
        }
    }

    async fn settle<T: Serialize>(
        &self,
        ctx: StepCtx<'_>,
        attempt: Attempt<T, E>,
    ) -> Result<T, Halt<E>> {
        match attempt {
            Attempt::Success(value) => self.settle_success(ctx, value).await,
            Attempt::Failed {
                error,
                cause,
                origin,
            } => self.settle_failure(ctx, error, cause, origin).await,
            Attempt::Panicked { message } => {
                if let Some(mapper) = self.core.catch_unexpected.clone() {
                    match std::panic::catch_unwind(AssertUnwindSafe(|| mapper(&message))) {
                        Ok(error) => {
                            self.settle_failure(
                                ctx,
                                error,
                                Some(Cause::String(message)),
                                FailureOrigin::Panicked,
                            )
                            .await
                        }
                        Err(payload) => {
                            // A broken mapper is the one failure that must
                            // reach the caller as a panic, unwrapped.
                            self.core.bypass_panic.store(true, Ordering::SeqCst);
                            std::panic::resume_unwind(payload);
                        }
                    }
                } else {
                    self.settle_unexpected(ctx, message).await
                }
            }
            Attempt::TimedOut(info) => self.settle_timeout(ctx, info).await,
            Attempt::Cancelled => {
                self.core.sink.emit(EventKind::StepAborted {
                    step_id: ctx.id.to_string(),
                });
                Err(self.cancelled_halt())
            }
        }
    }

    async fn settle_success<T: Serialize>(
        &self,
        ctx: StepCtx<'_>,
        value: T,
    ) -> Result<T, Halt<E>> {
        self.note_success(ctx.id);
        self.core.sink.emit(EventKind::StepSuccess {
            step_id: ctx.id.to_string(),
        });

        if let Some(key) = &ctx.key {
            match serde_json::to_value(&value) {
                Ok(json) => {
                    let record = StepRecord::success(json);
                    self.core.sink.emit(EventKind::StepComplete {
                        step_id: ctx.id.to_string(),
                        key: key.clone(),
                        record: record.clone(),
                    });
                    self.core
                        .hooks
                        .after_step(key, StepReport::Record(record.clone()))
                        .await;
                    if let (Some(ttl), Some(cache)) = (ctx.ttl, &self.core.cache) {
                        cache.set(key, record, Some(ttl)).await;
                    }
                }
                Err(e) => {
                    let reason = format!("success value is not JSON-representable: {e}");
                    self.core.sink.emit(EventKind::StepComplete {
                        step_id: ctx.id.to_string(),
                        key: key.clone(),
                        record: StepRecord::success(serde_json::Value::Null),
                    });
                    self.core
                        .hooks
                        .after_step(key, StepReport::Lossy { reason })
                        .await;
                }
            }
        }

        Ok(value)
    }

    async fn settle_failure<T>(
        &self,
        ctx: StepCtx<'_>,
        error: E,
        cause: Option<Cause>,
        origin: FailureOrigin,
    ) -> Result<T, Halt<E>> {
        let serialized = serde_json::to_value(&error);
        let event_value = serialized
            .as_ref()
            .ok()
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        self.core.sink.emit(EventKind::StepError {
            step_id: ctx.id.to_string(),
            error: event_value.clone(),
        });
        if let Some(on_error) = &self.core.on_error {
            on_error(&event_value, Some(ctx.id), self.core.context.as_ref());
        }

        if let Some(key) = &ctx.key {
            let meta = StepMeta {
                origin: Some(origin),
                failure: Some(FailureKind::Business),
                attempts: Some(ctx.attempts),
                duration_ms: Some(ctx.started.elapsed().as_millis() as u64),
            };
            match serialized {
                Ok(json) => {
                    let record = StepRecord::failure(json, cause.clone(), meta);
                    self.core.sink.emit(EventKind::StepComplete {
                        step_id: ctx.id.to_string(),
                        key: key.clone(),
                        record: record.clone(),
                    });
                    self.core
                        .hooks
                        .after_step(key, StepReport::Record(record))
                        .await;
                }
                Err(e) => {
                    let reason = format!("error value is not JSON-representable: {e}");
                    self.core.sink.emit(EventKind::StepComplete {
                        step_id: ctx.id.to_string(),
                        key: key.clone(),
                        record: StepRecord::failure(serde_json::Value::Null, None, meta),
                    });
                    self.core
                        .hooks
                        .after_step(key, StepReport::Lossy { reason })
                        .await;
                }
            }
        }

        Err(Halt {
            kind: HaltKind::Failed {
                error,
                cause,
                step_id: Some(ctx.id.to_string()),
                origin,
            },
        })
    }

    async fn settle_timeout<T>(&self, ctx: StepCtx<'_>, info: StepTimeout) -> Result<T, Halt<E>> {
        let error_value = to_event_value(&info);

        self.core.sink.emit(EventKind::StepError {
            step_id: ctx.id.to_string(),
            error: error_value.clone(),
        });
        if let Some(on_error) = &self.core.on_error {
            on_error(&error_value, Some(ctx.id), self.core.context.as_ref());
        }

        if let Some(key) = &ctx.key {
            let meta = StepMeta {
                origin: None,
                failure: Some(FailureKind::Timeout),
                attempts: Some(ctx.attempts),
                duration_ms: Some(ctx.started.elapsed().as_millis() as u64),
            };
            let record = StepRecord::failure(error_value, None, meta);
            self.core.sink.emit(EventKind::StepComplete {
                step_id: ctx.id.to_string(),
                key: key.clone(),
                record: record.clone(),
            });
            self.core
                .hooks
                .after_step(key, StepReport::Record(record))
                .await;
        }

        Err(Halt {
            kind: HaltKind::Timeout { info },
        })
    }

    async fn settle_unexpected<T>(&self, ctx: StepCtx<'_>, message: String) -> Result<T, Halt<E>> {
        let error = UnexpectedError {
            cause: UnexpectedCause::StepFailure {
                origin: FailureOrigin::Panicked,
                step_id: ctx.id.to_string(),
                panic_message: Some(message.clone()),
            },
        };
        let error_value = to_event_value(&error);

        self.core.sink.emit(EventKind::StepError {
            step_id: ctx.id.to_string(),
            error: error_value.clone(),
        });
        if let Some(on_error) = &self.core.on_error {
            on_error(&error_value, Some(ctx.id), self.core.context.as_ref());
        }

        if let Some(key) = &ctx.key {
            let meta = StepMeta {
                origin: Some(FailureOrigin::Panicked),
                failure: Some(FailureKind::Unexpected),
                attempts: Some(ctx.attempts),
                duration_ms: Some(ctx.started.elapsed().as_millis() as u64),
            };
            let record = StepRecord::failure(
                error_value,
                Some(Cause::String(message.clone())),
                meta,
            );
            self.core.sink.emit(EventKind::StepComplete {
                step_id: ctx.id.to_string(),
                key: key.clone(),
                record: record.clone(),
            });
            self.core
                .hooks
                .after_step(key, StepReport::Record(record))
                .await;
        }

        Err(Halt {
            kind: HaltKind::Unexpected {
                error,
                cause: Some(Cause::String(message)),
            },
        })
    }

    // =========================================================================
    // Attempt drivers
    // =========================================================================

    /// Drive one attempt under an optional per-attempt deadline.
    ///
    /// Workflow cancellation preempts the deadline; the deadline aborts the
    /// op by cancelling `child` (when the op subscribed) and dropping the
    /// future.
    async fn attempt_timed<T>(
        &self,
        id: &str,
        key: &Option<String>,
        attempt: u32,
        limit: Duration,
        fut: impl Future<Output = Outcome<T, E>>,
        child: Option<CancellationToken>,
    ) -> Attempt<T, E> {
        tokio::select! {
            biased;
            _ = self.core.cancel.cancelled() => {
                if let Some(child) = &child {
                    child.cancel();
                }
                Attempt::Cancelled
            }
            driven = drive(fut) => match driven {
                Driven::Done(Outcome::Ok(v)) => Attempt::Success(v),
                Driven::Done(Outcome::Err(f)) => Attempt::Failed {
                    error: f.error,
                    cause: f.cause,
                    origin: FailureOrigin::Returned,
                },
                Driven::Panicked(message) => Attempt::Panicked { message },
            },
            _ = tokio::time::sleep(limit) => {
                if let Some(child) = &child {
                    child.cancel();
                }
                let info = StepTimeout {
                    step_id: id.to_string(),
                    step_key: key.clone(),
                    timeout_ms: limit.as_millis() as u64,
                    attempt,
                };
                self.core.sink.emit(EventKind::StepTimeout {
                    step_id: id.to_string(),
                    timeout_ms: info.timeout_ms,
                    attempt,
                });
                Attempt::TimedOut(info)
            }
        }
    }

    async fn attempt_once<T>(
        &self,
        id: &str,
        key: &Option<String>,
        attempt: u32,
        timeout: Option<Duration>,
        fut: impl Future<Output = Outcome<T, E>>,
    ) -> Attempt<T, E> {
        match timeout {
            None => match drive(fut).await {
                Driven::Done(Outcome::Ok(v)) => Attempt::Success(v),
                Driven::Done(Outcome::Err(f)) => Attempt::Failed {
                    error: f.error,
                    cause: f.cause,
                    origin: FailureOrigin::Returned,
                },
                Driven::Panicked(message) => Attempt::Panicked { message },
            },
            Some(limit) => self.attempt_timed(id, key, attempt, limit, fut, None).await,
        }
    }

    // =========================================================================
    // Step surface
    // =========================================================================

    /// Run a Result-returning op; unwrap the value or halt the workflow.
    ///
    /// The op is a thunk so replayed steps never execute it; a ready
    /// [`Outcome`] is passed as `|| async move { outcome }`.
    pub async fn run<T, E2, F, Fut>(&self, id: &str, op: F) -> Result<T, Halt<E>>
    where
        T: Serialize + DeserializeOwned,
        E2: Into<E>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T, E2>>,
    {
        self.run_with(id, StepOptions::new(), op).await
    }

    /// [`Step::run`] with explicit options
    pub async fn run_with<T, E2, F, Fut>(
        &self,
        id: &str,
        opts: StepOptions,
        op: F,
    ) -> Result<T, Halt<E>>
    where
        T: Serialize + DeserializeOwned,
        E2: Into<E>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T, E2>>,
    {
        match self.prepare::<T>(id, &opts).await? {
            Prepared::Replay(result) => result,
            Prepared::Fresh { key } => {
                let ctx = StepCtx {
                    id,
                    key,
                    ttl: opts.ttl,
                    attempts: 1,
                    started: Instant::now(),
                };
                let fut = async move { op().await.map_error(Into::into) };
                let attempt = self.attempt_once(id, &ctx.key, 1, None, fut).await;
                self.settle(ctx, attempt).await
            }
        }
    }

    /// Like [`Step::run`], mapping the op's error type into the workflow's
    pub async fn run_mapped<T, E2, F, Fut, M>(
        &self,
        id: &str,
        op: F,
        map_err: M,
    ) -> Result<T, Halt<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T, E2>>,
        M: FnOnce(E2) -> E,
    {
        match self.prepare::<T>(id, &StepOptions::new()).await? {
            Prepared::Replay(result) => result,
            Prepared::Fresh { key } => {
                let ctx = StepCtx {
                    id,
                    key,
                    ttl: None,
                    attempts: 1,
                    started: Instant::now(),
                };
                let attempt = match drive(op()).await {
                    Driven::Done(Outcome::Ok(v)) => Attempt::Success(v),
                    Driven::Done(Outcome::Err(f)) => Attempt::Failed {
                        error: map_err(f.error),
                        cause: f.cause,
                        origin: FailureOrigin::Returned,
                    },
                    Driven::Panicked(message) => Attempt::Panicked { message },
                };
                self.settle(ctx, attempt).await
            }
        }
    }

    /// Wrap an op with an untyped error channel, mapping its raw error to
    /// the workflow's typed error. The raw error's display form becomes the
    /// cause.
    pub async fn try_run<T, F, Fut, M>(&self, id: &str, op: F, on_error: M) -> Result<T, Halt<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
        M: FnOnce(&anyhow::Error) -> E,
    {
        match self.prepare::<T>(id, &StepOptions::new()).await? {
            Prepared::Replay(result) => result,
            Prepared::Fresh { key } => {
                let ctx = StepCtx {
                    id,
                    key,
                    ttl: None,
                    attempts: 1,
                    started: Instant::now(),
                };
                let settled = AssertUnwindSafe(op()).catch_unwind().await;
                let attempt = match settled {
                    Ok(Ok(v)) => Attempt::Success(v),
                    Ok(Err(raw)) => Attempt::Failed {
                        error: on_error(&raw),
                        cause: Some(Cause::String(format!("{raw:#}"))),
                        origin: FailureOrigin::Raw,
                    },
                    Err(payload) => Attempt::Panicked {
                        message: panic_message(payload.as_ref()),
                    },
                };
                self.settle(ctx, attempt).await
            }
        }
    }

    /// Run a step only when `cond` holds; a skipped step emits
    /// `step_skipped` and yields `None`
    pub async fn run_if<T, E2, F, Fut>(
        &self,
        id: &str,
        cond: bool,
        op: F,
    ) -> Result<Option<T>, Halt<E>>
    where
        T: Serialize + DeserializeOwned,
        E2: Into<E>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T, E2>>,
    {
        if !cond {
            self.register_id(id);
            self.core.sink.emit(EventKind::StepSkipped {
                step_id: id.to_string(),
            });
            return Ok(None);
        }
        self.run(id, op).await.map(Some)
    }

    /// Retry a Result op per the policy.
    ///
    /// `step_start` is emitted once for the logical step; each additional
    /// attempt is announced by `step_retry`, and exhaustion by a single
    /// `step_retries_exhausted` before the final failure surfaces.
    pub async fn retry<T, F, Fut>(
        &self,
        id: &str,
        policy: RetryPolicy<E>,
        op: F,
    ) -> Result<T, Halt<E>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
    {
        self.retry_with(id, StepOptions::new(), policy, op).await
    }

    /// [`Step::retry`] with explicit options
    pub async fn retry_with<T, F, Fut>(
        &self,
        id: &str,
        opts: StepOptions,
        policy: RetryPolicy<E>,
        op: F,
    ) -> Result<T, Halt<E>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
    {
        match self.prepare::<T>(id, &opts).await? {
            Prepared::Replay(result) => result,
            Prepared::Fresh { key } => {
                let attempts = policy.attempts.max(1);
                let started = Instant::now();
                let mut attempt_num = 1u32;

                loop {
                    let attempt = self
                        .attempt_once(id, &key, attempt_num, policy.timeout, op())
                        .await;

                    let is_final = match &attempt {
                        Attempt::Success(_) | Attempt::Cancelled => true,
                        Attempt::Failed { error, .. } => {
                            attempt_num >= attempts
                                || !policy.permits(RetryFailure::Error(error), attempt_num)
                        }
                        Attempt::Panicked { message } => {
                            attempt_num >= attempts
                                || !policy.permits(RetryFailure::Panic(message), attempt_num)
                        }
                        Attempt::TimedOut(info) => {
                            attempt_num >= attempts
                                || !policy.permits(RetryFailure::Timeout(info), attempt_num)
                        }
                    };

                    if is_final {
                        let failed =
                            !matches!(attempt, Attempt::Success(_) | Attempt::Cancelled);
                        if failed && attempts > 1 && attempt_num >= attempts {
                            self.core.sink.emit(EventKind::StepRetriesExhausted {
                                step_id: id.to_string(),
                                attempts,
                            });
                        }
                        let ctx = StepCtx {
                            id,
                            key,
                            ttl: opts.ttl,
                            attempts: attempt_num,
                            started,
                        };
                        return self.settle(ctx, attempt).await;
                    }

                    attempt_num += 1;
                    let delay = policy.delay_for_attempt(attempt_num);
                    self.core.sink.emit(EventKind::StepRetry {
                        step_id: id.to_string(),
                        attempt: attempt_num,
                        delay_ms: delay.as_millis() as u64,
                    });
                    policy.notify_retry(attempt_num);

                    tokio::select! {
                        biased;
                        _ = self.core.cancel.cancelled() => {
                            let ctx = StepCtx {
                                id,
                                key,
                                ttl: opts.ttl,
                                attempts: attempt_num,
                                started,
                            };
                            return self.settle(ctx, Attempt::Cancelled).await;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Time-bound an op; the deadline fails the step with [`StepTimeout`].
    ///
    /// The op receives a [`CancellationToken`] composed from the workflow
    /// signal: either a fired deadline or workflow cancellation cancels it.
    pub async fn with_timeout<T, E2, F, Fut>(
        &self,
        id: &str,
        limit: Duration,
        op: F,
    ) -> Result<T, Halt<E>>
    where
        T: Serialize + DeserializeOwned,
        E2: Into<E>,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome<T, E2>>,
    {
        match self.prepare::<T>(id, &StepOptions::new()).await? {
            Prepared::Replay(result) => result,
            Prepared::Fresh { key } => {
                let ctx = StepCtx {
                    id,
                    key,
                    ttl: None,
                    attempts: 1,
                    started: Instant::now(),
                };
                let child = self.core.cancel.child_token();
                let fut = op(child.clone());
                let attempt = self
                    .attempt_timed(
                        id,
                        &ctx.key,
                        1,
                        limit,
                        async move { fut.await.map_error(Into::into) },
                        Some(child),
                    )
                    .await;
                self.settle(ctx, attempt).await
            }
        }
    }

    /// Like [`Step::with_timeout`], but the deadline produces a custom typed
    /// error. The factory runs once per attempt; the timeout stays
    /// recognizable through the `step_timeout` event and the serialized
    /// [`StepTimeout`] recorded as the failure's cause.
    pub async fn with_timeout_or<T, E2, F, Fut, M>(
        &self,
        id: &str,
        limit: Duration,
        error: M,
        op: F,
    ) -> Result<T, Halt<E>>
    where
        T: Serialize + DeserializeOwned,
        E2: Into<E>,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome<T, E2>>,
        M: FnOnce(&StepTimeout) -> E,
    {
        match self.prepare::<T>(id, &StepOptions::new()).await? {
            Prepared::Replay(result) => result,
            Prepared::Fresh { key } => {
                let ctx = StepCtx {
                    id,
                    key,
                    ttl: None,
                    attempts: 1,
                    started: Instant::now(),
                };
                let child = self.core.cancel.child_token();
                let fut = op(child.clone());
                let attempt = self
                    .attempt_timed(
                        id,
                        &ctx.key,
                        1,
                        limit,
                        async move { fut.await.map_error(Into::into) },
                        Some(child),
                    )
                    .await;
                let attempt = match attempt {
                    Attempt::TimedOut(info) => Attempt::Failed {
                        error: error(&info),
                        cause: Some(to_event_value(&info)),
                        origin: FailureOrigin::Returned,
                    },
                    other => other,
                };
                self.settle(ctx, attempt).await
            }
        }
    }

    /// Time-bound an op, resolving the step as `Ok(None)` on deadline
    /// instead of failing it. Retries do not apply.
    pub async fn with_timeout_option<T, E2, F, Fut>(
        &self,
        id: &str,
        limit: Duration,
        op: F,
    ) -> Result<Option<T>, Halt<E>>
    where
        T: Serialize + DeserializeOwned,
        E2: Into<E>,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome<T, E2>>,
    {
        match self.prepare::<Option<T>>(id, &StepOptions::new()).await? {
            Prepared::Replay(result) => result,
            Prepared::Fresh { key } => {
                let ctx = StepCtx {
                    id,
                    key,
                    ttl: None,
                    attempts: 1,
                    started: Instant::now(),
                };
                let child = self.core.cancel.child_token();
                let fut = op(child.clone());
                let attempt = match self
                    .attempt_timed(
                        id,
                        &ctx.key,
                        1,
                        limit,
                        async move { fut.await.map_error(Into::into) },
                        Some(child),
                    )
                    .await
                {
                    Attempt::Success(v) => Attempt::Success(Some(v)),
                    Attempt::TimedOut(_) => Attempt::Success(None),
                    Attempt::Failed {
                        error,
                        cause,
                        origin,
                    } => Attempt::Failed {
                        error,
                        cause,
                        origin,
                    },
                    Attempt::Panicked { message } => Attempt::Panicked { message },
                    Attempt::Cancelled => Attempt::Cancelled,
                };
                self.settle(ctx, attempt).await
            }
        }
    }

    /// Time-bound an op, returning the timeout error immediately while the
    /// op continues on a background task. Whatever the background task
    /// eventually produces is observed by the runtime and discarded.
    pub async fn with_timeout_detach<T, E2, F, Fut>(
        &self,
        id: &str,
        limit: Duration,
        op: F,
    ) -> Result<T, Halt<E>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E2: Into<E> + Send + 'static,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome<T, E2>> + Send + 'static,
    {
        match self.prepare::<T>(id, &StepOptions::new()).await? {
            Prepared::Replay(result) => result,
            Prepared::Fresh { key } => {
                let ctx = StepCtx {
                    id,
                    key,
                    ttl: None,
                    attempts: 1,
                    started: Instant::now(),
                };
                let child = self.core.cancel.child_token();
                let mut handle = tokio::spawn(op(child.clone()));

                let attempt = tokio::select! {
                    biased;
                    _ = self.core.cancel.cancelled() => {
                        child.cancel();
                        Attempt::Cancelled
                    }
                    joined = &mut handle => match joined {
                        Ok(Outcome::Ok(v)) => Attempt::Success(v),
                        Ok(Outcome::Err(f)) => Attempt::Failed {
                            error: f.error.into(),
                            cause: f.cause,
                            origin: FailureOrigin::Returned,
                        },
                        Err(join_err) if join_err.is_panic() => Attempt::Panicked {
                            message: panic_message(join_err.into_panic().as_ref()),
                        },
                        Err(join_err) => Attempt::Panicked {
                            message: join_err.to_string(),
                        },
                    },
                    _ = tokio::time::sleep(limit) => {
                        // The op keeps running detached; dropping the handle
                        // discards whatever it eventually produces.
                        let info = StepTimeout {
                            step_id: id.to_string(),
                            step_key: ctx.key.clone(),
                            timeout_ms: limit.as_millis() as u64,
                            attempt: 1,
                        };
                        self.core.sink.emit(EventKind::StepTimeout {
                            step_id: id.to_string(),
                            timeout_ms: info.timeout_ms,
                            attempt: 1,
                        });
                        Attempt::TimedOut(info)
                    }
                };
                self.settle(ctx, attempt).await
            }
        }
    }

    /// Cancellation-aware delay, recorded like any other keyed step so a
    /// resumed run does not sleep again
    pub async fn sleep(&self, id: &str, duration: Duration) -> Result<(), Halt<E>> {
        match self.prepare::<()>(id, &StepOptions::new()).await? {
            Prepared::Replay(result) => result,
            Prepared::Fresh { key } => {
                let ctx = StepCtx {
                    id,
                    key,
                    ttl: None,
                    attempts: 1,
                    started: Instant::now(),
                };
                let attempt = tokio::select! {
                    biased;
                    _ = self.core.cancel.cancelled() => Attempt::Cancelled,
                    _ = tokio::time::sleep(duration) => Attempt::Success(()),
                };
                self.settle(ctx, attempt).await
            }
        }
    }
}
