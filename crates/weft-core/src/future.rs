//! Asynchronous aggregators over futures of outcomes
//!
//! Inputs are driven concurrently in completion order while results keep
//! their input-order slots. A panicking task is captured and normalized into
//! a synthetic [`TaskError::Panicked`] failure with the panic payload in the
//! outcome's cause, so aggregation never unwinds into the caller.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::outcome::{Cause, Failure, Outcome};

/// Failure of a single concurrently driven task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskError<E> {
    /// The task settled with a typed failure
    Failed { error: E },

    /// The task panicked; the payload also travels in the outcome cause
    Panicked { message: String },
}

/// Error produced by [`any_async`] when no task succeeded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnyAsyncError<E> {
    /// No inputs were provided
    EmptyInput,

    /// Every task failed; failures are in input order
    All { errors: Vec<Failure<TaskError<E>>> },
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

fn panicked<E>(payload: Box<dyn Any + Send>) -> Failure<TaskError<E>> {
    let message = panic_message(payload.as_ref());
    Failure {
        error: TaskError::Panicked {
            message: message.clone(),
        },
        cause: Some(Cause::String(message)),
    }
}

fn failed<E>(failure: Failure<E>) -> Failure<TaskError<E>> {
    Failure {
        error: TaskError::Failed {
            error: failure.error,
        },
        cause: failure.cause,
    }
}

type Settled<T, E> = Result<Outcome<T, E>, Box<dyn Any + Send>>;

fn indexed<T, E, F>(
    futures_in: impl IntoIterator<Item = F>,
) -> FuturesUnordered<impl Future<Output = (usize, Settled<T, E>)>>
where
    F: Future<Output = Outcome<T, E>>,
{
    futures_in
        .into_iter()
        .enumerate()
        .map(|(idx, fut)| async move { (idx, AssertUnwindSafe(fut).catch_unwind().await) })
        .collect()
}

/// Fail-fast conjunction over futures.
///
/// All inputs are polled concurrently; the first failure to settle (business
/// error or panic) settles the whole call **without awaiting the rest**:
/// the pending futures are dropped, which in Rust cancels them. Successes
/// land in their input-order slots. Empty input yields `Ok(vec![])`.
pub async fn all_async<T, E, F>(
    futures_in: impl IntoIterator<Item = F>,
) -> Outcome<Vec<T>, TaskError<E>>
where
    F: Future<Output = Outcome<T, E>>,
{
    let mut driver = indexed(futures_in);
    let mut slots: Vec<Option<T>> = Vec::new();
    slots.resize_with(driver.len(), || None);

    while let Some((idx, settled)) = driver.next().await {
        match settled {
            Ok(Outcome::Ok(v)) => slots[idx] = Some(v),
            Ok(Outcome::Err(f)) => return Outcome::Err(failed(f)),
            Err(payload) => return Outcome::Err(panicked(payload)),
        }
    }

    Outcome::Ok(slots.into_iter().map(|s| s.expect("slot filled")).collect())
}

/// First success wins, in settle order.
///
/// Resolves with the first task to settle `Ok`; the remaining futures are
/// dropped. If every task fails, resolves with all failures in input order.
/// Empty input yields [`AnyAsyncError::EmptyInput`].
pub async fn any_async<T, E, F>(
    futures_in: impl IntoIterator<Item = F>,
) -> Outcome<T, AnyAsyncError<E>>
where
    F: Future<Output = Outcome<T, E>>,
{
    let mut driver = indexed(futures_in);
    if driver.is_empty() {
        return Outcome::err(AnyAsyncError::EmptyInput);
    }

    let mut failures: Vec<Option<Failure<TaskError<E>>>> = Vec::new();
    failures.resize_with(driver.len(), || None);

    while let Some((idx, settled)) = driver.next().await {
        match settled {
            Ok(Outcome::Ok(v)) => return Outcome::Ok(v),
            Ok(Outcome::Err(f)) => failures[idx] = Some(failed(f)),
            Err(payload) => failures[idx] = Some(panicked(payload)),
        }
    }

    let errors = failures
        .into_iter()
        .map(|f| f.expect("slot filled"))
        .collect();
    Outcome::err(AnyAsyncError::All { errors })
}

/// Collect-all conjunction over futures: every input is awaited.
///
/// Yields `Ok(values)` iff every task succeeded; otherwise every failure in
/// input order.
pub async fn all_settled_async<T, E, F>(
    futures_in: impl IntoIterator<Item = F>,
) -> Outcome<Vec<T>, Vec<Failure<TaskError<E>>>>
where
    F: Future<Output = Outcome<T, E>>,
{
    let mut driver = indexed(futures_in);
    let mut slots: Vec<Option<Settled<T, E>>> = Vec::new();
    slots.resize_with(driver.len(), || None);

    while let Some((idx, settled)) = driver.next().await {
        slots[idx] = Some(settled);
    }

    let mut values = Vec::new();
    let mut errors = Vec::new();
    for settled in slots.into_iter().map(|s| s.expect("slot filled")) {
        match settled {
            Ok(Outcome::Ok(v)) => values.push(v),
            Ok(Outcome::Err(f)) => errors.push(failed(f)),
            Err(payload) => errors.push(panicked(payload)),
        }
    }

    if errors.is_empty() {
        Outcome::Ok(values)
    } else {
        Outcome::err(errors)
    }
}

/// Tuple form of [`all_settled_async`] for exactly two inputs.
///
/// Both sides are awaited (no fail-fast); the left failure wins over the
/// right when both fail.
pub async fn zip_async<A, B, E, FA, FB>(a: FA, b: FB) -> Outcome<(A, B), TaskError<E>>
where
    FA: Future<Output = Outcome<A, E>>,
    FB: Future<Output = Outcome<B, E>>,
{
    let (ra, rb) = futures::join!(
        AssertUnwindSafe(a).catch_unwind(),
        AssertUnwindSafe(b).catch_unwind()
    );

    let left = match ra {
        Ok(Outcome::Ok(v)) => Ok(v),
        Ok(Outcome::Err(f)) => Err(failed(f)),
        Err(payload) => Err(panicked(payload)),
    };
    let right = match rb {
        Ok(Outcome::Ok(v)) => Ok(v),
        Ok(Outcome::Err(f)) => Err(failed(f)),
        Err(payload) => Err(panicked(payload)),
    };

    match (left, right) {
        (Ok(a), Ok(b)) => Outcome::Ok((a, b)),
        (Err(f), _) => Outcome::Err(f),
        (_, Err(f)) => Outcome::Err(f),
    }
}
