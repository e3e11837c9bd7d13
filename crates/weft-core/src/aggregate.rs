//! Synchronous aggregators over collections of outcomes
//!
//! Fail-fast (`all`, `any`, `zip`) and collect-all (`all_settled`,
//! `partition`) are distinct named operators rather than overloaded flags:
//! their error shapes are fundamentally different (`E` vs `Vec<Failure<E>>`).

use serde::{Deserialize, Serialize};

use crate::outcome::{Failure, Outcome};

/// Error produced by [`any`] when no input succeeded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnyError<E> {
    /// No inputs were provided
    EmptyInput,

    /// Every input failed; carries the first failure in input order
    Failed { error: E },
}

/// Result of [`partition`]: inputs split by variant, input order preserved
#[derive(Debug, Clone, PartialEq)]
pub struct Partitioned<T, E> {
    pub values: Vec<T>,
    pub errors: Vec<Failure<E>>,
}

/// Fail-fast conjunction: the first `Err` in input order wins.
///
/// Empty input yields `Ok(vec![])`.
pub fn all<T, E>(results: impl IntoIterator<Item = Outcome<T, E>>) -> Outcome<Vec<T>, E> {
    let iter = results.into_iter();
    let mut values = Vec::with_capacity(iter.size_hint().0);

    for result in iter {
        match result {
            Outcome::Ok(v) => values.push(v),
            Outcome::Err(f) => return Outcome::Err(f),
        }
    }

    Outcome::Ok(values)
}

/// First `Ok` in input order wins.
///
/// If every input failed, returns the first failure in input order. Empty
/// input yields [`AnyError::EmptyInput`].
pub fn any<T, E>(results: impl IntoIterator<Item = Outcome<T, E>>) -> Outcome<T, AnyError<E>> {
    let mut first_failure: Option<Failure<E>> = None;

    for result in results {
        match result {
            Outcome::Ok(v) => return Outcome::Ok(v),
            Outcome::Err(f) => {
                if first_failure.is_none() {
                    first_failure = Some(f);
                }
            }
        }
    }

    match first_failure {
        Some(f) => Outcome::Err(Failure {
            error: AnyError::Failed { error: f.error },
            cause: f.cause,
        }),
        None => Outcome::err(AnyError::EmptyInput),
    }
}

/// Collect-all conjunction: `Ok(values)` iff every input is `Ok`; otherwise
/// every failure, in input order.
pub fn all_settled<T, E>(
    results: impl IntoIterator<Item = Outcome<T, E>>,
) -> Outcome<Vec<T>, Vec<Failure<E>>> {
    let mut values = Vec::new();
    let mut errors = Vec::new();

    for result in results {
        match result {
            Outcome::Ok(v) => values.push(v),
            Outcome::Err(f) => errors.push(f),
        }
    }

    if errors.is_empty() {
        Outcome::Ok(values)
    } else {
        Outcome::err(errors)
    }
}

/// Split inputs into successes and failures, both preserving input order
pub fn partition<T, E>(results: impl IntoIterator<Item = Outcome<T, E>>) -> Partitioned<T, E> {
    let mut values = Vec::new();
    let mut errors = Vec::new();

    for result in results {
        match result {
            Outcome::Ok(v) => values.push(v),
            Outcome::Err(f) => errors.push(f),
        }
    }

    Partitioned { values, errors }
}

/// Tuple form of [`all`] for exactly two inputs; `a`'s failure wins over `b`'s
pub fn zip<A, B, E>(a: Outcome<A, E>, b: Outcome<B, E>) -> Outcome<(A, B), E> {
    match (a, b) {
        (Outcome::Ok(a), Outcome::Ok(b)) => Outcome::Ok((a, b)),
        (Outcome::Err(f), _) => Outcome::Err(f),
        (_, Outcome::Err(f)) => Outcome::Err(f),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_all_collects_in_order() {
        let r = all(vec![
            Outcome::<i32, &str>::ok(1),
            Outcome::ok(2),
            Outcome::ok(3),
        ]);
        assert_eq!(r, Outcome::ok(vec![1, 2, 3]));
    }

    #[test]
    fn test_all_first_error_by_input_order_wins() {
        let r = all(vec![
            Outcome::<i32, &str>::ok(1),
            Outcome::err("a"),
            Outcome::ok(3),
            Outcome::err("b"),
        ]);
        assert_eq!(r.failure().unwrap().error, "a");
    }

    #[test]
    fn test_all_empty_is_ok() {
        let r: Outcome<Vec<i32>, &str> = all(Vec::new());
        assert_eq!(r, Outcome::ok(vec![]));
    }

    #[test]
    fn test_all_preserves_cause() {
        let r = all(vec![
            Outcome::<i32, &str>::ok(1),
            Outcome::err_with_cause("a", json!("deep")),
        ]);
        assert_eq!(r.failure().unwrap().cause, Some(json!("deep")));
    }

    #[test]
    fn test_any_first_ok_by_input_order() {
        let r = any(vec![
            Outcome::<i32, &str>::err("a"),
            Outcome::ok(1),
            Outcome::ok(2),
        ]);
        assert_eq!(r.value(), Some(1));
    }

    #[test]
    fn test_any_all_err_returns_first() {
        let r: Outcome<i32, _> = any(vec![
            Outcome::<i32, &str>::err("a"),
            Outcome::err("b"),
        ]);
        assert_eq!(
            r.failure().unwrap().error,
            AnyError::Failed { error: "a" }
        );
    }

    #[test]
    fn test_any_empty_input() {
        let r: Outcome<i32, AnyError<&str>> = any(Vec::new());
        assert_eq!(r.failure().unwrap().error, AnyError::EmptyInput);
    }

    #[test]
    fn test_all_settled_success() {
        let r = all_settled(vec![Outcome::<i32, &str>::ok(1), Outcome::ok(2)]);
        assert_eq!(r, Outcome::ok(vec![1, 2]));
    }

    #[test]
    fn test_all_settled_collects_every_failure() {
        let r = all_settled(vec![
            Outcome::<i32, &str>::err("a"),
            Outcome::ok(1),
            Outcome::err_with_cause("b", json!(2)),
        ]);
        let errors = r.failure().unwrap().error;
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].error, "a");
        assert_eq!(errors[1].error, "b");
        assert_eq!(errors[1].cause, Some(json!(2)));
    }

    #[test]
    fn test_partition_preserves_order() {
        let split = partition(vec![
            Outcome::<i32, &str>::ok(1),
            Outcome::err("a"),
            Outcome::ok(2),
            Outcome::err("b"),
        ]);
        assert_eq!(split.values, vec![1, 2]);
        assert_eq!(split.errors[0].error, "a");
        assert_eq!(split.errors[1].error, "b");
    }

    #[test]
    fn test_zip_ok() {
        let r = zip(Outcome::<_, &str>::ok(1), Outcome::ok("x"));
        assert_eq!(r, Outcome::ok((1, "x")));
    }

    #[test]
    fn test_zip_left_failure_wins() {
        let r = zip(
            Outcome::<i32, &str>::err("left"),
            Outcome::<i32, &str>::err("right"),
        );
        assert_eq!(r.failure().unwrap().error, "left");
    }
}
