//! The `Outcome` sum type and its combinators

use serde::{Deserialize, Serialize};

/// Untyped carrier for the underlying raw error or panic payload.
///
/// A cause travels with a failure through every combinator but is invisible
/// to the typed error channel. It is kept JSON-representable so it can be
/// persisted alongside step records.
pub type Cause = serde_json::Value;

/// The failure half of an [`Outcome`]: a typed error plus an optional cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure<E> {
    /// The typed error value
    pub error: E,

    /// Underlying raw error or panic payload, for debugging
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cause: Option<Cause>,
}

impl<E> Failure<E> {
    /// Create a failure without a cause
    pub fn new(error: E) -> Self {
        Self { error, cause: None }
    }

    /// Create a failure carrying a cause
    pub fn with_cause(error: E, cause: Cause) -> Self {
        Self {
            error,
            cause: Some(cause),
        }
    }

    /// Transform the typed error, preserving the cause
    pub fn map<F>(self, f: impl FnOnce(E) -> F) -> Failure<F> {
        Failure {
            error: f(self.error),
            cause: self.cause,
        }
    }
}

/// Typed success/failure value.
///
/// Every operation returning an `Outcome` produces exactly one variant.
/// `Err` never carries a success value; `Ok` never carries an error.
/// Equality is structural.
///
/// # Example
///
/// ```
/// use weft_core::Outcome;
///
/// fn parse(input: &str) -> Outcome<i32, String> {
///     match input.parse() {
///         Ok(n) => Outcome::ok(n),
///         Err(_) => Outcome::err(format!("not a number: {input}")),
///     }
/// }
///
/// assert!(parse("42").is_ok());
/// assert!(parse("nope").is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T, E> {
    /// Success carrying a value
    Ok(T),

    /// Failure carrying a typed error and optional cause
    Err(Failure<E>),
}

impl<T, E> Outcome<T, E> {
    /// Construct a success
    pub fn ok(value: T) -> Self {
        Self::Ok(value)
    }

    /// Construct a failure without a cause
    pub fn err(error: E) -> Self {
        Self::Err(Failure::new(error))
    }

    /// Construct a failure carrying a cause
    pub fn err_with_cause(error: E, cause: Cause) -> Self {
        Self::Err(Failure::with_cause(error, cause))
    }

    /// True if this is the `Ok` variant
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// True if this is the `Err` variant
    pub fn is_err(&self) -> bool {
        matches!(self, Self::Err(_))
    }

    /// Consume, returning the success value if present
    pub fn value(self) -> Option<T> {
        match self {
            Self::Ok(v) => Some(v),
            Self::Err(_) => None,
        }
    }

    /// Consume, returning the failure if present
    pub fn failure(self) -> Option<Failure<E>> {
        match self {
            Self::Ok(_) => None,
            Self::Err(f) => Some(f),
        }
    }

    /// Borrow the success value if present
    pub fn value_ref(&self) -> Option<&T> {
        match self {
            Self::Ok(v) => Some(v),
            Self::Err(_) => None,
        }
    }

    /// Borrow the failure if present
    pub fn failure_ref(&self) -> Option<&Failure<E>> {
        match self {
            Self::Ok(_) => None,
            Self::Err(f) => Some(f),
        }
    }

    /// Convert into a standard `Result`, keeping the cause on the error side
    pub fn into_result(self) -> Result<T, Failure<E>> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Err(f) => Err(f),
        }
    }

    /// Build from a standard `Result` (no cause on the error side)
    pub fn from_result(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => Self::Ok(v),
            Err(e) => Self::err(e),
        }
    }

    /// Transform the success value; failures pass through preserving cause
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U, E> {
        match self {
            Self::Ok(v) => Outcome::Ok(f(v)),
            Self::Err(e) => Outcome::Err(e),
        }
    }

    /// Transform the typed error; successes pass through
    pub fn map_error<F>(self, f: impl FnOnce(E) -> F) -> Outcome<T, F> {
        match self {
            Self::Ok(v) => Outcome::Ok(v),
            Self::Err(e) => Outcome::Err(e.map(f)),
        }
    }

    /// Monadic bind: chain a further computation off a success
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Outcome<U, E>) -> Outcome<U, E> {
        match self {
            Self::Ok(v) => f(v),
            Self::Err(e) => Outcome::Err(e),
        }
    }

    /// Recover from a failure with a new outcome; successes pass through
    pub fn or_else<F>(self, f: impl FnOnce(Failure<E>) -> Outcome<T, F>) -> Outcome<T, F> {
        match self {
            Self::Ok(v) => Outcome::Ok(v),
            Self::Err(e) => f(e),
        }
    }

    /// Total recovery to a raw value, always yielding `Ok`
    pub fn recover(self, f: impl FnOnce(Failure<E>) -> T) -> Outcome<T, E> {
        match self {
            Self::Ok(v) => Outcome::Ok(v),
            Self::Err(e) => Outcome::Ok(f(e)),
        }
    }

    /// Simultaneous transform of both channels
    pub fn bimap<U, F>(
        self,
        on_ok: impl FnOnce(T) -> U,
        on_err: impl FnOnce(E) -> F,
    ) -> Outcome<U, F> {
        match self {
            Self::Ok(v) => Outcome::Ok(on_ok(v)),
            Self::Err(e) => Outcome::Err(e.map(on_err)),
        }
    }

    /// Exhaustive handler; the only combinator that escapes the type
    pub fn fold<R>(self, on_ok: impl FnOnce(T) -> R, on_err: impl FnOnce(Failure<E>) -> R) -> R {
        match self {
            Self::Ok(v) => on_ok(v),
            Self::Err(e) => on_err(e),
        }
    }

    /// Observe the success value without changing the outcome
    pub fn tap(self, f: impl FnOnce(&T)) -> Self {
        if let Self::Ok(v) = &self {
            f(v);
        }
        self
    }

    /// Observe the failure without changing the outcome
    pub fn tap_error(self, f: impl FnOnce(&Failure<E>)) -> Self {
        if let Self::Err(e) = &self {
            f(e);
        }
        self
    }

    /// Fallible transform of the success value.
    ///
    /// The transform's own error is turned into the typed error via `on_err`,
    /// with its display form recorded as the cause.
    pub fn map_try<U, X>(
        self,
        f: impl FnOnce(T) -> Result<U, X>,
        on_err: impl FnOnce(X) -> E,
    ) -> Outcome<U, E>
    where
        X: std::fmt::Display,
    {
        match self {
            Self::Ok(v) => match f(v) {
                Ok(u) => Outcome::Ok(u),
                Err(x) => {
                    let cause = Cause::String(x.to_string());
                    Outcome::err_with_cause(on_err(x), cause)
                }
            },
            Self::Err(e) => Outcome::Err(e),
        }
    }

    /// Fallible transform of the typed error.
    ///
    /// If the transform itself fails, `on_err` supplies the replacement error
    /// and the transform failure becomes the cause.
    pub fn map_error_try<F, X>(
        self,
        f: impl FnOnce(E) -> Result<F, X>,
        on_err: impl FnOnce(X) -> F,
    ) -> Outcome<T, F>
    where
        X: std::fmt::Display,
    {
        match self {
            Self::Ok(v) => Outcome::Ok(v),
            Self::Err(failure) => match f(failure.error) {
                Ok(mapped) => Outcome::Err(Failure {
                    error: mapped,
                    cause: failure.cause,
                }),
                Err(x) => {
                    let cause = Cause::String(x.to_string());
                    Outcome::err_with_cause(on_err(x), cause)
                }
            },
        }
    }
}

impl<T, E> From<Result<T, E>> for Outcome<T, E> {
    fn from(result: Result<T, E>) -> Self {
        Self::from_result(result)
    }
}
