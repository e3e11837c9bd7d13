//! # Weft Result Algebra
//!
//! The typed success/failure value used throughout the weft workflow engine.
//!
//! ## Features
//!
//! - **`Outcome<T, E>`**: a tagged sum of `Ok(T)` and `Err(Failure<E>)`, where
//!   the failure carries the typed error plus an untyped diagnostic `cause`
//! - **Combinators**: `map`, `and_then`, `or_else`, `fold` and friends, all
//!   pure and total
//! - **Aggregators**: fail-fast (`all`, `any`, `zip`) and collect-all
//!   (`all_settled`, `partition`) as distinct named operators, because their
//!   error shapes differ fundamentally
//! - **Async aggregators**: the same operators over futures, with panics
//!   captured as synthetic `TaskError::Panicked` failures
//!
//! ## Example
//!
//! ```
//! use weft_core::Outcome;
//!
//! let n: Outcome<i32, String> = Outcome::ok(2);
//! let doubled = n.map(|v| v * 2);
//! assert_eq!(doubled.value(), Some(4));
//! ```

pub mod aggregate;
pub mod future;
pub mod outcome;

pub use aggregate::{AnyError, Partitioned};
pub use future::{AnyAsyncError, TaskError};
pub use outcome::{Cause, Failure, Outcome};
