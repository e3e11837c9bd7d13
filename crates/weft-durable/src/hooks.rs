//! Seam between the step runtime and the durable coordinator
//!
//! The runtime never reads or writes snapshots; everything it needs from the
//! coordinator flows through [`RunHooks`]. An ephemeral run uses
//! [`NoopHooks`], which tracks nothing.

use async_trait::async_trait;

use crate::snapshot::StepRecord;

/// Decision for a keyed step about to start
#[derive(Debug, Clone)]
pub enum Replay {
    /// No memo table is in play; run the step, emit no cache events
    Untracked,

    /// The memo table was consulted and holds nothing for this key
    Miss,

    /// A prior outcome exists; replay it verbatim instead of running the op
    Cached(StepRecord),
}

/// What a keyed step produced, as reported to the coordinator
#[derive(Debug, Clone)]
pub enum StepReport {
    /// The outcome, ready to persist
    Record(StepRecord),

    /// The outcome could not be represented as JSON; record a warning
    /// instead of a step entry so the failure is visible rather than silent
    Lossy { reason: String },
}

/// Coordinator hooks installed into the step runtime
#[async_trait]
pub trait RunHooks: Send + Sync {
    /// Called before a keyed step starts
    async fn replay(&self, step_key: &str) -> Replay {
        let _ = step_key;
        Replay::Untracked
    }

    /// Called once at workflow entry
    async fn before_start(&self) {}

    /// Called after each keyed step settles, success or error.
    ///
    /// Awaited before the next keyed step begins, so persistent state always
    /// reflects a consistent prefix of the run.
    async fn after_step(&self, step_key: &str, report: StepReport) {
        let _ = (step_key, report);
    }
}

/// Hooks for ephemeral (non-durable) runs
pub struct NoopHooks;

#[async_trait]
impl RunHooks for NoopHooks {}
