//! Workflow cancellation signal

use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Cancellation signal for a workflow run.
///
/// Wraps a [`CancellationToken`] with a reason slot so the coordinator can
/// report *why* a run was cancelled. Cloning shares the underlying signal.
///
/// # Example
///
/// ```
/// use weft_durable::CancelSignal;
///
/// let signal = CancelSignal::new();
/// signal.cancel("operator requested shutdown");
///
/// assert!(signal.is_cancelled());
/// assert_eq!(signal.reason().as_deref(), Some("operator requested shutdown"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<RwLock<Option<String>>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal, recording a reason.
    ///
    /// The first reason wins; later calls are no-ops.
    pub fn cancel(&self, reason: impl Into<String>) {
        if !self.token.is_cancelled() {
            let mut slot = self.reason.write();
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason supplied at cancellation, if any
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Resolves when the signal fires.
    ///
    /// Intended for `tokio::select!` arms; resolves immediately if the
    /// signal has already fired.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Derive a per-op token that fires when either the workflow signal or
    /// the child itself is cancelled
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}
