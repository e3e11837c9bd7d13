//! Fan-out scopes
//!
//! `parallel`, `race` and `all_settled` bracket a region of the workflow
//! with `scope_start`/`scope_end` events. Scopes nest on a LIFO stack; a
//! race scope additionally records the step id of the first success
//! observed inside it as the winner.

use std::future::Future;
use std::time::Instant;

use uuid::Uuid;

use crate::event::{EventKind, ScopeKind};
use crate::runtime::RunCore;
use crate::step::Step;

/// One entry of the active-scope stack
pub(crate) struct ScopeFrame {
    pub(crate) scope_id: Uuid,
    pub(crate) kind: ScopeKind,
    pub(crate) winner_id: Option<String>,
}

/// Emits `scope_end` exactly once, even when the body unwinds
struct ScopeGuard<'a, E> {
    core: &'a RunCore<E>,
    scope_id: Uuid,
    kind: ScopeKind,
    name: String,
    started: Instant,
    armed: bool,
}

impl<E> ScopeGuard<'_, E> {
    fn finish(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        // Pop by scope_id, not position, to stay correct if frames were
        // pushed or popped out of order by a re-entrancy bug.
        let winner_id = {
            let mut scopes = self.core.scopes.lock();
            scopes
                .iter()
                .rposition(|frame| frame.scope_id == self.scope_id)
                .map(|idx| scopes.remove(idx).winner_id)
                .unwrap_or(None)
        };

        self.core.sink.emit(EventKind::ScopeEnd {
            scope_id: self.scope_id,
            kind: self.kind,
            name: self.name.clone(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            winner_id,
        });
    }
}

impl<E> Drop for ScopeGuard<'_, E> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl<E> Step<E> {
    /// Run a fan-out region under a named parallel scope.
    ///
    /// The body typically drives its branches with
    /// [`weft_core::future::all_async`], which settles on the first failure
    /// and drops the still-pending branches (their results are discarded).
    pub async fn parallel<R>(&self, name: &str, fut: impl Future<Output = R>) -> R {
        self.scoped(ScopeKind::Parallel, name, fut).await
    }

    /// Run a fan-out region under a named race scope.
    ///
    /// `scope_end` carries the step id of the first `step_success` observed
    /// inside this scope as `winner_id`.
    pub async fn race<R>(&self, name: &str, fut: impl Future<Output = R>) -> R {
        self.scoped(ScopeKind::Race, name, fut).await
    }

    /// Run a fan-out region under a named all-settled scope
    pub async fn all_settled<R>(&self, name: &str, fut: impl Future<Output = R>) -> R {
        self.scoped(ScopeKind::AllSettled, name, fut).await
    }

    async fn scoped<R>(&self, kind: ScopeKind, name: &str, fut: impl Future<Output = R>) -> R {
        let scope_id = Uuid::now_v7();
        self.core.scopes.lock().push(ScopeFrame {
            scope_id,
            kind,
            winner_id: None,
        });
        self.core.sink.emit(EventKind::ScopeStart {
            scope_id,
            kind,
            name: name.to_string(),
        });

        let mut guard = ScopeGuard {
            core: &self.core,
            scope_id,
            kind,
            name: name.to_string(),
            started: Instant::now(),
            armed: true,
        };

        let out = fut.await;
        guard.finish();
        out
    }
}
