//! Durable coordinator behavior: resume, locking, versioning, finalize

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{init_tracing, EventLog};
use weft_core::Outcome;
use weft_durable::{
    has_state, run_durable, CancelSignal, ConcurrencyScope, DurableOptions, EventKind,
    InMemorySnapshotStore, ListQuery, RunStatus, SnapshotStore, SnapshotSummary, Step,
    StepOptions, StoreError, VersionDecision, WorkflowError, WorkflowSnapshot,
};

/// Workflow under test: step `one` succeeds, step `two` fails unless
/// `healthy` is set
struct TwoStep {
    store: Arc<InMemorySnapshotStore>,
    one_calls: Arc<AtomicU32>,
    two_calls: Arc<AtomicU32>,
    healthy: bool,
}

impl TwoStep {
    fn new(store: Arc<InMemorySnapshotStore>) -> Self {
        Self {
            store,
            one_calls: Arc::new(AtomicU32::new(0)),
            two_calls: Arc::new(AtomicU32::new(0)),
            healthy: false,
        }
    }

    fn healthy(mut self) -> Self {
        self.healthy = true;
        self
    }

    async fn run(&self, id: &str, log: &EventLog) -> Outcome<i32, WorkflowError<String>> {
        let one_calls = self.one_calls.clone();
        let two_calls = self.two_calls.clone();
        let healthy = self.healthy;

        run_durable(
            DurableOptions::new(id)
                .with_store(self.store.clone())
                .on_event(log.observer()),
            |step| async move {
                let one = step
                    .run("one", move || async move {
                        one_calls.fetch_add(1, Ordering::SeqCst);
                        Outcome::<i32, String>::ok(10)
                    })
                    .await?;
                let two = step
                    .run("two", move || async move {
                        two_calls.fetch_add(1, Ordering::SeqCst);
                        if healthy {
                            Outcome::<i32, String>::ok(32)
                        } else {
                            Outcome::err("SERVICE_DOWN".to_string())
                        }
                    })
                    .await?;
                Ok(one + two)
            },
        )
        .await
    }
}

#[tokio::test]
async fn test_success_deletes_snapshot() {
    init_tracing();
    let store = Arc::new(InMemorySnapshotStore::new());
    let log = EventLog::new();

    let workflow = TwoStep::new(store.clone()).healthy();
    let result = workflow.run("resume-success", &log).await;

    assert_eq!(result.value(), Some(42));
    assert!(!has_state(store.as_ref(), "resume-success").await.unwrap());
}

#[tokio::test]
async fn test_failure_preserves_completed_prefix() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let log = EventLog::new();

    let workflow = TwoStep::new(store.clone());
    let result = workflow.run("resume-fail", &log).await;

    assert_eq!(
        result.failure().unwrap().error.step_error(),
        Some(&"SERVICE_DOWN".to_string())
    );
    assert!(has_state(store.as_ref(), "resume-fail").await.unwrap());

    let snapshot = store.load("resume-fail").await.unwrap().unwrap();
    assert!(snapshot.steps.contains_key("one"));
    assert!(!snapshot.steps.contains_key("two"));
    assert_eq!(snapshot.execution.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_resume_replays_completed_steps_without_invoking_ops() {
    let store = Arc::new(InMemorySnapshotStore::new());

    let first = TwoStep::new(store.clone());
    let _ = first.run("resume-skip", &EventLog::new()).await;
    assert_eq!(first.one_calls.load(Ordering::SeqCst), 1);

    // Second run: step one replays from the snapshot, step two runs again.
    let log = EventLog::new();
    let second = TwoStep::new(store.clone());
    let result = second.run("resume-skip", &log).await;

    assert_eq!(second.one_calls.load(Ordering::SeqCst), 0);
    assert_eq!(second.two_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        result.failure().unwrap().error.step_error(),
        Some(&"SERVICE_DOWN".to_string())
    );
    assert_eq!(
        log.count(|k| matches!(k, EventKind::StepCacheHit { key, .. } if key == "one")),
        1
    );

    // Fixing the dependency completes the run and clears the state.
    let third = TwoStep::new(store.clone()).healthy();
    let result = third.run("resume-skip", &EventLog::new()).await;
    assert_eq!(third.one_calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.value(), Some(42));
    assert!(!has_state(store.as_ref(), "resume-skip").await.unwrap());
}

#[tokio::test]
async fn test_explicit_key_overrides_step_id_for_memoization() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let fetch_calls = Arc::new(AtomicU32::new(0));

    let body = |calls: Arc<AtomicU32>| {
        move |step: Step<String>| async move {
            let value = step
                .run_with("fetch", StepOptions::new().with_key("fetch:v2"), {
                    let calls = calls.clone();
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Outcome::<i32, String>::ok(40)
                    }
                })
                .await?;
            step.run("always-fails", || async {
                Outcome::<i32, String>::err("SERVICE_DOWN".to_string())
            })
            .await?;
            Ok(value)
        }
    };

    let first = run_durable(
        DurableOptions::new("keyed-override").with_store(store.clone()),
        body(fetch_calls.clone()),
    )
    .await;
    assert!(first.is_err());
    assert_eq!(fetch_calls.load(Ordering::SeqCst), 1);

    // The outcome is memoized under the override key, not the step id.
    let snapshot = store.load("keyed-override").await.unwrap().unwrap();
    assert!(snapshot.steps.contains_key("fetch:v2"));
    assert!(!snapshot.steps.contains_key("fetch"));

    let log = EventLog::new();
    let second = run_durable(
        DurableOptions::new("keyed-override")
            .with_store(store.clone())
            .on_event(log.observer()),
        body(fetch_calls.clone()),
    )
    .await;
    assert!(second.is_err());

    // Resume replays through the override key; the op does not run again.
    assert_eq!(fetch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        log.count(|k| matches!(k, EventKind::StepCacheHit { key, .. } if key == "fetch:v2")),
        1
    );
}

#[tokio::test]
async fn test_transient_steps_execute_every_run_and_are_not_persisted() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let probe_calls = Arc::new(AtomicU32::new(0));

    let body = |calls: Arc<AtomicU32>| {
        move |step: Step<String>| async move {
            let anchor = step
                .run("anchor", || async { Outcome::<i32, String>::ok(1) })
                .await?;
            step.run_with("probe", StepOptions::new().transient(), {
                let calls = calls.clone();
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Outcome::<i32, String>::ok(2)
                }
            })
            .await?;
            step.run("always-fails", || async {
                Outcome::<i32, String>::err("SERVICE_DOWN".to_string())
            })
            .await?;
            Ok(anchor)
        }
    };

    let first = run_durable(
        DurableOptions::new("transient-step").with_store(store.clone()),
        body(probe_calls.clone()),
    )
    .await;
    assert!(first.is_err());
    assert_eq!(probe_calls.load(Ordering::SeqCst), 1);

    // The keyed sibling is persisted; the transient step never is.
    let snapshot = store.load("transient-step").await.unwrap().unwrap();
    assert!(snapshot.steps.contains_key("anchor"));
    assert!(!snapshot.steps.contains_key("probe"));

    let second = run_durable(
        DurableOptions::new("transient-step").with_store(store.clone()),
        body(probe_calls.clone()),
    )
    .await;
    assert!(second.is_err());

    // The anchor replayed, but the transient step executed again.
    assert_eq!(probe_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_version_gate_rejects_by_default() {
    let store = Arc::new(InMemorySnapshotStore::new());

    let first = TwoStep::new(store.clone());
    let _ = first.run("versioned", &EventLog::new()).await;
    let before = store.load("versioned").await.unwrap().unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let op_calls = calls.clone();
    let result = run_durable(
        DurableOptions::new("versioned")
            .with_store(store.clone())
            .with_version(2),
        |step: Step<String>| async move {
            let value = step
                .run("one", move || async move {
                    op_calls.fetch_add(1, Ordering::SeqCst);
                    Outcome::<i32, String>::ok(1)
                })
                .await?;
            Ok(value)
        },
    )
    .await;

    match &result.failure().unwrap().error {
        WorkflowError::VersionMismatch(mismatch) => {
            assert_eq!(mismatch.stored_version, 1);
            assert_eq!(mismatch.requested_version, 2);
            assert_eq!(mismatch.workflow_id, "versioned");
        }
        other => panic!("expected version mismatch, got {other:?}"),
    }

    // No step ran, and the snapshot is untouched.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let after = store.load("versioned").await.unwrap().unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_version_mismatch_clear_starts_fresh() {
    let store = Arc::new(InMemorySnapshotStore::new());

    let first = TwoStep::new(store.clone());
    let _ = first.run("versioned-clear", &EventLog::new()).await;

    let second = Arc::new(AtomicU32::new(0));
    let op_calls = second.clone();
    let result = run_durable(
        DurableOptions::new("versioned-clear")
            .with_store(store.clone())
            .with_version(2)
            .on_version_mismatch(|_, _| VersionDecision::Clear),
        |step: Step<String>| async move {
            let value = step
                .run("one", move || async move {
                    op_calls.fetch_add(1, Ordering::SeqCst);
                    Outcome::<i32, String>::ok(5)
                })
                .await?;
            Ok(value)
        },
    )
    .await;

    assert_eq!(result.value(), Some(5));
    // The old snapshot was cleared, so step one executed again.
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_version_mismatch_migrate_keeps_steps_and_rewrites_version() {
    let store = Arc::new(InMemorySnapshotStore::new());

    let first = TwoStep::new(store.clone());
    let _ = first.run("versioned-migrate", &EventLog::new()).await;

    let workflow = TwoStep::new(store.clone());
    let one_calls = workflow.one_calls.clone();
    let two_calls = workflow.two_calls.clone();
    let result = run_durable(
        DurableOptions::new("versioned-migrate")
            .with_store(store.clone())
            .with_version(2)
            .on_version_mismatch(|_, _| {
                // Carry the old steps forward unchanged.
                VersionDecision::Migrate(WorkflowSnapshot::new("versioned-migrate", 1))
            }),
        |step: weft_durable::Step<String>| async move {
            let one = step
                .run("one", move || async move {
                    one_calls.fetch_add(1, Ordering::SeqCst);
                    Outcome::<i32, String>::ok(10)
                })
                .await?;
            let two = step
                .run("two", move || async move {
                    two_calls.fetch_add(1, Ordering::SeqCst);
                    Outcome::<i32, String>::err("SERVICE_DOWN".to_string())
                })
                .await?;
            Ok(one + two)
        },
    )
    .await;

    assert!(result.is_err());
    // The migrated (empty) snapshot forced step one to run again, and the
    // failed run persisted under the requested version.
    assert_eq!(workflow.one_calls.load(Ordering::SeqCst), 1);
    let after = store.load("versioned-migrate").await.unwrap().unwrap();
    assert_eq!(after.stored_version(), 2);
}

#[tokio::test]
async fn test_in_process_concurrency_is_rejected() {
    let store = Arc::new(InMemorySnapshotStore::new());

    let slow = run_durable(
        DurableOptions::<String>::new("concurrent-in-process").with_store(store.clone()),
        |step| async move {
            step.sleep("hold", Duration::from_millis(100)).await?;
            Ok(1)
        },
    );

    let contender = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        run_durable(
            DurableOptions::<String>::new("concurrent-in-process").with_store(store.clone()),
            |step| async move {
                step.sleep("hold", Duration::from_millis(1)).await?;
                Ok(2)
            },
        )
        .await
    };

    let (first, second) = tokio::join!(slow, contender);
    assert_eq!(first.value(), Some(1));

    match &second.failure().unwrap().error {
        WorkflowError::ConcurrentExecution(concurrent) => {
            assert_eq!(concurrent.reason, ConcurrencyScope::InProcess);
        }
        other => panic!("expected concurrent execution, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cross_process_lock_is_respected() {
    let store = Arc::new(InMemorySnapshotStore::new());

    // Another "process" holds the advisory lock.
    let foreign = store.try_acquire("concurrent-cross").await.unwrap();
    assert!(matches!(foreign, weft_durable::LockAcquire::Acquired(_)));

    let result = run_durable(
        DurableOptions::<String>::new("concurrent-cross").with_store(store.clone()),
        |step| async move {
            step.sleep("hold", Duration::from_millis(1)).await?;
            Ok(1)
        },
    )
    .await;

    match &result.failure().unwrap().error {
        WorkflowError::ConcurrentExecution(concurrent) => {
            assert_eq!(concurrent.reason, ConcurrencyScope::CrossProcess);
        }
        other => panic!("expected concurrent execution, got {other:?}"),
    }
}

#[tokio::test]
async fn test_allow_concurrent_skips_guards() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let _foreign = store.try_acquire("concurrent-allowed").await.unwrap();

    let result = run_durable(
        DurableOptions::<String>::new("concurrent-allowed")
            .with_store(store.clone())
            .allow_concurrent(),
        |step| async move {
            step.sleep("hold", Duration::from_millis(1)).await?;
            Ok(1)
        },
    )
    .await;

    assert_eq!(result.value(), Some(1));
}

/// Store whose saves always fail; loads and deletes pass through
struct SaveFailsStore {
    inner: InMemorySnapshotStore,
}

#[async_trait]
impl SnapshotStore for SaveFailsStore {
    async fn save(&self, _id: &str, _snapshot: &WorkflowSnapshot) -> Result<(), StoreError> {
        Err(StoreError::Backend("disk full".to_string()))
    }

    async fn load(&self, id: &str) -> Result<Option<WorkflowSnapshot>, StoreError> {
        self.inner.load(id).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn list(&self, query: ListQuery) -> Result<Vec<SnapshotSummary>, StoreError> {
        self.inner.list(query).await
    }
}

#[tokio::test]
async fn test_persist_errors_do_not_fail_the_workflow() {
    let store = Arc::new(SaveFailsStore {
        inner: InMemorySnapshotStore::new(),
    });
    let log = EventLog::new();

    let result = run_durable(
        DurableOptions::<String>::new("persist-tolerant")
            .with_store(store)
            .on_event(log.observer()),
        |step| async move {
            let a = step
                .run("one", || async { Outcome::<i32, String>::ok(1) })
                .await?;
            let b = step
                .run("two", || async { Outcome::<i32, String>::ok(2) })
                .await?;
            Ok(a + b)
        },
    )
    .await;

    assert_eq!(result.value(), Some(3));
    assert_eq!(log.count(|k| matches!(k, EventKind::PersistError { .. })), 2);
    assert_eq!(
        log.count(|k| matches!(k, EventKind::PersistSuccess { .. })),
        0
    );
}

#[tokio::test]
async fn test_cancellation_preserves_snapshot_with_reason() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let signal = CancelSignal::new();

    let canceller = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel("deploy rollout");
    });

    let result = run_durable(
        DurableOptions::<String>::new("cancelled-run")
            .with_store(store.clone())
            .with_cancel(signal),
        |step| async move {
            let one = step
                .run("one", || async { Outcome::<i32, String>::ok(10) })
                .await?;
            step.sleep("long-pause", Duration::from_secs(60)).await?;
            Ok(one)
        },
    )
    .await;

    match &result.failure().unwrap().error {
        WorkflowError::Cancelled(cancelled) => {
            assert_eq!(cancelled.reason.as_deref(), Some("deploy rollout"));
            assert_eq!(cancelled.last_step_key.as_deref(), Some("long-pause"));
        }
        other => panic!("expected cancellation, got {other:?}"),
    }

    let snapshot = store.load("cancelled-run").await.unwrap().unwrap();
    assert_eq!(snapshot.execution.status, RunStatus::Cancelled);
    assert!(snapshot.steps.contains_key("one"));
}

#[tokio::test]
async fn test_lock_released_after_run() {
    let store = Arc::new(InMemorySnapshotStore::new());

    let result = run_durable(
        DurableOptions::<String>::new("lock-release").with_store(store.clone()),
        |step| async move {
            step.sleep("hold", Duration::from_millis(1)).await?;
            Ok(1)
        },
    )
    .await;
    assert_eq!(result.value(), Some(1));
    assert!(!store.is_locked("lock-release"));

    // A later run can take the lock again.
    let again = run_durable(
        DurableOptions::<String>::new("lock-release").with_store(store.clone()),
        |step| async move {
            step.sleep("hold", Duration::from_millis(1)).await?;
            Ok(2)
        },
    )
    .await;
    assert_eq!(again.value(), Some(2));
}
