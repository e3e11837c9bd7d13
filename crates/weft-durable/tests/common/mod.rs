#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use weft_durable::{EventKind, RunEvent};

/// Collects emitted events for assertions
#[derive(Clone)]
pub struct EventLog(Arc<Mutex<Vec<RunEvent>>>);

impl EventLog {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn observer(&self) -> impl Fn(&RunEvent) + Send + Sync + 'static {
        let events = self.0.clone();
        move |event: &RunEvent| events.lock().push(event.clone())
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.0.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.0.lock().iter().map(|e| e.kind.clone()).collect()
    }

    pub fn count(&self, pred: impl Fn(&EventKind) -> bool) -> usize {
        self.0.lock().iter().filter(|e| pred(&e.kind)).count()
    }

    /// Position of the first event matching the predicate
    pub fn position(&self, pred: impl Fn(&EventKind) -> bool) -> Option<usize> {
        self.0.lock().iter().position(|e| pred(&e.kind))
    }
}

pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}
