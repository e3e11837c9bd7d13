//! Count-based backpressure controller
//!
//! Tracks a buffered-item count against a high-water mark and a low-water
//! mark with hysteresis: the controller pauses when the count reaches the
//! high mark and resumes only once it has drained to the low mark, so it
//! cannot oscillate between the two on every item.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Flow state of the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Below the marks; producers may write
    Flowing,

    /// At or above the high mark; producers should wait for drain
    Paused,
}

type TransitionObserver = Arc<dyn Fn(FlowState, usize) + Send + Sync>;

struct Inner {
    count: usize,
    state: FlowState,
}

/// Backpressure controller shared between a producer and a consumer
///
/// # Example
///
/// ```
/// use weft_durable::{FlowController, FlowState};
///
/// let flow = FlowController::new(4);
/// for _ in 0..4 {
///     flow.increment();
/// }
/// assert_eq!(flow.state(), FlowState::Paused);
/// ```
pub struct FlowController {
    high: usize,
    low: usize,
    inner: Mutex<Inner>,
    flowing_tx: watch::Sender<bool>,
    observer: Option<TransitionObserver>,
}

impl FlowController {
    /// Create a controller with the given high-water mark; the low-water
    /// mark defaults to half of it
    pub fn new(high_watermark: usize) -> Self {
        let high = high_watermark.max(1);
        let (flowing_tx, _) = watch::channel(true);
        Self {
            high,
            low: high / 2,
            inner: Mutex::new(Inner {
                count: 0,
                state: FlowState::Flowing,
            }),
            flowing_tx,
            observer: None,
        }
    }

    /// Override the low-water mark (clamped below the high mark)
    pub fn with_low_watermark(mut self, low: usize) -> Self {
        self.low = low.min(self.high.saturating_sub(1));
        self
    }

    /// Observe state transitions as `(new_state, count_at_transition)`
    pub fn on_transition(
        mut self,
        observer: impl Fn(FlowState, usize) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    pub fn state(&self) -> FlowState {
        self.inner.lock().state
    }

    pub fn high_watermark(&self) -> usize {
        self.high
    }

    pub fn low_watermark(&self) -> usize {
        self.low
    }

    /// Record one buffered item; returns the state after the update
    pub fn increment(&self) -> FlowState {
        self.update(|count| count.saturating_add(1))
    }

    /// Record one drained item; returns the state after the update
    pub fn decrement(&self) -> FlowState {
        self.update(|count| count.saturating_sub(1))
    }

    /// Set the count outright; negative values clamp to zero
    pub fn set_count(&self, count: i64) -> FlowState {
        self.update(|_| count.max(0) as usize)
    }

    /// Wait until the controller is flowing.
    ///
    /// Returns immediately when already flowing; otherwise resolves on the
    /// transition back to [`FlowState::Flowing`].
    pub async fn wait_for_drain(&self) {
        let mut rx = self.flowing_tx.subscribe();
        // The sender lives on self, so the channel cannot close under us.
        let _ = rx.wait_for(|flowing| *flowing).await;
    }

    fn update(&self, f: impl FnOnce(usize) -> usize) -> FlowState {
        let (state, transition) = {
            let mut inner = self.inner.lock();
            inner.count = f(inner.count);

            let next = match inner.state {
                FlowState::Flowing if inner.count >= self.high => FlowState::Paused,
                FlowState::Paused if inner.count <= self.low => FlowState::Flowing,
                current => current,
            };

            let transition = (next != inner.state).then_some((next, inner.count));
            inner.state = next;
            (next, transition)
        };

        if let Some((next, count)) = transition {
            self.flowing_tx.send_replace(next == FlowState::Flowing);
            if let Some(observer) = &self.observer {
                observer(next, count);
            }
        }

        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_flowing() {
        let flow = FlowController::new(10);
        assert_eq!(flow.state(), FlowState::Flowing);
        assert_eq!(flow.count(), 0);
        assert_eq!(flow.low_watermark(), 5);
    }

    #[test]
    fn test_pauses_at_high_watermark() {
        let flow = FlowController::new(3);
        flow.increment();
        flow.increment();
        assert_eq!(flow.state(), FlowState::Flowing);

        assert_eq!(flow.increment(), FlowState::Paused);
    }

    #[test]
    fn test_hysteresis_resumes_only_at_low_watermark() {
        let flow = FlowController::new(4).with_low_watermark(1);
        for _ in 0..4 {
            flow.increment();
        }
        assert_eq!(flow.state(), FlowState::Paused);

        // Between the marks: still paused.
        flow.decrement();
        flow.decrement();
        assert_eq!(flow.state(), FlowState::Paused);

        flow.decrement();
        assert_eq!(flow.state(), FlowState::Flowing);
    }

    #[test]
    fn test_set_count_clamps_negative() {
        let flow = FlowController::new(4);
        flow.set_count(-5);
        assert_eq!(flow.count(), 0);

        flow.set_count(9);
        assert_eq!(flow.state(), FlowState::Paused);
    }

    #[test]
    fn test_transition_observer() {
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = transitions.clone();
        let flow = FlowController::new(2)
            .with_low_watermark(0)
            .on_transition(move |state, count| seen.lock().push((state, count)));

        flow.increment();
        flow.increment(); // -> paused
        flow.decrement();
        flow.decrement(); // -> flowing

        assert_eq!(
            transitions.lock().as_slice(),
            &[(FlowState::Paused, 2), (FlowState::Flowing, 0)]
        );
    }

    #[tokio::test]
    async fn test_wait_for_drain_released_on_resume() {
        let flow = Arc::new(FlowController::new(2).with_low_watermark(0));
        flow.increment();
        flow.increment();
        assert_eq!(flow.state(), FlowState::Paused);

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move {
                flow.wait_for_drain().await;
            })
        };

        flow.decrement();
        assert!(!waiter.is_finished());

        flow.decrement();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("drain waiter released")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_drain_immediate_when_flowing() {
        let flow = FlowController::new(2);
        tokio::time::timeout(std::time::Duration::from_millis(50), flow.wait_for_drain())
            .await
            .expect("no wait needed");
    }
}
