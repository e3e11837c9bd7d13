//! Step-level configuration: keying, TTL caching, retry policy

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::StepTimeout;

/// Options accepted by the `*_with` step variants
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use weft_durable::StepOptions;
///
/// let opts = StepOptions::new()
///     .with_key("fetch-user:123")
///     .with_ttl(Duration::from_secs(300));
/// ```
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    pub(crate) key: Option<String>,
    pub(crate) transient: bool,
    pub(crate) ttl: Option<Duration>,
    pub(crate) description: Option<String>,
}

impl StepOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the persistence key (defaults to the step id).
    ///
    /// Keys must be unique within a workflow; two steps sharing a key will
    /// mis-memoize on resume.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Opt out of keying: the step executes on every attempt and is never
    /// persisted or replayed
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Cache the outcome in the configured step cache for this long
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Human-readable description, for tooling
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Delay strategy between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Every delay equals the initial delay
    Fixed,

    /// Delay grows linearly with the retry number
    Linear,

    /// Delay doubles with each retry
    Exponential,
}

/// View of a failed attempt handed to the retry gate
#[derive(Debug)]
pub enum RetryFailure<'a, E> {
    /// The op returned a typed error
    Error(&'a E),

    /// The op panicked
    Panic(&'a str),

    /// The attempt's deadline elapsed
    Timeout(&'a StepTimeout),
}

type RetryPredicate<E> = Arc<dyn for<'a> Fn(RetryFailure<'a, E>, u32) -> bool + Send + Sync>;
type RetryCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Configuration for step retries
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use weft_durable::{Backoff, RetryPolicy};
///
/// let policy: RetryPolicy<String> = RetryPolicy::exponential()
///     .with_attempts(5)
///     .with_initial_delay(Duration::from_millis(100))
///     .with_max_delay(Duration::from_secs(10));
/// ```
#[derive(Clone)]
pub struct RetryPolicy<E> {
    /// Maximum number of attempts, including the initial one; clamped to ≥ 1
    pub attempts: u32,

    pub backoff: Backoff,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Cap applied after the backoff computation
    pub max_delay: Duration,

    /// Perturb each delay by a uniform amount in `[0, delay / 4]`
    pub jitter: bool,

    /// Per-attempt deadline; a timeout counts as a failed attempt
    pub timeout: Option<Duration>,

    retry_on: Option<RetryPredicate<E>>,
    on_retry: Option<RetryCallback>,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("attempts", &self.attempts)
            .field("backoff", &self.backoff)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("timeout", &self.timeout)
            .field("retry_on", &self.retry_on.is_some())
            .finish()
    }
}

impl<E> Default for RetryPolicy<E> {
    fn default() -> Self {
        Self::exponential()
    }
}

impl<E> RetryPolicy<E> {
    /// Exponential backoff with sensible defaults: 3 attempts, 100 ms
    /// initial delay, 30 s cap, jitter on
    pub fn exponential() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::Exponential,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: true,
            timeout: None,
            retry_on: None,
            on_retry: None,
        }
    }

    /// Fixed delay between attempts, no jitter
    pub fn fixed(delay: Duration, attempts: u32) -> Self {
        Self {
            attempts,
            backoff: Backoff::Fixed,
            initial_delay: delay,
            max_delay: delay,
            jitter: false,
            timeout: None,
            retry_on: None,
            on_retry: None,
        }
    }

    /// Linearly growing delay, no jitter
    pub fn linear(initial_delay: Duration, attempts: u32) -> Self {
        Self {
            attempts,
            backoff: Backoff::Linear,
            initial_delay,
            max_delay: Duration::from_secs(30),
            jitter: false,
            timeout: None,
            retry_on: None,
            on_retry: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Apply a per-attempt deadline; timeouts are retried like any failure
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Gate retries: called with the failure and the attempt that produced
    /// it; returning false surfaces the failure immediately
    pub fn retry_if(
        mut self,
        predicate: impl for<'a> Fn(RetryFailure<'a, E>, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_on = Some(Arc::new(predicate));
        self
    }

    /// Observe each retry; called with the upcoming attempt number
    pub fn on_retry(mut self, callback: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    /// Whether the gate permits retrying this failure
    pub(crate) fn permits(&self, failure: RetryFailure<'_, E>, attempt: u32) -> bool {
        match &self.retry_on {
            Some(predicate) => predicate(failure, attempt),
            None => true,
        }
    }

    pub(crate) fn notify_retry(&self, attempt: u32) {
        if let Some(callback) = &self.on_retry {
            callback(attempt);
        }
    }

    /// Delay to wait before the given attempt (1-based; attempt 1 has none)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = (attempt - 1) as f64;
        let initial = self.initial_delay.as_secs_f64();
        let base = match self.backoff {
            Backoff::Fixed => initial,
            Backoff::Linear => initial * retry_num,
            Backoff::Exponential => initial * 2f64.powi(retry_num as i32 - 1),
        };
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter && capped > 0.0 {
            capped + rand::thread_rng().gen_range(0.0..=capped * 0.25)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}
