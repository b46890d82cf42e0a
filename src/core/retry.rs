//! Retry logic with exponential backoff and jitter.
//!
//! Wraps one logical operation in a bounded number of attempts. Delays are
//! produced by an explicit [`Backoff`] state machine and slept on tokio
//! timers raced against the caller's [`CallContext`], so cancellation and
//! deadlines compose with concurrent callers.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::config::serde_ms;
use super::context::{CallContext, Interrupted};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (minimum 1).
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    #[serde(rename = "base_delay_ms", with = "serde_ms")]
    pub base_delay: Duration,

    /// Upper bound for the un-jittered delay.
    #[serde(rename = "max_delay_ms", with = "serde_ms")]
    pub max_delay: Duration,

    /// Jitter fraction: each delay is scaled by a factor in `[1-j, 1+j]`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Create a config with a single attempt (fail fast).
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Default::default() }
    }

    /// Effective number of attempts.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Un-jittered delay after the given failed attempt (1-based).
    pub fn base_delay_after(&self, failed_attempt: u32) -> Duration {
        if failed_attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (failed_attempt - 1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent).min(self.max_delay)
    }

    /// Delay after the given failed attempt, with jitter applied.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let delay = self.base_delay_after(failed_attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor)
    }
}

/// Backoff state for one logical call.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    /// Start a new backoff sequence.
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of attempts started so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Begin the next attempt and return its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    /// Delay to wait before the next attempt, or `None` if none remain.
    pub fn next_delay(&self) -> Option<Duration> {
        if self.attempt >= self.config.attempts() {
            return None;
        }
        Some(self.config.delay_after(self.attempt))
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    /// Whether the failure is transient and worth retrying.
    fn is_transient(&self) -> bool;
}

/// Terminal failure of a retried operation.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed transiently; holds the last error.
    Exhausted(E),
    /// A non-transient error ended the loop.
    Fatal(E),
    /// The caller's context interrupted a backoff sleep.
    Interrupted(Interrupted),
}

/// Result of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// The final result.
    pub result: Result<T, RetryError<E>>,

    /// Number of attempts made.
    pub attempts: u32,

    /// Delays slept between attempts, in order.
    pub delays: Vec<Duration>,

    /// Total time spent (including delays).
    pub elapsed: Duration,
}

impl<T, E> RetryOutcome<T, E> {
    /// Check if the operation succeeded.
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Whether more than one attempt was made.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }
}

/// Retry policy for one server.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The policy configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out.
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, ctx: &CallContext, mut operation: F) -> RetryOutcome<T, E>
    where
        E: Retryable,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let start = tokio::time::Instant::now();
        let mut backoff = Backoff::new(self.config.clone());
        let mut delays = Vec::new();

        let finish = |result: Result<T, RetryError<E>>, attempts: u32, delays: Vec<Duration>| {
            RetryOutcome { result, attempts, delays, elapsed: start.elapsed() }
        };

        loop {
            let attempt = backoff.begin_attempt();

            let error = match operation(attempt).await {
                Ok(value) => return finish(Ok(value), attempt, delays),
                Err(error) if !error.is_transient() => {
                    return finish(Err(RetryError::Fatal(error)), attempt, delays);
                }
                Err(error) => error,
            };

            let Some(delay) = backoff.next_delay() else {
                return finish(Err(RetryError::Exhausted(error)), attempt, delays);
            };

            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying after transient failure"
            );
            if let Err(interrupted) = ctx.sleep(delay).await {
                return finish(Err(RetryError::Interrupted(interrupted)), attempt, delays);
            }
            delays.push(delay);
        }
    }
}
