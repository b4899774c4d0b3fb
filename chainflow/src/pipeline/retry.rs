//! Retry with configurable backoff and jitter.
//!
//! A stage is invoked once and retried up to `max_retries` more times while
//! its failures are retryable. Backoff sleeps race against cancellation.

use crate::cancellation::CancellationToken;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter strategy applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Additional attempts after the first one.
    pub max_retries: usize,
    /// Base delay between retries in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of retries after the first attempt.
    #[must_use]
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Total number of invocations allowed.
    #[must_use]
    pub fn max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }
}

/// State tracking for one retried operation.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Retries performed so far.
    pub retries: usize,
    previous_delays: HashMap<String, u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once no retries remain.
    #[must_use]
    pub fn is_exhausted(&self, config: &RetryConfig) -> bool {
        self.retries >= config.max_retries
    }

    /// Calculates the delay before the next retry.
    #[must_use]
    pub fn calculate_delay(&mut self, key: &str, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;
        let retry = u32::try_from(self.retries).unwrap_or(u32::MAX);

        let delay = match config.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retry)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry) + 1),
            BackoffStrategy::Constant => base,
        }
        .min(max);

        let jittered = match config.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full if delay == 0 => 0,
            JitterStrategy::Full => rand::thread_rng().gen_range(0..=delay),
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delays.get(key).copied().unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                let next = if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.previous_delays.insert(key.to_string(), next);
                next
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// Decides whether a failed attempt is retried.
#[must_use]
pub fn should_retry(state: &mut RetryState, config: &RetryConfig, key: &str, retryable: bool) -> RetryDecision {
    if !retryable {
        return RetryDecision::NotRetryable;
    }
    if state.is_exhausted(config) {
        return RetryDecision::GiveUp;
    }

    let delay = state.calculate_delay(key, config);
    state.retries += 1;
    RetryDecision::Retry(delay)
}

/// A successful value and the number of invocations it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    /// The value.
    pub value: T,
    /// Invocations made, including the successful one.
    pub attempts: usize,
}

/// Why a retried operation stopped without a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every allowed attempt failed.
    Exhausted {
        /// Invocations made.
        attempts: usize,
        /// The last failure.
        last: E,
    },
    /// A failure was not retryable.
    NotRetryable {
        /// Invocations made.
        attempts: usize,
        /// The failure.
        error: E,
    },
    /// Cancellation was requested before a value was produced.
    Cancelled {
        /// Invocations started.
        attempts: usize,
        /// The cancellation reason.
        reason: String,
    },
}

/// Runs `operation` with retries.
///
/// `is_retryable` classifies failures; `on_retry` is called with the retry
/// number, delay and failure before each backoff sleep. Both the operation
/// and the sleeps are abandoned as soon as `cancel` fires.
pub async fn with_retry<T, E, F, Fut, C, R>(
    config: &RetryConfig,
    key: &str,
    cancel: &CancellationToken,
    mut operation: F,
    is_retryable: C,
    mut on_retry: R,
) -> Result<Attempted<T>, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    R: FnMut(usize, Duration, &E),
{
    let mut state = RetryState::new();
    let mut attempts = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(cancelled(cancel, attempts));
        }

        attempts += 1;
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(cancelled(cancel, attempts)),
            result = operation(attempts) => result,
        };

        let error = match result {
            Ok(value) => return Ok(Attempted { value, attempts }),
            Err(error) => error,
        };

        match should_retry(&mut state, config, key, is_retryable(&error)) {
            RetryDecision::Retry(delay) => {
                on_retry(state.retries, delay, &error);
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(cancelled(cancel, attempts)),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            RetryDecision::GiveUp => return Err(RetryError::Exhausted { attempts, last: error }),
            RetryDecision::NotRetryable => return Err(RetryError::NotRetryable { attempts, error }),
        }
    }
}

fn cancelled<E>(cancel: &CancellationToken, attempts: usize) -> RetryError<E> {
    RetryError::Cancelled {
        attempts,
        reason: cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
    }
}
