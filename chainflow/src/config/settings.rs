//! Engine-wide execution settings.

use crate::pipeline::retry::{BackoffStrategy, JitterStrategy, RetryConfig};
use serde::{Deserialize, Serialize};

/// Settings applied to every pipeline an engine builds and runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Retry budget for components that declare no `max_retry`.
    pub default_max_retry: usize,
    /// Base delay between retries in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Backoff strategy between retries.
    pub backoff: BackoffStrategy,
    /// Jitter applied to retry delays.
    pub jitter: JitterStrategy,
    /// Timeout for components that declare no `timeout_ms`.
    pub stage_timeout_ms: Option<u64>,
    /// Reuse resolved pipelines whose parameters have no placeholders.
    pub cache_static_pipelines: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_max_retry: 0,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Full,
            stage_timeout_ms: None,
            cache_static_pipelines: true,
        }
    }
}

impl EngineSettings {
    /// Creates settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default retry budget.
    #[must_use]
    pub fn with_default_max_retry(mut self, max_retry: usize) -> Self {
        self.default_max_retry = max_retry;
        self
    }

    /// Sets the retry delays.
    #[must_use]
    pub fn with_retry_delays(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.retry_base_delay_ms = base_ms;
        self.retry_max_delay_ms = max_ms;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the default per-stage timeout.
    #[must_use]
    pub fn with_stage_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.stage_timeout_ms = Some(timeout_ms);
        self
    }

    /// Enables or disables caching of static pipelines.
    #[must_use]
    pub fn with_cache_static_pipelines(mut self, enabled: bool) -> Self {
        self.cache_static_pipelines = enabled;
        self
    }

    /// Builds the retry configuration for a stage with the given budget.
    #[must_use]
    pub fn retry_config(&self, max_retry: usize) -> RetryConfig {
        RetryConfig::new()
            .with_max_retries(max_retry)
            .with_base_delay_ms(self.retry_base_delay_ms)
            .with_max_delay_ms(self.retry_max_delay_ms)
            .with_backoff(self.backoff)
            .with_jitter(self.jitter)
    }
}
