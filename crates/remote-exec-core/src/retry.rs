//! Retry-with-backoff for I/O that may transiently fail.

use std::{fmt::Display, future::Future, time::Duration};

use serde::{Deserialize, Deserializer, Serialize, de};

use crate::config::ConfigError;

/// Longest sleep between two attempts, whatever the backoff factor.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Errors that can tell whether they are worth retrying.
pub trait Transient {
    /// Timeout-class or connection-class failure.
    fn is_transient(&self) -> bool;
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Abort,
}

impl RetryDecision {
    /// Default classification: transient errors retry, everything else aborts.
    pub fn transient_only<E: Transient>(error: &E) -> Self {
        if error.is_transient() {
            Self::Retry
        } else {
            Self::Abort
        }
    }
}

/// Retry tuning, deserialisable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    /// Finite and at least 1.0.
    #[serde(deserialize_with = "backoff_factor")]
    pub backoff_factor: f64,
}

impl RetryConfig {
    /// # Errors
    /// [`ConfigError::Invalid`] when the backoff factor is not finite or
    /// below 1.0.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if valid_factor(self.backoff_factor) {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                key: "retry.backoff_factor",
                value: self.backoff_factor.to_string(),
            })
        }
    }
}

fn valid_factor(factor: f64) -> bool {
    factor.is_finite() && factor >= 1.0
}

fn backoff_factor<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let factor = f64::deserialize(d)?;
    if valid_factor(factor) {
        Ok(factor)
    } else {
        Err(de::Error::custom(format!(
            "backoff_factor must be finite and at least 1.0, got {factor}"
        )))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            backoff_factor: 2.0,
        }
    }
}

/// Exponential backoff retry policy.
///
/// Performs up to `max_retries + 1` attempts, sleeping
/// `initial_delay * backoff_factor^attempt` between them, capped at
/// [`MAX_RETRY_DELAY`]. The sleep holds no lock, so concurrent executions
/// are unaffected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Policy doubling `initial_delay` after each failure.
    #[must_use]
    pub const fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            backoff_factor: 2.0,
        }
    }

    /// Policy built from configuration.
    ///
    /// A factor that fails [`RetryConfig::validate`] falls back to 1.0
    /// (constant delay).
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            backoff_factor: if valid_factor(config.backoff_factor) {
                config.backoff_factor
            } else {
                1.0
            },
        }
    }

    /// Maximum number of retries after the first attempt.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay slept after the failed attempt numbered `attempt` (from 0).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::try_from_secs_f64(secs).map_or(MAX_RETRY_DELAY, |d| d.min(MAX_RETRY_DELAY))
    }

    /// Run `operation`, retrying while `classify` says so.
    ///
    /// # Errors
    /// Returns the first non-retryable error, or the last error once
    /// retries are exhausted.
    pub async fn run<T, E, F, Fut, C>(
        &self,
        operation_name: &str,
        mut operation: F,
        classify: C,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDecision,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if classify(&error) == RetryDecision::Abort {
                tracing::debug!(operation = operation_name, "not retrying: {error}");
                return Err(error);
            }

            if attempt >= self.max_retries {
                tracing::error!(
                    operation = operation_name,
                    attempts = attempt + 1,
                    "giving up: {error}"
                );
                return Err(error);
            }

            let delay = self.delay_for(attempt);
            tracing::warn!(
                operation = operation_name,
                attempt = attempt + 1,
                max_retries = self.max_retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "retrying: {error}"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// [`run`](Self::run) with the default transient-only classification.
    ///
    /// # Errors
    /// See [`run`](Self::run).
    pub async fn run_transient<T, E, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + Transient,
    {
        self.run(operation_name, operation, RetryDecision::transient_only)
            .await
    }
}
