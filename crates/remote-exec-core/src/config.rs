//! Coordinator tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::{RetryConfig, RetryPolicy};

pub const ENV_SNAPSHOT_INTERVAL_SECS: &str = "EXEC_SNAPSHOT_INTERVAL_SECS";
pub const ENV_SNAPSHOT_GRACE_MS: &str = "EXEC_SNAPSHOT_GRACE_MS";
pub const ENV_PUBLISH_TIMEOUT_MS: &str = "EXEC_PUBLISH_TIMEOUT_MS";
pub const ENV_RETRY_MAX: &str = "EXEC_RETRY_MAX";
pub const ENV_RETRY_INITIAL_DELAY_MS: &str = "EXEC_RETRY_INITIAL_DELAY_MS";
pub const ENV_RETRY_BACKOFF_FACTOR: &str = "EXEC_RETRY_BACKOFF_FACTOR";

/// Configuration loading error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Timings and limits used by the execution coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Period between partial-progress snapshots.
    #[serde(with = "duration_secs")]
    pub snapshot_interval: Duration,
    /// How long to wait for an in-flight snapshot after stopping it.
    #[serde(with = "duration_millis")]
    pub snapshot_grace: Duration,
    /// Per-event publish timeout.
    #[serde(with = "duration_millis")]
    pub publish_timeout: Duration,
    /// Upper bound on draining queued events at completion.
    #[serde(with = "duration_millis")]
    pub publisher_drain_timeout: Duration,
    /// Tool output longer than this many characters is truncated.
    pub tool_output_limit: usize,
    pub retry: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(60),
            snapshot_grace: Duration::from_secs(2),
            publish_timeout: Duration::from_secs(1),
            publisher_drain_timeout: Duration::from_secs(5),
            tool_output_limit: 1000,
            retry: RetryConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Defaults overridden by `EXEC_*` environment variables.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] when a variable is set but unparsable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by values from `lookup`.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] when a value is present but unparsable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(secs) = parse(&lookup, ENV_SNAPSHOT_INTERVAL_SECS)? {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    key: ENV_SNAPSHOT_INTERVAL_SECS,
                    value: "0".into(),
                });
            }
            config.snapshot_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse(&lookup, ENV_SNAPSHOT_GRACE_MS)? {
            config.snapshot_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, ENV_PUBLISH_TIMEOUT_MS)? {
            config.publish_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = parse(&lookup, ENV_RETRY_MAX)? {
            config.retry.max_retries = max;
        }
        if let Some(ms) = parse(&lookup, ENV_RETRY_INITIAL_DELAY_MS)? {
            config.retry.initial_delay_ms = ms;
        }
        if let Some(factor) = parse(&lookup, ENV_RETRY_BACKOFF_FACTOR)? {
            config.retry.backoff_factor = factor;
            config.retry.validate().map_err(|_| ConfigError::Invalid {
                key: ENV_RETRY_BACKOFF_FACTOR,
                value: factor.to_string(),
            })?;
        }

        Ok(config)
    }

    /// Retry policy for session-store I/O.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.retry)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Invalid { key, value: raw })
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
