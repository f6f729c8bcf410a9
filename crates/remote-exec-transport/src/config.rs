//! Control-plane connection settings.

use std::time::Duration;

use remote_exec_core::ConfigError;
use serde::{Deserialize, Serialize};

pub const ENV_CONTROL_PLANE_URL: &str = "CONTROL_PLANE_URL";
pub const ENV_CONTROL_PLANE_API_KEY: &str = "CONTROL_PLANE_API_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

impl ControlPlaneConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Read `CONTROL_PLANE_URL` and `CONTROL_PLANE_API_KEY`.
    ///
    /// # Errors
    /// Returns [`ConfigError::Missing`] when either variable is unset or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// # Errors
    /// Returns [`ConfigError::Missing`] when a required value is absent.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let base_url = required(ENV_CONTROL_PLANE_URL)?;
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: ENV_CONTROL_PLANE_URL,
                value: base_url,
            });
        }

        Ok(Self::new(base_url, required(ENV_CONTROL_PLANE_API_KEY)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_required_values() {
        let config = ControlPlaneConfig::from_lookup(|key| match key {
            ENV_CONTROL_PLANE_URL => Some("https://cp.example.com/".into()),
            ENV_CONTROL_PLANE_API_KEY => Some("secret".into()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.base_url, "https://cp.example.com/");
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
    }

    #[test]
    fn missing_key_is_reported() {
        let err = ControlPlaneConfig::from_lookup(|key| {
            (key == ENV_CONTROL_PLANE_URL).then(|| "http://localhost:8000".to_string())
        })
        .unwrap_err();
        assert_eq!(err, ConfigError::Missing(ENV_CONTROL_PLANE_API_KEY));
    }

    #[test]
    fn url_without_scheme_is_invalid() {
        let err = ControlPlaneConfig::from_lookup(|key| match key {
            ENV_CONTROL_PLANE_URL => Some("cp.example.com".into()),
            _ => Some("k".into()),
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
