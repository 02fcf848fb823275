//! Upload manager configuration.

use std::time::Duration;

use posecoach_core::CoreError;

use crate::retry::{RetryStrategy, StrategyPreset};

pub const ENV_MAX_CONCURRENT: &str = "POSECOACH_MAX_CONCURRENT";
pub const ENV_CLEANUP_GRACE_MS: &str = "POSECOACH_CLEANUP_GRACE_MS";
pub const ENV_ENABLE_RETRY: &str = "POSECOACH_ENABLE_RETRY";
pub const ENV_RETRY_STRATEGY: &str = "POSECOACH_RETRY_STRATEGY";
pub const ENV_UPLOAD_TIMEOUT_MS: &str = "POSECOACH_UPLOAD_TIMEOUT_MS";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("malformed value for {var}: {value:?}")]
    Malformed { var: String, value: String },
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Upload manager configuration.
#[derive(Debug, Clone)]
pub struct UploadManagerConfig {
    /// Uploads allowed in flight at once
    pub max_concurrent: usize,
    /// How long terminal tasks stay visible before eviction
    pub cleanup_grace: Duration,
    /// Route attempts through the retry executor
    pub enable_retry: bool,
    /// Strategy used when retry is enabled
    pub strategy: RetryStrategy,
    /// Default per-attempt timeout
    pub upload_timeout: Duration,
}

impl Default for UploadManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            cleanup_grace: Duration::from_secs(10),
            enable_retry: true,
            strategy: StrategyPreset::Upload.strategy(),
            upload_timeout: Duration::from_secs(60),
        }
    }
}

impl UploadManagerConfig {
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_cleanup_grace(mut self, grace: Duration) -> Self {
        self.cleanup_grace = grace;
        self
    }

    pub fn with_retry(mut self, enabled: bool) -> Self {
        self.enable_retry = enabled;
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<RetryStrategy>) -> Self {
        self.strategy = strategy.into();
        self
    }

    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent", "must be at least 1"));
        }
        if self.upload_timeout.is_zero() {
            return Err(ConfigError::invalid("upload_timeout", "must be greater than zero"));
        }
        Ok(())
    }

    /// Strategy a task runs with, honouring the retry switch.
    pub fn effective_strategy(&self, skip_retry: bool) -> RetryStrategy {
        if self.enable_retry && !skip_retry {
            self.strategy.clone()
        } else {
            self.strategy.clone().with_max_retries(0)
        }
    }

    /// Load from `POSECOACH_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (unset keys keep their defaults).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_MAX_CONCURRENT) {
            config.max_concurrent = parse_number(ENV_MAX_CONCURRENT, &raw)? as usize;
        }
        if let Some(raw) = lookup(ENV_CLEANUP_GRACE_MS) {
            config.cleanup_grace = Duration::from_millis(parse_number(ENV_CLEANUP_GRACE_MS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_ENABLE_RETRY) {
            config.enable_retry = parse_bool(ENV_ENABLE_RETRY, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RETRY_STRATEGY) {
            let preset: StrategyPreset = raw.parse()?;
            config.strategy = preset.strategy();
        }
        if let Some(raw) = lookup(ENV_UPLOAD_TIMEOUT_MS) {
            config.upload_timeout =
                Duration::from_millis(parse_number(ENV_UPLOAD_TIMEOUT_MS, &raw)?);
        }

        config.validate()?;
        Ok(config)
    }
}

fn malformed(var: &str, value: &str) -> ConfigError {
    ConfigError::Malformed {
        var: var.to_string(),
        value: value.to_string(),
    }
}

fn parse_number(var: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse::<u64>().map_err(|_| malformed(var, raw))
}

fn parse_bool(var: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(malformed(var, raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_upload_manager() {
        let config = UploadManagerConfig::default();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.cleanup_grace, Duration::from_secs(10));
        assert!(config.enable_retry);
        assert_eq!(config.strategy.max_retries(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_values_override_defaults() {
        let config = UploadManagerConfig::from_lookup(lookup(&[
            (ENV_MAX_CONCURRENT, "5"),
            (ENV_CLEANUP_GRACE_MS, "250"),
            (ENV_ENABLE_RETRY, "off"),
            (ENV_RETRY_STRATEGY, "network"),
            (ENV_UPLOAD_TIMEOUT_MS, "1500"),
        ]))
        .unwrap();

        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.cleanup_grace, Duration::from_millis(250));
        assert!(!config.enable_retry);
        assert_eq!(config.strategy.max_retries(), 3);
        assert_eq!(config.upload_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn unknown_strategy_fails_fast() {
        let err = UploadManagerConfig::from_lookup(lookup(&[(ENV_RETRY_STRATEGY, "turbo")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Core(CoreError::UnknownStrategy("turbo".to_string()))
        );
    }

    #[test]
    fn malformed_numbers_are_reported() {
        let err = UploadManagerConfig::from_lookup(lookup(&[(ENV_MAX_CONCURRENT, "three")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[test]
    fn zero_concurrency_is_invalid() {
        let err = UploadManagerConfig::from_lookup(lookup(&[(ENV_MAX_CONCURRENT, "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "max_concurrent", .. }));
    }

    #[test]
    fn disabled_retry_yields_single_attempt() {
        let config = UploadManagerConfig::default().with_retry(false);
        assert_eq!(config.effective_strategy(false).max_attempts(), 1);

        let config = UploadManagerConfig::default();
        assert_eq!(config.effective_strategy(true).max_attempts(), 1);
        assert_eq!(config.effective_strategy(false).max_attempts(), 3);
    }
}
