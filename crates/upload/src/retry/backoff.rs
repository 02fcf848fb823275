//! Backoff policy: retry strategies and the pure retry/delay decisions.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use posecoach_core::{AttemptError, CoreError, ErrorKind};

use crate::config::ConfigError;

/// Relative spread of the random jitter applied to a delay (±25%).
const JITTER_SPREAD: f64 = 0.25;

/// Jittered delays never drop below this fraction of the base delay.
const JITTER_FLOOR: f64 = 0.5;

/// Predicate deciding whether an error is worth another attempt.
pub type ConditionFn = Arc<dyn Fn(&AttemptError) -> bool + Send + Sync>;

/// Which errors a strategy retries.
#[derive(Clone)]
pub enum RetryCondition {
    /// Network, timeout and server faults (plus their wire codes).
    Network,
    /// Transport failures of a file upload; never user aborts.
    Upload,
    /// Anything except invalid parameters.
    Fast,
    Always,
    Never,
    /// Errors whose `code` is one of the listed codes.
    Codes(Vec<String>),
    Custom(ConditionFn),
}

impl RetryCondition {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&AttemptError) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    pub fn codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Codes(codes.into_iter().map(Into::into).collect())
    }

    pub fn accepts(&self, error: &AttemptError) -> bool {
        let code_in = |codes: &[&str]| codes.iter().any(|c| error.has_code(c));

        match self {
            RetryCondition::Network => {
                matches!(
                    error.kind,
                    ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Server
                ) || code_in(&["NETWORK_ERROR", "TIMEOUT", "HTTP_ERROR"])
            }
            RetryCondition::Upload => {
                !error.is_abort() && code_in(&["UPLOAD_FAILED", "HTTP_ERROR", "NETWORK_ERROR"])
            }
            RetryCondition::Fast => error.kind != ErrorKind::InvalidParams,
            RetryCondition::Always => true,
            RetryCondition::Never => false,
            RetryCondition::Codes(codes) => codes.iter().any(|c| error.has_code(c)),
            RetryCondition::Custom(f) => f(error),
        }
    }
}

impl fmt::Debug for RetryCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryCondition::Network => f.write_str("Network"),
            RetryCondition::Upload => f.write_str("Upload"),
            RetryCondition::Fast => f.write_str("Fast"),
            RetryCondition::Always => f.write_str("Always"),
            RetryCondition::Never => f.write_str("Never"),
            RetryCondition::Codes(codes) => f.debug_tuple("Codes").field(codes).finish(),
            RetryCondition::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Named strategy presets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyPreset {
    Network,
    Upload,
    Fast,
}

impl StrategyPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyPreset::Network => "NETWORK",
            StrategyPreset::Upload => "UPLOAD",
            StrategyPreset::Fast => "FAST",
        }
    }

    pub fn strategy(&self) -> RetryStrategy {
        let (max_retries, base_ms, max_ms, factor, condition) = match self {
            StrategyPreset::Network => (3, 1_000, 10_000, 2.0, RetryCondition::Network),
            StrategyPreset::Upload => (2, 2_000, 15_000, 2.5, RetryCondition::Upload),
            StrategyPreset::Fast => (2, 500, 2_000, 2.0, RetryCondition::Fast),
        };
        RetryStrategy {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_factor: factor,
            jitter: true,
            condition,
        }
    }
}

impl FromStr for StrategyPreset {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NETWORK" => Ok(StrategyPreset::Network),
            "UPLOAD" => Ok(StrategyPreset::Upload),
            "FAST" => Ok(StrategyPreset::Fast),
            _ => Err(CoreError::unknown_strategy(s)),
        }
    }
}

impl fmt::Display for StrategyPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry strategy configuration. Immutable once built.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    jitter: bool,
    condition: RetryCondition,
}

impl RetryStrategy {
    /// Build a custom strategy, validating its timing parameters.
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter: bool,
        condition: RetryCondition,
    ) -> Result<Self, ConfigError> {
        if base_delay.is_zero() {
            return Err(ConfigError::invalid("base_delay", "must be greater than zero"));
        }
        if max_delay < base_delay {
            return Err(ConfigError::invalid(
                "max_delay",
                format!("{max_delay:?} is shorter than base_delay {base_delay:?}"),
            ));
        }
        if !(backoff_factor.is_finite() && backoff_factor > 1.0) {
            return Err(ConfigError::invalid(
                "backoff_factor",
                format!("{backoff_factor} must be a finite number above 1"),
            ));
        }
        Ok(Self {
            max_retries,
            base_delay,
            max_delay,
            backoff_factor,
            jitter,
            condition,
        })
    }

    pub fn preset(preset: StrategyPreset) -> Self {
        preset.strategy()
    }

    /// A strategy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..StrategyPreset::Upload.strategy()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    pub fn condition(&self) -> &RetryCondition {
        &self.condition
    }

    /// Total number of attempts this strategy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl From<StrategyPreset> for RetryStrategy {
    fn from(preset: StrategyPreset) -> Self {
        preset.strategy()
    }
}

fn millis_f64(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

fn from_millis_f64(ms: f64) -> Duration {
    Duration::from_micros((ms.max(0.0) * 1_000.0).round() as u64)
}

/// Un-jittered delay after the failed attempt `attempt` (0-based):
/// `min(base * factor^attempt, max)`.
pub fn capped_delay(attempt: u32, strategy: &RetryStrategy) -> Duration {
    let base_ms = millis_f64(strategy.base_delay);
    let max_ms = millis_f64(strategy.max_delay);
    let exp = strategy
        .backoff_factor
        .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
    from_millis_f64((base_ms * exp).min(max_ms))
}

/// Delay to wait before the attempt following `attempt`.
///
/// With jitter enabled the capped delay is moved by a uniform offset of
/// ±25% and floored at half the base delay.
pub fn next_delay<R: Rng + ?Sized>(attempt: u32, strategy: &RetryStrategy, rng: &mut R) -> Duration {
    let capped = capped_delay(attempt, strategy);
    if !strategy.jitter {
        return capped;
    }

    let delay_ms = millis_f64(capped);
    let offset = rng.gen_range(-1.0..=1.0) * JITTER_SPREAD * delay_ms;
    let floor_ms = millis_f64(strategy.base_delay) * JITTER_FLOOR;
    from_millis_f64((delay_ms + offset).max(floor_ms))
}

/// Whether the failed attempt `attempt` (0-based) may be followed by another.
///
/// The last allowed attempt is terminal, and user aborts are never retried
/// whatever the strategy's condition says.
pub fn should_retry(attempt: u32, error: &AttemptError, strategy: &RetryStrategy) -> bool {
    if attempt >= strategy.max_retries {
        return false;
    }
    if error.is_abort() {
        return false;
    }
    strategy.condition.accepts(error)
}
