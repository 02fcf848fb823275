//! Retry layer: backoff policy engine and the retry executor.
//!
//! ## Components
//!
//! - `RetryStrategy` / `StrategyPreset`: immutable retry configuration
//! - `backoff::next_delay` / `backoff::should_retry`: pure decisions
//! - `RetryExecutor`: runs an async operation under a strategy, with
//!   cancellation and an optional per-attempt timeout
//! - `batch_retry`: many operations under one strategy, in chunks

pub mod backoff;
pub mod executor;

pub use backoff::{
    ConditionFn, RetryCondition, RetryStrategy, StrategyPreset, capped_delay, next_delay,
    should_retry,
};
pub use executor::{
    BatchRetryReport, CancelHandle, RetryExecutor, RetryObserver, batch_retry, retry_when,
    retry_with_backoff, with_timeout,
};
