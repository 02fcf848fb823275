//! `posecoach-upload` — upload and retry orchestration for frame scoring.
//!
//! Layers, leaf to root:
//! - [`retry`]: backoff policy and the cancellable retry executor
//! - [`tasks`]: upload task state machine and the observable registry
//! - [`scheduler`]: concurrency-limited, priority-ordered admission
//! - [`batch`]: fan-out of a frame batch and score aggregation
//!
//! The remote scoring call sits behind the [`Uploader`] trait; enable the
//! `http` feature for a `reqwest` implementation.

pub mod batch;
pub mod config;
pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod retry;
pub mod scheduler;
pub mod tasks;
pub mod uploader;

pub use batch::{
    BatchOptions, BatchProgress, BatchSummary, FrameJob, FrameResult, FrameScores, FrameStats,
    run_batch, summarize_scores,
};
pub use config::{ConfigError, UploadManagerConfig};
pub use error::{RegistryError, UploadError, UploadResult};
#[cfg(feature = "http")]
pub use http::HttpUploader;
pub use retry::{
    BatchRetryReport, RetryCondition, RetryExecutor, RetryStrategy, StrategyPreset, batch_retry,
    retry_when, retry_with_backoff,
};
pub use scheduler::{UploadJob, UploadScheduler, upload_with_retry};
pub use tasks::{TaskEvent, TaskEventKind, TaskRegistry, TaskStats, TaskStatus, UploadTask};
pub use uploader::{ProgressReporter, UploadRequest, Uploader};
