//! Batch aggregator: fan a set of frames out through a dedicated scheduler
//! and fold the per-frame outcomes into one summary.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{join_all, try_join_all};
use serde::Serialize;
use tracing::{Instrument, info, info_span};

use posecoach_core::{BatchId, OutcomeCode, TaskId, UploadOutcome};

use crate::config::UploadManagerConfig;
use crate::error::{UploadError, UploadResult};
use crate::retry::RetryStrategy;
use crate::scheduler::{UploadJob, UploadScheduler};
use crate::tasks::{Subscription, TaskEvent, TaskEventKind, TaskStatus};
use crate::uploader::Uploader;

/// Called after every frame reaches a terminal status.
pub type ProgressObserver = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// Called after every successfully scored frame with
/// `(outcome, completed, total)`.
pub type FrameObserver = Arc<dyn Fn(&UploadOutcome, usize, usize) + Send + Sync>;

/// One frame of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameJob {
    pub file_path: PathBuf,
    pub pose_id: String,
}

impl FrameJob {
    pub fn new(file_path: impl Into<PathBuf>, pose_id: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            pose_id: pose_id.into(),
        }
    }

    /// One job per path, all scored against the same pose.
    pub fn for_paths<I, P>(paths: I, pose_id: &str) -> Vec<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        paths
            .into_iter()
            .map(|path| Self::new(path, pose_id))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    /// Rounded completion percentage
    pub percent: u8,
}

impl BatchProgress {
    fn new(completed: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100
        } else {
            ((completed as f64 / total as f64) * 100.0).round() as u8
        };
        Self {
            completed,
            total,
            percent,
        }
    }
}

/// Batch run options.
#[derive(Clone)]
pub struct BatchOptions {
    pub concurrency: usize,
    pub enable_retry: bool,
    /// Overrides the strategy's retry count when set
    pub max_retries: Option<u32>,
    /// When `false`, the first failed frame fails the whole batch
    pub skip_failed_frames: bool,
    pub strategy: RetryStrategy,
    pub upload_timeout: Duration,
    pub cleanup_grace: Duration,
    pub on_progress: Option<ProgressObserver>,
    pub on_frame_complete: Option<FrameObserver>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from_config(&UploadManagerConfig::default())
    }
}

impl BatchOptions {
    /// Options that inherit the manager configuration.
    pub fn from_config(config: &UploadManagerConfig) -> Self {
        Self {
            concurrency: config.max_concurrent,
            enable_retry: config.enable_retry,
            max_retries: None,
            skip_failed_frames: true,
            strategy: config.strategy.clone(),
            upload_timeout: config.upload_timeout,
            cleanup_grace: config.cleanup_grace,
            on_progress: None,
            on_frame_complete: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry(mut self, enabled: bool) -> Self {
        self.enable_retry = enabled;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_skip_failed_frames(mut self, skip: bool) -> Self {
        self.skip_failed_frames = skip;
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

    pub fn on_progress<F>(mut self, observer: F) -> Self
    where
        F: Fn(BatchProgress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(observer));
        self
    }

    pub fn on_frame_complete<F>(mut self, observer: F) -> Self
    where
        F: Fn(&UploadOutcome, usize, usize) + Send + Sync + 'static,
    {
        self.on_frame_complete = Some(Arc::new(observer));
        self
    }

    fn manager_config(&self) -> UploadManagerConfig {
        let strategy = match self.max_retries {
            Some(n) => self.strategy.clone().with_max_retries(n),
            None => self.strategy.clone(),
        };
        UploadManagerConfig::default()
            .with_max_concurrent(self.concurrency)
            .with_retry(self.enable_retry)
            .with_strategy(strategy)
            .with_upload_timeout(self.upload_timeout)
            .with_cleanup_grace(self.cleanup_grace)
    }
}

impl core::fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BatchOptions")
            .field("concurrency", &self.concurrency)
            .field("enable_retry", &self.enable_retry)
            .field("max_retries", &self.max_retries)
            .field("skip_failed_frames", &self.skip_failed_frames)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

/// Outcome counts over the scored frames.
///
/// Only frames that came back with an outcome are counted. A frame whose
/// upload failed or was cancelled has no outcome, so it shows up in
/// [`BatchSummary::failed_frames`] and not here; use
/// [`BatchSummary::total_frames`] for the size of the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    /// Frames with an outcome
    pub total: usize,
    pub valid: usize,
    /// Outcomes that are not valid, `no_keypoint` included
    pub failed: usize,
    pub no_keypoint: usize,
}

/// Score aggregate over a set of outcomes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameScores {
    /// Rounded mean over valid frames; 0 when none are valid
    pub average_score: f64,
    pub valid_frames: usize,
    pub stats: FrameStats,
    pub message: String,
}

/// Reduce outcomes to their average score and per-code counts.
///
/// Only `SUCCESS` outcomes with a positive score are valid.
pub fn summarize_scores<'a, I>(outcomes: I) -> FrameScores
where
    I: IntoIterator<Item = &'a UploadOutcome>,
{
    let mut stats = FrameStats::default();
    let mut sum = 0.0;

    for outcome in outcomes {
        stats.total += 1;
        if outcome.is_valid() {
            stats.valid += 1;
            sum += outcome.score;
        }
        if outcome.code == OutcomeCode::NoKeypoint {
            stats.no_keypoint += 1;
        }
    }
    stats.failed = stats.total - stats.valid;

    if stats.valid == 0 {
        return FrameScores {
            average_score: 0.0,
            valid_frames: 0,
            stats,
            message: "no valid pose detected".to_string(),
        };
    }

    FrameScores {
        average_score: (sum / stats.valid as f64).round(),
        valid_frames: stats.valid,
        stats,
        message: format!("analysed {}/{} frames", stats.valid, stats.total),
    }
}

/// Per-frame result, in submission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameResult {
    pub index: usize,
    pub file_path: PathBuf,
    pub status: TaskStatus,
    pub outcome: Option<UploadOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub batch_id: BatchId,
    #[serde(flatten)]
    pub scores: FrameScores,
    pub total_frames: usize,
    /// Frames that completed with an outcome
    pub processed_frames: usize,
    /// Frames that failed or were cancelled
    pub failed_frames: usize,
    pub frames: Vec<FrameResult>,
}

impl BatchSummary {
    pub fn average_score(&self) -> f64 {
        self.scores.average_score
    }

    pub fn valid_frames(&self) -> usize {
        self.scores.valid_frames
    }

    fn from_frames(batch_id: BatchId, frames: Vec<FrameResult>) -> Self {
        let scores = summarize_scores(frames.iter().filter_map(|f| f.outcome.as_ref()));
        let processed_frames = frames.iter().filter(|f| f.outcome.is_some()).count();

        Self {
            batch_id,
            scores,
            total_frames: frames.len(),
            processed_frames,
            failed_frames: frames.len() - processed_frames,
            frames,
        }
    }
}

/// Unsubscribes the batch listener and cancels leftover tasks on every exit.
struct BatchGuard<'a> {
    scheduler: &'a UploadScheduler,
    subscription: Option<Subscription>,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        drop(self.subscription.take());
        self.scheduler.cancel_all();
    }
}

/// Score every frame in `jobs` and aggregate the results.
///
/// Earlier frames get higher priority. With `skip_failed_frames` (the
/// default) a failed frame is recorded and the rest carry on; otherwise the
/// first failure is returned and the remaining frames are cancelled.
pub async fn run_batch<U>(
    uploader: U,
    jobs: Vec<FrameJob>,
    options: BatchOptions,
) -> UploadResult<BatchSummary>
where
    U: Uploader + 'static,
{
    let batch_id = BatchId::new();
    let span = info_span!("batch", batch_id = %batch_id, frames = jobs.len());

    async move {
        let scheduler = UploadScheduler::new(options.manager_config(), uploader)?;
        let total = jobs.len();
        info!(
            concurrency = options.concurrency,
            skip_failed_frames = options.skip_failed_frames,
            "batch started"
        );

        let subscription = scheduler.subscribe(progress_listener(&options, total));
        let _guard = BatchGuard {
            scheduler: &scheduler,
            subscription: Some(subscription),
        };

        let submissions = jobs.iter().enumerate().map(|(index, job)| {
            let upload = UploadJob::new(job.file_path.clone(), job.pose_id.clone())
                .with_priority((total - index) as i64);
            let scheduler = &scheduler;
            async move { (index, scheduler.submit(TaskId::for_frame(index), upload).await) }
        });

        let settled: Vec<(usize, UploadResult<UploadOutcome>)> = if options.skip_failed_frames {
            join_all(submissions).await
        } else {
            try_join_all(submissions.map(|submission| async move {
                let (index, result) = submission.await;
                result.map(|outcome| (index, Ok(outcome)))
            }))
            .await?
        };

        let frames = collect_frames(&jobs, settled);
        let summary = BatchSummary::from_frames(batch_id, frames);
        info!(
            total = summary.total_frames,
            valid = summary.scores.valid_frames,
            failed = summary.failed_frames,
            average_score = summary.scores.average_score,
            "batch finished"
        );
        Ok::<_, UploadError>(summary)
    }
    .instrument(span)
    .await
}

fn collect_frames(
    jobs: &[FrameJob],
    mut settled: Vec<(usize, UploadResult<UploadOutcome>)>,
) -> Vec<FrameResult> {
    settled.sort_by_key(|(index, _)| *index);
    settled
        .into_iter()
        .map(|(index, result)| {
            let file_path = jobs[index].file_path.clone();
            match result {
                Ok(outcome) => FrameResult {
                    index,
                    file_path,
                    status: TaskStatus::Completed,
                    outcome: Some(outcome),
                    error: None,
                },
                Err(err) => FrameResult {
                    index,
                    file_path,
                    status: if err.is_cancelled() {
                        TaskStatus::Cancelled
                    } else {
                        TaskStatus::Failed
                    },
                    outcome: None,
                    error: Some(err.to_string()),
                },
            }
        })
        .collect()
}

fn progress_listener(
    options: &BatchOptions,
    total: usize,
) -> impl Fn(&TaskEvent) + Send + Sync + 'static {
    let completed = Arc::new(AtomicUsize::new(0));
    let on_progress = options.on_progress.clone();
    let on_frame_complete = options.on_frame_complete.clone();

    move |event: &TaskEvent| {
        let TaskEventKind::Updated { old_status } = event.kind else {
            return;
        };
        if old_status.is_terminal() || !event.task.status.is_terminal() {
            return;
        }

        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
        if let (TaskStatus::Completed, Some(observer), Some(outcome)) =
            (event.task.status, &on_frame_complete, &event.task.result)
        {
            observer(outcome, done, total);
        }
        if let Some(observer) = &on_progress {
            observer(BatchProgress::new(done, total));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::StrategyPreset;

    fn outcome(code: OutcomeCode, score: f64) -> UploadOutcome {
        UploadOutcome::new("warrior", code, score)
    }

    #[test]
    fn average_counts_only_valid_frames() {
        let outcomes = [
            outcome(OutcomeCode::Success, 80.0),
            outcome(OutcomeCode::Success, 70.0),
            outcome(OutcomeCode::NoKeypoint, 0.0),
            outcome(OutcomeCode::Success, 90.0),
            outcome(OutcomeCode::Success, 60.0),
        ];
        let scores = summarize_scores(&outcomes);

        assert_eq!(scores.average_score, 75.0);
        assert_eq!(scores.valid_frames, 4);
        assert_eq!(
            scores.stats,
            FrameStats {
                total: 5,
                valid: 4,
                failed: 1,
                no_keypoint: 1,
            }
        );
        assert_eq!(scores.message, "analysed 4/5 frames");
    }

    #[test]
    fn no_valid_frames_averages_to_zero() {
        let outcomes = [
            outcome(OutcomeCode::NoKeypoint, 0.0),
            outcome(OutcomeCode::Success, 0.0),
            outcome(OutcomeCode::HttpError, 0.0),
        ];
        let scores = summarize_scores(&outcomes);

        assert_eq!(scores.average_score, 0.0);
        assert_eq!(scores.valid_frames, 0);
        assert_eq!(scores.stats.failed, 3);
        assert_eq!(scores.message, "no valid pose detected");
    }

    #[test]
    fn average_rounds_half_up() {
        let outcomes = [
            outcome(OutcomeCode::Success, 80.0),
            outcome(OutcomeCode::Success, 81.0),
        ];
        assert_eq!(summarize_scores(&outcomes).average_score, 81.0);
    }

    #[test]
    fn progress_percent_is_rounded() {
        assert_eq!(BatchProgress::new(1, 3).percent, 33);
        assert_eq!(BatchProgress::new(2, 3).percent, 67);
        assert_eq!(BatchProgress::new(0, 0).percent, 100);
    }

    #[test]
    fn options_override_retry_count() {
        let config = BatchOptions::default()
            .with_strategy(StrategyPreset::Network)
            .with_max_retries(1)
            .with_concurrency(5)
            .manager_config();

        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.strategy.max_retries(), 1);
    }
}
