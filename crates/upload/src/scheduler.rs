//! Concurrency-limited upload scheduler.
//!
//! Admits up to `max_concurrent` uploads at once and parks the rest in a
//! priority queue. Admitted uploads run through the [`RetryExecutor`] with
//! the task's cancellation token, and every state change goes through the
//! [`TaskRegistry`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use posecoach_core::{AttemptError, TaskId, UploadOutcome};

use crate::config::UploadManagerConfig;
use crate::error::{UploadError, UploadResult};
use crate::retry::{RetryExecutor, RetryStrategy};
use crate::tasks::{
    NewTask, Subscription, TaskEvent, TaskPatch, TaskRegistry, TaskStats, TaskStatus, UploadTask,
};
use crate::uploader::{ProgressReporter, UploadRequest, Uploader};

/// One upload submitted to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub file_path: PathBuf,
    pub pose_id: String,
    /// Higher is admitted first
    pub priority: i64,
    /// Per-attempt timeout; the configured default when `None`
    pub timeout: Option<Duration>,
    /// Exactly one attempt, regardless of the retry strategy
    pub skip_retry: bool,
}

impl UploadJob {
    pub fn new(file_path: impl Into<PathBuf>, pose_id: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            pose_id: pose_id.into(),
            priority: 0,
            timeout: None,
            skip_retry: false,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn skip_retry(mut self) -> Self {
        self.skip_retry = true;
        self
    }
}

/// Priority-ordered wait queue: highest priority first, FIFO among equals.
#[derive(Debug)]
pub(crate) struct WaitQueue<T> {
    entries: Vec<(i64, T)>,
}

impl<T> WaitQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, priority: i64, item: T) {
        let at = self.entries.partition_point(|(p, _)| *p >= priority);
        self.entries.insert(at, (priority, item));
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0).1)
        }
    }

    /// Remove and return the first entry matching `pred`.
    pub(crate) fn remove_where<F>(&mut self, pred: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        let at = self.entries.iter().position(|(_, item)| pred(item))?;
        Some(self.entries.remove(at).1)
    }

    pub(crate) fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|(_, item)| item).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

struct Waiter {
    task_id: TaskId,
    admit: oneshot::Sender<AdmissionPermit>,
}

struct Admission {
    active: usize,
    queue: WaitQueue<Waiter>,
}

type SharedAdmission = Arc<Mutex<Admission>>;

fn lock(admission: &SharedAdmission) -> MutexGuard<'_, Admission> {
    admission.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One occupied concurrency slot.
///
/// Dropping the permit hands the slot straight to the next queued waiter,
/// or frees it when nobody is waiting.
struct AdmissionPermit {
    admission: SharedAdmission,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let next = {
            let mut admission = lock(&self.admission);
            match admission.queue.pop() {
                Some(waiter) => Some(waiter),
                None => {
                    admission.active = admission.active.saturating_sub(1);
                    None
                }
            }
        };

        if let Some(waiter) = next {
            debug!(task_id = %waiter.task_id, "admitted from queue");
            let permit = AdmissionPermit {
                admission: Arc::clone(&self.admission),
            };
            // A closed receiver returns the permit, whose drop moves on to
            // the next waiter.
            let _ = waiter.admit.send(permit);
        }
    }
}

/// Cancels its task if the submit future is dropped before settling.
struct SubmitGuard<'a> {
    scheduler: &'a UploadScheduler,
    task_id: TaskId,
    armed: bool,
}

impl SubmitGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.scheduler.cancel(&self.task_id) {
            debug!(task_id = %self.task_id, "submit dropped; task cancelled");
        }
    }
}

enum Admit {
    Now(AdmissionPermit),
    Queued(oneshot::Receiver<AdmissionPermit>),
}

/// Runs uploads with bounded concurrency, priority queueing, retries and
/// cancellation.
pub struct UploadScheduler {
    registry: Arc<TaskRegistry>,
    config: UploadManagerConfig,
    uploader: Arc<dyn Uploader>,
    admission: SharedAdmission,
}

impl UploadScheduler {
    pub fn new<U>(config: UploadManagerConfig, uploader: U) -> UploadResult<Self>
    where
        U: Uploader + 'static,
    {
        config.validate()?;
        Ok(Self {
            registry: TaskRegistry::new(config.cleanup_grace),
            config,
            uploader: Arc::new(uploader),
            admission: Arc::new(Mutex::new(Admission {
                active: 0,
                queue: WaitQueue::new(),
            })),
        })
    }

    pub fn config(&self) -> &UploadManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Register `task_id`, wait for a slot and run the upload to a terminal
    /// status.
    ///
    /// Resolves with the outcome once the task is `Completed`. Business
    /// codes such as `NO_KEYPOINT` still complete the task; only transport
    /// failures go through the retry strategy.
    ///
    /// Dropping the returned future cancels the task.
    pub async fn submit(&self, task_id: TaskId, job: UploadJob) -> UploadResult<UploadOutcome> {
        self.registry.create(
            task_id.clone(),
            NewTask::new(job.file_path.clone(), job.pose_id.clone()).with_priority(job.priority),
        )?;
        let guard = SubmitGuard {
            scheduler: self,
            task_id: task_id.clone(),
            armed: true,
        };

        let permit = match self.admit(&task_id, job.priority) {
            Admit::Now(permit) => permit,
            Admit::Queued(admitted) => match admitted.await {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(task_id = %task_id, "removed from queue before start");
                    return Err(UploadError::Cancelled(task_id));
                }
            },
        };

        let cancel = CancellationToken::new();
        if !self.registry.update(
            &task_id,
            TaskStatus::Uploading,
            TaskPatch::progress(0).cancel_token(cancel.clone()),
        ) {
            return Err(UploadError::Cancelled(task_id));
        }

        let result = self.run_attempts(&task_id, &job, cancel.clone()).await;
        let settled = self.settle(task_id, result, &cancel);
        guard.disarm();
        drop(permit);
        settled
    }

    /// Cancel a queued or running task. Returns `false` when the task is
    /// unknown or already terminal.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        // Dropping the waiter's sender resolves its submit as cancelled.
        let waiter = lock(&self.admission)
            .queue
            .remove_where(|w| &w.task_id == task_id);
        drop(waiter);

        self.registry.cancel(task_id)
    }

    /// Cancel every live task and empty the wait queue. Returns the number
    /// of tasks cancelled.
    pub fn cancel_all(&self) -> usize {
        let waiters = lock(&self.admission).queue.drain();
        drop(waiters);

        let cancelled = self
            .registry
            .live_task_ids()
            .iter()
            .filter(|id| self.registry.cancel(id))
            .count();
        if cancelled > 0 {
            info!(cancelled, "cancelled all live tasks");
        }
        cancelled
    }

    pub fn get_task(&self, task_id: &TaskId) -> Option<UploadTask> {
        self.registry.get(task_id)
    }

    pub fn get_all_tasks(&self) -> Vec<UploadTask> {
        self.registry.all_tasks()
    }

    pub fn get_stats(&self) -> TaskStats {
        let (active, queued) = {
            let admission = lock(&self.admission);
            (admission.active, admission.queue.len())
        };
        TaskStats {
            active,
            queued,
            ..self.registry.stats()
        }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.admission).active
    }

    pub fn queued_count(&self) -> usize {
        lock(&self.admission).queue.len()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.registry.subscribe(listener)
    }

    fn admit(&self, task_id: &TaskId, priority: i64) -> Admit {
        let mut admission = lock(&self.admission);
        if admission.active < self.config.max_concurrent {
            admission.active += 1;
            return Admit::Now(AdmissionPermit {
                admission: Arc::clone(&self.admission),
            });
        }

        let (tx, rx) = oneshot::channel();
        admission.queue.push(
            priority,
            Waiter {
                task_id: task_id.clone(),
                admit: tx,
            },
        );
        debug!(
            task_id = %task_id,
            priority,
            queued = admission.queue.len(),
            "queued; concurrency limit reached"
        );
        Admit::Queued(rx)
    }

    async fn run_attempts(
        &self,
        task_id: &TaskId,
        job: &UploadJob,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome, AttemptError> {
        let strategy = self.config.effective_strategy(job.skip_retry);
        let limit = job.timeout.unwrap_or(self.config.upload_timeout);

        let registry = Arc::clone(&self.registry);
        let retry_id = task_id.clone();
        let executor = RetryExecutor::new(strategy)
            .named(format!("upload {task_id}"))
            .with_cancellation(cancel)
            .on_retry(move |attempt, _, delay| registry.record_retry(&retry_id, attempt, delay));

        let request = UploadRequest::new(job.file_path.clone(), job.pose_id.clone());
        let progress = self.progress_reporter(task_id);

        executor
            .execute_with_timeout(limit, |token| {
                attempt_upload(
                    Arc::clone(&self.uploader),
                    request.clone(),
                    progress.clone(),
                    token,
                )
            })
            .await
    }

    fn settle(
        &self,
        task_id: TaskId,
        result: Result<UploadOutcome, AttemptError>,
        cancel: &CancellationToken,
    ) -> UploadResult<UploadOutcome> {
        match result {
            Ok(outcome) => {
                let applied = self.registry.update(
                    &task_id,
                    TaskStatus::Completed,
                    TaskPatch::result(outcome.clone()),
                );
                if !applied && self.registry.status(&task_id) == Some(TaskStatus::Cancelled) {
                    return Err(UploadError::Cancelled(task_id));
                }
                debug!(task_id = %task_id, code = %outcome.code, score = outcome.score, "task completed");
                Ok(outcome)
            }
            Err(err) if err.is_abort() || cancel.is_cancelled() => {
                self.registry.cancel(&task_id);
                Err(UploadError::Cancelled(task_id))
            }
            Err(err) => {
                self.registry
                    .update(&task_id, TaskStatus::Failed, TaskPatch::error(err.clone()));
                Err(UploadError::Failed {
                    task_id,
                    source: err,
                })
            }
        }
    }

    fn progress_reporter(&self, task_id: &TaskId) -> ProgressReporter {
        let registry = Arc::clone(&self.registry);
        let task_id = task_id.clone();
        ProgressReporter::new(move |percent| {
            registry.update(&task_id, TaskStatus::Uploading, TaskPatch::progress(percent));
        })
    }
}

impl core::fmt::Debug for UploadScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UploadScheduler")
            .field("config", &self.config)
            .field("stats", &self.get_stats())
            .finish()
    }
}

/// One attempt: a resolved transport-failure or abort outcome becomes an
/// error so the retry strategy can judge it.
async fn attempt_upload(
    uploader: Arc<dyn Uploader>,
    request: UploadRequest,
    progress: ProgressReporter,
    cancel: CancellationToken,
) -> Result<UploadOutcome, AttemptError> {
    let outcome = uploader.upload(&request, progress, cancel).await?;
    match AttemptError::from_outcome(&outcome) {
        Some(err) => Err(err),
        None => Ok(outcome),
    }
}

/// Upload one file under `strategy` without registry bookkeeping.
pub async fn upload_with_retry<U>(
    uploader: &U,
    request: &UploadRequest,
    strategy: RetryStrategy,
) -> Result<UploadOutcome, AttemptError>
where
    U: Uploader + ?Sized,
{
    RetryExecutor::new(strategy)
        .named(format!("upload {}", request.file_path.display()))
        .execute(|token| async move {
            let outcome = uploader
                .upload(request, ProgressReporter::noop(), token)
                .await?;
            match AttemptError::from_outcome(&outcome) {
                Some(err) => Err(err),
                None => Ok(outcome),
            }
        })
        .await
}
