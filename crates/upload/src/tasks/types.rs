//! Upload task record, its state machine and registry events.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use posecoach_core::{AttemptError, TaskId, UploadOutcome};

/// Lifecycle status of an upload task.
///
/// `Pending -> Uploading -> Completed | Failed`, and `Cancelled` from any
/// non-terminal status. Status only ever moves forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for a concurrency slot
    Pending,
    /// Admitted; an attempt or a retry delay is outstanding
    Uploading,
    Completed,
    /// Retries exhausted or non-retryable error
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a forward transition.
    ///
    /// Re-entering the current non-terminal status is allowed (progress
    /// updates while uploading).
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Cancelled) => true,
            (Pending, Pending | Uploading) => true,
            (Uploading, Uploading | Completed | Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied fields of a new task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub file_path: PathBuf,
    pub pose_id: String,
    /// Higher is served first
    pub priority: i64,
}

impl NewTask {
    pub fn new(file_path: impl Into<PathBuf>, pose_id: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            pose_id: pose_id.into(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// One tracked upload-and-score attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTask {
    pub task_id: TaskId,
    pub file_path: PathBuf,
    pub pose_id: String,
    pub status: TaskStatus,
    pub priority: i64,
    /// Upload progress, 0..=100
    pub progress: u8,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// Number of the latest scheduled retry (0 = none yet)
    pub retry_attempt: u32,
    pub result: Option<UploadOutcome>,
    pub error: Option<AttemptError>,
    /// Present only while an attempt or retry delay is outstanding.
    #[serde(skip)]
    pub(crate) cancel: Option<CancellationToken>,
}

impl UploadTask {
    pub(crate) fn new(task_id: TaskId, fields: NewTask) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            file_path: fields.file_path,
            pose_id: fields.pose_id,
            status: TaskStatus::Pending,
            priority: fields.priority,
            progress: 0,
            start_time: now,
            last_update: now,
            retry_attempt: 0,
            result: None,
            error: None,
            cancel: None,
        }
    }

    /// Whether an in-flight attempt can currently be cancelled.
    pub fn is_cancellable(&self) -> bool {
        self.cancel.is_some()
    }

    pub(crate) fn apply(&mut self, status: TaskStatus, patch: TaskPatch) {
        self.status = status;
        self.last_update = Utc::now();

        if let Some(progress) = patch.progress {
            self.progress = progress.min(100);
        }
        if let Some(attempt) = patch.retry_attempt {
            self.retry_attempt = attempt;
        }
        if patch.result.is_some() {
            self.result = patch.result;
        }
        if patch.error.is_some() {
            self.error = patch.error;
        }
        if patch.cancel.is_some() {
            self.cancel = patch.cancel;
        }

        if status.is_terminal() {
            self.cancel = None;
        }
        if status == TaskStatus::Completed {
            self.progress = 100;
        }
    }
}

/// Field changes applied together with a status update.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub progress: Option<u8>,
    pub retry_attempt: Option<u32>,
    pub result: Option<UploadOutcome>,
    pub error: Option<AttemptError>,
    pub(crate) cancel: Option<CancellationToken>,
}

impl TaskPatch {
    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn result(outcome: UploadOutcome) -> Self {
        Self {
            result: Some(outcome),
            ..Self::default()
        }
    }

    pub fn error(error: AttemptError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// Attach the token that cancels the task's outstanding attempt.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// What happened to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventKind {
    Created,
    Updated { old_status: TaskStatus },
    Retry { attempt: u32, delay_ms: u64 },
    /// Evicted from the live map after the grace period
    Cleaned,
}

/// Notification delivered to registry listeners.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    /// Snapshot of the task right after the change
    pub task: UploadTask,
    pub kind: TaskEventKind,
}

/// Read-only counters over the live tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub active: usize,
    pub queued: usize,
    pub pending: usize,
    pub uploading: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use posecoach_core::OutcomeCode;

    #[test]
    fn terminal_statuses_accept_nothing() {
        for s in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            assert!(s.is_terminal());
            for next in [
                TaskStatus::Pending,
                TaskStatus::Uploading,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(!s.can_transition_to(next), "{s} -> {next}");
            }
        }
    }

    #[test]
    fn status_never_moves_backwards() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Uploading));
        assert!(TaskStatus::Uploading.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Uploading.can_transition_to(TaskStatus::Uploading));
        assert!(!TaskStatus::Uploading.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn completing_clears_cancel_token_and_fills_progress() {
        let mut task = UploadTask::new(
            TaskId::for_frame(0),
            NewTask::new("/tmp/f0.jpg", "warrior"),
        );
        task.apply(
            TaskStatus::Uploading,
            TaskPatch::progress(40).cancel_token(CancellationToken::new()),
        );
        assert!(task.is_cancellable());
        assert_eq!(task.progress, 40);

        task.apply(
            TaskStatus::Completed,
            TaskPatch::result(UploadOutcome::new("warrior", OutcomeCode::Success, 88.0)),
        );
        assert!(!task.is_cancellable());
        assert_eq!(task.progress, 100);
        assert_eq!(task.result.as_ref().map(|o| o.score), Some(88.0));
    }
}
