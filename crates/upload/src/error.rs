use posecoach_core::{AttemptError, TaskId};

use crate::config::ConfigError;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("task already registered: {0}")]
    DuplicateTask(TaskId),
}

/// Upload scheduler errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UploadError {
    #[error("task already registered: {0}")]
    DuplicateTask(TaskId),

    #[error("task cancelled: {0}")]
    Cancelled(TaskId),

    #[error("task {task_id} failed: {source}")]
    Failed {
        task_id: TaskId,
        #[source]
        source: AttemptError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl UploadError {
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            UploadError::DuplicateTask(id) | UploadError::Cancelled(id) => Some(id),
            UploadError::Failed { task_id, .. } => Some(task_id),
            UploadError::Config(_) => None,
        }
    }

    /// The attempt error behind a failure, if any.
    pub fn attempt_error(&self) -> Option<&AttemptError> {
        match self {
            UploadError::Failed { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled(_))
    }
}

impl From<RegistryError> for UploadError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateTask(id) => UploadError::DuplicateTask(id),
        }
    }
}

pub type UploadResult<T> = Result<T, UploadError>;
