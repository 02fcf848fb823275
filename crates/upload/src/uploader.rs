//! The scoring-service seam.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use posecoach_core::{AttemptError, UploadOutcome};

/// What one upload attempt sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub file_path: PathBuf,
    pub pose_id: String,
}

impl UploadRequest {
    pub fn new(file_path: impl Into<PathBuf>, pose_id: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            pose_id: pose_id.into(),
        }
    }
}

/// Sink for upload progress percentages.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Option<Arc<dyn Fn(u8) + Send + Sync>>,
}

impl ProgressReporter {
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        Self {
            sink: Some(Arc::new(sink)),
        }
    }

    /// Reporter that drops every update.
    pub fn noop() -> Self {
        Self { sink: None }
    }

    /// Report `percent` (clamped to 100).
    pub fn report(&self, percent: u8) {
        if let Some(sink) = &self.sink {
            sink(percent.min(100));
        }
    }

    /// Report `sent` out of `total` bytes.
    pub fn report_bytes(&self, sent: u64, total: u64) {
        if total == 0 {
            return;
        }
        let percent = (sent.min(total) * 100 / total) as u8;
        self.report(percent);
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::noop()
    }
}

impl core::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("active", &self.sink.is_some())
            .finish()
    }
}

/// Uploads one frame to the scoring service.
///
/// Business and transport failures come back as `Ok` outcomes carrying a
/// failure code; `Err` is reserved for failures the call could not even
/// describe as an outcome. Implementations should stop promptly once
/// `cancel` fires.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(
        &self,
        request: &UploadRequest,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome, AttemptError>;
}

#[async_trait]
impl<U: Uploader + ?Sized> Uploader for Arc<U> {
    async fn upload(
        &self,
        request: &UploadRequest,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome, AttemptError> {
        (**self).upload(request, progress, cancel).await
    }
}
