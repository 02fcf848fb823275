//! `reqwest`-backed [`Uploader`] for the pose scoring endpoint.

use std::path::Path;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Body;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use posecoach_core::{AttemptError, OutcomeCode, UploadOutcome};

use crate::uploader::{ProgressReporter, UploadRequest, Uploader};

/// Bytes per streamed chunk; each chunk handed to the transport is one
/// progress report.
const CHUNK_SIZE: usize = 64 * 1024;

/// Posts frames as `multipart/form-data` (`file` part plus a `poseId`
/// field) and maps every response to an [`UploadOutcome`].
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpUploader {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(
        &self,
        request: &UploadRequest,
        bytes: Vec<u8>,
        progress: ProgressReporter,
    ) -> UploadOutcome {
        let size = bytes.len() as u64;
        let body = Body::wrap_stream(progress_chunks(bytes, progress));
        let part = Part::stream_with_length(body, size).file_name(file_name(&request.file_path));
        let form = Form::new()
            .part("file", part)
            .text("poseId", request.pose_id.clone());

        let response = match self.client.post(&self.endpoint).multipart(form).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "upload failed");
                return UploadOutcome::new(&request.pose_id, OutcomeCode::UploadFailed, 0.0)
                    .with_message(format!("upload failed: {e}"));
            }
        };

        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => outcome_from_response(status, &body, &request.pose_id, &self.endpoint),
            Err(e) => {
                warn!(endpoint = %self.endpoint, status, error = %e, "response body unreadable");
                UploadOutcome::new(&request.pose_id, OutcomeCode::UploadFailed, 0.0)
                    .with_message(format!("upload failed: {e}"))
            }
        }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(
        &self,
        request: &UploadRequest,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome, AttemptError> {
        let bytes = tokio::fs::read(&request.file_path).await.map_err(|e| {
            AttemptError::invalid_params(format!(
                "cannot read {}: {e}",
                request.file_path.display()
            ))
        })?;
        let size = bytes.len() as u64;
        progress.report(0);
        debug!(endpoint = %self.endpoint, file = %request.file_path.display(), size, "uploading frame");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                UploadOutcome::new(&request.pose_id, OutcomeCode::Aborted, 0.0)
                    .with_message("upload cancelled by user")
            }
            outcome = self.post(request, bytes, progress) => outcome,
        };
        Ok(outcome)
    }
}

/// Split `bytes` into body chunks, reporting bytes sent as each chunk is
/// pulled by the transport.
fn progress_chunks(
    bytes: Vec<u8>,
    progress: ProgressReporter,
) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + Sync + 'static {
    let total = bytes.len() as u64;
    let chunks: Vec<Vec<u8>> = bytes.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect();
    let mut sent = 0u64;
    futures::stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as u64;
        progress.report_bytes(sent, total);
        Ok::<_, std::io::Error>(chunk)
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "frame".to_string())
}

/// Map an HTTP status and body to the outcome the scoring call reports.
///
/// - non-200 carrying a structured `code`: that outcome
/// - any other non-200: `HTTP_ERROR`
/// - unparseable body: `INVALID_JSON`
/// - missing `code`: `SUCCESS`
pub fn outcome_from_response(status: u16, body: &str, pose_id: &str, endpoint: &str) -> UploadOutcome {
    let json = serde_json::from_str::<Value>(body)
        .ok()
        .filter(Value::is_object);
    let has_code = json
        .as_ref()
        .and_then(|v| v.get("code"))
        .is_some_and(|code| code.as_str().is_some_and(|c| !c.is_empty()));

    if status != 200 {
        warn!(status, endpoint, "scoring endpoint returned an error status");
        if let (Some(json), true) = (json, has_code) {
            return structured_outcome(json, pose_id)
                .map(|mut outcome| {
                    if outcome.message.is_none() {
                        outcome.message = Some(format!("HTTP {status}"));
                    }
                    outcome
                })
                .unwrap_or_else(|| http_error(status, pose_id, endpoint));
        }
        return http_error(status, pose_id, endpoint);
    }

    let Some(mut json) = json else {
        warn!(endpoint, "scoring endpoint returned invalid JSON");
        return UploadOutcome::new(pose_id, OutcomeCode::InvalidJson, 0.0)
            .with_message("invalid JSON response");
    };

    if !has_code {
        if let Some(map) = json.as_object_mut() {
            map.insert("code".to_string(), Value::from(OutcomeCode::Success.as_str()));
        }
    }
    structured_outcome(json, pose_id).unwrap_or_else(|| {
        UploadOutcome::new(pose_id, OutcomeCode::InvalidJson, 0.0)
            .with_message("invalid JSON response")
    })
}

fn structured_outcome(mut json: Value, pose_id: &str) -> Option<UploadOutcome> {
    let map = json.as_object_mut()?;
    let missing_pose = map
        .get("poseId")
        .and_then(Value::as_str)
        .is_none_or(str::is_empty);
    if missing_pose {
        map.insert("poseId".to_string(), Value::from(pose_id));
    }
    if map.get("score").is_some_and(Value::is_null) {
        map.remove("score");
    }

    let mut outcome: UploadOutcome = serde_json::from_value(json).ok()?;
    if matches!(outcome.code, OutcomeCode::NoKeypoint) {
        outcome.score = 0.0;
        outcome.skeleton_url = None;
    }
    Some(outcome)
}

fn http_error(status: u16, pose_id: &str, endpoint: &str) -> UploadOutcome {
    UploadOutcome::new(pose_id, OutcomeCode::HttpError, 0.0)
        .with_message(format!("HTTP {status} from {endpoint}"))
}
