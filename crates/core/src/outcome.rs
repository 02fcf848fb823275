//! Outcome returned by the remote scoring service for one uploaded frame.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AttemptError, ErrorKind};

/// Business-level result tag of a scoring call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeCode {
    Success,
    NoKeypoint,
    Error,
    NoFile,
    HttpError,
    InvalidJson,
    UploadFailed,
    NetworkError,
    Timeout,
    Aborted,
    #[serde(other)]
    Unknown,
}

impl OutcomeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeCode::Success => "SUCCESS",
            OutcomeCode::NoKeypoint => "NO_KEYPOINT",
            OutcomeCode::Error => "ERROR",
            OutcomeCode::NoFile => "NO_FILE",
            OutcomeCode::HttpError => "HTTP_ERROR",
            OutcomeCode::InvalidJson => "INVALID_JSON",
            OutcomeCode::UploadFailed => "UPLOAD_FAILED",
            OutcomeCode::NetworkError => "NETWORK_ERROR",
            OutcomeCode::Timeout => "TIMEOUT",
            OutcomeCode::Aborted => "ABORTED",
            OutcomeCode::Unknown => "UNKNOWN",
        }
    }

    /// Parse a wire code; anything unrecognised maps to `Unknown`.
    pub fn parse(code: &str) -> Self {
        match code {
            "SUCCESS" => OutcomeCode::Success,
            "NO_KEYPOINT" => OutcomeCode::NoKeypoint,
            "ERROR" => OutcomeCode::Error,
            "NO_FILE" => OutcomeCode::NoFile,
            "HTTP_ERROR" => OutcomeCode::HttpError,
            "INVALID_JSON" => OutcomeCode::InvalidJson,
            "UPLOAD_FAILED" => OutcomeCode::UploadFailed,
            "NETWORK_ERROR" => OutcomeCode::NetworkError,
            "TIMEOUT" => OutcomeCode::Timeout,
            "ABORTED" => OutcomeCode::Aborted,
            _ => OutcomeCode::Unknown,
        }
    }

    /// Codes that describe a transport failure rather than a scoring verdict.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            OutcomeCode::UploadFailed
                | OutcomeCode::HttpError
                | OutcomeCode::NetworkError
                | OutcomeCode::Timeout
        )
    }
}

impl core::fmt::Display for OutcomeCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured response of the scoring service.
///
/// The service resolves with one of these even for business and network
/// failures; only call-setup errors are reported as `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    #[serde(default)]
    pub score: f64,
    pub code: OutcomeCode,
    #[serde(default)]
    pub skeleton_url: Option<String>,
    #[serde(default)]
    pub pose_id: String,
    #[serde(default, rename = "msg", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub was_aborted: bool,
    /// Remaining service fields (keypoints, label, suggestion, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UploadOutcome {
    pub fn new(pose_id: impl Into<String>, code: OutcomeCode, score: f64) -> Self {
        Self {
            score,
            code,
            skeleton_url: None,
            pose_id: pose_id.into(),
            message: None,
            was_aborted: code == OutcomeCode::Aborted,
            extra: Map::new(),
        }
    }

    pub fn success(pose_id: impl Into<String>, score: f64) -> Self {
        Self::new(pose_id, OutcomeCode::Success, score)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_skeleton_url(mut self, url: impl Into<String>) -> Self {
        self.skeleton_url = Some(url.into());
        self
    }

    /// A frame counts towards the average only when scored successfully
    /// with a positive score.
    pub fn is_valid(&self) -> bool {
        self.code == OutcomeCode::Success && self.score > 0.0
    }

    /// Error for the retry layer when this outcome is a transport failure
    /// or an abort; `None` for business results.
    pub fn as_attempt_error(&self) -> Option<AttemptError> {
        if self.was_aborted || self.code == OutcomeCode::Aborted {
            return Some(AttemptError::aborted());
        }
        if !self.code.is_transport_failure() {
            return None;
        }
        let kind = match self.code {
            OutcomeCode::Timeout => ErrorKind::Timeout,
            OutcomeCode::HttpError => ErrorKind::Server,
            _ => ErrorKind::Network,
        };
        let message = self
            .message
            .clone()
            .unwrap_or_else(|| format!("scoring call resolved with {}", self.code));
        Some(AttemptError::new(kind, message).with_code(self.code.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_payload_with_extra_fields() {
        let json = r#"{
            "score": 87,
            "code": "SUCCESS",
            "skeletonUrl": "https://cdn/s.png",
            "poseId": "tree",
            "label": "tree_pose"
        }"#;
        let outcome: UploadOutcome = serde_json::from_str(json).unwrap();
        assert_eq!(outcome.code, OutcomeCode::Success);
        assert_eq!(outcome.score, 87.0);
        assert_eq!(outcome.skeleton_url.as_deref(), Some("https://cdn/s.png"));
        assert_eq!(outcome.extra.get("label"), Some(&Value::from("tree_pose")));
        assert!(outcome.is_valid());
    }

    #[test]
    fn unknown_codes_do_not_fail_parsing() {
        let outcome: UploadOutcome =
            serde_json::from_str(r#"{"code": "SOMETHING_NEW", "poseId": "x"}"#).unwrap();
        assert_eq!(outcome.code, OutcomeCode::Unknown);
        assert!(!outcome.is_valid());
    }

    #[test]
    fn zero_score_success_is_not_valid() {
        assert!(!UploadOutcome::success("p", 0.0).is_valid());
    }

    #[test]
    fn business_results_are_not_attempt_errors() {
        for code in [
            OutcomeCode::Success,
            OutcomeCode::NoKeypoint,
            OutcomeCode::Error,
            OutcomeCode::InvalidJson,
        ] {
            assert!(UploadOutcome::new("p", code, 0.0).as_attempt_error().is_none());
        }
    }

    #[test]
    fn transport_failures_carry_their_code() {
        let err = UploadOutcome::new("p", OutcomeCode::HttpError, 0.0)
            .as_attempt_error()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::Server);
        assert!(err.has_code("HTTP_ERROR"));

        let err = UploadOutcome::new("p", OutcomeCode::Aborted, 0.0)
            .as_attempt_error()
            .unwrap();
        assert!(err.is_abort());
    }
}
