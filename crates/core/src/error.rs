//! Error model: core value errors and the retry-layer error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result of parsing or constructing a core value.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error building a core value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. blank or parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A retry strategy name that is not one of the known presets.
    #[error("unknown retry strategy: {0}")]
    UnknownStrategy(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_strategy(name: impl Into<String>) -> Self {
        Self::UnknownStrategy(name.into())
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    Server,
    Timeout,
    UserAbort,
    QuotaExceeded,
    InvalidParams,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "NETWORK",
            ErrorKind::Server => "SERVER",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::UserAbort => "USER_ABORT",
            ErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorKind::InvalidParams => "INVALID_PARAMS",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error produced by one attempt of an operation (or by a timeout wrapper).
///
/// `code` carries the transport/business code when one exists (e.g.
/// `HTTP_ERROR`); retry conditions may match on either `kind` or `code`.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct AttemptError {
    pub kind: ErrorKind,
    pub code: Option<String>,
    pub message: String,
    pub was_aborted: bool,
}

impl AttemptError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
            was_aborted: kind == ErrorKind::UserAbort,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message).with_code("NETWORK_ERROR")
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message).with_code("TIMEOUT")
    }

    /// Cancellation requested by the user/caller. Never retried.
    pub fn aborted() -> Self {
        Self::new(ErrorKind::UserAbort, "cancelled").with_code("USER_ABORT")
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParams, message)
    }

    /// Retry-layer error for an outcome that reports a transport failure or
    /// an abort. Business results yield `None`.
    pub fn from_outcome(outcome: &crate::outcome::UploadOutcome) -> Option<Self> {
        outcome.as_attempt_error()
    }

    /// True for user-initiated cancellation, however it was signalled.
    pub fn is_abort(&self) -> bool {
        self.was_aborted
            || self.kind == ErrorKind::UserAbort
            || self.code.as_deref() == Some("USER_ABORT")
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_is_flagged() {
        let e = AttemptError::aborted();
        assert!(e.is_abort());
        assert!(e.was_aborted);
        assert_eq!(e.kind, ErrorKind::UserAbort);
    }

    #[test]
    fn abort_detected_from_code_alone() {
        let e = AttemptError::server("stopped").with_code("USER_ABORT");
        assert!(e.is_abort());
    }

    #[test]
    fn display_includes_kind_and_message() {
        let e = AttemptError::timeout("upload took too long");
        assert_eq!(e.to_string(), "TIMEOUT: upload took too long");
        assert!(e.has_code("TIMEOUT"));
    }

    #[test]
    fn kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorKind::QuotaExceeded).unwrap();
        assert_eq!(json, "\"QUOTA_EXCEEDED\"");
    }
}
