//! `posecoach-core` — value types shared by the upload pipeline.
//!
//! This crate contains **pure** primitives (no IO, no async): identifiers,
//! the retry-layer error taxonomy and the scoring outcome returned by the
//! remote pose service.

pub mod error;
pub mod id;
pub mod outcome;

pub use error::{AttemptError, CoreError, CoreResult, ErrorKind};
pub use id::{BatchId, TaskId};
pub use outcome::{OutcomeCode, UploadOutcome};
