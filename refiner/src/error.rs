//! Non-recoverable run errors.
//!
//! Attempt-level failures never surface here; they are recorded in the
//! history. A [`FatalError`] stops the run regardless of remaining budget and
//! its message becomes the run's fatal diagnostic.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::cancel::CancelReason;

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("project {} is inaccessible: {reason}", path.display())]
    ProjectInaccessible { path: PathBuf, reason: String },
    #[error("proposal provider rejected credentials: {0}")]
    Authentication(String),
    #[error("run cancelled: {}", .0.as_str())]
    Cancelled(CancelReason),
    #[error("validation did not terminate within {}s", .0.as_secs())]
    ValidationHung(Duration),
    #[error("could not build proposal context: {0}")]
    Feedback(String),
}
