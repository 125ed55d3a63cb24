//! Shared deterministic types for the refinement loop.
//!
//! These types define stable contracts between the controller, the history
//! model and the feedback builder. They carry no I/O and serialize to a stable
//! JSON shape for iteration logs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Status of a refinement run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Converged,
    Exhausted,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Converged => "converged",
            RunStatus::Exhausted => "exhausted",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Opaque proposed modification to the target project.
///
/// The loop never looks inside `content`; only the applier interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDescriptor {
    pub id: String,
    pub content: String,
}

impl PatchDescriptor {
    /// Build a descriptor whose id is derived from the content digest.
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let digest = Sha256::digest(content.as_bytes());
        let id = format!("patch-{}", &hex::encode(digest)[..12]);
        Self { id, content }
    }

    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Outcome of the apply phase for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// The patch modified at least one file.
    Applied { files_changed: usize },
    /// The patch was empty or a no-op; the project is unchanged.
    NoChange,
    /// The patch did not apply cleanly; the project is unchanged.
    Rejected { reason: String },
    /// No patch reached the applier (the proposal failed).
    NotRun,
}

/// Outcome of the validation phase for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Pass { output: String },
    Fail { diagnostic: String },
    NotRun,
}

impl ValidationOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, ValidationOutcome::Pass { .. })
    }
}

/// Which phase an attempt failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Proposal,
    Apply,
    Validation,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Proposal => "proposal failed",
            FailureClass::Apply => "patch did not apply",
            FailureClass::Validation => "validation failed",
        }
    }
}
