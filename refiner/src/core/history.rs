//! Append-only attempt history and run status.
//!
//! [`ProjectState`] is the single source of truth for what happened during a
//! run. Records can only be appended, and the status is derived from the
//! history at append time so the status invariants cannot drift from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{ApplyOutcome, FailureClass, RunStatus, ValidationOutcome};

/// One propose -> apply -> validate cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 0-based attempt index; equals the number of records before this one.
    pub index: u32,
    /// Id of the proposed patch, if a proposal was produced.
    pub patch_id: Option<String>,
    /// Proposal error that ended the attempt before a patch existed.
    pub proposal_error: Option<String>,
    /// Transient proposal errors retried within this attempt.
    pub transient_retries: u32,
    pub apply: ApplyOutcome,
    pub validation: ValidationOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn passed(&self) -> bool {
        self.validation.is_pass()
    }

    /// Failure class and diagnostic text, or `None` when the attempt passed.
    pub fn failure(&self) -> Option<(FailureClass, &str)> {
        if let Some(err) = &self.proposal_error {
            return Some((FailureClass::Proposal, err.as_str()));
        }
        if let ApplyOutcome::Rejected { reason } = &self.apply {
            return Some((FailureClass::Apply, reason.as_str()));
        }
        match &self.validation {
            ValidationOutcome::Fail { diagnostic } => {
                Some((FailureClass::Validation, diagnostic.as_str()))
            }
            ValidationOutcome::Pass { .. } => None,
            ValidationOutcome::NotRun => Some((FailureClass::Validation, "validation not run")),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("run is already {0}; no further attempts may be recorded")]
    NotRunning(&'static str),
    #[error("attempt budget of {budget} already consumed")]
    BudgetExceeded { budget: u32 },
    #[error("attempt index {got} out of order (expected {expected})")]
    IndexMismatch { expected: u32, got: u32 },
}

/// History and status for exactly one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectState {
    run_id: String,
    iteration_budget: u32,
    status: RunStatus,
    history: Vec<AttemptRecord>,
    fatal: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl ProjectState {
    /// Start a run. A zero budget is exhausted before any attempt.
    pub fn new(run_id: impl Into<String>, iteration_budget: u32) -> Self {
        let now = Utc::now();
        let (status, finished_at) = if iteration_budget == 0 {
            (RunStatus::Exhausted, Some(now))
        } else {
            (RunStatus::Running, None)
        };
        Self {
            run_id: run_id.into(),
            iteration_budget,
            status,
            history: Vec::new(),
            fatal: None,
            started_at: now,
            finished_at,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn iteration_budget(&self) -> u32 {
        self.iteration_budget
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn history(&self) -> &[AttemptRecord] {
        &self.history
    }

    pub fn last(&self) -> Option<&AttemptRecord> {
        self.history.last()
    }

    /// Diagnostic for a `Failed` run.
    pub fn fatal(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Index the next appended record must carry.
    pub fn next_index(&self) -> u32 {
        self.history.len() as u32
    }

    pub fn remaining_budget(&self) -> u32 {
        self.iteration_budget.saturating_sub(self.next_index())
    }

    /// Append a finished attempt and derive the new status from it.
    pub fn append(&mut self, record: AttemptRecord) -> Result<RunStatus, HistoryError> {
        if self.status.is_terminal() {
            return Err(HistoryError::NotRunning(self.status.as_str()));
        }
        if self.remaining_budget() == 0 {
            return Err(HistoryError::BudgetExceeded {
                budget: self.iteration_budget,
            });
        }
        let expected = self.next_index();
        if record.index != expected {
            return Err(HistoryError::IndexMismatch {
                expected,
                got: record.index,
            });
        }

        let passed = record.passed();
        self.history.push(record);
        if passed {
            self.finish(RunStatus::Converged);
        } else if self.remaining_budget() == 0 {
            self.finish(RunStatus::Exhausted);
        }
        Ok(self.status)
    }

    /// Stop the run on a non-recoverable error. No-op once terminal.
    pub fn fail(&mut self, diagnostic: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.fatal = Some(diagnostic.into());
        self.finish(RunStatus::Failed);
    }

    /// Count prior failures per class.
    pub fn failure_counts(&self) -> FailureCounts {
        FailureCounts::from_history(&self.history)
    }

    /// Check the status/history invariants, returning human-readable violations.
    pub fn check_invariants(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let len = self.history.len() as u32;

        if len > self.iteration_budget {
            errors.push(format!(
                "history length {len} exceeds iteration budget {}",
                self.iteration_budget
            ));
        }
        for (pos, record) in self.history.iter().enumerate() {
            if record.index != pos as u32 {
                errors.push(format!(
                    "record at position {pos} has index {}",
                    record.index
                ));
            }
        }
        if let Some((pos, _)) = self
            .history
            .iter()
            .enumerate()
            .find(|(pos, record)| record.passed() && *pos + 1 != self.history.len())
        {
            errors.push(format!("passing record {pos} is followed by further attempts"));
        }

        let last_passed = self.history.last().is_some_and(AttemptRecord::passed);
        let any_passed = self.history.iter().any(AttemptRecord::passed);
        match self.status {
            RunStatus::Converged if !last_passed => {
                errors.push("status converged but last record did not pass".to_string());
            }
            RunStatus::Exhausted if len != self.iteration_budget || any_passed => {
                errors.push(format!(
                    "status exhausted with {len}/{} attempts (any passed: {any_passed})",
                    self.iteration_budget
                ));
            }
            RunStatus::Failed if self.fatal.is_none() => {
                errors.push("status failed without a fatal diagnostic".to_string());
            }
            RunStatus::Running if last_passed => {
                errors.push("status running but last record passed".to_string());
            }
            RunStatus::Running if len == self.iteration_budget => {
                errors.push("status running with budget consumed".to_string());
            }
            _ => {}
        }
        if self.status != RunStatus::Failed && self.fatal.is_some() {
            errors.push(format!(
                "fatal diagnostic present on {} run",
                self.status.as_str()
            ));
        }
        errors
    }

    fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// Per-class failure tally over a history slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FailureCounts {
    pub total: usize,
    pub proposal: usize,
    pub apply: usize,
    pub validation: usize,
}

impl FailureCounts {
    pub fn from_history(history: &[AttemptRecord]) -> Self {
        let mut counts = Self::default();
        for (class, _) in history.iter().filter_map(AttemptRecord::failure) {
            counts.total += 1;
            match class {
                FailureClass::Proposal => counts.proposal += 1,
                FailureClass::Apply => counts.apply += 1,
                FailureClass::Validation => counts.validation += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{apply_failed, passed, validation_failed};

    #[test]
    fn zero_budget_starts_exhausted() {
        let state = ProjectState::new("run", 0);
        assert_eq!(state.status(), RunStatus::Exhausted);
        assert!(state.history().is_empty());
        assert!(state.finished_at().is_some());
        assert!(state.check_invariants().is_empty());
    }

    #[test]
    fn passing_record_converges() {
        let mut state = ProjectState::new("run", 3);
        let status = state.append(passed(0, "ok")).expect("append");
        assert_eq!(status, RunStatus::Converged);
        assert_eq!(state.history().len(), 1);
        assert!(state.check_invariants().is_empty());
    }

    #[test]
    fn consuming_budget_without_pass_exhausts() {
        let mut state = ProjectState::new("run", 2);
        assert_eq!(
            state.append(validation_failed(0, "D1")).expect("append"),
            RunStatus::Running
        );
        assert_eq!(
            state.append(apply_failed(1, "hunk 2 failed")).expect("append"),
            RunStatus::Exhausted
        );
        assert_eq!(state.remaining_budget(), 0);
        assert!(state.check_invariants().is_empty());
    }

    #[test]
    fn append_after_terminal_is_rejected() {
        let mut state = ProjectState::new("run", 1);
        state.append(validation_failed(0, "D1")).expect("append");
        let err = state.append(passed(1, "ok")).unwrap_err();
        assert_eq!(err, HistoryError::NotRunning("exhausted"));
        assert_eq!(state.history().len(), 1);
    }

    #[test]
    fn append_rejects_out_of_order_index() {
        let mut state = ProjectState::new("run", 3);
        let err = state.append(validation_failed(1, "D")).unwrap_err();
        assert_eq!(
            err,
            HistoryError::IndexMismatch {
                expected: 0,
                got: 1
            }
        );
        assert!(state.history().is_empty());
    }

    #[test]
    fn fail_keeps_history_and_records_diagnostic() {
        let mut state = ProjectState::new("run", 5);
        state.append(validation_failed(0, "D1")).expect("append");
        state.fail("authentication failed: 401");
        assert_eq!(state.status(), RunStatus::Failed);
        assert_eq!(state.fatal(), Some("authentication failed: 401"));
        assert_eq!(state.history().len(), 1);
        assert!(state.check_invariants().is_empty());

        // Terminal states are sticky.
        state.fail("second");
        assert_eq!(state.fatal(), Some("authentication failed: 401"));
    }

    #[test]
    fn failure_counts_split_by_class() {
        let mut state = ProjectState::new("run", 4);
        state.append(validation_failed(0, "D1")).expect("append");
        state.append(apply_failed(1, "conflict")).expect("append");
        state.append(validation_failed(2, "D2")).expect("append");
        let counts = state.failure_counts();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.validation, 2);
        assert_eq!(counts.apply, 1);
        assert_eq!(counts.proposal, 0);
    }

    #[test]
    fn invariants_flag_tampered_state() {
        let mut state = ProjectState::new("run", 1);
        state.append(validation_failed(0, "D1")).expect("append");
        let mut json = serde_json::to_value(&state).expect("to json");
        json["status"] = serde_json::json!("converged");
        let tampered: ProjectState = serde_json::from_value(json).expect("from json");
        let errors = tampered.check_invariants();
        assert!(errors.iter().any(|e| e.contains("converged")));
    }
}
