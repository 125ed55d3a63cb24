//! Test-only fixtures: attempt records, scripted collaborators and configs.
//!
//! Scripted collaborators pop one scripted response per call and remember
//! what they were asked, so tests can assert both the loop's outcome and the
//! exact calls it made.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use chrono::Utc;
use tempfile::TempDir;

use crate::core::history::AttemptRecord;
use crate::core::types::{ApplyOutcome, PatchDescriptor, ValidationOutcome};
use crate::io::config::{EngineeringConfig, ProposalConfig, ValidationConfig};
use crate::io::patch::{AppliedChange, ApplyError, PatchApplier};
use crate::io::proposer::{ProposalError, ProposalMechanism, ProposalRequest};
use crate::io::validation::{ValidationDelegate, ValidationReport, ValidationRequest};

fn record(index: u32, apply: ApplyOutcome, validation: ValidationOutcome) -> AttemptRecord {
    let now = Utc::now();
    AttemptRecord {
        index,
        patch_id: Some(PatchDescriptor::new(format!("patch {index}")).id),
        proposal_error: None,
        transient_retries: 0,
        apply,
        validation,
        started_at: now,
        finished_at: now,
    }
}

/// Attempt whose validation passed with `output`.
pub fn passed(index: u32, output: &str) -> AttemptRecord {
    record(
        index,
        ApplyOutcome::Applied { files_changed: 1 },
        ValidationOutcome::Pass {
            output: output.to_string(),
        },
    )
}

/// Attempt whose validation failed with `diagnostic`.
pub fn validation_failed(index: u32, diagnostic: &str) -> AttemptRecord {
    record(
        index,
        ApplyOutcome::Applied { files_changed: 1 },
        ValidationOutcome::Fail {
            diagnostic: diagnostic.to_string(),
        },
    )
}

/// Attempt whose patch was rejected with `reason`.
pub fn apply_failed(index: u32, reason: &str) -> AttemptRecord {
    record(
        index,
        ApplyOutcome::Rejected {
            reason: reason.to_string(),
        },
        ValidationOutcome::NotRun,
    )
}

/// Attempt that produced no patch.
pub fn proposal_failed(index: u32, error: &str) -> AttemptRecord {
    AttemptRecord {
        patch_id: None,
        proposal_error: Some(error.to_string()),
        ..record(index, ApplyOutcome::NotRun, ValidationOutcome::NotRun)
    }
}

/// A valid config whose project is an empty directory inside the returned tempdir.
pub fn test_config(iteration_budget: u32) -> (TempDir, EngineeringConfig) {
    let temp = tempfile::tempdir().expect("tempdir");
    let project = temp.path().join("project");
    fs::create_dir_all(&project).expect("create project dir");
    let cfg = EngineeringConfig {
        requirement: "Keep the pump head above 30 m".to_string(),
        iteration_budget,
        project_path: project,
        model: "test-model".to_string(),
        system_prompt: None,
        attempt_timeout_secs: None,
        run_timeout_secs: None,
        log_dir: temp.path().join("logs"),
        proposal: ProposalConfig {
            command: vec!["true".to_string()],
            retry_backoff_ms: 1,
            ..ProposalConfig::default()
        },
        validation: ValidationConfig {
            command: vec!["true".to_string()],
            timeout_secs: 60,
            ..ValidationConfig::default()
        },
        context: Default::default(),
        convergence: Default::default(),
    };
    (temp, cfg)
}

/// Proposer returning scripted results in order.
pub struct ScriptedProposer {
    script: RefCell<VecDeque<Result<PatchDescriptor, ProposalError>>>,
    contexts: RefCell<Vec<String>>,
    attempts: RefCell<Vec<u32>>,
}

impl ScriptedProposer {
    pub fn new(script: Vec<Result<PatchDescriptor, ProposalError>>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            contexts: RefCell::new(Vec::new()),
            attempts: RefCell::new(Vec::new()),
        }
    }

    /// One successful proposal per entry.
    pub fn patches(contents: &[&str]) -> Self {
        Self::new(
            contents
                .iter()
                .map(|content| Ok(PatchDescriptor::new(*content)))
                .collect(),
        )
    }

    pub fn calls(&self) -> usize {
        self.contexts.borrow().len()
    }

    /// Contexts received, one per call (retries included).
    pub fn contexts(&self) -> Vec<String> {
        self.contexts.borrow().clone()
    }

    /// Attempt index of every call.
    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.borrow().clone()
    }

    pub fn assert_drained(&self) -> Result<()> {
        let left = self.script.borrow().len();
        if left > 0 {
            bail!("scripted proposer has {left} unused responses");
        }
        Ok(())
    }
}

impl ProposalMechanism for ScriptedProposer {
    fn propose(&self, request: &ProposalRequest<'_>) -> Result<PatchDescriptor, ProposalError> {
        self.contexts.borrow_mut().push(request.context.to_string());
        self.attempts.borrow_mut().push(request.attempt);
        self.script.borrow_mut().pop_front().unwrap_or_else(|| {
            Err(ProposalError::Provider(
                "scripted proposer exhausted".to_string(),
            ))
        })
    }
}

/// Applier returning scripted results, then a fallback once the script is empty.
pub struct ScriptedApplier {
    script: RefCell<VecDeque<Result<AppliedChange, ApplyError>>>,
    fallback: Option<usize>,
    calls: Cell<usize>,
}

impl ScriptedApplier {
    pub fn new(script: Vec<Result<AppliedChange, ApplyError>>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            fallback: None,
            calls: Cell::new(0),
        }
    }

    /// Always applies, touching `files` files.
    pub fn applied(files: usize) -> Self {
        Self {
            fallback: Some(files),
            ..Self::new(Vec::new())
        }
    }

    /// Always succeeds without changing anything.
    pub fn no_change() -> Self {
        Self::applied(0)
    }

    /// Rejects every patch with `reason`.
    pub fn rejecting(reason: &str, times: usize) -> Self {
        Self::new(
            (0..times)
                .map(|_| Err(ApplyError::Rejected(reason.to_string())))
                .collect(),
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn assert_drained(&self) -> Result<()> {
        let left = self.script.borrow().len();
        if left > 0 {
            bail!("scripted applier has {left} unused responses");
        }
        Ok(())
    }
}

impl PatchApplier for ScriptedApplier {
    fn apply(
        &self,
        _patch: &PatchDescriptor,
        _project: &Path,
    ) -> Result<AppliedChange, ApplyError> {
        self.calls.set(self.calls.get() + 1);
        if let Some(result) = self.script.borrow_mut().pop_front() {
            return result;
        }
        match self.fallback {
            Some(files) => Ok(AppliedChange {
                written: (0..files)
                    .map(|i| PathBuf::from(format!("file_{i}.py")))
                    .collect(),
                removed: Vec::new(),
            }),
            None => Err(ApplyError::Rejected(
                "scripted applier exhausted".to_string(),
            )),
        }
    }
}

/// One scripted validation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedValidation {
    Pass(String),
    Fail(String),
    /// The delegate could not run.
    Error(String),
    TimedOut,
    Cancelled,
}

impl ScriptedValidation {
    pub fn pass(output: &str) -> Self {
        ScriptedValidation::Pass(output.to_string())
    }

    pub fn fail(diagnostic: &str) -> Self {
        ScriptedValidation::Fail(diagnostic.to_string())
    }
}

/// Validation delegate returning scripted reports in order.
pub struct ScriptedValidator {
    script: RefCell<VecDeque<ScriptedValidation>>,
    delay: Duration,
    calls: Cell<usize>,
}

impl ScriptedValidator {
    pub fn new(script: Vec<ScriptedValidation>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            delay: Duration::ZERO,
            calls: Cell::new(0),
        }
    }

    /// Sleep this long in every call before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn assert_drained(&self) -> Result<()> {
        let left = self.script.borrow().len();
        if left > 0 {
            bail!("scripted validator has {left} unused responses");
        }
        Ok(())
    }
}

impl ValidationDelegate for ScriptedValidator {
    fn validate(&self, _request: &ValidationRequest<'_>) -> Result<ValidationReport> {
        self.calls.set(self.calls.get() + 1);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let next = self
            .script
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted validator exhausted"))?;
        let report = |passed: bool, output: String| ValidationReport {
            passed,
            output,
            timed_out: false,
            cancelled: false,
            elapsed: Duration::ZERO,
        };
        Ok(match next {
            ScriptedValidation::Pass(output) => report(true, output),
            ScriptedValidation::Fail(diagnostic) => report(false, diagnostic),
            ScriptedValidation::Error(message) => bail!(message),
            ScriptedValidation::TimedOut => ValidationReport {
                timed_out: true,
                ..report(false, String::new())
            },
            ScriptedValidation::Cancelled => ValidationReport {
                cancelled: true,
                ..report(false, String::new())
            },
        })
    }
}
