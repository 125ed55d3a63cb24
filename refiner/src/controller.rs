//! The iteration control loop.
//!
//! [`IterationController`] drives propose -> apply -> validate for at most
//! `iteration_budget` attempts and owns the run's [`ProjectState`]. Every
//! attempt-level failure becomes a history record; only a [`FatalError`]
//! stops the loop early, and the attempt in flight at that point is not
//! recorded.

use std::path::Path;
use std::time::Instant;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::core::budget::bounded_timeout;
use crate::core::cancel::{CancelReason, CancelToken};
use crate::core::convergence::ConvergencePredicate;
use crate::core::feedback::FeedbackBuilder;
use crate::core::history::{AttemptRecord, ProjectState};
use crate::core::retry::RetryPolicy;
use crate::core::types::{ApplyOutcome, PatchDescriptor, RunStatus, ValidationOutcome};
use crate::error::FatalError;
use crate::io::config::{ConfigError, EngineeringConfig, check_project_path};
use crate::io::iteration_log::generate_run_id;
use crate::io::patch::{ApplyError, PatchApplier};
use crate::io::proposer::{ProposalError, ProposalMechanism, ProposalRequest};
use crate::io::snapshot::ProjectSnapshot;
use crate::io::validation::{ValidationDelegate, ValidationRunner, ValidationVerdict};

/// Where the controller currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Proposing { index: u32, retries: u32 },
    Applying { index: u32 },
    Validating { index: u32 },
    Converged,
    Exhausted,
    Failed,
}

impl Phase {
    fn terminal(status: RunStatus) -> Self {
        match status {
            RunStatus::Converged => Phase::Converged,
            RunStatus::Exhausted => Phase::Exhausted,
            RunStatus::Failed => Phase::Failed,
            RunStatus::Running => Phase::Idle,
        }
    }
}

/// Everything known about one appended attempt, handed to the observer.
#[derive(Debug, Clone, Copy)]
pub struct AttemptEvent<'a> {
    /// State right after the record was appended.
    pub state: &'a ProjectState,
    pub record: &'a AttemptRecord,
    /// Context sent to the proposal mechanism.
    pub context: &'a str,
    pub patch: Option<&'a PatchDescriptor>,
    /// Raw validation output or diagnostic, when validation ran.
    pub validation_output: Option<&'a str>,
}

pub struct IterationController<P, A, V> {
    proposer: P,
    applier: A,
    validator: V,
    cancel: CancelToken,
    run_id: Option<String>,
    convergence: Option<Box<dyn ConvergencePredicate>>,
    phase: Phase,
}

impl<P, A, V> IterationController<P, A, V>
where
    P: ProposalMechanism,
    A: PatchApplier,
    V: ValidationDelegate,
{
    pub fn new(proposer: P, applier: A, validator: V) -> Self {
        Self {
            proposer,
            applier,
            validator,
            cancel: CancelToken::new(),
            run_id: None,
            convergence: None,
            phase: Phase::Idle,
        }
    }

    /// Share a cancellation token with a signal handler or another thread.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Use a fixed run id instead of generating one.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Override the convergence predicate from the configuration.
    pub fn with_convergence(mut self, predicate: Box<dyn ConvergencePredicate>) -> Self {
        self.convergence = Some(predicate);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn run(&mut self, config: &EngineeringConfig) -> Result<ProjectState, ConfigError> {
        self.run_with(config, |_| {})
    }

    /// Run the loop, calling `on_attempt` once for every appended record.
    ///
    /// Returns `Err` only for a structurally invalid configuration; every
    /// other outcome is described by the returned state.
    #[instrument(
        skip_all,
        fields(budget = config.iteration_budget, project = %config.project_path.display())
    )]
    pub fn run_with<F>(
        &mut self,
        config: &EngineeringConfig,
        mut on_attempt: F,
    ) -> Result<ProjectState, ConfigError>
    where
        F: FnMut(&AttemptEvent<'_>),
    {
        config.validate()?;
        let Self {
            proposer,
            applier,
            validator,
            cancel,
            run_id,
            convergence,
            phase,
        } = self;
        *phase = Phase::Idle;

        let run_id = run_id.clone().unwrap_or_else(generate_run_id);
        let mut state = ProjectState::new(run_id, config.iteration_budget);
        if state.status().is_terminal() {
            info!(run_id = state.run_id(), "iteration budget is zero, nothing to do");
            *phase = Phase::terminal(state.status());
            return Ok(state);
        }

        let project = config.project_path.as_path();
        if let Err(err) = check_project_path(project) {
            fail(
                &mut state,
                FatalError::ProjectInaccessible {
                    path: project.to_path_buf(),
                    reason: format!("{err:#}"),
                },
            );
            *phase = Phase::Failed;
            return Ok(state);
        }

        let config_predicate;
        let predicate: &dyn ConvergencePredicate = match convergence.as_deref() {
            Some(predicate) => predicate,
            None => {
                config_predicate = config.convergence_predicate()?;
                &*config_predicate
            }
        };
        let cancel = cancel.with_deadline(config.run_deadline(Instant::now()));
        let attempts = AttemptRunner {
            config,
            project,
            proposer: &*proposer,
            applier: &*applier,
            validation: ValidationRunner::new(&*validator, config.validation_timeout())
                .with_hang_ceiling(config.hang_ceiling())
                .with_predicate(Box::new(BorrowedPredicate(predicate))),
            feedback: FeedbackBuilder::new(config.system_prompt.as_deref()),
            retry: config.retry_policy(),
            cancel: &cancel,
        };
        info!(run_id = state.run_id(), "run started");

        while !state.status().is_terminal() {
            let index = state.next_index();
            let attempt = match attempts.run(index, state.history(), phase) {
                Ok(attempt) => attempt,
                Err(fatal) => {
                    fail(&mut state, fatal);
                    break;
                }
            };

            let passed = attempt.record.passed();
            if let Err(err) = state.append(attempt.record) {
                fail(&mut state, format!("history rejected attempt {index}: {err}"));
                break;
            }
            info!(
                attempt = index,
                passed,
                remaining = state.remaining_budget(),
                "attempt recorded"
            );
            if let Some(record) = state.last() {
                on_attempt(&AttemptEvent {
                    state: &state,
                    record,
                    context: &attempt.context,
                    patch: attempt.patch.as_ref(),
                    validation_output: attempt.validation_output.as_deref(),
                });
            }
        }

        *phase = Phase::terminal(state.status());
        info!(
            run_id = state.run_id(),
            status = state.status().as_str(),
            attempts = state.history().len(),
            "run finished"
        );
        Ok(state)
    }
}

fn fail(state: &mut ProjectState, diagnostic: impl ToString) {
    let diagnostic = diagnostic.to_string();
    error!(run_id = state.run_id(), %diagnostic, "run failed");
    state.fail(diagnostic);
}

/// Lends the controller's predicate to a validation runner for one run.
struct BorrowedPredicate<'a>(&'a dyn ConvergencePredicate);

impl ConvergencePredicate for BorrowedPredicate<'_> {
    fn accept(&self, output: &str) -> Result<(), String> {
        self.0.accept(output)
    }
}

/// A finished attempt before it is appended.
struct AttemptRun {
    record: AttemptRecord,
    context: String,
    patch: Option<PatchDescriptor>,
    validation_output: Option<String>,
}

struct AttemptRunner<'a, P, A, V> {
    config: &'a EngineeringConfig,
    project: &'a Path,
    proposer: &'a P,
    applier: &'a A,
    validation: ValidationRunner<'a, &'a V>,
    feedback: FeedbackBuilder,
    retry: RetryPolicy,
    cancel: &'a CancelToken,
}

impl<P, A, V> AttemptRunner<'_, P, A, V>
where
    P: ProposalMechanism,
    A: PatchApplier,
    V: ValidationDelegate,
{
    #[instrument(skip_all, fields(attempt = index))]
    fn run(
        &self,
        index: u32,
        history: &[AttemptRecord],
        phase: &mut Phase,
    ) -> Result<AttemptRun, FatalError> {
        let started_at = Utc::now();
        self.check_cancel()?;
        let snapshot = self.snapshot()?;
        let context = self
            .feedback
            .build(&self.config.requirement, snapshot.as_deref(), history)
            .map_err(|err| FatalError::Feedback(err.to_string()))?;

        let mut record = AttemptRecord {
            index,
            patch_id: None,
            proposal_error: None,
            transient_retries: 0,
            apply: ApplyOutcome::NotRun,
            validation: ValidationOutcome::NotRun,
            started_at,
            finished_at: started_at,
        };

        let patch = match self.propose(index, &context, &mut record.transient_retries, phase)? {
            Ok(patch) => patch,
            Err(err) => {
                warn!(err = %err, "proposal failed");
                record.proposal_error = Some(err.to_string());
                record.finished_at = Utc::now();
                return Ok(AttemptRun {
                    record,
                    context,
                    patch: None,
                    validation_output: None,
                });
            }
        };
        record.patch_id = Some(patch.id.clone());

        // Apply is never interrupted midway, so cancellation is checked first.
        self.check_cancel()?;
        *phase = Phase::Applying { index };
        record.apply = match self.applier.apply(&patch, self.project) {
            Ok(change) if change.is_empty() => ApplyOutcome::NoChange,
            Ok(change) => ApplyOutcome::Applied {
                files_changed: change.files_changed(),
            },
            Err(ApplyError::Rejected(reason)) => {
                warn!(%reason, "patch rejected");
                record.apply = ApplyOutcome::Rejected { reason };
                record.finished_at = Utc::now();
                return Ok(AttemptRun {
                    record,
                    context,
                    patch: Some(patch),
                    validation_output: None,
                });
            }
            Err(ApplyError::ProjectInaccessible(reason)) => {
                return Err(FatalError::ProjectInaccessible {
                    path: self.project.to_path_buf(),
                    reason,
                });
            }
        };

        *phase = Phase::Validating { index };
        record.validation = match self.validation.run(self.project, self.cancel) {
            ValidationVerdict::Pass { output } => ValidationOutcome::Pass { output },
            ValidationVerdict::Fail { diagnostic } => ValidationOutcome::Fail { diagnostic },
            ValidationVerdict::Hung { ceiling } => return Err(FatalError::ValidationHung(ceiling)),
            ValidationVerdict::Cancelled => return Err(self.cancelled()),
        };
        let validation_output = match &record.validation {
            ValidationOutcome::Pass { output } => Some(output.clone()),
            ValidationOutcome::Fail { diagnostic } => Some(diagnostic.clone()),
            ValidationOutcome::NotRun => None,
        };
        record.finished_at = Utc::now();
        Ok(AttemptRun {
            record,
            context,
            patch: Some(patch),
            validation_output,
        })
    }

    /// Ask for a patch, retrying transient errors within the same attempt.
    ///
    /// The outer `Result` carries fatal errors; the inner one an attempt-level
    /// proposal failure.
    fn propose(
        &self,
        index: u32,
        context: &str,
        retries: &mut u32,
        phase: &mut Phase,
    ) -> Result<Result<PatchDescriptor, ProposalError>, FatalError> {
        loop {
            *phase = Phase::Proposing {
                index,
                retries: *retries,
            };
            let timeout = bounded_timeout(self.config.proposal_timeout(), self.cancel.deadline())
                .ok_or_else(|| self.cancelled())?;
            let request = ProposalRequest {
                context,
                model: &self.config.model,
                project: self.project,
                timeout,
                attempt: index,
                cancel: self.cancel,
            };
            match self.proposer.propose(&request) {
                Ok(patch) => return Ok(Ok(patch)),
                Err(err) if err.is_fatal() => {
                    return Err(match err {
                        ProposalError::Auth(message) => FatalError::Authentication(message),
                        _ => self.cancelled(),
                    });
                }
                Err(err) if err.is_transient() && self.retry.allows(*retries) => {
                    let delay = self.retry.backoff(*retries);
                    *retries += 1;
                    warn!(
                        retry = *retries,
                        delay_ms = delay.as_millis() as u64,
                        err = %err,
                        "transient proposal error, retrying"
                    );
                    if !self.cancel.sleep(delay) {
                        return Err(self.cancelled());
                    }
                }
                Err(err) => return Ok(Err(err)),
            }
        }
    }

    /// Rendered project snapshot, or `None` when disabled or the project is empty.
    fn snapshot(&self) -> Result<Option<String>, FatalError> {
        let max_bytes = self.config.context.snapshot_max_bytes;
        if max_bytes == 0 {
            return Ok(None);
        }
        let extensions = self.config.context_extensions();
        let snapshot = ProjectSnapshot::capture(self.project, max_bytes, &extensions)
            .map_err(|err| FatalError::ProjectInaccessible {
                path: self.project.to_path_buf(),
                reason: format!("{err:#}"),
            })?;
        Ok((!snapshot.is_empty()).then(|| snapshot.render()))
    }

    fn check_cancel(&self) -> Result<(), FatalError> {
        match self.cancel.reason() {
            Some(reason) => Err(FatalError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    fn cancelled(&self) -> FatalError {
        FatalError::Cancelled(self.cancel.reason().unwrap_or(CancelReason::Interrupted))
    }
}
