//! Change-proposal backends.
//!
//! The [`ProposalMechanism`] trait is the only thing the controller knows
//! about how patches are produced. [`CommandProposer`] shells out to a
//! configured command; tests use scripted proposers instead.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::classifier::{ProviderFailure, classify_provider_message};
use crate::core::types::PatchDescriptor;
use crate::io::config::EngineeringConfig;
use crate::io::process::run_command_with_timeout;

const MESSAGE_LIMIT_CHARS: usize = 2000;

#[derive(Debug, Error)]
pub enum ProposalError {
    #[error("proposal timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider rejected credentials: {0}")]
    Auth(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("proposal cancelled")]
    Cancelled,
}

impl ProposalError {
    /// Worth retrying within the same attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProposalError::Timeout(_) | ProposalError::Transient(_))
    }

    /// Ends the run instead of the attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProposalError::Auth(_) | ProposalError::Cancelled)
    }
}

/// Parameters for one proposal call.
#[derive(Debug, Clone)]
pub struct ProposalRequest<'a> {
    /// Requirement plus feedback from earlier attempts.
    pub context: &'a str,
    pub model: &'a str,
    pub project: &'a Path,
    pub timeout: Duration,
    /// Attempt index this proposal belongs to.
    pub attempt: u32,
    pub cancel: &'a CancelToken,
}

pub trait ProposalMechanism {
    fn propose(&self, request: &ProposalRequest<'_>) -> Result<PatchDescriptor, ProposalError>;
}

impl<T: ProposalMechanism + ?Sized> ProposalMechanism for &T {
    fn propose(&self, request: &ProposalRequest<'_>) -> Result<PatchDescriptor, ProposalError> {
        (**self).propose(request)
    }
}

/// Proposer that pipes the context into a command and reads the patch from stdout.
#[derive(Debug, Clone)]
pub struct CommandProposer {
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandProposer {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
        }
    }

    pub fn from_config(cfg: &EngineeringConfig) -> Self {
        Self::new(cfg.proposal.command.clone(), cfg.proposal.output_limit_bytes)
    }

    fn build_command(&self, request: &ProposalRequest<'_>) -> Result<Command, ProposalError> {
        let project = request.project.display().to_string();
        let mut args = self
            .command
            .iter()
            .map(|arg| arg.replace("{model}", request.model).replace("{project}", &project));
        let program = args
            .next()
            .ok_or_else(|| ProposalError::Provider("proposal command is empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(request.project);
        Ok(cmd)
    }
}

impl ProposalMechanism for CommandProposer {
    #[instrument(skip_all, fields(attempt = request.attempt, model = request.model))]
    fn propose(&self, request: &ProposalRequest<'_>) -> Result<PatchDescriptor, ProposalError> {
        info!(context_bytes = request.context.len(), "requesting proposal");
        let cmd = self.build_command(request)?;
        let output = run_command_with_timeout(
            cmd,
            Some(request.context.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
            Some(request.cancel),
        )
        .map_err(|err| ProposalError::Provider(format!("{err:#}")))?;

        if output.cancelled {
            return Err(ProposalError::Cancelled);
        }
        if output.timed_out {
            return Err(ProposalError::Timeout(request.timeout));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            let message = if stderr.trim().is_empty() {
                format!("proposal command exited with status {:?}", output.status.code())
            } else {
                tail(stderr.trim(), MESSAGE_LIMIT_CHARS)
            };
            warn!(exit_code = ?output.status.code(), "proposal command failed");
            return Err(match classify_provider_message(&message) {
                ProviderFailure::Transient => ProposalError::Transient(message),
                ProviderFailure::Auth => ProposalError::Auth(message),
                ProviderFailure::Provider => ProposalError::Provider(message),
            });
        }
        if output.stdout_truncated > 0 {
            return Err(ProposalError::Provider(format!(
                "proposal exceeded {} bytes of output",
                self.output_limit_bytes
            )));
        }

        let patch = PatchDescriptor::new(output.stdout_lossy());
        debug!(patch_id = %patch.id, bytes = patch.content.len(), "proposal received");
        Ok(patch)
    }
}

/// Keep the last `max_chars` characters; provider errors put the cause last.
fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let skipped: String = text.chars().skip(count - max_chars).collect();
    format!("...{skipped}")
}
