//! Validation of the target project.
//!
//! A [`ValidationDelegate`] runs the project's own simulation/test code and
//! reports what happened. [`ValidationRunner`] turns that report into a
//! verdict the controller can act on: pass, fail with a diagnostic, or a
//! fatal condition (hung process, cancellation).

use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::bounded_timeout;
use crate::core::cancel::CancelToken;
use crate::core::convergence::{ConvergencePredicate, ValidationPassed};
use crate::io::config::{ConfigError, EngineeringConfig};
use crate::io::process::{CommandOutput, run_command_with_timeout};
use crate::io::snapshot::project_files;

#[derive(Debug, Clone)]
pub struct ValidationRequest<'a> {
    pub project: &'a Path,
    /// Hard limit; the delegate must stop the validation once it elapses.
    pub timeout: Duration,
    pub cancel: &'a CancelToken,
}

/// Raw result of one validation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub passed: bool,
    /// Combined stdout/stderr of the validation code.
    pub output: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

pub trait ValidationDelegate {
    /// Run validation once. `Err` means the validation could not run at all.
    fn validate(&self, request: &ValidationRequest<'_>) -> Result<ValidationReport>;
}

impl<T: ValidationDelegate + ?Sized> ValidationDelegate for &T {
    fn validate(&self, request: &ValidationRequest<'_>) -> Result<ValidationReport> {
        (**self).validate(request)
    }
}

/// Runs the configured command inside the project directory.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    command: Vec<String>,
    output_limit_bytes: usize,
    per_file_extension: Option<String>,
}

impl CommandValidator {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
            per_file_extension: None,
        }
    }

    /// Run the command once per project file with `extension`, passing the
    /// file's relative path as the last argument.
    pub fn per_file(mut self, extension: impl Into<String>) -> Self {
        self.per_file_extension = Some(extension.into());
        self
    }

    pub fn from_config(cfg: &EngineeringConfig) -> Self {
        let validator = Self::new(
            cfg.validation.command.clone(),
            cfg.validation.output_limit_bytes,
        );
        match cfg.per_file_extension() {
            Some(ext) => validator.per_file(ext),
            None => validator,
        }
    }

    fn command(&self, project: &Path, file: Option<&Path>) -> Result<Command> {
        let (program, args) = self
            .command
            .split_first()
            .context("validation command is empty")?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(project);
        if let Some(file) = file {
            cmd.arg(file);
        }
        Ok(cmd)
    }

    fn run_once(
        &self,
        request: &ValidationRequest<'_>,
        file: Option<&Path>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let cmd = self.command(request.project, file)?;
        run_command_with_timeout(
            cmd,
            None,
            timeout,
            self.output_limit_bytes,
            Some(request.cancel),
        )
        .with_context(|| format!("run validation command {:?}", self.command))
    }

    fn validate_per_file(
        &self,
        request: &ValidationRequest<'_>,
        extension: &str,
    ) -> Result<ValidationReport> {
        let started = Instant::now();
        let files = project_files(request.project, |path| {
            path.extension().and_then(|ext| ext.to_str()) == Some(extension)
        })?;
        if files.is_empty() {
            return Ok(ValidationReport {
                passed: false,
                output: format!("no .{extension} files found in project"),
                timed_out: false,
                cancelled: false,
                elapsed: started.elapsed(),
            });
        }

        let deadline = started + request.timeout;
        let mut blocks = Vec::new();
        let mut failures = Vec::new();
        for file in &files {
            let Some(timeout) = bounded_timeout(request.timeout, Some(deadline)) else {
                return Ok(interrupted(blocks, true, false, started));
            };
            let output = self.run_once(request, Some(file), timeout)?;
            let block = format!("**{}**:\n{}", file.display(), combined_output(&output));
            if output.cancelled || output.timed_out {
                blocks.push(block);
                return Ok(interrupted(blocks, output.timed_out, output.cancelled, started));
            }
            debug!(file = %file.display(), passed = output.success(), "validated file");
            if !output.success() {
                failures.push(block.clone());
            }
            blocks.push(block);
        }

        let passed = failures.is_empty();
        let output = if passed { blocks } else { failures }.join("\n\n");
        Ok(ValidationReport {
            passed,
            output,
            timed_out: false,
            cancelled: false,
            elapsed: started.elapsed(),
        })
    }
}

impl ValidationDelegate for CommandValidator {
    #[instrument(
        skip_all,
        fields(project = %request.project.display(), timeout_secs = request.timeout.as_secs())
    )]
    fn validate(&self, request: &ValidationRequest<'_>) -> Result<ValidationReport> {
        if let Some(ext) = &self.per_file_extension {
            return self.validate_per_file(request, ext);
        }
        let output = self.run_once(request, None, request.timeout)?;
        Ok(ValidationReport {
            passed: output.success(),
            output: combined_output(&output),
            timed_out: output.timed_out,
            cancelled: output.cancelled,
            elapsed: output.elapsed,
        })
    }
}

fn interrupted(
    blocks: Vec<String>,
    timed_out: bool,
    cancelled: bool,
    started: Instant,
) -> ValidationReport {
    ValidationReport {
        passed: false,
        output: blocks.join("\n\n"),
        timed_out,
        cancelled,
        elapsed: started.elapsed(),
    }
}

/// Stdout followed by stderr, with truncation noted.
fn combined_output(output: &CommandOutput) -> String {
    let mut text = output.stdout_lossy();
    let stderr = output.stderr_lossy();
    if !stderr.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    let truncated = output.stdout_truncated + output.stderr_truncated;
    if truncated > 0 {
        text.push_str(&format!("\n[output truncated {truncated} bytes]\n"));
    }
    text
}

/// What the controller does with a validation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationVerdict {
    Pass { output: String },
    Fail { diagnostic: String },
    /// The validation was still running at the hang ceiling.
    Hung { ceiling: Duration },
    Cancelled,
}

/// Normalizes delegate reports into verdicts.
pub struct ValidationRunner<'p, V> {
    delegate: V,
    timeout: Duration,
    hang_ceiling: Option<Duration>,
    predicate: Box<dyn ConvergencePredicate + 'p>,
}

impl<'p, V: ValidationDelegate> ValidationRunner<'p, V> {
    pub fn new(delegate: V, timeout: Duration) -> Self {
        Self {
            delegate,
            timeout,
            hang_ceiling: None,
            predicate: Box::new(ValidationPassed),
        }
    }

    pub fn from_config(delegate: V, cfg: &EngineeringConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(delegate, cfg.validation_timeout())
            .with_hang_ceiling(cfg.hang_ceiling())
            .with_predicate(cfg.convergence_predicate()?))
    }

    pub fn with_hang_ceiling(mut self, ceiling: Option<Duration>) -> Self {
        self.hang_ceiling = ceiling;
        self
    }

    pub fn with_predicate(mut self, predicate: Box<dyn ConvergencePredicate + 'p>) -> Self {
        self.predicate = predicate;
        self
    }

    /// Validate `project` once.
    ///
    /// Running the same validation against an unchanged project yields the
    /// same verdict; nothing here depends on earlier runs.
    #[instrument(skip_all, fields(project = %project.display()))]
    pub fn run(&self, project: &Path, cancel: &CancelToken) -> ValidationVerdict {
        let limit = self.hang_ceiling.unwrap_or(self.timeout);
        let request = ValidationRequest {
            project,
            timeout: limit,
            cancel,
        };
        let report = match self.delegate.validate(&request) {
            Ok(report) => report,
            Err(err) => {
                warn!(err = %err, "validation could not run");
                return ValidationVerdict::Fail {
                    diagnostic: format!("validation could not run: {err:#}"),
                };
            }
        };

        if report.cancelled {
            return ValidationVerdict::Cancelled;
        }
        if report.timed_out {
            return match self.hang_ceiling {
                Some(ceiling) => {
                    warn!(ceiling_secs = ceiling.as_secs(), "validation hung");
                    ValidationVerdict::Hung { ceiling }
                }
                None => ValidationVerdict::Fail {
                    diagnostic: with_output(
                        format!(
                            "validation exceeded timeout of {}s",
                            self.timeout.as_secs()
                        ),
                        &report.output,
                    ),
                },
            };
        }
        if report.elapsed > self.timeout {
            return ValidationVerdict::Fail {
                diagnostic: with_output(
                    format!(
                        "validation exceeded timeout of {}s (finished after {}s)",
                        self.timeout.as_secs(),
                        report.elapsed.as_secs()
                    ),
                    &report.output,
                ),
            };
        }
        if !report.passed {
            let diagnostic = if report.output.trim().is_empty() {
                "validation failed without output".to_string()
            } else {
                report.output
            };
            info!("validation failed");
            return ValidationVerdict::Fail { diagnostic };
        }

        match self.predicate.accept(&report.output) {
            Ok(()) => {
                info!("validation passed");
                ValidationVerdict::Pass {
                    output: report.output,
                }
            }
            Err(reason) => ValidationVerdict::Fail {
                diagnostic: with_output(reason, &report.output),
            },
        }
    }
}

fn with_output(headline: String, output: &str) -> String {
    if output.trim().is_empty() {
        headline
    } else {
        format!("{headline}\n\n{output}")
    }
}
