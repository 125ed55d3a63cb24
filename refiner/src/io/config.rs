//! Engineering configuration loaded from `refiner.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::core::convergence::{ConvergencePredicate, OutputMatches, ValidationPassed};
use crate::core::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "refiner.toml";

/// Structural problems that make a configuration unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("requirement must not be empty")]
    EmptyRequirement,
    #[error("model must not be empty")]
    EmptyModel,
    #[error("project_path must not be empty")]
    EmptyProjectPath,
    #[error("{0} must be a non-empty array")]
    EmptyCommand(&'static str),
    #[error("{0} must be > 0")]
    Zero(&'static str),
    #[error(
        "validation.hang_ceiling_secs ({ceiling}) must be >= validation.timeout_secs ({timeout})"
    )]
    CeilingBelowTimeout { ceiling: u64, timeout: u64 },
    #[error("validation.per_file_extension must name an extension")]
    EmptyExtension,
    #[error("context.extensions entries must name an extension")]
    EmptyContextExtension,
    #[error("convergence.output_pattern is not a valid regex: {0}")]
    BadPattern(#[from] regex::Error),
}

/// Everything a run needs, fixed before the first attempt.
///
/// Missing optional sections take defaults. Unknown keys are rejected so typos
/// do not silently fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EngineeringConfig {
    /// Natural-language requirement the project must satisfy.
    pub requirement: String,
    /// Maximum number of attempts; 0 ends the run before touching the project.
    pub iteration_budget: u32,
    /// Target project directory, relative to the config file.
    pub project_path: PathBuf,
    /// Model/provider identifier passed to the proposal command.
    pub model: String,
    /// Optional preamble placed before the requirement in every context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Overrides `proposal.timeout_secs` for each attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_timeout_secs: Option<u64>,
    /// Wall-clock deadline for the whole run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub proposal: ProposalConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub convergence: ConvergenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ProposalConfig {
    /// Proposal command; `{model}` and `{project}` are substituted.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub max_transient_retries: u32,
    pub retry_backoff_ms: u64,
    pub output_limit_bytes: usize,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 600,
            max_transient_retries: 3,
            retry_backoff_ms: 1000,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationConfig {
    /// Validation command, run with the project as working directory.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// A validation still running at this point is treated as hung.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hang_ceiling_secs: Option<u64>,
    /// Run the command once per project file with this extension.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_file_extension: Option<String>,
    pub output_limit_bytes: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            command: vec!["python".to_string(), "design.py".to_string()],
            timeout_secs: 600,
            hang_ceiling_secs: None,
            per_file_extension: None,
            output_limit_bytes: 100_000,
        }
    }
}

/// What of the project goes into each proposal context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ContextConfig {
    /// Cap on file contents included per context; 0 leaves the project out.
    pub snapshot_max_bytes: usize,
    /// Only files with these extensions are included; empty means all files.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            snapshot_max_bytes: 100_000,
            extensions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ConvergenceConfig {
    /// Regex the validation output must match for a pass to count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_pattern: Option<String>,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".refiner/runs")
}

impl EngineeringConfig {
    /// A filled-in template for `refiner init`.
    pub fn example() -> Self {
        Self {
            requirement: "Describe what the design must satisfy.".to_string(),
            iteration_budget: 5,
            project_path: PathBuf::from("design"),
            model: "openai/gpt-4o".to_string(),
            system_prompt: None,
            attempt_timeout_secs: None,
            run_timeout_secs: None,
            log_dir: default_log_dir(),
            proposal: ProposalConfig {
                command: vec![
                    "llm".to_string(),
                    "--model".to_string(),
                    "{model}".to_string(),
                ],
                ..ProposalConfig::default()
            },
            validation: ValidationConfig::default(),
            context: ContextConfig {
                snapshot_max_bytes: 100_000,
                extensions: vec!["py".to_string()],
            },
            convergence: ConvergenceConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.requirement.trim().is_empty() {
            return Err(ConfigError::EmptyRequirement);
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::EmptyModel);
        }
        if self.project_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyProjectPath);
        }
        if self.attempt_timeout_secs == Some(0) {
            return Err(ConfigError::Zero("attempt_timeout_secs"));
        }
        if self.run_timeout_secs == Some(0) {
            return Err(ConfigError::Zero("run_timeout_secs"));
        }

        if command_is_empty(&self.proposal.command) {
            return Err(ConfigError::EmptyCommand("proposal.command"));
        }
        if self.proposal.timeout_secs == 0 {
            return Err(ConfigError::Zero("proposal.timeout_secs"));
        }
        if self.proposal.output_limit_bytes == 0 {
            return Err(ConfigError::Zero("proposal.output_limit_bytes"));
        }

        if command_is_empty(&self.validation.command) {
            return Err(ConfigError::EmptyCommand("validation.command"));
        }
        if self.validation.timeout_secs == 0 {
            return Err(ConfigError::Zero("validation.timeout_secs"));
        }
        if self.validation.output_limit_bytes == 0 {
            return Err(ConfigError::Zero("validation.output_limit_bytes"));
        }
        match self.validation.hang_ceiling_secs {
            Some(ceiling) if ceiling < self.validation.timeout_secs => {
                return Err(ConfigError::CeilingBelowTimeout {
                    ceiling,
                    timeout: self.validation.timeout_secs,
                });
            }
            _ => {}
        }
        if self
            .validation
            .per_file_extension
            .as_deref()
            .is_some_and(|ext| ext.trim().trim_start_matches('.').is_empty())
        {
            return Err(ConfigError::EmptyExtension);
        }
        if self
            .context
            .extensions
            .iter()
            .any(|ext| ext.trim().trim_start_matches('.').is_empty())
        {
            return Err(ConfigError::EmptyContextExtension);
        }

        if let Some(pattern) = &self.convergence.output_pattern {
            OutputMatches::new(pattern)?;
        }
        Ok(())
    }

    /// Resolve relative `project_path` and `log_dir` against `base`.
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        if self.project_path.is_relative() {
            self.project_path = base.join(&self.project_path);
        }
        if self.log_dir.is_relative() {
            self.log_dir = base.join(&self.log_dir);
        }
        self
    }

    /// Timeout for one proposal call.
    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_secs(
            self.attempt_timeout_secs
                .unwrap_or(self.proposal.timeout_secs),
        )
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation.timeout_secs)
    }

    pub fn hang_ceiling(&self) -> Option<Duration> {
        self.validation.hang_ceiling_secs.map(Duration::from_secs)
    }

    /// Wall-clock deadline for a run starting at `started`.
    pub fn run_deadline(&self, started: Instant) -> Option<Instant> {
        self.run_timeout_secs
            .map(|secs| started + Duration::from_secs(secs))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.proposal.max_transient_retries,
            Duration::from_millis(self.proposal.retry_backoff_ms),
        )
    }

    /// Extension for per-file validation, without a leading dot.
    pub fn per_file_extension(&self) -> Option<&str> {
        self.validation
            .per_file_extension
            .as_deref()
            .map(|ext| ext.trim().trim_start_matches('.'))
    }

    /// Extensions for the context snapshot, without leading dots.
    pub fn context_extensions(&self) -> Vec<String> {
        self.context
            .extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_string())
            .collect()
    }

    pub fn convergence_predicate(&self) -> Result<Box<dyn ConvergencePredicate>, ConfigError> {
        Ok(match &self.convergence.output_pattern {
            Some(pattern) => Box::new(OutputMatches::new(pattern)?),
            None => Box::new(ValidationPassed),
        })
    }
}

fn command_is_empty(command: &[String]) -> bool {
    command
        .first()
        .is_none_or(|program| program.trim().is_empty())
}

/// Verify the target project is an existing, writable directory.
///
/// Only inspects metadata; the project is never written here.
pub fn check_project_path(path: &Path) -> Result<()> {
    let meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    if !meta.is_dir() {
        bail!("{} is not a directory", path.display());
    }
    if meta.permissions().readonly() {
        bail!("{} is read-only", path.display());
    }
    Ok(())
}

/// Load and validate config from a TOML file.
pub fn load_config(path: &Path) -> Result<EngineeringConfig> {
    debug!(path = %path.display(), "loading config");
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineeringConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineeringConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
