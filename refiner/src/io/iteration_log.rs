//! Run logs under the configured log directory.
//!
//! Layout per run:
//!
//! ```text
//! <log_dir>/<run_id>/state.json
//! <log_dir>/<run_id>/summary.md
//! <log_dir>/<run_id>/attempts/<index>/{record.json,context.md,patch.txt,validation.log}
//! ```

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;
use tracing::debug;

use crate::controller::AttemptEvent;
use crate::core::history::ProjectState;
use crate::core::types::{ApplyOutcome, ValidationOutcome};

const STATE_FILE: &str = "state.json";
const SUMMARY_FILE: &str = "summary.md";
const SUMMARY_DIAGNOSTIC_LINES: usize = 40;

/// New run identifier: UTC timestamp plus a short random suffix.
pub fn generate_run_id() -> String {
    format!("run-{}_{}", generate_timestamp(), generate_short_id())
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub record_path: PathBuf,
    pub context_path: PathBuf,
    pub patch_path: PathBuf,
    pub validation_log_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(run_dir: &Path, index: u32) -> Self {
        let dir = run_dir.join("attempts").join(index.to_string());
        Self {
            record_path: dir.join("record.json"),
            context_path: dir.join("context.md"),
            patch_path: dir.join("patch.txt"),
            validation_log_path: dir.join("validation.log"),
            dir,
        }
    }
}

/// Log directory of one run.
#[derive(Debug, Clone)]
pub struct RunLog {
    dir: PathBuf,
}

impl RunLog {
    pub fn create(log_dir: &Path, run_id: &str) -> Result<Self> {
        let dir = log_dir.join(run_id);
        fs::create_dir_all(&dir).with_context(|| format!("create run dir {}", dir.display()))?;
        debug!(dir = %dir.display(), "created run log");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join(SUMMARY_FILE)
    }

    /// Atomically replace `state.json`.
    pub fn write_state(&self, state: &ProjectState) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(state).context("serialize state")?;
        buf.push('\n');
        write_atomic(&self.state_path(), &buf)
    }

    pub fn write_attempt(&self, event: &AttemptEvent<'_>) -> Result<AttemptPaths> {
        let paths = AttemptPaths::new(&self.dir, event.record.index);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;

        write_json(&paths.record_path, event.record)?;
        write_text(&paths.context_path, event.context)?;
        if let Some(patch) = event.patch {
            write_text(&paths.patch_path, &patch.content)?;
        }
        if let Some(output) = event.validation_output {
            write_text(&paths.validation_log_path, output)?;
        }
        Ok(paths)
    }

    pub fn write_summary(&self, state: &ProjectState) -> Result<PathBuf> {
        let path = self.summary_path();
        write_text(&path, &render_summary(state))?;
        Ok(path)
    }
}

/// Load a persisted state from a run directory or a `state.json` path.
///
/// A state that violates the history invariants is rejected.
pub fn load_state(path: &Path) -> Result<ProjectState> {
    let path = if path.is_dir() {
        path.join(STATE_FILE)
    } else {
        path.to_path_buf()
    };
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read state {}", path.display()))?;
    let state: ProjectState = serde_json::from_str(&contents)
        .with_context(|| format!("parse state {}", path.display()))?;
    let errors = state.check_invariants();
    if !errors.is_empty() {
        bail!(
            "state {} violates invariants:\n- {}",
            path.display(),
            errors.join("\n- ")
        );
    }
    Ok(state)
}

/// Human-readable run summary (Markdown).
pub fn render_summary(state: &ProjectState) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Run {}\n", state.run_id());
    let _ = writeln!(out, "- status: {}", state.status().as_str());
    let _ = writeln!(
        out,
        "- attempts: {} / {}",
        state.history().len(),
        state.iteration_budget()
    );
    let _ = writeln!(out, "- started: {}", state.started_at().to_rfc3339());
    if let Some(finished) = state.finished_at() {
        let _ = writeln!(out, "- finished: {}", finished.to_rfc3339());
    }
    if let Some(fatal) = state.fatal() {
        let _ = writeln!(out, "- fatal: {fatal}");
    }

    if !state.history().is_empty() {
        out.push_str("\n| # | patch | apply | validation | retries |\n");
        out.push_str("|---|-------|-------|------------|---------|\n");
        for record in state.history() {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} |",
                record.index,
                record.patch_id.as_deref().unwrap_or("-"),
                apply_cell(&record.apply, record.proposal_error.as_deref()),
                validation_cell(&record.validation),
                record.transient_retries
            );
        }
    }

    let last_failure = state
        .history()
        .iter()
        .rev()
        .find_map(|record| record.failure().map(|failure| (record.index, failure)));
    if let Some((index, (class, diagnostic))) = last_failure {
        let _ = writeln!(out, "\n## Last failure (attempt {index}): {}\n", class.as_str());
        out.push_str("```text\n");
        let lines: Vec<&str> = diagnostic.lines().collect();
        for line in lines.iter().take(SUMMARY_DIAGNOSTIC_LINES) {
            out.push_str(line);
            out.push('\n');
        }
        if lines.len() > SUMMARY_DIAGNOSTIC_LINES {
            let _ = writeln!(
                out,
                "... ({} more lines)",
                lines.len() - SUMMARY_DIAGNOSTIC_LINES
            );
        }
        out.push_str("```\n");
    }
    out
}

fn apply_cell(apply: &ApplyOutcome, proposal_error: Option<&str>) -> String {
    match apply {
        ApplyOutcome::Applied { files_changed } => format!("applied ({files_changed} files)"),
        ApplyOutcome::NoChange => "no change".to_string(),
        ApplyOutcome::Rejected { .. } => "rejected".to_string(),
        ApplyOutcome::NotRun if proposal_error.is_some() => "not run (no proposal)".to_string(),
        ApplyOutcome::NotRun => "not run".to_string(),
    }
}

fn validation_cell(validation: &ValidationOutcome) -> &'static str {
    match validation {
        ValidationOutcome::Pass { .. } => "pass",
        ValidationOutcome::Fail { .. } => "fail",
        ValidationOutcome::NotRun => "not run",
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PatchDescriptor;
    use crate::test_support::{apply_failed, passed, validation_failed};

    #[test]
    fn run_ids_are_unique_and_prefixed() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert!(a.starts_with("run-"));
        assert_ne!(a, b);
    }

    #[test]
    fn attempt_paths_are_stable() {
        let paths = AttemptPaths::new(Path::new("/logs/run-1"), 3);
        assert!(paths.dir.ends_with("run-1/attempts/3"));
        assert!(paths.record_path.ends_with("record.json"));
        assert!(paths.context_path.ends_with("context.md"));
        assert!(paths.patch_path.ends_with("patch.txt"));
        assert!(paths.validation_log_path.ends_with("validation.log"));
    }

    #[test]
    fn writes_attempt_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = RunLog::create(temp.path(), "run-1").expect("create");
        let mut state = ProjectState::new("run-1", 2);
        state.append(validation_failed(0, "D1")).expect("append");
        let record = state.last().expect("record");
        let patch = PatchDescriptor::new("{}");
        let paths = log
            .write_attempt(&AttemptEvent {
                state: &state,
                record,
                context: "Size the pump",
                patch: Some(&patch),
                validation_output: Some("D1"),
            })
            .expect("write");

        assert!(paths.record_path.is_file());
        assert_eq!(
            fs::read_to_string(&paths.context_path).expect("read"),
            "Size the pump"
        );
        assert_eq!(fs::read_to_string(&paths.patch_path).expect("read"), "{}");
        assert_eq!(
            fs::read_to_string(&paths.validation_log_path).expect("read"),
            "D1"
        );
    }

    #[test]
    fn state_round_trips_through_run_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = RunLog::create(temp.path(), "run-2").expect("create");
        let mut state = ProjectState::new("run-2", 3);
        state.append(apply_failed(0, "bad hunk")).expect("append");
        state.append(passed(1, "ok")).expect("append");
        log.write_state(&state).expect("write");

        assert_eq!(load_state(log.dir()).expect("load dir"), state);
        assert_eq!(load_state(&log.state_path()).expect("load file"), state);
    }

    #[test]
    fn load_state_rejects_broken_invariants() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = RunLog::create(temp.path(), "run-3").expect("create");
        let mut state = ProjectState::new("run-3", 2);
        state.append(validation_failed(0, "D1")).expect("append");
        log.write_state(&state).expect("write");

        let text = fs::read_to_string(log.state_path()).expect("read");
        fs::write(
            log.state_path(),
            text.replace("\"running\"", "\"converged\""),
        )
        .expect("write");
        let err = load_state(log.dir()).unwrap_err();
        assert!(err.to_string().contains("violates invariants"));
    }

    #[test]
    fn summary_lists_attempts_and_last_failure() {
        let mut state = ProjectState::new("run-4", 3);
        state
            .append(validation_failed(0, "D1: mass over"))
            .expect("append");
        state
            .append(validation_failed(1, "D2: head under"))
            .expect("append");
        let summary = render_summary(&state);

        assert!(summary.contains("# Run run-4"));
        assert!(summary.contains("- status: running"));
        assert!(summary.contains("- attempts: 2 / 3"));
        assert!(summary.contains("## Last failure (attempt 1): validation failed"));
        assert!(summary.contains("D2: head under"));
        assert!(!summary.contains("D1: mass over"));
    }
}
