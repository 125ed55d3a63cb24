//! Patch application backends.
//!
//! A [`PatchApplier`] either applies a whole patch or leaves the project
//! exactly as it was. [`FileSetApplier`] understands whole-file edits encoded
//! as `{"files":[{"name": "...", "content": "..."}]}`.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::types::PatchDescriptor;

const FILE_SET_SCHEMA: &str = include_str!("../schemas/file_set.schema.json");
pub(crate) const TMP_SUFFIX: &str = "refiner-tmp";

static FILE_SET_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(FILE_SET_SCHEMA).expect("file set schema should be valid json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("file set schema should compile")
});

#[derive(Debug, Error)]
pub enum ApplyError {
    /// The patch is malformed or conflicts with the project; nothing changed.
    #[error("{0}")]
    Rejected(String),
    /// The project could not be read, written or restored.
    #[error("project inaccessible: {0}")]
    ProjectInaccessible(String),
}

/// Files touched by a successfully applied patch, relative to the project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedChange {
    pub written: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl AppliedChange {
    pub fn files_changed(&self) -> usize {
        self.written.len() + self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files_changed() == 0
    }
}

pub trait PatchApplier {
    /// Apply `patch` to `project` all-or-nothing.
    fn apply(&self, patch: &PatchDescriptor, project: &Path) -> Result<AppliedChange, ApplyError>;
}

impl<T: PatchApplier + ?Sized> PatchApplier for &T {
    fn apply(&self, patch: &PatchDescriptor, project: &Path) -> Result<AppliedChange, ApplyError> {
        (**self).apply(patch, project)
    }
}

#[derive(Debug, Deserialize)]
struct FileSet {
    #[serde(default)]
    files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    name: String,
    content: Option<String>,
}

/// One planned file edit with enough state to undo it.
#[derive(Debug)]
struct Change {
    rel: PathBuf,
    target: PathBuf,
    previous: Option<Vec<u8>>,
    next: Option<String>,
}

/// Applies JSON file sets with whole-file writes and deletions.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSetApplier;

impl PatchApplier for FileSetApplier {
    #[instrument(skip_all, fields(patch_id = %patch.id, project = %project.display()))]
    fn apply(&self, patch: &PatchDescriptor, project: &Path) -> Result<AppliedChange, ApplyError> {
        ensure_project_dir(project)?;
        if patch.is_blank() {
            debug!("blank patch, nothing to apply");
            return Ok(AppliedChange::default());
        }

        let file_set = parse_file_set(&patch.content)?;
        let changes = plan(project, file_set.files)?;
        if changes.is_empty() {
            debug!("patch matches current project contents");
            return Ok(AppliedChange::default());
        }

        let mut created_dirs = Vec::new();
        for (done, change) in changes.iter().enumerate() {
            if let Err(err) = commit(project, change, &mut created_dirs) {
                warn!(file = %change.rel.display(), err = %err, "apply failed, rolling back");
                rollback(&changes[..done], &created_dirs).map_err(|rollback_err| {
                    ApplyError::ProjectInaccessible(format!(
                        "rollback after failed write of {} did not complete: {rollback_err}",
                        change.rel.display()
                    ))
                })?;
                return Err(ApplyError::Rejected(format!(
                    "failed to write {}: {err}; project restored",
                    change.rel.display()
                )));
            }
        }

        let mut applied = AppliedChange::default();
        for change in changes {
            if change.next.is_some() {
                applied.written.push(change.rel);
            } else {
                applied.removed.push(change.rel);
            }
        }
        info!(
            written = applied.written.len(),
            removed = applied.removed.len(),
            "patch applied"
        );
        Ok(applied)
    }
}

fn ensure_project_dir(project: &Path) -> Result<(), ApplyError> {
    match fs::metadata(project) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(ApplyError::ProjectInaccessible(format!(
            "{} is not a directory",
            project.display()
        ))),
        Err(err) => Err(ApplyError::ProjectInaccessible(format!(
            "{}: {err}",
            project.display()
        ))),
    }
}

fn parse_file_set(content: &str) -> Result<FileSet, ApplyError> {
    let body = strip_code_fence(content);
    let value: Value = serde_json::from_str(body)
        .map_err(|err| ApplyError::Rejected(format!("patch is not valid JSON: {err}")))?;
    let messages: Vec<String> = FILE_SET_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(ApplyError::Rejected(format!(
            "patch does not match the file set schema:\n- {}",
            messages.join("\n- ")
        )));
    }
    serde_json::from_value(value)
        .map_err(|err| ApplyError::Rejected(format!("patch is not a file set: {err}")))
}

/// Models often wrap JSON in a Markdown code fence; accept exactly one.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(newline) = rest.find('\n') else {
        return trimmed;
    };
    rest[newline + 1..]
        .trim_end()
        .strip_suffix("```")
        .map_or(trimmed, str::trim)
}

fn plan(project: &Path, files: Vec<FileEntry>) -> Result<Vec<Change>, ApplyError> {
    let mut seen = HashSet::new();
    let mut changes = Vec::new();
    for entry in files {
        let rel = safe_relative_path(&entry.name).map_err(ApplyError::Rejected)?;
        if !seen.insert(rel.clone()) {
            return Err(ApplyError::Rejected(format!(
                "duplicate entry for {}",
                rel.display()
            )));
        }
        check_ancestors(project, &rel)?;
        let target = project.join(&rel);
        let previous = read_existing(&target, &rel)?;

        match (&entry.content, &previous) {
            (Some(next), Some(prev)) if next.as_bytes() == prev.as_slice() => continue,
            (None, None) => {
                return Err(ApplyError::Rejected(format!(
                    "cannot delete {}: no such file",
                    rel.display()
                )));
            }
            _ => {}
        }
        changes.push(Change {
            rel,
            target,
            previous,
            next: entry.content,
        });
    }
    Ok(changes)
}

/// Normalize a patch file name into a path that stays inside the project.
fn safe_relative_path(name: &str) -> Result<PathBuf, String> {
    let mut out = PathBuf::new();
    for component in Path::new(name.trim()).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(format!("file name {name:?} escapes the project"));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(format!("file name {name:?} is empty"));
    }
    Ok(out)
}

/// Existing ancestors must be real directories, never symlinks.
fn check_ancestors(project: &Path, rel: &Path) -> Result<(), ApplyError> {
    let mut current = project.to_path_buf();
    let Some(parent) = rel.parent() else {
        return Ok(());
    };
    for component in parent.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(ApplyError::Rejected(format!(
                    "{} is a symlink",
                    rel.display()
                )));
            }
            Ok(meta) if !meta.is_dir() => {
                return Err(ApplyError::Rejected(format!(
                    "cannot write {}: an ancestor is not a directory",
                    rel.display()
                )));
            }
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(ApplyError::ProjectInaccessible(format!(
                    "{}: {err}",
                    current.display()
                )));
            }
        }
    }
    Ok(())
}

fn read_existing(target: &Path, rel: &Path) -> Result<Option<Vec<u8>>, ApplyError> {
    let meta = match fs::symlink_metadata(target) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(ApplyError::ProjectInaccessible(format!(
                "{}: {err}",
                target.display()
            )));
        }
    };
    if meta.file_type().is_symlink() {
        return Err(ApplyError::Rejected(format!(
            "{} is a symlink",
            rel.display()
        )));
    }
    if meta.is_dir() {
        return Err(ApplyError::Rejected(format!(
            "{} is a directory",
            rel.display()
        )));
    }
    fs::read(target)
        .map(Some)
        .map_err(|err| ApplyError::ProjectInaccessible(format!("{}: {err}", target.display())))
}

fn commit(
    project: &Path,
    change: &Change,
    created_dirs: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    match &change.next {
        Some(content) => {
            create_parents(project, &change.rel, created_dirs)?;
            write_atomic(&change.target, content.as_bytes())
        }
        None => fs::remove_file(&change.target),
    }
}

/// Create missing parent directories one by one, remembering each for rollback.
fn create_parents(
    project: &Path,
    rel: &Path,
    created_dirs: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    let Some(parent) = rel.parent() else {
        return Ok(());
    };
    let mut current = project.to_path_buf();
    for component in parent.components() {
        current.push(component);
        if !current.exists() {
            fs::create_dir(&current)?;
            created_dirs.push(current.clone());
        }
    }
    Ok(())
}

fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp_path = tmp_path_for(path);
    if let Err(err) = fs::write(&tmp_path, contents) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

/// Undo committed changes in reverse order, then drop directories we created.
fn rollback(committed: &[Change], created_dirs: &[PathBuf]) -> std::io::Result<()> {
    for change in committed.iter().rev() {
        match &change.previous {
            Some(bytes) => write_atomic(&change.target, bytes)?,
            None => match fs::remove_file(&change.target) {
                Err(err) if err.kind() != ErrorKind::NotFound => return Err(err),
                _ => {}
            },
        }
    }
    for dir in created_dirs.iter().rev() {
        fs::remove_dir(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("design.py"), "PUMP_HEAD_M = 25\n").expect("write");
        fs::write(temp.path().join("params.py"), "FLOW = 3\n").expect("write");
        temp
    }

    fn apply(project: &Path, content: &str) -> Result<AppliedChange, ApplyError> {
        FileSetApplier.apply(&PatchDescriptor::new(content), project)
    }

    fn read(project: &Path, name: &str) -> String {
        fs::read_to_string(project.join(name)).expect("read")
    }

    #[test]
    fn writes_creates_and_deletes_files() {
        let temp = project();
        let patch = r#"{"files":[
            {"name":"design.py","content":"PUMP_HEAD_M = 32\n"},
            {"name":"systems/cooling.py","content":"FANS = 2\n"},
            {"name":"params.py","content":null}
        ]}"#;
        let applied = apply(temp.path(), patch).expect("apply");

        assert_eq!(
            applied.written,
            vec![PathBuf::from("design.py"), PathBuf::from("systems/cooling.py")]
        );
        assert_eq!(applied.removed, vec![PathBuf::from("params.py")]);
        assert_eq!(read(temp.path(), "design.py"), "PUMP_HEAD_M = 32\n");
        assert_eq!(read(temp.path(), "systems/cooling.py"), "FANS = 2\n");
        assert!(!temp.path().join("params.py").exists());
    }

    #[test]
    fn blank_and_empty_patches_are_no_ops() {
        let temp = project();
        assert!(apply(temp.path(), "  \n").expect("blank").is_empty());
        assert!(apply(temp.path(), "{}").expect("empty object").is_empty());
        assert!(apply(temp.path(), r#"{"files":[]}"#).expect("no files").is_empty());
        let same = r#"{"files":[{"name":"design.py","content":"PUMP_HEAD_M = 25\n"}]}"#;
        assert!(apply(temp.path(), same).expect("identical").is_empty());
    }

    #[test]
    fn accepts_fenced_json() {
        let temp = project();
        let patch = concat!(
            "```json\n",
            r#"{"files":[{"name":"design.py","content":"X = 1\n"}]}"#,
            "\n```\n"
        );
        let applied = apply(temp.path(), patch).expect("apply");
        assert_eq!(applied.files_changed(), 1);
        assert_eq!(read(temp.path(), "design.py"), "X = 1\n");
    }

    #[test]
    fn rejects_malformed_patches_without_touching_project() {
        let temp = project();
        let cases = [
            "not json at all",
            r#"{"edits":[]}"#,
            r#"{"files":[{"name":"design.py"}]}"#,
            r#"{"files":[{"name":"../outside.py","content":"x"}]}"#,
            r#"{"files":[{"name":"/etc/passwd","content":"x"}]}"#,
            r#"{"files":[{"name":"a.py","content":"1"},{"name":"./a.py","content":"2"}]}"#,
            r#"{"files":[{"name":"missing.py","content":null}]}"#,
            r#"{"files":[{"name":"design.py/inner.py","content":"x"}]}"#,
        ];
        for case in cases {
            let err = apply(temp.path(), case).unwrap_err();
            assert!(matches!(err, ApplyError::Rejected(_)), "{case}: {err}");
        }
        assert_eq!(read(temp.path(), "design.py"), "PUMP_HEAD_M = 25\n");
        assert_eq!(read(temp.path(), "params.py"), "FLOW = 3\n");
        assert!(!temp.path().join("a.py").exists());
    }

    #[test]
    fn rejects_directory_targets() {
        let temp = project();
        fs::create_dir(temp.path().join("systems")).expect("mkdir");
        let err =
            apply(temp.path(), r#"{"files":[{"name":"systems","content":"x"}]}"#).unwrap_err();
        assert!(err.to_string().contains("is a directory"));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_writes_through_symlinks() {
        let temp = project();
        let outside = tempfile::tempdir().expect("tempdir");
        std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).expect("symlink");
        let err = apply(
            temp.path(),
            r#"{"files":[{"name":"link/x.py","content":"x"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::Rejected(_)));
        assert!(!outside.path().join("x.py").exists());
    }

    #[test]
    fn missing_project_is_inaccessible() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = apply(&temp.path().join("gone"), "{}").unwrap_err();
        assert!(matches!(err, ApplyError::ProjectInaccessible(_)));
    }

    #[test]
    fn rollback_restores_previous_contents_and_directories() {
        let temp = project();
        let root = temp.path();
        let changes = plan(
            root,
            vec![
                FileEntry {
                    name: "design.py".to_string(),
                    content: Some("PUMP_HEAD_M = 40\n".to_string()),
                },
                FileEntry {
                    name: "new/dir/file.py".to_string(),
                    content: Some("NEW = 1\n".to_string()),
                },
                FileEntry {
                    name: "params.py".to_string(),
                    content: None,
                },
            ],
        )
        .expect("plan");

        let mut created = Vec::new();
        for change in &changes {
            commit(root, change, &mut created).expect("commit");
        }
        assert_eq!(created.len(), 2);
        assert!(!root.join("params.py").exists());

        rollback(&changes, &created).expect("rollback");
        assert_eq!(read(root, "design.py"), "PUMP_HEAD_M = 25\n");
        assert_eq!(read(root, "params.py"), "FLOW = 3\n");
        assert!(!root.join("new").exists());
    }

    #[test]
    fn safe_relative_path_normalizes_current_dir() {
        assert_eq!(
            safe_relative_path("./systems/./pump.py").expect("path"),
            PathBuf::from("systems/pump.py")
        );
        assert!(safe_relative_path(".").is_err());
        assert!(safe_relative_path("a/../../b").is_err());
    }
}
