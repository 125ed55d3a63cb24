//! Bounded snapshot of the target project for proposal contexts.
//!
//! Every proposal sees the project as it is now: the sorted list of files
//! and as much of their contents as the byte cap allows. Whole-file edits
//! are only possible when the proposer knows what the files contain.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::io::patch::TMP_SUFFIX;

/// What the snapshot holds for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileBody {
    /// UTF-8 contents, cut after `content` when `truncated > 0` bytes remain.
    Text { content: String, truncated: usize },
    Binary,
    /// The byte cap was reached before this file.
    Omitted,
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    /// Relative to the project root.
    pub path: PathBuf,
    pub size: u64,
    pub body: FileBody,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectSnapshot {
    files: Vec<SnapshotFile>,
}

impl ProjectSnapshot {
    /// Walk `project` and read files until `max_bytes` of contents are taken.
    ///
    /// With `extensions` empty every non-hidden file is listed.
    pub fn capture(project: &Path, max_bytes: usize, extensions: &[String]) -> Result<Self> {
        let paths = project_files(project, |path| {
            extensions.is_empty()
                || path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| extensions.iter().any(|want| want == ext))
        })?;

        let mut remaining = max_bytes;
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let full = project.join(&path);
            let (size, body) = match fs::read(&full) {
                Ok(bytes) => (bytes.len() as u64, text_body(bytes, &mut remaining)),
                Err(err) => {
                    warn!(file = %full.display(), err = %err, "could not read project file");
                    (0, FileBody::Unreadable(err.to_string()))
                }
            };
            files.push(SnapshotFile { path, size, body });
        }
        debug!(
            files = files.len(),
            bytes = max_bytes - remaining,
            "captured project snapshot"
        );
        Ok(Self { files })
    }

    pub fn files(&self) -> &[SnapshotFile] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// One `## <path>` section per file, contents in a fenced block.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, file) in self.files.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let _ = writeln!(out, "## {}\n", file.path.display());
            match &file.body {
                FileBody::Text { content, truncated } => {
                    let fence = if content.contains("```") { "````" } else { "```" };
                    let _ = writeln!(out, "{fence}");
                    out.push_str(content);
                    if !content.is_empty() && !content.ends_with('\n') {
                        out.push('\n');
                    }
                    let _ = writeln!(out, "{fence}");
                    if *truncated > 0 {
                        let _ = writeln!(out, "[truncated {truncated} bytes]");
                    }
                }
                FileBody::Binary => {
                    let _ = writeln!(out, "[binary file, {} bytes]", file.size);
                }
                FileBody::Omitted => {
                    let _ = writeln!(out, "[contents omitted, {} bytes]", file.size);
                }
                FileBody::Unreadable(reason) => {
                    let _ = writeln!(out, "[unreadable: {reason}]");
                }
            }
        }
        out
    }
}

fn text_body(bytes: Vec<u8>, remaining: &mut usize) -> FileBody {
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(_) => return FileBody::Binary,
    };
    if *remaining == 0 && !text.is_empty() {
        return FileBody::Omitted;
    }
    let mut cut = text.len().min(*remaining);
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    *remaining -= cut;
    FileBody::Text {
        content: text[..cut].to_string(),
        truncated: text.len() - cut,
    }
}

/// Project files accepted by `keep`, relative and sorted.
///
/// Hidden entries and leftover temp files are skipped, as are entries that
/// cannot be read below the root.
pub(crate) fn project_files(
    project: &Path,
    keep: impl Fn(&Path) -> bool,
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(project)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() > 0 => {
                warn!(err = %err, "skipping unreadable project entry");
                continue;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("walk {}", project.display()));
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|ext| ext.to_str()) == Some(TMP_SUFFIX) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(project)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        if keep(rel) {
            files.push(rel.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("systems")).expect("mkdir");
        fs::create_dir_all(root.join(".git")).expect("mkdir");
        fs::write(root.join("design.py"), "PUMP_HEAD_M = 25\n").expect("write");
        fs::write(root.join("systems/pump.py"), "def head():\n    return 25\n").expect("write");
        fs::write(root.join("notes.txt"), "sized for 30 m").expect("write");
        fs::write(root.join(".git/HEAD"), "ref: main\n").expect("write");
        fs::write(root.join("design.py.refiner-tmp"), "partial").expect("write");
        temp
    }

    fn paths(snapshot: &ProjectSnapshot) -> Vec<String> {
        snapshot
            .files()
            .iter()
            .map(|file| file.path.display().to_string())
            .collect()
    }

    #[test]
    fn lists_sorted_files_without_hidden_or_temp_entries() {
        let temp = project();
        let snapshot = ProjectSnapshot::capture(temp.path(), 10_000, &[]).expect("capture");
        assert_eq!(
            paths(&snapshot),
            vec!["design.py", "notes.txt", "systems/pump.py"]
        );
    }

    #[test]
    fn extensions_filter_the_listing() {
        let temp = project();
        let snapshot =
            ProjectSnapshot::capture(temp.path(), 10_000, &["py".to_string()]).expect("capture");
        assert_eq!(paths(&snapshot), vec!["design.py", "systems/pump.py"]);
    }

    #[test]
    fn byte_cap_truncates_then_omits() {
        let temp = project();
        let snapshot = ProjectSnapshot::capture(temp.path(), 20, &[]).expect("capture");
        let bodies: Vec<&FileBody> = snapshot.files().iter().map(|file| &file.body).collect();
        assert_eq!(
            bodies[0],
            &FileBody::Text {
                content: "PUMP_HEAD_M = 25\n".to_string(),
                truncated: 0
            }
        );
        assert_eq!(
            bodies[1],
            &FileBody::Text {
                content: "siz".to_string(),
                truncated: 11
            }
        );
        assert_eq!(bodies[2], &FileBody::Omitted);

        let rendered = snapshot.render();
        assert!(rendered.contains("[truncated 11 bytes]"));
        assert!(rendered.contains("## systems/pump.py\n\n[contents omitted, 26 bytes]"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("units.py"), "DELTA = \"Δp\"\n").expect("write");
        let snapshot = ProjectSnapshot::capture(temp.path(), 10, &[]).expect("capture");
        match &snapshot.files()[0].body {
            FileBody::Text { content, truncated } => {
                assert_eq!(content, "DELTA = \"");
                assert_eq!(*truncated, 5);
            }
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn binary_files_are_listed_not_inlined() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("mesh.bin"), [0xff, 0xfe, 0x00]).expect("write");
        let snapshot = ProjectSnapshot::capture(temp.path(), 1_000, &[]).expect("capture");
        assert_eq!(snapshot.files()[0].body, FileBody::Binary);
        assert_eq!(snapshot.render(), "## mesh.bin\n\n[binary file, 3 bytes]\n");
    }

    #[test]
    fn render_fences_each_file() {
        let temp = project();
        let snapshot =
            ProjectSnapshot::capture(temp.path(), 10_000, &["py".to_string()]).expect("capture");
        assert_eq!(
            snapshot.render(),
            "## design.py\n\n```\nPUMP_HEAD_M = 25\n```\n\n\
             ## systems/pump.py\n\n```\ndef head():\n    return 25\n```\n"
        );
    }

    #[test]
    fn missing_project_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(ProjectSnapshot::capture(&temp.path().join("gone"), 10, &[]).is_err());
    }
}
