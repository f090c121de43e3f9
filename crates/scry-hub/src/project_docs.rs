//! Project memory and instruction files shown beside a session.
//!
//! Per-project files live under the transcript root in a directory named by the
//! project path with `/` replaced by `-`.

use crate::path_guard::allowed_path;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, PartialEq)]
pub enum DocLookup {
    /// `{content, path, lineCount}` of the file that was read.
    Found(Value),
    /// Error body naming the paths that were tried.
    Missing(Value),
    /// A candidate resolved outside the directory it must stay in.
    Forbidden,
}

pub fn project_slug(project: &str) -> String {
    project.replace('/', "-")
}

/// `MEMORY.md` from the project's directory under `root`.
pub fn memory(root: &Path, project: &str) -> DocLookup {
    let nominal = root
        .join(project_slug(project))
        .join("memory")
        .join("MEMORY.md");
    let Some(path) = allowed_path(&nominal, root, no_transcripts()) else {
        return DocLookup::Forbidden;
    };
    match read_doc(&path) {
        Some(doc) => DocLookup::Found(doc),
        None => DocLookup::Missing(json!({
            "error": "MEMORY.md not found",
            "path": nominal.display().to_string(),
        })),
    }
}

/// `CLAUDE.md` from the project's directory under `root`, else from the
/// project itself.
pub fn claude_md(root: &Path, project: &str) -> DocLookup {
    let scoped = root.join(project_slug(project)).join("CLAUDE.md");
    let in_project = Path::new(project).join("CLAUDE.md");
    let Some(project_file) = allowed_path(&in_project, Path::new(project), no_transcripts())
    else {
        return DocLookup::Forbidden;
    };

    let mut candidates: Vec<PathBuf> = Vec::new();
    candidates.extend(allowed_path(&scoped, root, no_transcripts()));
    candidates.push(project_file);
    for path in &candidates {
        if let Some(doc) = read_doc(path) {
            return DocLookup::Found(doc);
        }
    }
    DocLookup::Missing(json!({
        "error": "CLAUDE.md not found",
        "paths": [scoped.display().to_string(), in_project.display().to_string()],
    }))
}

fn no_transcripts<'a>() -> std::iter::Empty<&'a Path> {
    std::iter::empty()
}

fn read_doc(path: &Path) -> Option<Value> {
    if !path.is_file() {
        return None;
    }
    let content = fs::read_to_string(path).ok()?;
    let line_count = content.split('\n').count();
    Some(json!({
        "content": content,
        "path": path.display().to_string(),
        "lineCount": line_count,
    }))
}
