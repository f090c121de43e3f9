//! Containment checks for transcript paths supplied by dashboard queries.
//!
//! A candidate is resolved one component at a time: each existing prefix is
//! canonicalized before the next component is applied, so `..` after a symlink
//! climbs from the link target exactly as the OS would. The resolved path is
//! what callers read.

use scry_core::config::is_within;
use std::fs;
use std::path::{Component, Path, PathBuf};

pub fn resolve_path(raw: &Path) -> PathBuf {
    let absolute = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(raw)
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => {
                out.push(other.as_os_str());
                if let Ok(real) = fs::canonicalize(&out) {
                    out = real;
                }
            }
        }
    }
    out
}

/// The resolved form of `raw` when it lies under `root`, is one of the `known`
/// transcripts, or lies in the directory of one.
pub fn allowed_path<'a>(
    raw: &Path,
    root: &Path,
    known: impl IntoIterator<Item = &'a Path>,
) -> Option<PathBuf> {
    let candidate = resolve_path(raw);
    let root = resolve_path(root);
    if candidate != root && is_within(&candidate, &root) {
        return Some(candidate);
    }
    let permitted = known.into_iter().any(|transcript| {
        let transcript = resolve_path(transcript);
        if candidate == transcript {
            return true;
        }
        transcript
            .parent()
            .is_some_and(|dir| candidate != dir && is_within(&candidate, dir))
    });
    permitted.then_some(candidate)
}
