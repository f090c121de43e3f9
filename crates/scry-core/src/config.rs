use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 7847;
pub const DEFAULT_COLLECTOR_HOST: &str = "127.0.0.1";
pub const DEFAULT_COLLECTOR_PORT: u16 = 4318;
pub const DEFAULT_EXPORT_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_GATEWAY_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_IDLE_CHECK_SECS: u64 = 60;

/// On-disk layout shared by the hub, the exporter and the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScryPaths {
    pub base_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub pending_dir: PathBuf,
    pub resolved_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub log_dir: PathBuf,
    pub pid_file: PathBuf,
    pub db_path: PathBuf,
}

impl ScryPaths {
    pub fn from_base(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            sessions_dir: base_dir.join("sessions"),
            pending_dir: base_dir.join("pending"),
            resolved_dir: base_dir.join("resolved"),
            prompts_dir: base_dir.join("prompts"),
            log_dir: base_dir.join("logs"),
            pid_file: base_dir.join("server.pid"),
            db_path: base_dir.join("observatory.db"),
            base_dir,
        }
    }

    /// `SCRY_BASE_DIR` or `~/.claude/observatory`; `OBSERVATORY_DB` moves the database.
    pub fn resolve() -> Self {
        let base = env_string("SCRY_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join(".claude").join("observatory"));
        let mut paths = Self::from_base(base);
        if let Some(db) = env_string("OBSERVATORY_DB") {
            paths.db_path = PathBuf::from(db);
        }
        paths
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.base_dir,
            &self.sessions_dir,
            &self.pending_dir,
            &self.resolved_dir,
            &self.prompts_dir,
        ] {
            fs::create_dir_all(dir)?;
        }
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/home"))
}

/// Root under which host transcripts live (`~/.claude/projects`).
pub fn default_transcript_root() -> PathBuf {
    env_string("SCRY_TRANSCRIPT_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".claude").join("projects"))
}

pub fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse::<T>().ok())
}

pub fn env_true(key: &str) -> bool {
    env_string(key)
        .map(|value| matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

pub fn is_within(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_base_lays_out_children() {
        let paths = ScryPaths::from_base("/x/obs");
        assert_eq!(paths.sessions_dir, PathBuf::from("/x/obs/sessions"));
        assert_eq!(paths.pending_dir, PathBuf::from("/x/obs/pending"));
        assert_eq!(paths.resolved_dir, PathBuf::from("/x/obs/resolved"));
        assert_eq!(paths.pid_file, PathBuf::from("/x/obs/server.pid"));
        assert_eq!(paths.db_path, PathBuf::from("/x/obs/observatory.db"));
    }

    #[test]
    fn ensure_dirs_creates_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = ScryPaths::from_base(dir.path().join("obs"));
        paths.ensure_dirs().expect("ensure");
        assert!(paths.sessions_dir.is_dir());
        assert!(paths.pending_dir.is_dir());
        assert!(paths.resolved_dir.is_dir());
    }

    #[test]
    fn component_containment_is_not_string_prefix() {
        assert!(is_within(Path::new("/a/b/c"), Path::new("/a/b")));
        assert!(!is_within(Path::new("/a/bc"), Path::new("/a/b")));
    }
}
