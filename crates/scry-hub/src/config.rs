use scry_core::config::{
    default_transcript_root, env_parse, ScryPaths, DEFAULT_IDLE_CHECK_SECS,
    DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_PORT,
};
use std::path::PathBuf;
use std::time::Duration;

pub const MAX_EVENT_BYTES: usize = 1024 * 1024;
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
const BLOCKING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub addr: String,
    pub paths: ScryPaths,
    pub transcript_root: PathBuf,
    /// Zero disables idle shutdown.
    pub idle_timeout: Duration,
    pub idle_check: Duration,
    /// Upper bound for store writes and transcript parsing off the async runtime.
    pub blocking_timeout: Duration,
    pub use_store: bool,
    pub debug: bool,
}

impl HubConfig {
    /// Defaults rooted at `base_dir`, ignoring the environment.
    pub fn for_base(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            addr: default_addr(DEFAULT_PORT),
            paths: ScryPaths::from_base(base_dir),
            transcript_root: default_transcript_root(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            idle_check: Duration::from_secs(DEFAULT_IDLE_CHECK_SECS),
            blocking_timeout: BLOCKING_TIMEOUT,
            use_store: false,
            debug: false,
        }
    }

    pub fn from_env() -> Self {
        let port = env_parse::<u16>("OBSERVATORY_PORT").unwrap_or(DEFAULT_PORT);
        Self {
            addr: default_addr(port),
            paths: ScryPaths::resolve(),
            transcript_root: default_transcript_root(),
            idle_timeout: Duration::from_secs(
                env_parse("SCRY_IDLE_TIMEOUT_SECS").unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
            ),
            idle_check: Duration::from_secs(
                env_parse("SCRY_IDLE_CHECK_SECS").unwrap_or(DEFAULT_IDLE_CHECK_SECS),
            ),
            blocking_timeout: BLOCKING_TIMEOUT,
            use_store: false,
            debug: false,
        }
    }
}

fn default_addr(port: u16) -> String {
    format!("127.0.0.1:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_base_uses_documented_defaults() {
        let config = HubConfig::for_base("/tmp/scry-base");
        assert_eq!(config.addr, "127.0.0.1:7847");
        assert_eq!(config.paths.sessions_dir, PathBuf::from("/tmp/scry-base/sessions"));
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert!(!config.use_store);
    }
}
