use scry_core::config::{
    env_parse, env_string, ScryPaths, DEFAULT_COLLECTOR_HOST, DEFAULT_COLLECTOR_PORT,
    DEFAULT_EXPORT_TIMEOUT_MS, DEFAULT_GATEWAY_TIMEOUT_MS, DEFAULT_PORT,
};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub paths: ScryPaths,
    /// Full OTLP/HTTP logs endpoint, e.g. `http://127.0.0.1:4318/v1/logs`.
    pub collector_endpoint: String,
    pub collector_timeout: Duration,
    /// Ingestion gateway event endpoint used in forwarding mode.
    pub gateway_endpoint: String,
    pub gateway_timeout: Duration,
    /// Session id for payloads that do not name one (`CLAUDE_SESSION_ID`).
    pub fallback_session: Option<String>,
    pub host_name: String,
}

impl ExporterConfig {
    pub fn for_base(base_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            paths: ScryPaths::from_base(base_dir),
            collector_endpoint: collector_endpoint(DEFAULT_COLLECTOR_HOST, DEFAULT_COLLECTOR_PORT),
            collector_timeout: Duration::from_millis(DEFAULT_EXPORT_TIMEOUT_MS),
            gateway_endpoint: gateway_endpoint(DEFAULT_PORT),
            gateway_timeout: Duration::from_millis(DEFAULT_GATEWAY_TIMEOUT_MS),
            fallback_session: None,
            host_name: crate::otlp::local_host_name(),
        }
    }

    pub fn from_env() -> Self {
        let paths = ScryPaths::resolve();
        let mut config = Self::for_base(paths.base_dir.clone());
        config.paths = paths;
        let host = env_string("ALLOY_HOST").unwrap_or_else(|| DEFAULT_COLLECTOR_HOST.to_string());
        let port = env_parse::<u16>("ALLOY_PORT").unwrap_or(DEFAULT_COLLECTOR_PORT);
        config.collector_endpoint = collector_endpoint(&host, port);
        if let Some(ms) = env_parse::<u64>("SCRY_EXPORT_TIMEOUT_MS") {
            config.collector_timeout = Duration::from_millis(ms);
        }
        let gateway_port = env_parse::<u16>("OBSERVATORY_PORT").unwrap_or(DEFAULT_PORT);
        config.gateway_endpoint = gateway_endpoint(gateway_port);
        config.fallback_session = env_string("CLAUDE_SESSION_ID");
        config
    }
}

pub fn collector_endpoint(host: &str, port: u16) -> String {
    format!("http://{host}:{port}/v1/logs")
}

pub fn gateway_endpoint(port: u16) -> String {
    format!("http://127.0.0.1:{port}/api/events")
}
