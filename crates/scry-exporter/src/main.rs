use clap::Parser;
use scry_core::config::{env_string, env_true, ScryPaths};
use scry_core::logging::{self, Console, LogGuard, LogSettings};
use scry_exporter::{Exporter, ExporterConfig, GatewayClient};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tracing::{error, warn};

/// Hook entry point: reads the hook payload from stdin and exports one event.
#[derive(Parser, Debug)]
#[command(name = "scry-export")]
struct Args {
    /// Event kind this hook reports, e.g. `tool_start`.
    event_type: String,
    /// Forward to the local ingestion gateway instead of the OTLP collector.
    #[arg(long, default_value_t = false)]
    gateway: bool,
    #[arg(long, default_value = "")]
    base_dir: String,
    /// Collector logs endpoint, overriding `ALLOY_HOST`/`ALLOY_PORT`.
    #[arg(long, default_value = "")]
    collector: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    let config = load_config(&args);
    let _log_guard = init_logging(&config, args.debug || env_true("SCRY_DEBUG"));

    let payload = read_payload().await;
    let exporter = match Exporter::new(config) {
        Ok(exporter) => exporter,
        Err(err) => {
            error!(event = "exporter_init_failed", error = %err);
            return;
        }
    };

    let outcome = if args.gateway {
        let config = exporter.config();
        match GatewayClient::new(config.gateway_endpoint.clone(), config.gateway_timeout) {
            Ok(gateway) => exporter.forward(&gateway, &args.event_type, &payload).await,
            Err(err) => Err(err),
        }
    } else {
        exporter.export(&args.event_type, &payload).await
    };
    // Hooks must never fail the host tool call, so errors only reach the log.
    if let Err(err) = outcome {
        error!(event = "export_failed", event_type = %args.event_type, error = %err);
    }
}

/// Unparseable or empty stdin is treated as an empty payload.
async fn read_payload() -> Value {
    let mut raw = String::new();
    if let Err(err) = tokio::io::stdin().read_to_string(&mut raw).await {
        warn!(event = "stdin_read_failed", error = %err);
        return json!({});
    }
    match serde_json::from_str::<Value>(&raw) {
        Ok(value @ Value::Object(_)) => value,
        _ => json!({}),
    }
}

fn load_config(args: &Args) -> ExporterConfig {
    let mut config = ExporterConfig::from_env();
    if !args.base_dir.trim().is_empty() {
        let db_path = config.paths.db_path.clone();
        config.paths = ScryPaths::from_base(args.base_dir.trim());
        if env_string("OBSERVATORY_DB").is_some() {
            config.paths.db_path = db_path;
        }
    }
    if !args.collector.trim().is_empty() {
        config.collector_endpoint = args.collector.trim().to_string();
    }
    config
}

fn init_logging(config: &ExporterConfig, debug: bool) -> Option<LogGuard> {
    logging::init_logging(&LogSettings {
        log_dir: &config.paths.log_dir,
        file_name: "scry-export.log",
        console: Console::Stderr,
        default_level: "warn",
        debug,
        ansi: false,
    })
}
