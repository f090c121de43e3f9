use clap::Parser;
use scry_core::config::{env_string, env_true, ScryPaths};
use scry_core::logging::{self, Console, LogGuard, LogSettings};
use scry_hub::{config::SHUTDOWN_GRACE, idle, router, HubConfig, HubState};
use std::{
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "scry-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    base_dir: String,
    #[arg(long, default_value = "")]
    transcript_root: String,
    #[arg(long)]
    idle_timeout: Option<u64>,
    #[arg(long)]
    idle_check: Option<u64>,
    /// Also fold every accepted event into the SQLite store.
    #[arg(long, default_value_t = false)]
    store: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr);
        return;
    }

    let state = match HubState::new(config.clone()) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };
    let pid_file = config.paths.pid_file.clone();
    if let Err(err) = fs::write(&pid_file, std::process::id().to_string()) {
        warn!(event = "pid_write_failed", path = %pid_file.display(), error = %err);
    }
    info!(
        event = "hub_start",
        addr = %config.addr,
        pid = std::process::id(),
        store = config.use_store
    );

    let shutdown = shutdown_signal(Arc::clone(&state), pid_file.clone());
    if let Err(err) = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
    remove_pid_file(&pid_file);
    info!(event = "hub_stopped");
}

/// Resolves on Ctrl-C, SIGTERM or idle timeout. Once it fires, open
/// connections get a grace period before the process exits regardless.
async fn shutdown_signal(state: Arc<HubState>, pid_file: PathBuf) {
    let idle_timeout = state.config().idle_timeout;
    let idle_check = state.config().idle_check;
    let reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => "interrupt",
        _ = terminate() => "terminate",
        _ = idle::wait_for_idle(state, idle_timeout, idle_check) => "idle",
    };
    info!(event = "hub_shutdown", reason);
    remove_pid_file(&pid_file);
    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        warn!(event = "hub_forced_exit");
        std::process::exit(0);
    });
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}

fn remove_pid_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(event = "pid_remove_failed", error = %err),
    }
}

fn load_config() -> HubConfig {
    let args = Args::parse();
    let mut config = HubConfig::from_env();
    if !args.base_dir.trim().is_empty() {
        let db_path = env_string("OBSERVATORY_DB").map(PathBuf::from);
        config.paths = ScryPaths::from_base(args.base_dir.trim());
        if let Some(db_path) = db_path {
            config.paths.db_path = db_path;
        }
    }
    if !args.addr.trim().is_empty() {
        config.addr = args.addr.trim().to_string();
    }
    if !args.transcript_root.trim().is_empty() {
        config.transcript_root = PathBuf::from(args.transcript_root.trim());
    }
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.idle_check {
        config.idle_check = Duration::from_secs(secs);
    }
    config.use_store = args.store || env_true("SCRY_HUB_STORE");
    config.debug = args.debug || env_true("SCRY_DEBUG");
    config
}

fn init_logging(config: &HubConfig) -> Option<LogGuard> {
    logging::init_logging(&LogSettings {
        log_dir: &config.paths.log_dir,
        file_name: "scry-hub.log",
        console: Console::Stdout,
        default_level: "info",
        debug: config.debug,
        ansi: true,
    })
}
