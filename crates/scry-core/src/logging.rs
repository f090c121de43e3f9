//! Tracing setup shared by the scry binaries: one console stream teed into an
//! append-only file under `logs/`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

use crate::config::env_string;

type SharedFile = Arc<Mutex<File>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Console {
    Stdout,
    /// Hooks keep stdout for the host tool.
    Stderr,
}

#[derive(Debug, Clone)]
pub struct LogSettings<'a> {
    pub log_dir: &'a Path,
    pub file_name: &'a str,
    pub console: Console,
    pub default_level: &'a str,
    pub debug: bool,
    pub ansi: bool,
}

/// Keeps the log file open for the life of the process and flushes it on drop.
pub struct LogGuard {
    file: Option<SharedFile>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = file.lock().unwrap_or_else(PoisonError::into_inner).flush();
        }
    }
}

/// `debug` wins, then `SCRY_LOG_LEVEL`, then the binary's default.
/// `RUST_LOG` overrides all of these when set.
pub fn level_directive(debug: bool, default_level: &str) -> String {
    if debug {
        return "debug".to_string();
    }
    env_string("SCRY_LOG_LEVEL").unwrap_or_else(|| default_level.to_string())
}

/// Install the global subscriber. Returns `None` if one is already set.
pub fn init_logging(settings: &LogSettings<'_>) -> Option<LogGuard> {
    let level = level_directive(settings.debug, settings.default_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file = match open_append(settings.log_dir, settings.file_name) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };

    let console = settings.console;
    let shared = file.clone();
    let make_writer = BoxMakeWriter::new(move || TeeWriter::new(console, shared.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(settings.ansi)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(LogGuard { file })
}

/// A missing or uncreatable log directory means console-only logging.
fn open_append(dir: &Path, name: &str) -> io::Result<Option<SharedFile>> {
    if fs::create_dir_all(dir).is_err() {
        return Ok(None);
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(name))?;
    Ok(Some(Arc::new(Mutex::new(file))))
}

struct TeeWriter {
    console: Console,
    file: Option<SharedFile>,
}

impl TeeWriter {
    fn new(console: Console, file: Option<SharedFile>) -> Self {
        Self { console, file }
    }

    fn with_file(&self, write: impl FnOnce(&mut File) -> io::Result<()>) {
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = write(&mut file);
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = match self.console {
            Console::Stdout => io::stdout().write_all(buf),
            Console::Stderr => io::stderr().write_all(buf),
        };
        self.with_file(|file| file.write_all(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = match self.console {
            Console::Stdout => io::stdout().flush(),
            Console::Stderr => io::stderr().flush(),
        };
        self.with_file(|file| file.flush());
        Ok(())
    }
}
