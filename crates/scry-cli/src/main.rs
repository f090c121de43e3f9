use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scry_core::config::{default_transcript_root, ScryPaths};
use scry_storage::ScryStore;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "scry")]
#[command(about = "Query and backfill the scry session store", long_about = None)]
struct Cli {
    /// Database file; defaults to `OBSERVATORY_DB` or `<base>/observatory.db`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest one transcript or backfill a directory of them
    Ingest {
        #[arg(long, conflicts_with = "backfill")]
        session: Option<PathBuf>,
        /// Ingest every `*.jsonl` transcript in a directory
        #[arg(long)]
        backfill: bool,
        /// Backfill directory (defaults to the transcript root)
        #[arg(requires = "backfill")]
        dir: Option<PathBuf>,
    },
    /// List stored sessions, newest first
    Sessions {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Full-text search over first prompts and agent tasks
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Print one session with its agents, tool calls and compactions
    Show { session_id: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let paths = ScryPaths::resolve();
    let db_path = cli.db.unwrap_or(paths.db_path);
    if let Some(parent) = db_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = ScryStore::open(&db_path)
        .with_context(|| format!("Failed to open {}", db_path.display()))?;
    let mut out = io::stdout().lock();

    match cli.command {
        Commands::Ingest {
            session,
            backfill,
            dir,
        } => match session {
            Some(path) => commands::ingest_one(&store, &path, &mut out)?,
            None if backfill => {
                let dir = dir.unwrap_or_else(default_transcript_root);
                commands::ingest_all(&store, &dir, &mut out)?
            }
            None => bail!("Pass --session <file> or --backfill [dir]"),
        },
        Commands::Sessions {
            project,
            status,
            limit,
            json,
        } => commands::list_sessions(&store, project, status.as_deref(), limit, json, &mut out)?,
        Commands::Search { query, limit, json } => {
            commands::search(&store, &query, limit, json, &mut out)?
        }
        Commands::Show { session_id } => commands::show(&store, &session_id, &mut out)?,
    }

    Ok(())
}

/// Diagnostics go to stderr so command output stays pipeable.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            scry_core::config::env_string("SCRY_LOG_LEVEL").unwrap_or_else(|| "warn".to_string()),
        )
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}
