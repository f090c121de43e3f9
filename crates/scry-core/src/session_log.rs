//! Append-only per-session event logs (`sessions/<id>.jsonl`).

use crate::events::HookEvent;
use crate::sanitize_session_id;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionLogError {
    #[error("session log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Listing row for `GET /sessions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub project: String,
    pub cwd: String,
    pub start_time: i64,
    pub active: bool,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionLog {
    dir: PathBuf,
}

impl SessionLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", sanitize_session_id(session_id)))
    }

    pub fn append(&self, event: &HookEvent) -> Result<PathBuf, SessionLogError> {
        self.append_value(&event.session_id, &event.to_wire())
    }

    /// One line per call; a single `write_all` keeps concurrent appends whole.
    pub fn append_value(&self, session_id: &str, value: &Value) -> Result<PathBuf, SessionLogError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(session_id);
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&line)?;
        Ok(path)
    }

    /// Events in file order. Lines that fail to parse are skipped.
    pub fn read_events(&self, session_id: &str) -> Result<Vec<HookEvent>, SessionLogError> {
        let raw = match fs::read_to_string(self.path_for(session_id)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(parse_event_lines(&raw))
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.path_for(session_id).is_file()
    }

    /// Every session with a log, newest start first.
    pub fn list(&self) -> Result<Vec<SessionSummary>, SessionLogError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            if let Some(summary) = summarize(stem, &parse_event_lines(&raw)) {
                sessions.push(summary);
            }
        }
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }
}

pub fn parse_event_lines(raw: &str) -> Vec<HookEvent> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|value| HookEvent::from_wire(value).ok())
        .collect()
}

fn summarize(id: &str, events: &[HookEvent]) -> Option<SessionSummary> {
    let first = events.first()?;
    let last = events.last()?;
    let cwd = events
        .iter()
        .find_map(|event| event.cwd.clone())
        .unwrap_or_default();
    let project = project_name(&cwd);
    let model = events.iter().find_map(|event| match &event.payload {
        crate::events::EventPayload::SessionStart(body) => body.model.clone(),
        _ => event
            .extra
            .get("model")
            .and_then(Value::as_str)
            .map(ToString::to_string),
    });
    Some(SessionSummary {
        id: id.to_string(),
        project,
        cwd,
        start_time: first.timestamp,
        active: last.event_type() != "session_end",
        model,
    })
}

/// Last path segment of a working directory.
pub fn project_name(cwd: &str) -> String {
    cwd.trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .to_string()
}
