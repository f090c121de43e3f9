//! Per-session record of the latest user prompt, so every later event can be
//! joined back to the prompt that caused it.

use scry_core::events::EventPayload;
use scry_core::{sanitize_session_id, HookEvent};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMarker {
    pub prompt_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct PromptTracker {
    dir: PathBuf,
}

impl PromptTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", sanitize_session_id(session_id)))
    }

    pub fn record(&self, session_id: &str, marker: &PromptMarker) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let target = self.path_for(session_id);
        let temp = target.with_extension("json.tmp");
        let body = serde_json::to_vec(marker).map_err(io::Error::other)?;
        fs::write(&temp, body)?;
        fs::rename(&temp, &target)
    }

    pub fn current(&self, session_id: &str) -> Option<PromptMarker> {
        let raw = match fs::read_to_string(self.path_for(session_id)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(event = "prompt_marker_read_failed", session_id, error = %err);
                return None;
            }
        };
        serde_json::from_str(&raw).ok()
    }

    /// A prompt becomes the session's current prompt and carries its own id;
    /// any other event without a `prompt_id` inherits the current one.
    pub fn tag(&self, event: &mut HookEvent) {
        if matches!(event.payload, EventPayload::UserPrompt(_)) {
            let marker = PromptMarker {
                prompt_id: event.id.clone(),
                timestamp: event.timestamp,
            };
            if let Err(err) = self.record(&event.session_id, &marker) {
                warn!(event = "prompt_marker_write_failed", session_id = %event.session_id, error = %err);
            }
            event.prompt_id = Some(marker.prompt_id);
            return;
        }
        if event.prompt_id.is_none() {
            event.prompt_id = self
                .current(&event.session_id)
                .map(|marker| marker.prompt_id);
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
