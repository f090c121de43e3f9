//! Spawn correlation between a parent's `Task` tool call and the sub-agent
//! completion that follows it.
//!
//! Hooks fire in separate processes with no shared memory, so the parent side
//! records a pending spawn and the completion side claims one. Claims go
//! through an atomic move so two completions never take the same record.

use crate::events::{EventPayload, HookEvent, UNKNOWN_AGENT_ID};
use crate::sanitize_session_id;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error("mailbox io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pending record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("mailbox lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSpawn {
    pub agent_id: String,
    #[serde(default)]
    pub parent_agent_id: Option<String>,
    pub agent_label: String,
    #[serde(default)]
    pub task_description: String,
    #[serde(default)]
    pub model: Option<String>,
    pub timestamp: i64,
    #[serde(default)]
    pub session_id: String,
}

impl PendingSpawn {
    /// `{label}-{agent_id}`; the label prefix is what completions match on.
    pub fn key(&self) -> String {
        format!("{}-{}", self.agent_label, self.agent_id)
    }

    /// Whether the key starts with `{label}-`. A label that is a dash-bounded
    /// prefix of a longer one (`general` for `general-purpose`) also matches.
    pub fn matches_label(&self, label: &str) -> bool {
        self.key().starts_with(&format!("{label}-"))
    }
}

pub trait SpawnMailbox: Send + Sync {
    fn record_pending(&self, spawn: &PendingSpawn) -> Result<(), CorrelatorError>;

    /// Atomically take the best pending record for `candidate_label`.
    ///
    /// Records whose key carries the candidate label prefix win; otherwise the
    /// oldest record of any label is taken. Returns `None` when nothing is pending.
    fn claim_pending(&self, candidate_label: &str) -> Result<Option<PendingSpawn>, CorrelatorError>;

    fn pending(&self) -> Result<Vec<PendingSpawn>, CorrelatorError>;

    fn resolved(&self) -> Result<Vec<PendingSpawn>, CorrelatorError>;
}

/// Derive a stable-looking agent id for a freshly spawned sub-agent.
pub fn spawn_agent_id(session_id: &str, now_ms: i64, description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(now_ms.to_string().as_bytes());
    hasher.update(description.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("ag_{}", &hex[..12])
}

pub const DEFAULT_SPAWN_LABEL: &str = "general-purpose";

/// Tools whose invocation dispatches a sub-agent.
pub fn is_dispatch_tool(tool_name: &str) -> bool {
    matches!(tool_name, "Task" | "Agent")
}

/// Record a pending spawn for a dispatching `tool_start` and stamp the spawn
/// fields onto the event. Events that already carry `spawns_agent_id` are left
/// alone.
pub fn record_dispatch(
    mailbox: &dyn SpawnMailbox,
    event: &mut HookEvent,
    tool_input: Option<&Map<String, Value>>,
) -> Result<Option<PendingSpawn>, CorrelatorError> {
    let session_id = event.session_id.clone();
    let timestamp = event.timestamp;
    let EventPayload::ToolStart(body) = &mut event.payload else {
        return Ok(None);
    };
    if !is_dispatch_tool(&body.tool_name) || body.spawns_agent_id.is_some() {
        return Ok(None);
    }

    let input_str = |key: &str| {
        tool_input
            .and_then(|input| input.get(key))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };
    let description = body
        .agent_spawn_task
        .clone()
        .or_else(|| input_str("description"))
        .or_else(|| input_str("prompt"))
        .unwrap_or_default();
    let label = body
        .agent_spawn_label
        .clone()
        .or_else(|| input_str("subagent_type"))
        .unwrap_or_else(|| DEFAULT_SPAWN_LABEL.to_string());
    let model = body.agent_spawn_model.clone().or_else(|| input_str("model"));
    let parent = Some(body.agent_id.trim())
        .filter(|value| !value.is_empty())
        .unwrap_or(crate::MAIN_AGENT_ID)
        .to_string();

    let spawn = PendingSpawn {
        agent_id: spawn_agent_id(&session_id, timestamp, &description),
        parent_agent_id: Some(parent),
        agent_label: label,
        task_description: description,
        model,
        timestamp,
        session_id,
    };
    mailbox.record_pending(&spawn)?;

    body.spawns_agent_id = Some(spawn.agent_id.clone());
    body.agent_spawn_label = Some(spawn.agent_label.clone());
    body.agent_spawn_task = Some(spawn.task_description.clone());
    body.agent_spawn_model = spawn.model.clone();
    Ok(Some(spawn))
}

/// Label a completion should be matched on: `agent_type`, then `agent_label`,
/// then `subagent_type`.
pub fn completion_label(event: &HookEvent) -> String {
    let extra = |key: &str| {
        event
            .extra
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };
    let modelled = match &event.payload {
        EventPayload::AgentComplete(body) => Some(body.agent_label.trim().to_string())
            .filter(|value| !value.is_empty() && value != "unknown"),
        _ => None,
    };
    extra("agent_type")
        .or(modelled)
        .or_else(|| extra("subagent_type"))
        .unwrap_or_default()
}

/// Claim a pending spawn for an unresolved `agent_complete` and copy its
/// identity onto the event. Completions that already name an agent are left
/// alone; unmatched ones end up as `ag_unknown`.
pub fn resolve_completion(
    mailbox: &dyn SpawnMailbox,
    event: &mut HookEvent,
) -> Result<Option<PendingSpawn>, CorrelatorError> {
    let label = completion_label(event);
    let EventPayload::AgentComplete(body) = &mut event.payload else {
        return Ok(None);
    };
    let agent_id = body.agent_id.trim();
    if !agent_id.is_empty() && agent_id != UNKNOWN_AGENT_ID {
        return Ok(None);
    }

    let claimed = mailbox.claim_pending(&label)?;
    match &claimed {
        Some(spawn) => {
            body.agent_id = spawn.agent_id.clone();
            if spawn.parent_agent_id.is_some() {
                body.parent_agent_id = spawn.parent_agent_id.clone();
            }
            body.agent_label = spawn.agent_label.clone();
            if !spawn.task_description.is_empty() {
                body.task_description = spawn.task_description.clone();
            }
            if spawn.model.is_some() {
                body.model = spawn.model.clone();
            }
        }
        None => {
            body.agent_id = UNKNOWN_AGENT_ID.to_string();
            if body.agent_label.trim().is_empty() {
                body.agent_label = if label.is_empty() {
                    "unknown".to_string()
                } else {
                    label
                };
            }
        }
    }
    Ok(claimed)
}

/// Directory-backed mailbox shared by every hook process on the host.
#[derive(Debug, Clone)]
pub struct FsMailbox {
    pending_dir: PathBuf,
    resolved_dir: PathBuf,
}

struct Candidate {
    path: PathBuf,
    spawn: PendingSpawn,
    modified: SystemTime,
    key: String,
}

impl FsMailbox {
    pub fn new(pending_dir: impl Into<PathBuf>, resolved_dir: impl Into<PathBuf>) -> Self {
        Self {
            pending_dir: pending_dir.into(),
            resolved_dir: resolved_dir.into(),
        }
    }

    pub fn pending_dir(&self) -> &Path {
        &self.pending_dir
    }

    pub fn resolved_dir(&self) -> &Path {
        &self.resolved_dir
    }

    fn file_name(spawn: &PendingSpawn) -> String {
        format!("{}.json", sanitize_session_id(&spawn.key()))
    }

    fn scan(&self, dir: &Path) -> Result<Vec<Candidate>, CorrelatorError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            // Half-written or foreign files are ignored, never claimed.
            let Ok(spawn) = serde_json::from_str::<PendingSpawn>(&raw) else {
                continue;
            };
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let key = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default()
                .to_string();
            out.push(Candidate {
                path,
                spawn,
                modified,
                key,
            });
        }
        out.sort_by(|a, b| {
            a.spawn
                .timestamp
                .cmp(&b.spawn.timestamp)
                .then(a.modified.cmp(&b.modified))
                .then(a.key.cmp(&b.key))
        });
        Ok(out)
    }
}

impl SpawnMailbox for FsMailbox {
    fn record_pending(&self, spawn: &PendingSpawn) -> Result<(), CorrelatorError> {
        fs::create_dir_all(&self.pending_dir)?;
        let target = self.pending_dir.join(Self::file_name(spawn));
        let tmp = target.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(spawn)?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn claim_pending(&self, candidate_label: &str) -> Result<Option<PendingSpawn>, CorrelatorError> {
        let candidates = self.scan(&self.pending_dir)?;
        if candidates.is_empty() {
            return Ok(None);
        }
        fs::create_dir_all(&self.resolved_dir)?;

        let label = candidate_label.trim();
        let (matching, rest): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|candidate| !label.is_empty() && candidate.spawn.matches_label(label));

        for candidate in matching.into_iter().chain(rest) {
            let Some(name) = candidate.path.file_name() else {
                continue;
            };
            let destination = self.resolved_dir.join(name);
            match fs::rename(&candidate.path, &destination) {
                Ok(()) => return Ok(Some(candidate.spawn)),
                // Another process won this one; try the next.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }

    fn pending(&self) -> Result<Vec<PendingSpawn>, CorrelatorError> {
        Ok(self
            .scan(&self.pending_dir)?
            .into_iter()
            .map(|candidate| candidate.spawn)
            .collect())
    }

    fn resolved(&self) -> Result<Vec<PendingSpawn>, CorrelatorError> {
        Ok(self
            .scan(&self.resolved_dir)?
            .into_iter()
            .map(|candidate| candidate.spawn)
            .collect())
    }
}

/// In-process mailbox for single-process embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryMailbox {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    seq: u64,
    pending: Vec<(u64, PendingSpawn)>,
    resolved: Vec<PendingSpawn>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpawnMailbox for MemoryMailbox {
    fn record_pending(&self, spawn: &PendingSpawn) -> Result<(), CorrelatorError> {
        let mut inner = self.inner.lock().map_err(|_| CorrelatorError::Poisoned)?;
        inner.seq += 1;
        let seq = inner.seq;
        let key = spawn.key();
        inner.pending.retain(|(_, existing)| existing.key() != key);
        inner.pending.push((seq, spawn.clone()));
        Ok(())
    }

    fn claim_pending(&self, candidate_label: &str) -> Result<Option<PendingSpawn>, CorrelatorError> {
        let mut inner = self.inner.lock().map_err(|_| CorrelatorError::Poisoned)?;
        let label = candidate_label.trim();
        let matched = if label.is_empty() {
            None
        } else {
            oldest_index(&inner.pending, |spawn| spawn.matches_label(label))
        };
        let chosen = matched.or_else(|| oldest_index(&inner.pending, |_| true));
        let Some(idx) = chosen else {
            return Ok(None);
        };
        let (_, spawn) = inner.pending.remove(idx);
        inner.resolved.push(spawn.clone());
        Ok(Some(spawn))
    }

    fn pending(&self) -> Result<Vec<PendingSpawn>, CorrelatorError> {
        let inner = self.inner.lock().map_err(|_| CorrelatorError::Poisoned)?;
        let mut entries = inner.pending.clone();
        entries.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp).then(a.0.cmp(&b.0)));
        Ok(entries.into_iter().map(|(_, spawn)| spawn).collect())
    }

    fn resolved(&self) -> Result<Vec<PendingSpawn>, CorrelatorError> {
        let inner = self.inner.lock().map_err(|_| CorrelatorError::Poisoned)?;
        Ok(inner.resolved.clone())
    }
}

fn oldest_index(
    entries: &[(u64, PendingSpawn)],
    accept: impl Fn(&PendingSpawn) -> bool,
) -> Option<usize> {
    entries
        .iter()
        .enumerate()
        .filter(|(_, (_, spawn))| accept(spawn))
        .min_by(|(_, a), (_, b)| a.1.timestamp.cmp(&b.1.timestamp).then(a.0.cmp(&b.0)))
        .map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn spawn(agent_id: &str, label: &str, timestamp: i64) -> PendingSpawn {
        PendingSpawn {
            agent_id: agent_id.to_string(),
            parent_agent_id: Some("ag_main".to_string()),
            agent_label: label.to_string(),
            task_description: format!("task for {agent_id}"),
            model: None,
            timestamp,
            session_id: "s1".to_string(),
        }
    }

    fn fs_mailbox(root: &Path) -> FsMailbox {
        FsMailbox::new(root.join("pending"), root.join("resolved"))
    }

    #[test]
    fn agent_id_is_prefixed_hex() {
        let id = spawn_agent_id("s1", 1_000, "refactor");
        assert!(id.starts_with("ag_"));
        assert_eq!(id.len(), 15);
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, spawn_agent_id("s1", 1_000, "refactor"));
        assert_ne!(id, spawn_agent_id("s1", 1_001, "refactor"));
    }

    #[test]
    fn same_label_claims_in_fifo_order() {
        let dir = tempdir().expect("tempdir");
        let mailbox = fs_mailbox(dir.path());
        mailbox.record_pending(&spawn("ag_a", "x", 100)).expect("record a");
        mailbox.record_pending(&spawn("ag_b", "x", 200)).expect("record b");

        let first = mailbox.claim_pending("x").expect("claim").expect("some");
        let second = mailbox.claim_pending("x").expect("claim").expect("some");
        assert_eq!(first.agent_id, "ag_a");
        assert_eq!(second.agent_id, "ag_b");
        assert!(mailbox.claim_pending("x").expect("claim").is_none());
        assert_eq!(mailbox.resolved().expect("resolved").len(), 2);
    }

    #[test]
    fn exact_label_beats_older_other_label() {
        let dir = tempdir().expect("tempdir");
        let mailbox = fs_mailbox(dir.path());
        mailbox.record_pending(&spawn("ag_old", "explore", 100)).expect("record");
        mailbox.record_pending(&spawn("ag_new", "plan", 200)).expect("record");

        let claimed = mailbox.claim_pending("plan").expect("claim").expect("some");
        assert_eq!(claimed.agent_id, "ag_new");

        // No exact match left: falls back to the oldest of any label.
        let fallback = mailbox.claim_pending("plan").expect("claim").expect("some");
        assert_eq!(fallback.agent_id, "ag_old");
    }

    #[test]
    fn label_matches_on_key_prefix() {
        let record = spawn("ag_gp", "general-purpose", 100);
        assert!(record.matches_label("general-purpose"));
        assert!(record.matches_label("general"));
        assert!(!record.matches_label("gen"));
        assert!(!record.matches_label("purpose"));

        let mailbox = MemoryMailbox::new();
        mailbox.record_pending(&spawn("ag_old", "explore", 50)).expect("record");
        mailbox.record_pending(&record).expect("record");
        let claimed = mailbox.claim_pending("general").expect("claim").expect("some");
        assert_eq!(claimed.agent_id, "ag_gp");
    }

    #[test]
    fn empty_mailbox_and_garbage_files_claim_nothing() {
        let dir = tempdir().expect("tempdir");
        let mailbox = fs_mailbox(dir.path());
        assert!(mailbox.claim_pending("x").expect("claim").is_none());

        fs::create_dir_all(mailbox.pending_dir()).expect("mkdir");
        fs::write(mailbox.pending_dir().join("broken.json"), "{not json").expect("write");
        assert!(mailbox.claim_pending("x").expect("claim").is_none());
    }

    #[test]
    fn concurrent_claims_never_share_a_record() {
        let dir = tempdir().expect("tempdir");
        let mailbox = Arc::new(fs_mailbox(dir.path()));
        for idx in 0..8 {
            mailbox
                .record_pending(&spawn(&format!("ag_{idx}"), "worker", idx))
                .expect("record");
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mailbox = Arc::clone(&mailbox);
                thread::spawn(move || mailbox.claim_pending("worker").expect("claim"))
            })
            .collect();
        let mut claimed: Vec<String> = handles
            .into_iter()
            .filter_map(|handle| handle.join().expect("join"))
            .map(|spawn| spawn.agent_id)
            .collect();
        claimed.sort();
        claimed.dedup();
        assert_eq!(claimed.len(), 8);
        assert!(mailbox.pending().expect("pending").is_empty());
    }

    #[test]
    fn dispatch_then_completion_round_trip() {
        use crate::events::{AgentComplete, ToolStart};
        use serde_json::json;

        let mailbox = MemoryMailbox::new();
        let mut start = HookEvent::new(
            "s1",
            1_000,
            EventPayload::ToolStart(ToolStart {
                agent_id: "ag_main".to_string(),
                tool_name: "Task".to_string(),
                ..Default::default()
            }),
        );
        let input = json!({"description": "survey the repo", "subagent_type": "explore"});
        let recorded = record_dispatch(&mailbox, &mut start, input.as_object())
            .expect("record")
            .expect("dispatch recorded");
        assert_eq!(recorded.agent_label, "explore");
        let EventPayload::ToolStart(body) = &start.payload else {
            panic!("tool_start expected");
        };
        assert_eq!(body.spawns_agent_id.as_deref(), Some(recorded.agent_id.as_str()));

        // Already stamped: a second pass records nothing.
        assert!(record_dispatch(&mailbox, &mut start, input.as_object())
            .expect("record")
            .is_none());

        let complete = |label: &str| {
            let mut event = HookEvent::new(
                "s1",
                2_000,
                EventPayload::AgentComplete(AgentComplete::default()),
            );
            event
                .extra
                .insert("agent_type".to_string(), json!(label));
            event
        };

        let mut first = complete("explore");
        let claimed = resolve_completion(&mailbox, &mut first).expect("resolve");
        assert!(claimed.is_some());
        let EventPayload::AgentComplete(body) = &first.payload else {
            panic!("agent_complete expected");
        };
        assert_eq!(body.agent_id, recorded.agent_id);
        assert_eq!(body.task_description, "survey the repo");
        assert_eq!(body.parent_agent_id.as_deref(), Some("ag_main"));

        let mut second = complete("explore");
        assert!(resolve_completion(&mailbox, &mut second).expect("resolve").is_none());
        assert_eq!(second.agent_id(), Some(UNKNOWN_AGENT_ID));
    }

    #[test]
    fn memory_mailbox_follows_same_ordering() {
        let mailbox = MemoryMailbox::new();
        mailbox.record_pending(&spawn("ag_a", "x", 100)).expect("record");
        mailbox.record_pending(&spawn("ag_b", "y", 50)).expect("record");
        mailbox.record_pending(&spawn("ag_c", "x", 300)).expect("record");

        assert_eq!(
            mailbox.claim_pending("x").expect("claim").map(|s| s.agent_id),
            Some("ag_a".to_string())
        );
        assert_eq!(
            mailbox.claim_pending("").expect("claim").map(|s| s.agent_id),
            Some("ag_b".to_string())
        );
        assert_eq!(
            mailbox.claim_pending("z").expect("claim").map(|s| s.agent_id),
            Some("ag_c".to_string())
        );
        assert!(mailbox.claim_pending("x").expect("claim").is_none());
    }
}
