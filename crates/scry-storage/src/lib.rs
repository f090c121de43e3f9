use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use scry_core::events::{EventPayload, HookEvent, MAIN_AGENT_ID};
use scry_core::session_log::project_name;
use scry_core::truncate_chars;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const SCRY_SCHEMA_VERSION: i64 = 1;
pub const FIRST_PROMPT_MAX_CHARS: usize = 2_000;
pub const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "completed" | "ended" | "done" => Ok(SessionStatus::Completed),
            other => Err(format!("Unknown session status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub slug: Option<String>,
    pub project: Option<String>,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub model: Option<String>,
    pub claude_version: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cache_read: i64,
    pub cache_create: i64,
    pub agent_count: i64,
    pub tool_call_count: i64,
    pub compaction_count: i64,
    pub transcript_path: Option<String>,
    pub first_prompt: Option<String>,
    pub status: SessionStatus,
}

/// Incoming session fields; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub id: String,
    pub slug: Option<String>,
    pub project: Option<String>,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub model: Option<String>,
    pub claude_version: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub cache_read: Option<i64>,
    pub cache_create: Option<i64>,
    pub transcript_path: Option<String>,
    pub first_prompt: Option<String>,
    pub status: Option<SessionStatus>,
}

impl SessionPatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentRecord {
    pub id: String,
    pub session_id: String,
    pub parent_agent_id: Option<String>,
    pub agent_type: Option<String>,
    pub task_description: Option<String>,
    pub model: Option<String>,
    pub status: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub duration_ms: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub transcript_path: Option<String>,
}

impl AgentRecord {
    pub fn running(id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            parent_agent_id: None,
            agent_type: None,
            task_description: None,
            model: None,
            status: "running".to_string(),
            tokens_in: 0,
            tokens_out: 0,
            duration_ms: None,
            started_at: None,
            ended_at: None,
            transcript_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub tool_name: String,
    pub params_summary: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub has_error: bool,
    pub response_summary: Option<String>,
    pub spawns_agent_id: Option<String>,
}

impl ToolCallRecord {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            agent_id: MAIN_AGENT_ID.to_string(),
            tool_name: tool_name.into(),
            params_summary: None,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            tokens_in: 0,
            tokens_out: 0,
            has_error: false,
            response_summary: None,
            spawns_agent_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionRecord {
    /// Assigned by the store; ignored on insert.
    pub id: Option<i64>,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub trigger: String,
    pub pre_tokens: Option<i64>,
    pub summary_text: Option<String>,
}

/// Everything a single transcript yields for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session: SessionPatch,
    pub agents: Vec<AgentRecord>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub compactions: Vec<CompactionRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub project: Option<String>,
    pub status: Option<SessionStatus>,
    pub limit: Option<usize>,
}

pub struct ScryStore {
    conn: Connection,
}

impl ScryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    fn configure(&self) -> Result<(), StorageError> {
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.conn.busy_timeout(Duration::from_secs(5))?;
        // In-memory databases answer "memory" here; only file databases switch to WAL.
        let _mode: String = self
            .conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > SCRY_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SCRY_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_scry_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Replace every child row of the session and recompute its rollups.
    ///
    /// Runs as one transaction: on any error nothing of the previous state
    /// is lost and nothing of the new snapshot is visible.
    pub fn replace_session(&self, snapshot: &SessionSnapshot) -> Result<(), StorageError> {
        let session_id = snapshot.session.id.as_str();
        if session_id.trim().is_empty() {
            return Err(StorageError::Serialization(
                "session snapshot without id".to_string(),
            ));
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM compactions WHERE session_id = ?1", [session_id])?;
        tx.execute("DELETE FROM tool_calls WHERE session_id = ?1", [session_id])?;
        tx.execute("DELETE FROM agents WHERE session_id = ?1", [session_id])?;

        upsert_session_row(&tx, &snapshot.session)?;
        for agent in &snapshot.agents {
            upsert_agent_row(&tx, session_id, agent)?;
        }
        for call in &snapshot.tool_calls {
            insert_tool_call_row(&tx, session_id, call)?;
        }
        for compaction in &snapshot.compactions {
            insert_compaction_row(&tx, session_id, compaction)?;
        }
        refresh_rollups(&tx, session_id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn upsert_session(&self, patch: &SessionPatch) -> Result<(), StorageError> {
        upsert_session_row(&self.conn, patch)
    }

    /// Fold one live hook event into the store.
    pub fn apply_event(&self, event: &HookEvent) -> Result<(), StorageError> {
        let session_id = event.session_id.as_str();
        if session_id.trim().is_empty() {
            return Ok(());
        }
        let at = millis_to_datetime(event.timestamp)?;

        let tx = self.conn.unchecked_transaction()?;
        ensure_session(&tx, session_id, at, event.cwd.as_deref())?;

        match &event.payload {
            EventPayload::SessionStart(body) => {
                tx.execute(
                    "
                    UPDATE sessions SET
                        model = COALESCE(?2, model),
                        transcript_path = COALESCE(?3, transcript_path),
                        status = 'active',
                        ended_at = NULL
                    WHERE id = ?1
                    ",
                    params![session_id, body.model, body.transcript_path],
                )?;
            }
            EventPayload::UserPrompt(body) => {
                let prompt = body.prompt_text.trim();
                if !prompt.is_empty() {
                    tx.execute(
                        "UPDATE sessions SET first_prompt = COALESCE(first_prompt, ?2) WHERE id = ?1",
                        params![session_id, truncate_chars(prompt, FIRST_PROMPT_MAX_CHARS)],
                    )?;
                }
            }
            EventPayload::ToolStart(body) => {
                let mut call = ToolCallRecord::new(
                    body.tool_use_id.clone().unwrap_or_else(|| event.id.clone()),
                    session_id,
                    non_empty(&body.tool_name).unwrap_or("unknown"),
                );
                call.agent_id = agent_or_main(&body.agent_id);
                call.params_summary = non_empty(&body.tool_params_summary).map(str::to_string);
                call.started_at = Some(at);
                call.spawns_agent_id = body.spawns_agent_id.clone();
                tx.execute(
                    "
                    INSERT INTO tool_calls (
                        id, session_id, agent_id, tool_name, params_summary, started_at,
                        spawns_agent_id
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT(id) DO NOTHING
                    ",
                    params![
                        call.id,
                        session_id,
                        call.agent_id,
                        call.tool_name,
                        call.params_summary,
                        format_ts(&at),
                        call.spawns_agent_id,
                    ],
                )?;
                if let (Some(spawned), Some(label)) =
                    (body.spawns_agent_id.as_deref(), body.agent_spawn_label.as_deref())
                {
                    let mut agent = AgentRecord::running(spawned, session_id);
                    agent.parent_agent_id = Some(call.agent_id.clone());
                    agent.agent_type = Some(label.to_string());
                    agent.task_description = body.agent_spawn_task.clone();
                    agent.model = body.agent_spawn_model.clone();
                    agent.started_at = Some(at);
                    upsert_agent_row(&tx, session_id, &agent)?;
                }
            }
            EventPayload::ToolEnd(body) => {
                let finish = ToolFinish {
                    tool_use_id: body.tool_use_id.as_deref(),
                    tool_name: &body.tool_name,
                    agent_id: agent_or_main(&body.agent_id),
                    params_summary: non_empty(&body.tool_params_summary),
                    ended_at: at,
                    duration_ms: (body.duration_ms > 0).then_some(body.duration_ms as i64),
                    tokens_in: body.tokens_in as i64,
                    tokens_out: body.tokens_out as i64,
                    has_error: body.has_error,
                    response_summary: body.tool_response_summary.as_deref(),
                    fallback_id: &event.id,
                };
                complete_tool_call(&tx, session_id, &finish)?;
            }
            EventPayload::ToolError(body) => {
                let finish = ToolFinish {
                    tool_use_id: body.tool_use_id.as_deref(),
                    tool_name: &body.tool_name,
                    agent_id: agent_or_main(&body.agent_id),
                    params_summary: non_empty(&body.tool_params_summary),
                    ended_at: at,
                    duration_ms: None,
                    tokens_in: 0,
                    tokens_out: 0,
                    has_error: true,
                    response_summary: non_empty(&body.error),
                    fallback_id: &event.id,
                };
                complete_tool_call(&tx, session_id, &finish)?;
            }
            EventPayload::AgentSpawn(body) => {
                if let Some(agent_id) = non_empty(&body.agent_id) {
                    let mut agent = AgentRecord::running(agent_id, session_id);
                    agent.parent_agent_id = body.parent_agent_id.clone();
                    agent.agent_type = non_empty(&body.agent_label).map(str::to_string);
                    agent.task_description = non_empty(&body.task_description).map(str::to_string);
                    agent.started_at = Some(at);
                    upsert_agent_row(&tx, session_id, &agent)?;
                }
            }
            EventPayload::AgentComplete(body) => {
                if let Some(agent_id) = non_empty(&body.agent_id) {
                    let mut agent = AgentRecord::running(agent_id, session_id);
                    agent.parent_agent_id = body.parent_agent_id.clone();
                    agent.agent_type = non_empty(&body.agent_label).map(str::to_string);
                    agent.task_description = non_empty(&body.task_description).map(str::to_string);
                    agent.model = body.model.clone();
                    agent.status = non_empty(&body.status).unwrap_or("success").to_string();
                    agent.tokens_in = body.tokens_in as i64;
                    agent.tokens_out = body.tokens_out as i64;
                    agent.duration_ms = (body.duration_ms > 0).then_some(body.duration_ms as i64);
                    agent.ended_at = Some(at);
                    agent.transcript_path = body
                        .agent_transcript_path
                        .clone()
                        .or_else(|| body.transcript_path.clone());
                    upsert_agent_row(&tx, session_id, &agent)?;
                }
            }
            EventPayload::Compaction(body) => {
                let compaction = CompactionRecord {
                    id: None,
                    session_id: session_id.to_string(),
                    timestamp: at,
                    trigger: non_empty(&body.trigger)
                        .unwrap_or("context_limit")
                        .to_string(),
                    pre_tokens: body.pre_tokens.map(|tokens| tokens as i64),
                    summary_text: None,
                };
                insert_compaction_row(&tx, session_id, &compaction)?;
            }
            EventPayload::AssistantResponse(body) => {
                tx.execute(
                    "
                    UPDATE sessions SET
                        tokens_in = tokens_in + ?2,
                        tokens_out = tokens_out + ?3,
                        cache_read = cache_read + ?4,
                        cache_create = cache_create + ?5
                    WHERE id = ?1
                    ",
                    params![
                        session_id,
                        body.tokens_in as i64,
                        body.tokens_out as i64,
                        body.cache_read as i64,
                        body.cache_create as i64,
                    ],
                )?;
            }
            EventPayload::SessionEnd(_) => {
                let started: Option<String> = tx
                    .query_row(
                        "SELECT started_at FROM sessions WHERE id = ?1",
                        [session_id],
                        |row| row.get(0),
                    )
                    .optional()?
                    .flatten();
                let duration = started
                    .map(parse_timestamp)
                    .transpose()?
                    .map(|started| (at - started).num_milliseconds().max(0));
                tx.execute(
                    "
                    UPDATE sessions SET
                        ended_at = ?2,
                        duration_ms = COALESCE(?3, duration_ms),
                        status = 'completed'
                    WHERE id = ?1
                    ",
                    params![session_id, format_ts(&at), duration],
                )?;
            }
            _ => {}
        }

        refresh_rollups(&tx, session_id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn session(&self, session_id: &str) -> Result<Option<SessionRecord>, StorageError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [session_id], session_from_row)
            .optional()?)
    }

    pub fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>, StorageError> {
        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT) as i64;
        let sql = format!(
            "
            SELECT {SESSION_COLUMNS}
            FROM sessions
            WHERE (?1 IS NULL OR project = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY started_at DESC, id ASC
            LIMIT ?3
            "
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(
            params![
                filter.project.as_deref(),
                filter.status.map(|status| status.as_str()),
                limit
            ],
            session_from_row,
        )?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// Full-text search over first prompts, best match first.
    pub fn search_sessions(&self, query: &str, limit: usize) -> Result<Vec<SessionRecord>, StorageError> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let columns = prefixed_columns("s", SESSION_COLUMNS);
        let sql = format!(
            "
            SELECT {columns}
            FROM sessions_fts
            JOIN sessions s ON s.rowid = sessions_fts.rowid
            WHERE sessions_fts MATCH ?1
            ORDER BY sessions_fts.rank
            LIMIT ?2
            "
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params![fts, limit as i64], session_from_row)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// Full-text search over sub-agent task descriptions.
    pub fn search_agents(&self, query: &str, limit: usize) -> Result<Vec<AgentRecord>, StorageError> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let columns = prefixed_columns("a", AGENT_COLUMNS);
        let sql = format!(
            "
            SELECT {columns}
            FROM agents_fts
            JOIN agents a ON a.rowid = agents_fts.rowid
            WHERE agents_fts MATCH ?1
            ORDER BY agents_fts.rank
            LIMIT ?2
            "
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params![fts, limit as i64], agent_from_row)?;

        let mut agents = Vec::new();
        for row in rows {
            agents.push(row?);
        }
        Ok(agents)
    }

    pub fn agents_for_session(&self, session_id: &str) -> Result<Vec<AgentRecord>, StorageError> {
        let sql = format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE session_id = ?1 ORDER BY started_at ASC, id ASC"
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map([session_id], agent_from_row)?;

        let mut agents = Vec::new();
        for row in rows {
            agents.push(row?);
        }
        Ok(agents)
    }

    pub fn tool_calls_for_session(&self, session_id: &str) -> Result<Vec<ToolCallRecord>, StorageError> {
        let sql = format!(
            "SELECT {TOOL_CALL_COLUMNS} FROM tool_calls WHERE session_id = ?1 ORDER BY started_at ASC, id ASC"
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map([session_id], tool_call_from_row)?;

        let mut calls = Vec::new();
        for row in rows {
            calls.push(row?);
        }
        Ok(calls)
    }

    pub fn compactions_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<CompactionRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, session_id, timestamp, trigger, pre_tokens, summary_text
            FROM compactions
            WHERE session_id = ?1
            ORDER BY timestamp ASC, id ASC
            ",
        )?;
        let rows = statement.query_map([session_id], |row| {
            Ok(CompactionRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                timestamp: required_ts(row, 2)?,
                trigger: row.get(3)?,
                pre_tokens: row.get(4)?,
                summary_text: row.get(5)?,
            })
        })?;

        let mut compactions = Vec::new();
        for row in rows {
            compactions.push(row?);
        }
        Ok(compactions)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type IN ('table', 'view') AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

const SESSION_COLUMNS: &str = "id, slug, project, cwd, git_branch, model, claude_version, \
    started_at, ended_at, duration_ms, tokens_in, tokens_out, cache_read, cache_create, \
    agent_count, tool_call_count, compaction_count, transcript_path, first_prompt, status";

const AGENT_COLUMNS: &str = "id, session_id, parent_agent_id, agent_type, task_description, \
    model, status, tokens_in, tokens_out, duration_ms, started_at, ended_at, transcript_path";

const TOOL_CALL_COLUMNS: &str = "id, session_id, agent_id, tool_name, params_summary, \
    started_at, ended_at, duration_ms, tokens_in, tokens_out, has_error, response_summary, \
    spawns_agent_id";

struct ToolFinish<'a> {
    tool_use_id: Option<&'a str>,
    tool_name: &'a str,
    agent_id: String,
    params_summary: Option<&'a str>,
    ended_at: DateTime<Utc>,
    duration_ms: Option<i64>,
    tokens_in: i64,
    tokens_out: i64,
    has_error: bool,
    response_summary: Option<&'a str>,
    fallback_id: &'a str,
}

fn ensure_session(
    conn: &Connection,
    session_id: &str,
    at: DateTime<Utc>,
    cwd: Option<&str>,
) -> Result<(), StorageError> {
    let project = cwd.map(project_name).filter(|name| !name.is_empty());
    conn.execute(
        "
        INSERT INTO sessions (id, cwd, project, started_at, status)
        VALUES (?1, ?2, ?3, ?4, 'active')
        ON CONFLICT(id) DO UPDATE SET
            cwd = COALESCE(sessions.cwd, excluded.cwd),
            project = COALESCE(sessions.project, excluded.project),
            started_at = CASE
                WHEN sessions.started_at IS NULL OR sessions.started_at > excluded.started_at
                THEN excluded.started_at
                ELSE sessions.started_at
            END
        ",
        params![session_id, cwd, project, format_ts(&at)],
    )?;
    Ok(())
}

fn upsert_session_row(conn: &Connection, patch: &SessionPatch) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO sessions (
            id, slug, project, cwd, git_branch, model, claude_version, started_at, ended_at,
            duration_ms, tokens_in, tokens_out, cache_read, cache_create, transcript_path,
            first_prompt, status
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
            ?10, COALESCE(?11, 0), COALESCE(?12, 0), COALESCE(?13, 0), COALESCE(?14, 0), ?15,
            ?16, COALESCE(?17, 'active')
        )
        ON CONFLICT(id) DO UPDATE SET
            slug = COALESCE(?2, slug),
            project = COALESCE(?3, project),
            cwd = COALESCE(?4, cwd),
            git_branch = COALESCE(?5, git_branch),
            model = COALESCE(?6, model),
            claude_version = COALESCE(?7, claude_version),
            started_at = COALESCE(?8, started_at),
            ended_at = COALESCE(?9, ended_at),
            duration_ms = COALESCE(?10, duration_ms),
            tokens_in = COALESCE(?11, tokens_in),
            tokens_out = COALESCE(?12, tokens_out),
            cache_read = COALESCE(?13, cache_read),
            cache_create = COALESCE(?14, cache_create),
            transcript_path = COALESCE(?15, transcript_path),
            first_prompt = COALESCE(?16, first_prompt),
            status = COALESCE(?17, status)
        ",
        params![
            patch.id,
            patch.slug,
            patch.project,
            patch.cwd,
            patch.git_branch,
            patch.model,
            patch.claude_version,
            patch.started_at.as_ref().map(format_ts),
            patch.ended_at.as_ref().map(format_ts),
            patch.duration_ms,
            patch.tokens_in,
            patch.tokens_out,
            patch.cache_read,
            patch.cache_create,
            patch.transcript_path,
            patch
                .first_prompt
                .as_deref()
                .map(|prompt| truncate_chars(prompt, FIRST_PROMPT_MAX_CHARS)),
            patch.status.map(|status| status.as_str()),
        ],
    )?;
    Ok(())
}

fn upsert_agent_row(conn: &Connection, session_id: &str, agent: &AgentRecord) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO agents (
            id, session_id, parent_agent_id, agent_type, task_description, model, status,
            tokens_in, tokens_out, duration_ms, started_at, ended_at, transcript_path
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(id) DO UPDATE SET
            parent_agent_id = COALESCE(excluded.parent_agent_id, parent_agent_id),
            agent_type = COALESCE(excluded.agent_type, agent_type),
            task_description = COALESCE(excluded.task_description, task_description),
            model = COALESCE(excluded.model, model),
            status = CASE
                WHEN excluded.status = 'running' THEN status
                ELSE excluded.status
            END,
            tokens_in = MAX(tokens_in, excluded.tokens_in),
            tokens_out = MAX(tokens_out, excluded.tokens_out),
            duration_ms = COALESCE(excluded.duration_ms, duration_ms),
            started_at = COALESCE(started_at, excluded.started_at),
            ended_at = COALESCE(excluded.ended_at, ended_at),
            transcript_path = COALESCE(excluded.transcript_path, transcript_path)
        ",
        params![
            agent.id,
            session_id,
            agent.parent_agent_id,
            agent.agent_type,
            agent.task_description,
            agent.model,
            agent.status,
            agent.tokens_in,
            agent.tokens_out,
            agent.duration_ms,
            agent.started_at.as_ref().map(format_ts),
            agent.ended_at.as_ref().map(format_ts),
            agent.transcript_path,
        ],
    )?;
    Ok(())
}

fn insert_tool_call_row(
    conn: &Connection,
    session_id: &str,
    call: &ToolCallRecord,
) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT OR REPLACE INTO tool_calls (
            id, session_id, agent_id, tool_name, params_summary, started_at, ended_at,
            duration_ms, tokens_in, tokens_out, has_error, response_summary, spawns_agent_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ",
        params![
            call.id,
            session_id,
            call.agent_id,
            call.tool_name,
            call.params_summary,
            call.started_at.as_ref().map(format_ts),
            call.ended_at.as_ref().map(format_ts),
            call.duration_ms,
            call.tokens_in,
            call.tokens_out,
            call.has_error,
            call.response_summary,
            call.spawns_agent_id,
        ],
    )?;
    Ok(())
}

fn insert_compaction_row(
    conn: &Connection,
    session_id: &str,
    compaction: &CompactionRecord,
) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO compactions (session_id, timestamp, trigger, pre_tokens, summary_text)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ",
        params![
            session_id,
            format_ts(&compaction.timestamp),
            compaction.trigger,
            compaction.pre_tokens,
            compaction.summary_text,
        ],
    )?;
    Ok(())
}

fn complete_tool_call(
    conn: &Connection,
    session_id: &str,
    finish: &ToolFinish<'_>,
) -> Result<(), StorageError> {
    let by_use_id = match finish.tool_use_id {
        Some(tool_use_id) => conn
            .query_row(
                "SELECT id, started_at FROM tool_calls WHERE id = ?1 AND session_id = ?2",
                params![tool_use_id, session_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?,
        None => None,
    };
    // Without a tool use id, close the newest open call of that tool on that agent.
    let open = match by_use_id {
        Some(found) => Some(found),
        None => conn
            .query_row(
                "
                SELECT id, started_at FROM tool_calls
                WHERE session_id = ?1 AND agent_id = ?2 AND tool_name = ?3 AND ended_at IS NULL
                ORDER BY started_at DESC, rowid DESC
                LIMIT 1
                ",
                params![session_id, finish.agent_id, finish.tool_name],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?,
    };

    match open {
        Some((id, started_at)) => {
            let measured = started_at
                .map(parse_timestamp)
                .transpose()?
                .map(|started| (finish.ended_at - started).num_milliseconds().max(0));
            conn.execute(
                "
                UPDATE tool_calls SET
                    ended_at = ?2,
                    duration_ms = COALESCE(?3, ?4, duration_ms),
                    tokens_in = tokens_in + ?5,
                    tokens_out = tokens_out + ?6,
                    has_error = MAX(has_error, ?7),
                    response_summary = COALESCE(?8, response_summary)
                WHERE id = ?1
                ",
                params![
                    id,
                    format_ts(&finish.ended_at),
                    finish.duration_ms,
                    measured,
                    finish.tokens_in,
                    finish.tokens_out,
                    finish.has_error,
                    finish.response_summary,
                ],
            )?;
        }
        None => {
            let mut call = ToolCallRecord::new(
                finish.tool_use_id.unwrap_or(finish.fallback_id),
                session_id,
                non_empty(finish.tool_name).unwrap_or("unknown"),
            );
            call.agent_id = finish.agent_id.clone();
            call.params_summary = finish.params_summary.map(str::to_string);
            call.ended_at = Some(finish.ended_at);
            call.duration_ms = finish.duration_ms;
            call.tokens_in = finish.tokens_in;
            call.tokens_out = finish.tokens_out;
            call.has_error = finish.has_error;
            call.response_summary = finish.response_summary.map(str::to_string);
            insert_tool_call_row(conn, session_id, &call)?;
        }
    }
    Ok(())
}

fn refresh_rollups(conn: &Connection, session_id: &str) -> Result<(), StorageError> {
    conn.execute(
        "
        UPDATE sessions SET
            agent_count = (SELECT COUNT(*) FROM agents WHERE session_id = ?1),
            tool_call_count = (SELECT COUNT(*) FROM tool_calls WHERE session_id = ?1),
            compaction_count = (SELECT COUNT(*) FROM compactions WHERE session_id = ?1)
        WHERE id = ?1
        ",
        [session_id],
    )?;
    Ok(())
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status_raw: String = row.get(19)?;
    let status = status_raw.parse::<SessionStatus>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            19,
            Type::Text,
            Box::new(StorageError::Serialization(err)),
        )
    })?;
    Ok(SessionRecord {
        id: row.get(0)?,
        slug: row.get(1)?,
        project: row.get(2)?,
        cwd: row.get(3)?,
        git_branch: row.get(4)?,
        model: row.get(5)?,
        claude_version: row.get(6)?,
        started_at: optional_ts(row, 7)?,
        ended_at: optional_ts(row, 8)?,
        duration_ms: row.get(9)?,
        tokens_in: row.get(10)?,
        tokens_out: row.get(11)?,
        cache_read: row.get(12)?,
        cache_create: row.get(13)?,
        agent_count: row.get(14)?,
        tool_call_count: row.get(15)?,
        compaction_count: row.get(16)?,
        transcript_path: row.get(17)?,
        first_prompt: row.get(18)?,
        status,
    })
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<AgentRecord> {
    Ok(AgentRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        parent_agent_id: row.get(2)?,
        agent_type: row.get(3)?,
        task_description: row.get(4)?,
        model: row.get(5)?,
        status: row.get(6)?,
        tokens_in: row.get(7)?,
        tokens_out: row.get(8)?,
        duration_ms: row.get(9)?,
        started_at: optional_ts(row, 10)?,
        ended_at: optional_ts(row, 11)?,
        transcript_path: row.get(12)?,
    })
}

fn tool_call_from_row(row: &Row<'_>) -> rusqlite::Result<ToolCallRecord> {
    Ok(ToolCallRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        agent_id: row.get(2)?,
        tool_name: row.get(3)?,
        params_summary: row.get(4)?,
        started_at: optional_ts(row, 5)?,
        ended_at: optional_ts(row, 6)?,
        duration_ms: row.get(7)?,
        tokens_in: row.get(8)?,
        tokens_out: row.get(9)?,
        has_error: row.get(10)?,
        response_summary: row.get(11)?,
        spawns_agent_id: row.get(12)?,
    })
}

fn optional_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| {
        parse_timestamp(value).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
        })
    })
    .transpose()
}

fn required_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn prefixed_columns(alias: &str, columns: &str) -> String {
    columns
        .split(',')
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn agent_or_main(agent_id: &str) -> String {
    non_empty(agent_id).unwrap_or(MAIN_AGENT_ID).to_string()
}

/// Quote each whitespace-separated term as an FTS5 phrase; terms are ANDed.
pub fn fts_query(raw: &str) -> Option<String> {
    let terms = raw
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>();
    (!terms.is_empty()).then(|| terms.join(" "))
}

/// Canonical text form: RFC 3339, millisecond precision, `Z` suffix, so text order is time order.
pub fn format_ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StorageError::Timestamp(format!("out of range: {ms}")))
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scry_core::events::{
        AgentComplete, Compaction, SessionEnd, SessionStart, ToolEnd, ToolStart, UserPrompt,
    };
    use tempfile::NamedTempFile;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_771_855_200 + secs, 0)
            .single()
            .expect("valid timestamp")
    }

    fn snapshot(session_id: &str, prompt: &str) -> SessionSnapshot {
        let mut session = SessionPatch::new(session_id);
        session.project = Some("scry".to_string());
        session.cwd = Some("/work/scry".to_string());
        session.model = Some("opus".to_string());
        session.started_at = Some(ts(0));
        session.first_prompt = Some(prompt.to_string());
        session.tokens_in = Some(120);
        session.tokens_out = Some(40);

        let mut agent = AgentRecord::running("toolu_task1", session_id);
        agent.agent_type = Some("explorer".to_string());
        agent.task_description = Some("map the storage layer".to_string());
        agent.status = "success".to_string();
        agent.started_at = Some(ts(5));

        let mut read = ToolCallRecord::new("toolu_read1", session_id, "Read");
        read.params_summary = Some("file_path=src/lib.rs".to_string());
        read.started_at = Some(ts(2));
        let mut task = ToolCallRecord::new("toolu_task1", session_id, "Task");
        task.started_at = Some(ts(5));
        task.spawns_agent_id = Some("toolu_task1".to_string());

        SessionSnapshot {
            session,
            agents: vec![agent],
            tool_calls: vec![read, task],
            compactions: vec![CompactionRecord {
                id: None,
                session_id: session_id.to_string(),
                timestamp: ts(60),
                trigger: "context_limit".to_string(),
                pre_tokens: Some(150_000),
                summary_text: Some("condensed history".to_string()),
            }],
        }
    }

    #[test]
    fn migration_creates_tables_and_fts() {
        let db = ScryStore::open_in_memory().expect("open db");
        for table in [
            "sessions",
            "agents",
            "tool_calls",
            "compactions",
            "sessions_fts",
            "agents_fts",
        ] {
            assert!(db.table_exists(table).expect("table check"), "{table}");
        }
        assert_eq!(db.schema_version().expect("schema version"), SCRY_SCHEMA_VERSION);
    }

    #[test]
    fn reopen_file_db_keeps_schema_and_rows() {
        let file = NamedTempFile::new().expect("temp db file");
        {
            let db = ScryStore::open(file.path()).expect("open db");
            db.replace_session(&snapshot("s1", "hello storage"))
                .expect("replace");
        }
        let db = ScryStore::open(file.path()).expect("reopen db");
        let session = db.session("s1").expect("query").expect("present");
        assert_eq!(session.tool_call_count, 2);
    }

    #[test]
    fn replace_session_is_idempotent() {
        let db = ScryStore::open_in_memory().expect("open db");
        let snap = snapshot("s1", "refactor the websocket hub");
        db.replace_session(&snap).expect("first ingest");
        let first = db.session("s1").expect("query").expect("present");
        let first_calls = db.tool_calls_for_session("s1").expect("calls");

        db.replace_session(&snap).expect("second ingest");
        let second = db.session("s1").expect("query").expect("present");
        let second_calls = db.tool_calls_for_session("s1").expect("calls");

        assert_eq!(first, second);
        assert_eq!(first_calls, second_calls);
        assert_eq!(second.agent_count, 1);
        assert_eq!(second.tool_call_count, 2);
        assert_eq!(second.compaction_count, 1);
        assert_eq!(db.compactions_for_session("s1").expect("compactions").len(), 1);
        assert_eq!(
            db.search_sessions("websocket", 10).expect("search").len(),
            1
        );
    }

    #[test]
    fn upsert_keeps_existing_fields_when_incoming_is_null() {
        let db = ScryStore::open_in_memory().expect("open db");
        let mut patch = SessionPatch::new("s1");
        patch.model = Some("opus".to_string());
        patch.git_branch = Some("main".to_string());
        db.upsert_session(&patch).expect("insert");

        let mut update = SessionPatch::new("s1");
        update.git_branch = Some("feature".to_string());
        db.upsert_session(&update).expect("merge");

        let session = db.session("s1").expect("query").expect("present");
        assert_eq!(session.model.as_deref(), Some("opus"));
        assert_eq!(session.git_branch.as_deref(), Some("feature"));
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn list_filters_by_project_and_status() {
        let db = ScryStore::open_in_memory().expect("open db");
        db.replace_session(&snapshot("s1", "one")).expect("s1");
        let mut other = snapshot("s2", "two");
        other.session.project = Some("other".to_string());
        other.session.started_at = Some(ts(100));
        other.session.status = Some(SessionStatus::Completed);
        db.replace_session(&other).expect("s2");

        let all = db.list_sessions(&SessionFilter::default()).expect("list");
        assert_eq!(
            all.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["s2", "s1"]
        );

        let scry_only = db
            .list_sessions(&SessionFilter {
                project: Some("scry".to_string()),
                ..Default::default()
            })
            .expect("list");
        assert_eq!(scry_only.len(), 1);
        assert_eq!(scry_only[0].id, "s1");

        let completed = db
            .list_sessions(&SessionFilter {
                status: Some(SessionStatus::Completed),
                limit: Some(5),
                ..Default::default()
            })
            .expect("list");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, "s2");
    }

    #[test]
    fn search_tolerates_punctuation_and_tracks_updates() {
        let db = ScryStore::open_in_memory().expect("open db");
        db.replace_session(&snapshot("s1", "fix \"quoted\" parser: edge-case"))
            .expect("ingest");
        assert_eq!(db.search_sessions("parser: \"quoted", 10).expect("search").len(), 1);
        assert!(db.search_sessions("   ", 10).expect("search").is_empty());

        let mut patch = SessionPatch::new("s1");
        patch.first_prompt = Some("entirely different words".to_string());
        db.upsert_session(&patch).expect("update");
        assert!(db.search_sessions("parser", 10).expect("search").is_empty());
        assert_eq!(db.search_sessions("different", 10).expect("search").len(), 1);

        let agents = db.search_agents("storage", 10).expect("search agents");
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, "toolu_task1");
    }

    #[test]
    fn failed_replace_rolls_back() {
        let db = ScryStore::open_in_memory().expect("open db");
        db.replace_session(&snapshot("s1", "original")).expect("ingest");

        let mut broken = snapshot("s1", "replacement");
        broken.tool_calls.truncate(1);
        db.conn
            .execute_batch(
                "CREATE TRIGGER fail_compactions BEFORE INSERT ON compactions
                 BEGIN SELECT RAISE(ABORT, 'boom'); END;",
            )
            .expect("install trigger");

        assert!(db.replace_session(&broken).is_err());
        let session = db.session("s1").expect("query").expect("present");
        assert_eq!(session.first_prompt.as_deref(), Some("original"));
        assert_eq!(session.tool_call_count, 2);
        assert_eq!(db.compactions_for_session("s1").expect("c")[0].timestamp, ts(60));
    }

    #[test]
    fn apply_event_builds_rows_incrementally() {
        let db = ScryStore::open_in_memory().expect("open db");
        let base = 1_771_855_200_000_i64;

        let mut start = HookEvent::new(
            "live",
            base,
            EventPayload::SessionStart(SessionStart {
                agent_id: MAIN_AGENT_ID.to_string(),
                agent_label: "main".to_string(),
                model: Some("sonnet".to_string()),
                ..Default::default()
            }),
        );
        start.cwd = Some("/work/app".to_string());
        db.apply_event(&start).expect("start");

        db.apply_event(&HookEvent::new(
            "live",
            base + 10,
            EventPayload::UserPrompt(UserPrompt {
                prompt_text: "ship the release".to_string(),
            }),
        ))
        .expect("prompt");

        db.apply_event(&HookEvent::new(
            "live",
            base + 100,
            EventPayload::ToolStart(ToolStart {
                tool_name: "Bash".to_string(),
                tool_params_summary: "command=ls".to_string(),
                ..Default::default()
            }),
        ))
        .expect("tool start");
        db.apply_event(&HookEvent::new(
            "live",
            base + 350,
            EventPayload::ToolEnd(ToolEnd {
                tool_name: "Bash".to_string(),
                has_error: true,
                tool_response_summary: Some("permission denied".to_string()),
                ..Default::default()
            }),
        ))
        .expect("tool end");

        db.apply_event(&HookEvent::new(
            "live",
            base + 400,
            EventPayload::AgentComplete(AgentComplete {
                agent_id: "ag_0123456789ab".to_string(),
                agent_label: "reviewer".to_string(),
                task_description: "review the diff".to_string(),
                tokens_in: 900,
                ..Default::default()
            }),
        ))
        .expect("agent complete");
        db.apply_event(&HookEvent::new(
            "live",
            base + 500,
            EventPayload::Compaction(Compaction {
                trigger: "manual".to_string(),
                ..Default::default()
            }),
        ))
        .expect("compaction");
        db.apply_event(&HookEvent::new(
            "live",
            base + 2_000,
            EventPayload::SessionEnd(SessionEnd::default()),
        ))
        .expect("end");

        let session = db.session("live").expect("query").expect("present");
        assert_eq!(session.project.as_deref(), Some("app"));
        assert_eq!(session.model.as_deref(), Some("sonnet"));
        assert_eq!(session.first_prompt.as_deref(), Some("ship the release"));
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.duration_ms, Some(2_000));
        assert_eq!(session.tool_call_count, 1);
        assert_eq!(session.agent_count, 1);
        assert_eq!(session.compaction_count, 1);

        let calls = db.tool_calls_for_session("live").expect("calls");
        assert_eq!(calls[0].agent_id, MAIN_AGENT_ID);
        assert!(calls[0].has_error);
        assert_eq!(calls[0].duration_ms, Some(250));
        assert_eq!(calls[0].response_summary.as_deref(), Some("permission denied"));

        let agents = db.agents_for_session("live").expect("agents");
        assert_eq!(agents[0].status, "success");
        assert_eq!(agents[0].tokens_in, 900);
    }

    #[test]
    fn completed_agents_end_in_success_or_error() {
        let db = ScryStore::open_in_memory().expect("open db");
        let base = 1_771_855_200_000_i64;
        db.apply_event(&HookEvent::new(
            "agents",
            base,
            EventPayload::SessionStart(SessionStart::default()),
        ))
        .expect("start");
        let completions = [(10, "ag_aaaaaaaaaaaa", ""), (20, "ag_bbbbbbbbbbbb", "error")];
        for (offset, agent_id, status) in completions {
            db.apply_event(&HookEvent::new(
                "agents",
                base + offset,
                EventPayload::AgentComplete(AgentComplete {
                    agent_id: agent_id.to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }),
            ))
            .expect("agent complete");
        }

        let agents = db.agents_for_session("agents").expect("agents");
        let status_of = |id: &str| {
            agents
                .iter()
                .find(|agent| agent.id == id)
                .map(|agent| agent.status.clone())
        };
        assert_eq!(status_of("ag_aaaaaaaaaaaa").as_deref(), Some("success"));
        assert_eq!(status_of("ag_bbbbbbbbbbbb").as_deref(), Some("error"));
    }

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(fts_query("a b"), Some("\"a\" \"b\"".to_string()));
        assert_eq!(fts_query("say \"hi\""), Some("\"say\" \"\"\"hi\"\"\"".to_string()));
        assert_eq!(fts_query(""), None);
    }
}
