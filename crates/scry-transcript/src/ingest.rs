use crate::{
    agents_from_records, compactions_from_records, read_records, tool_calls_from_records,
    usage_from_records, ParsedAgent, ParsedCompaction, ParsedToolCall, SessionMeta,
    TranscriptError,
};
use chrono::{DateTime, Utc};
use scry_core::MAIN_AGENT_ID;
use scry_storage::{
    AgentRecord, CompactionRecord, ScryStore, SessionPatch, SessionSnapshot, ToolCallRecord,
};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestOutcome {
    fn ok(session_id: String) -> Self {
        Self {
            success: true,
            session_id: Some(session_id),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub ingested: usize,
    pub failed: usize,
    pub total: usize,
}

/// Normalize one transcript and replace everything the store holds for its session.
///
/// Re-ingesting an unchanged transcript leaves the store in the same state.
pub fn ingest_session(store: &ScryStore, path: impl AsRef<Path>) -> IngestOutcome {
    let path = path.as_ref();
    if !path.is_file() {
        return IngestOutcome::failed("File not found");
    }
    let Some(records) = read_records(path) else {
        return IngestOutcome::failed("File not found");
    };
    let Some(meta) = crate::parse_session_meta(path) else {
        return IngestOutcome::failed("Could not parse session metadata");
    };

    let snapshot = build_snapshot(&meta, &records, path);
    match store.replace_session(&snapshot) {
        Ok(()) => {
            info!(
                event = "session_ingested",
                session_id = %meta.session_id,
                tool_calls = snapshot.tool_calls.len(),
                agents = snapshot.agents.len(),
                compactions = snapshot.compactions.len()
            );
            IngestOutcome::ok(meta.session_id)
        }
        Err(err) => {
            warn!(event = "session_ingest_failed", path = %path.display(), error = %err);
            IngestOutcome::failed(err.to_string())
        }
    }
}

/// Ingest every `*.jsonl` file directly inside `dir`, in name order.
pub fn backfill(store: &ScryStore, dir: impl AsRef<Path>) -> Result<BackfillReport, TranscriptError> {
    let dir = dir.as_ref();
    let mut files = fs::read_dir(dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().and_then(|ext| ext.to_str()) == Some("jsonl"))
        .collect::<Vec<_>>();
    files.sort();

    let mut report = BackfillReport {
        total: files.len(),
        ..BackfillReport::default()
    };
    for file in &files {
        if ingest_session(store, file).success {
            report.ingested += 1;
        } else {
            report.failed += 1;
        }
    }
    info!(
        event = "backfill_complete",
        dir = %dir.display(),
        ingested = report.ingested,
        failed = report.failed,
        total = report.total
    );
    Ok(report)
}

fn build_snapshot(meta: &SessionMeta, records: &[Value], path: &Path) -> SessionSnapshot {
    let session_id = meta.session_id.as_str();
    let usage = usage_from_records(records);

    let mut session = SessionPatch::new(session_id);
    session.slug = meta.slug.clone();
    session.project = meta.project.clone();
    session.cwd = meta.cwd.clone();
    session.git_branch = meta.git_branch.clone();
    session.model = meta.model.clone();
    session.claude_version = meta.version.clone();
    session.started_at = meta.started_at;
    session.first_prompt = meta.first_prompt.clone();
    session.transcript_path = Some(path.display().to_string());
    session.tokens_in = Some(saturating_i64(usage.input));
    session.tokens_out = Some(saturating_i64(usage.output));
    session.cache_read = Some(saturating_i64(usage.cache_read));
    session.cache_create = Some(saturating_i64(usage.cache_create));

    SessionSnapshot {
        session,
        agents: agents_from_records(records)
            .iter()
            .map(|agent| agent_record(session_id, agent))
            .collect(),
        tool_calls: tool_calls_from_records(records)
            .iter()
            .map(|call| tool_call_record(session_id, call))
            .collect(),
        compactions: compactions_from_records(records, Utc::now())
            .into_iter()
            .map(|compaction| compaction_record(session_id, compaction))
            .collect(),
    }
}

fn agent_record(session_id: &str, agent: &ParsedAgent) -> AgentRecord {
    let mut record = AgentRecord::running(agent.tool_use_id.clone(), session_id);
    record.parent_agent_id = Some(MAIN_AGENT_ID.to_string());
    record.agent_type = agent.agent_type.clone();
    record.task_description = agent.description.clone();
    record.model = agent.model.clone();
    record.status = agent.status.clone();
    record.tokens_in = saturating_i64(agent.tokens_in);
    record.tokens_out = saturating_i64(agent.tokens_out);
    record.duration_ms = agent
        .duration_ms
        .map(saturating_i64)
        .or_else(|| elapsed_ms(agent.started_at, agent.ended_at));
    record.started_at = agent.started_at;
    record.ended_at = agent.ended_at;
    record
}

fn tool_call_record(session_id: &str, call: &ParsedToolCall) -> ToolCallRecord {
    let mut record = ToolCallRecord::new(call.id.clone(), session_id, call.tool_name.clone());
    record.params_summary = Some(call.params_summary.clone()).filter(|summary| !summary.is_empty());
    record.started_at = call.started_at;
    record.ended_at = call.ended_at;
    record.duration_ms = elapsed_ms(call.started_at, call.ended_at);
    record.has_error = call.has_error;
    record.response_summary = call.response_preview.clone();
    record.spawns_agent_id = call.spawns_agent_id.clone();
    record
}

fn compaction_record(session_id: &str, compaction: ParsedCompaction) -> CompactionRecord {
    CompactionRecord {
        id: None,
        session_id: session_id.to_string(),
        timestamp: compaction.timestamp,
        trigger: compaction.trigger,
        pre_tokens: compaction.pre_tokens.map(saturating_i64),
        summary_text: Some(compaction.summary_text).filter(|text| !text.is_empty()),
    }
}

fn elapsed_ms(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<i64> {
    let elapsed = (end? - start?).num_milliseconds();
    (elapsed >= 0).then_some(elapsed)
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
