//! Normalization of append-only session transcripts (one JSON record per line)
//! into session metadata, token usage, tool calls, sub-agents and compactions.
//!
//! Every parser is forgiving: unreadable lines are skipped and a missing file
//! yields `None` or an empty result.

pub mod cache;
pub mod ingest;
pub mod view;

pub use cache::TranscriptCache;
pub use ingest::{backfill, ingest_session, BackfillReport, IngestOutcome};
pub use view::{
    extract_compaction_summaries, extract_turn_response, list_subagent_transcripts,
    parse_transcript, transcript_tool_use_ids, CompactionSummary, SubagentTranscript,
    TranscriptView, TurnResponse,
};

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use scry_core::session_log::project_name;
use scry_core::spawn::is_dispatch_tool;
use scry_core::truncate_chars;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

pub const FIRST_PROMPT_MAX_CHARS: usize = 2_000;
pub const PARAM_VALUE_MAX_CHARS: usize = 100;
pub const AGENT_PROMPT_MAX_CHARS: usize = 500;
pub const COMPACTION_SUMMARY_MAX_CHARS: usize = 5_000;
pub const RESULT_PREVIEW_MAX_CHARS: usize = 300;
pub const DEFAULT_COMPACTION_TRIGGER: &str = "context_limit";

#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] scry_storage::StorageError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub slug: Option<String>,
    pub cwd: Option<String>,
    pub project: Option<String>,
    pub git_branch: Option<String>,
    pub version: Option<String>,
    pub model: Option<String>,
    pub first_prompt: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_create: u64,
}

impl TokenUsage {
    fn add_usage(&mut self, usage: &Map<String, Value>) {
        self.input += counter(usage, "input_tokens");
        self.output += counter(usage, "output_tokens");
        self.cache_read += counter(usage, "cache_read_input_tokens");
        self.cache_create += counter(usage, "cache_creation_input_tokens");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedToolCall {
    pub id: String,
    pub tool_name: String,
    pub params_summary: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub has_error: bool,
    pub response_preview: Option<String>,
    /// Set for sub-agent dispatch tools; the spawned agent is keyed by this tool use id.
    pub spawns_agent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedAgent {
    pub tool_use_id: String,
    pub agent_type: Option<String>,
    pub description: Option<String>,
    pub model: Option<String>,
    pub prompt: String,
    pub background: bool,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedCompaction {
    pub timestamp: DateTime<Utc>,
    pub summary_text: String,
    pub trigger: String,
    pub pre_tokens: Option<u64>,
}

/// Parsed records of a transcript file; `None` when the file does not exist.
pub(crate) fn read_records(path: &Path) -> Option<Vec<Value>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return None,
        Err(err) => {
            debug!(event = "transcript_read_failed", path = %path.display(), error = %err);
            return None;
        }
    };
    Some(parse_records(&raw))
}

pub(crate) fn parse_records(raw: &str) -> Vec<Value> {
    let mut skipped = 0_usize;
    let mut records = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) if value.is_object() => records.push(value),
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(event = "transcript_lines_skipped", skipped);
    }
    records
}

pub(crate) fn record_type(record: &Value) -> &str {
    record.get("type").and_then(Value::as_str).unwrap_or_default()
}

pub(crate) fn message_content(record: &Value) -> Option<&Value> {
    record.get("message").and_then(|message| message.get("content"))
}

pub(crate) fn content_blocks(record: &Value) -> &[Value] {
    message_content(record)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

pub(crate) fn block_type(block: &Value) -> &str {
    block.get("type").and_then(Value::as_str).unwrap_or_default()
}

/// String content as-is, or the `text` blocks of an array joined by `separator`.
pub(crate) fn content_text(content: &Value, separator: &str) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => Some(
            blocks
                .iter()
                .filter(|block| block_type(block) == "text")
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(separator),
        ),
        _ => None,
    }
}

pub(crate) fn record_timestamp(record: &Value) -> Option<DateTime<Utc>> {
    match record.get("timestamp")? {
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        Value::Number(number) => number
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

pub(crate) fn str_field(object: &Value, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn counter(object: &Map<String, Value>, key: &str) -> u64 {
    object.get(key).and_then(Value::as_u64).unwrap_or(0)
}

/// `k=v` for the first three inputs, each value cut to 100 characters.
pub fn summarize_params(input: &Value) -> String {
    let Some(object) = input.as_object() else {
        return String::new();
    };
    object
        .iter()
        .take(3)
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            format!("{key}={}", truncate_chars(&rendered, PARAM_VALUE_MAX_CHARS))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// First user text of a record, when the record is a genuine prompt.
pub(crate) fn user_prompt_text(record: &Value) -> Option<String> {
    if record_type(record) != "user" {
        return None;
    }
    let text = content_text(message_content(record)?, "\n")?;
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn parse_session_meta(path: impl AsRef<Path>) -> Option<SessionMeta> {
    let records = read_records(path.as_ref())?;

    let mut session_id = None;
    let mut meta = SessionMeta::default();
    for record in &records {
        if session_id.is_none() {
            session_id = str_field(record, "sessionId");
        }
        if meta.slug.is_none() {
            meta.slug = str_field(record, "slug");
        }
        if meta.cwd.is_none() {
            meta.cwd = str_field(record, "cwd");
        }
        if meta.git_branch.is_none() {
            meta.git_branch = str_field(record, "gitBranch");
        }
        if meta.version.is_none() {
            meta.version = str_field(record, "version");
        }
        if meta.started_at.is_none() {
            meta.started_at = record_timestamp(record);
        }
        if meta.model.is_none() && record_type(record) == "assistant" {
            meta.model = record.get("message").and_then(|message| str_field(message, "model"));
        }
        if meta.first_prompt.is_none() {
            meta.first_prompt =
                user_prompt_text(record).map(|text| truncate_chars(&text, FIRST_PROMPT_MAX_CHARS));
        }

        if session_id.is_some()
            && meta.slug.is_some()
            && meta.cwd.is_some()
            && meta.git_branch.is_some()
            && meta.version.is_some()
            && meta.model.is_some()
            && meta.first_prompt.is_some()
            && meta.started_at.is_some()
        {
            break;
        }
    }

    meta.session_id = session_id?;
    meta.project = meta
        .cwd
        .as_deref()
        .map(project_name)
        .filter(|name| !name.is_empty());
    Some(meta)
}

pub fn parse_token_usage(path: impl AsRef<Path>) -> TokenUsage {
    read_records(path.as_ref())
        .map(|records| usage_from_records(&records))
        .unwrap_or_default()
}

pub(crate) fn usage_from_records(records: &[Value]) -> TokenUsage {
    let mut usage = TokenUsage::default();
    for record in records.iter().filter(|record| record_type(record) == "assistant") {
        if let Some(block) = record
            .get("message")
            .and_then(|message| message.get("usage"))
            .and_then(Value::as_object)
        {
            usage.add_usage(block);
        }
    }
    usage
}

struct ToolResult {
    ended_at: Option<DateTime<Utc>>,
    is_error: bool,
    preview: String,
    extra: Option<Map<String, Value>>,
}

/// Tool results keyed by tool use id, from user turns and standalone result records.
fn collect_tool_results(records: &[Value]) -> HashMap<String, ToolResult> {
    let mut results = HashMap::new();
    for record in records {
        let at = record_timestamp(record);
        let extra = record.get("toolUseResult").and_then(Value::as_object).cloned();
        match record_type(record) {
            "user" => {
                for block in content_blocks(record) {
                    if block_type(block) != "tool_result" {
                        continue;
                    }
                    let Some(id) = str_field(block, "tool_use_id") else {
                        continue;
                    };
                    results.insert(
                        id,
                        ToolResult {
                            ended_at: at,
                            is_error: block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
                            preview: preview_content(block.get("content")),
                            extra: extra.clone(),
                        },
                    );
                }
            }
            "tool_result" | "tool_response" => {
                let Some(id) = str_field(record, "tool_use_id") else {
                    continue;
                };
                let content = record.get("content").or_else(|| message_content(record));
                let is_error = record.get("is_error").and_then(Value::as_bool).unwrap_or(false)
                    || record.get("error").is_some_and(|error| !error.is_null());
                results.insert(
                    id,
                    ToolResult {
                        ended_at: at,
                        is_error,
                        preview: preview_content(content),
                        extra,
                    },
                );
            }
            _ => {}
        }
    }
    results
}

/// Single-line preview of tool result content.
pub(crate) fn preview_content(content: Option<&Value>) -> String {
    let text = match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    };
    truncate_chars(&text, RESULT_PREVIEW_MAX_CHARS).replace('\n', " ")
}

pub fn parse_tool_calls(path: impl AsRef<Path>) -> Vec<ParsedToolCall> {
    let Some(records) = read_records(path.as_ref()) else {
        return Vec::new();
    };
    tool_calls_from_records(&records)
}

pub(crate) fn tool_calls_from_records(records: &[Value]) -> Vec<ParsedToolCall> {
    let results = collect_tool_results(records);
    let mut calls = Vec::new();
    for record in records.iter().filter(|record| record_type(record) == "assistant") {
        let started_at = record_timestamp(record);
        for block in content_blocks(record) {
            if block_type(block) != "tool_use" {
                continue;
            }
            let Some(id) = str_field(block, "id") else {
                continue;
            };
            let tool_name = str_field(block, "name").unwrap_or_else(|| "unknown".to_string());
            let params_summary = block.get("input").map(summarize_params).unwrap_or_default();
            let result = results.get(&id);
            calls.push(ParsedToolCall {
                spawns_agent_id: is_dispatch_tool(&tool_name).then(|| id.clone()),
                id,
                tool_name,
                params_summary,
                started_at,
                ended_at: result.and_then(|result| result.ended_at),
                has_error: result.is_some_and(|result| result.is_error),
                response_preview: result
                    .map(|result| result.preview.clone())
                    .filter(|preview| !preview.is_empty()),
            });
        }
    }
    calls
}

pub fn parse_agents(path: impl AsRef<Path>) -> Vec<ParsedAgent> {
    let Some(records) = read_records(path.as_ref()) else {
        return Vec::new();
    };
    agents_from_records(&records)
}

pub(crate) fn agents_from_records(records: &[Value]) -> Vec<ParsedAgent> {
    let results = collect_tool_results(records);
    let mut agents = Vec::new();
    for record in records.iter().filter(|record| record_type(record) == "assistant") {
        for block in content_blocks(record) {
            if block_type(block) != "tool_use" {
                continue;
            }
            let is_dispatch = block
                .get("name")
                .and_then(Value::as_str)
                .is_some_and(is_dispatch_tool);
            let Some(id) = str_field(block, "id").filter(|_| is_dispatch) else {
                continue;
            };
            let input = block.get("input").cloned().unwrap_or(Value::Null);
            let result = results.get(&id);
            let status = match result {
                Some(result) if result.is_error => "error",
                Some(_) => "success",
                None => "running",
            };
            let extra = result.and_then(|result| result.extra.as_ref());
            let usage = extra
                .and_then(|extra| extra.get("usage"))
                .and_then(Value::as_object);

            agents.push(ParsedAgent {
                tool_use_id: id,
                agent_type: str_field(&input, "subagent_type"),
                description: str_field(&input, "description"),
                model: str_field(&input, "model"),
                prompt: input
                    .get("prompt")
                    .and_then(Value::as_str)
                    .map(|prompt| truncate_chars(prompt, AGENT_PROMPT_MAX_CHARS))
                    .unwrap_or_default(),
                background: input
                    .get("run_in_background")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                status: status.to_string(),
                started_at: record_timestamp(record),
                ended_at: result.and_then(|result| result.ended_at),
                duration_ms: extra
                    .and_then(|extra| extra.get("totalDurationMs"))
                    .and_then(Value::as_u64),
                tokens_in: usage.map(|usage| counter(usage, "input_tokens")).unwrap_or(0),
                tokens_out: usage.map(|usage| counter(usage, "output_tokens")).unwrap_or(0),
            });
        }
    }
    agents
}

fn summary_regex() -> &'static Regex {
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    SUMMARY.get_or_init(|| {
        Regex::new(r"(?s)<summary>(.*?)</summary>").expect("valid regex")
    })
}

pub fn parse_compactions(path: impl AsRef<Path>) -> Vec<ParsedCompaction> {
    let Some(records) = read_records(path.as_ref()) else {
        return Vec::new();
    };
    compactions_from_records(&records, Utc::now())
}

/// `now` stands in for a timestamp only when no earlier record carried one.
pub(crate) fn compactions_from_records(
    records: &[Value],
    now: DateTime<Utc>,
) -> Vec<ParsedCompaction> {
    let mut compactions = Vec::new();
    let mut last_seen: Option<DateTime<Utc>> = None;

    for record in records {
        let own = record_timestamp(record);
        let timestamp = own.or(last_seen).unwrap_or(now);
        if own.is_some() {
            last_seen = own;
        }

        match record_type(record) {
            "assistant" => {
                for block in content_blocks(record) {
                    if block_type(block) != "text" {
                        continue;
                    }
                    let Some(text) = block.get("text").and_then(Value::as_str) else {
                        continue;
                    };
                    if let Some(captures) = summary_regex().captures(text) {
                        let summary = captures.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
                        compactions.push(ParsedCompaction {
                            timestamp,
                            summary_text: truncate_chars(summary, COMPACTION_SUMMARY_MAX_CHARS),
                            trigger: DEFAULT_COMPACTION_TRIGGER.to_string(),
                            pre_tokens: None,
                        });
                    }
                }
            }
            "summary" | "compact" => {
                let text = record
                    .get("summary")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
                    .or_else(|| {
                        message_content(record)
                            .and_then(Value::as_str)
                            .map(ToString::to_string)
                    })
                    .unwrap_or_default();
                if !text.trim().is_empty() {
                    compactions.push(ParsedCompaction {
                        timestamp,
                        summary_text: truncate_chars(&text, COMPACTION_SUMMARY_MAX_CHARS),
                        trigger: DEFAULT_COMPACTION_TRIGGER.to_string(),
                        pre_tokens: None,
                    });
                }
            }
            "system" if str_field(record, "subtype").as_deref() == Some("compact_boundary") => {
                let metadata = record.get("compactMetadata");
                let trigger = metadata
                    .and_then(|metadata| str_field(metadata, "trigger"))
                    .unwrap_or_else(|| DEFAULT_COMPACTION_TRIGGER.to_string());
                let text = record
                    .get("content")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
                    .unwrap_or_default();
                compactions.push(ParsedCompaction {
                    timestamp,
                    summary_text: truncate_chars(&text, COMPACTION_SUMMARY_MAX_CHARS),
                    trigger,
                    pre_tokens: metadata
                        .and_then(|metadata| metadata.get("preTokens"))
                        .and_then(Value::as_u64),
                });
            }
            _ => {}
        }
    }
    compactions
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Write;
    use tempfile::NamedTempFile;

    pub fn transcript(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp transcript");
        for line in lines {
            writeln!(file, "{line}").expect("write line");
        }
        file.flush().expect("flush");
        file
    }
}
