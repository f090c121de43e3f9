use crate::{
    block_type, content_blocks, content_text, message_content, parse_records, preview_content,
    read_records, record_type, str_field, user_prompt_text, COMPACTION_SUMMARY_MAX_CHARS,
    FIRST_PROMPT_MAX_CHARS,
};
use regex::Regex;
use scry_core::truncate_chars;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const SUBAGENT_PROMPT_MAX_CHARS: usize = 200;
const ERROR_TEXT_MAX_CHARS: usize = 500;

/// Dashboard rendering of one transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TranscriptView {
    pub prompt: Option<String>,
    pub messages: Vec<TranscriptMessage>,
    pub usage: UsageView,
    pub files: Vec<FileTouch>,
    pub errors: Vec<ToolErrorEntry>,
    #[serde(rename = "compactionSummaries")]
    pub compaction_summaries: Vec<CompactionSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptMessage {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        id: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: Option<String>,
        is_error: bool,
        preview: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageView {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_hit_rate: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileTouch {
    pub path: String,
    pub ops: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolErrorEntry {
    pub tool_use_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionSummary {
    pub index: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentTranscript {
    pub path: PathBuf,
    pub prompt: Option<String>,
    pub agent_id: Option<String>,
}

/// What the assistant produced since the last genuine user turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TurnResponse {
    pub text: String,
    pub tool_names: Vec<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cache_read: u64,
    pub cache_create: u64,
}

pub fn parse_transcript(path: impl AsRef<Path>) -> Option<TranscriptView> {
    let records = read_records(path.as_ref())?;
    Some(view_from_records(&records))
}

pub(crate) fn view_from_records(records: &[Value]) -> TranscriptView {
    let mut view = TranscriptView::default();
    let mut files: Vec<FileTouch> = Vec::new();

    for record in records {
        match record_type(record) {
            "user" => {
                if view.prompt.is_none() {
                    view.prompt = user_prompt_text(record)
                        .map(|text| truncate_chars(&text, FIRST_PROMPT_MAX_CHARS));
                }
                for block in content_blocks(record) {
                    if block_type(block) == "tool_result" {
                        let is_error = block.get("is_error").and_then(Value::as_bool).unwrap_or(false);
                        push_result(
                            &mut view,
                            str_field(block, "tool_use_id"),
                            is_error,
                            block.get("content"),
                        );
                    }
                }
            }
            "assistant" => {
                if let Some(usage) = record.get("message").and_then(|message| message.get("usage")) {
                    let field = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
                    view.usage.input_tokens += field("input_tokens");
                    view.usage.output_tokens += field("output_tokens");
                    view.usage.cache_creation_input_tokens += field("cache_creation_input_tokens");
                    view.usage.cache_read_input_tokens += field("cache_read_input_tokens");
                }
                for block in content_blocks(record) {
                    match block_type(block) {
                        "tool_use" => {
                            let name = str_field(block, "name").unwrap_or_default();
                            let input = block.get("input").cloned().unwrap_or(Value::Object(Default::default()));
                            if let Some((file, op)) = touched_file(&name, &input) {
                                record_touch(&mut files, file, op);
                            }
                            view.messages.push(TranscriptMessage::ToolUse {
                                name,
                                id: str_field(block, "id").unwrap_or_default(),
                                input,
                            });
                        }
                        "text" => {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                view.messages.push(TranscriptMessage::Text {
                                    text: text.to_string(),
                                });
                            }
                        }
                        _ => {}
                    }
                }
            }
            "tool_result" | "tool_response" => {
                let content = record.get("content").or_else(|| message_content(record));
                let is_error = record.get("is_error").and_then(Value::as_bool).unwrap_or(false)
                    || record.get("error").is_some_and(|error| !error.is_null());
                push_result(&mut view, str_field(record, "tool_use_id"), is_error, content);
            }
            _ => {}
        }
    }

    view.usage.cache_hit_rate = if view.usage.input_tokens > 0 {
        let rate = view.usage.cache_read_input_tokens as f64 / view.usage.input_tokens as f64;
        format!("{:.1}%", rate * 100.0)
    } else {
        "0%".to_string()
    };
    view.files = files;
    view.compaction_summaries = summaries_from_records(records);
    view
}

fn push_result(
    view: &mut TranscriptView,
    tool_use_id: Option<String>,
    is_error: bool,
    content: Option<&Value>,
) {
    if is_error {
        let text = match content {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(blocks)) => blocks
                .iter()
                .map(|block| block.get("text").and_then(Value::as_str).unwrap_or_default())
                .collect::<Vec<_>>()
                .join("\n"),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        view.errors.push(ToolErrorEntry {
            tool_use_id: tool_use_id.clone(),
            text: truncate_chars(&text, ERROR_TEXT_MAX_CHARS),
        });
    }
    view.messages.push(TranscriptMessage::ToolResult {
        tool_use_id,
        is_error,
        preview: preview_content(content),
    });
}

fn read_command_regex() -> &'static Regex {
    static READ_COMMAND: OnceLock<Regex> = OnceLock::new();
    READ_COMMAND.get_or_init(|| {
        Regex::new(r"(?:cat|head|tail|less|vim|nano)\s+(?:-[^\s]*\s+)*([^\s|;&-][^\s|;&]*)")
            .expect("valid regex")
    })
}

/// File a tool call touched and how: `R`ead, `W`rite or `E`dit.
fn touched_file(tool_name: &str, input: &Value) -> Option<(String, &'static str)> {
    let field = |key: &str| str_field(input, key);
    match tool_name {
        "Read" | "NotebookRead" => field("file_path").map(|path| (path, "R")),
        "Write" | "NotebookEdit" => field("file_path")
            .or_else(|| field("notebook_path"))
            .map(|path| (path, "W")),
        "Edit" | "MultiEdit" => field("file_path").map(|path| (path, "E")),
        "Glob" => field("pattern").map(|path| (path, "R")),
        "Grep" => field("path").or_else(|| field("pattern")).map(|path| (path, "R")),
        "Bash" => {
            let command = field("command")?;
            let captures = read_command_regex().captures(&command)?;
            captures.get(1).map(|m| (m.as_str().to_string(), "R"))
        }
        _ => None,
    }
}

fn record_touch(files: &mut Vec<FileTouch>, path: String, op: &str) {
    match files.iter_mut().find(|touch| touch.path == path) {
        Some(touch) => {
            if !touch.ops.iter().any(|existing| existing == op) {
                touch.ops.push(op.to_string());
            }
        }
        None => files.push(FileTouch {
            path,
            ops: vec![op.to_string()],
        }),
    }
}

pub fn extract_compaction_summaries(path: impl AsRef<Path>) -> Vec<CompactionSummary> {
    read_records(path.as_ref())
        .map(|records| summaries_from_records(&records))
        .unwrap_or_default()
}

/// Summary and compact records, plus system notices mentioning a compaction, numbered in file order.
pub(crate) fn summaries_from_records(records: &[Value]) -> Vec<CompactionSummary> {
    let mut summaries = Vec::new();
    for record in records {
        let text = match record_type(record) {
            "summary" | "compact" => record
                .get("summary")
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .or_else(|| message_content(record).and_then(|content| content_text(content, "\n")))
                .unwrap_or_default(),
            "system" => {
                let content = message_content(record)
                    .and_then(Value::as_str)
                    .or_else(|| record.get("content").and_then(Value::as_str))
                    .unwrap_or_default();
                if content.contains("compacted") {
                    content.to_string()
                } else {
                    String::new()
                }
            }
            _ => String::new(),
        };
        if !text.is_empty() {
            summaries.push(CompactionSummary {
                index: summaries.len(),
                text: truncate_chars(&text, COMPACTION_SUMMARY_MAX_CHARS),
            });
        }
    }
    summaries
}

/// Sub-agent transcripts next to a session transcript: `<dir>/<session>/subagents/*.jsonl`,
/// falling back to `<dir>/subagents/*.jsonl`.
pub fn list_subagent_transcripts(session_transcript: impl AsRef<Path>) -> Vec<SubagentTranscript> {
    let session_transcript = session_transcript.as_ref();
    let Some(dir) = session_transcript.parent() else {
        return Vec::new();
    };
    let nested = session_transcript
        .file_stem()
        .map(|stem| dir.join(stem).join("subagents"));
    let target = match nested {
        Some(nested) if nested.is_dir() => nested,
        _ => {
            let alternative = dir.join("subagents");
            if !alternative.is_dir() {
                return Vec::new();
            }
            alternative
        }
    };

    let Ok(entries) = fs::read_dir(&target) else {
        return Vec::new();
    };
    let mut paths = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("jsonl"))
        .collect::<Vec<_>>();
    paths.sort();

    paths
        .into_iter()
        .filter_map(|path| {
            let raw = fs::read_to_string(&path).ok()?;
            let first_line = raw.lines().find(|line| !line.trim().is_empty())?;
            let first = parse_records(first_line).into_iter().next()?;
            let prompt = message_content(&first)
                .and_then(|content| content_text(content, " "))
                .map(|text| truncate_chars(&text, SUBAGENT_PROMPT_MAX_CHARS));
            Some(SubagentTranscript {
                agent_id: str_field(&first, "agentId"),
                path,
                prompt,
            })
        })
        .collect()
}

/// Tool use ids issued by assistant turns, in order.
pub fn transcript_tool_use_ids(path: impl AsRef<Path>) -> Vec<String> {
    let Some(records) = read_records(path.as_ref()) else {
        return Vec::new();
    };
    records
        .iter()
        .filter(|record| record_type(record) == "assistant")
        .flat_map(|record| content_blocks(record).iter())
        .filter(|block| block_type(block) == "tool_use")
        .filter_map(|block| str_field(block, "id"))
        .collect()
}

pub fn extract_turn_response(path: impl AsRef<Path>) -> Option<TurnResponse> {
    let records = read_records(path.as_ref())?;
    turn_response_from_records(&records)
}

pub(crate) fn turn_response_from_records(records: &[Value]) -> Option<TurnResponse> {
    // Tool results also arrive as user records; only text-bearing turns count.
    let start = records
        .iter()
        .rposition(|record| user_prompt_text(record).is_some())
        .map(|index| index + 1)
        .unwrap_or(0);

    let mut response = TurnResponse::default();
    let mut texts = Vec::new();
    let mut saw_assistant = false;
    for record in &records[start..] {
        if record_type(record) != "assistant" {
            continue;
        }
        saw_assistant = true;
        for block in content_blocks(record) {
            match block_type(block) {
                "text" => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        if !text.trim().is_empty() {
                            texts.push(text.trim().to_string());
                        }
                    }
                }
                "tool_use" => {
                    if let Some(name) = str_field(block, "name") {
                        response.tool_names.push(name);
                    }
                }
                _ => {}
            }
        }
        if let Some(usage) = record.get("message").and_then(|message| message.get("usage")) {
            let field = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
            response.tokens_in += field("input_tokens");
            response.tokens_out += field("output_tokens");
            response.cache_read += field("cache_read_input_tokens");
            response.cache_create += field("cache_creation_input_tokens");
        }
    }
    if !saw_assistant {
        return None;
    }
    response.text = texts.join("\n");
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::transcript;

    #[test]
    fn view_collects_messages_files_and_errors() {
        let file = transcript(&[
            r#"{"type":"user","message":{"content":"Fix the build"}}"#,
            r#"{"type":"assistant","message":{"usage":{"input_tokens":200,"output_tokens":5,"cache_read_input_tokens":50},"content":[{"type":"text","text":"On it"},{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"Cargo.toml"}},{"type":"tool_use","id":"t2","name":"Edit","input":{"file_path":"Cargo.toml"}},{"type":"tool_use","id":"t3","name":"Bash","input":{"command":"tail -5 build.log | grep error"}}]}}"#,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t3","is_error":true,"content":"exit 1"}]}}"#,
            r#"{"type":"system","message":{"content":"Conversation compacted"}}"#,
        ]);
        let view = parse_transcript(file.path()).expect("view");
        assert_eq!(view.prompt.as_deref(), Some("Fix the build"));
        assert_eq!(view.messages.len(), 5);
        assert_eq!(view.usage.cache_hit_rate, "25.0%");
        assert_eq!(
            view.files,
            vec![
                FileTouch {
                    path: "Cargo.toml".to_string(),
                    ops: vec!["R".to_string(), "E".to_string()],
                },
                FileTouch {
                    path: "build.log".to_string(),
                    ops: vec!["R".to_string()],
                },
            ]
        );
        assert_eq!(view.errors.len(), 1);
        assert_eq!(view.errors[0].tool_use_id.as_deref(), Some("t3"));
        assert_eq!(view.compaction_summaries.len(), 1);

        let json = serde_json::to_value(&view).expect("serialize");
        assert!(json.get("compactionSummaries").is_some());
        assert_eq!(json["messages"][1]["type"], "tool_use");
    }

    #[test]
    fn compaction_summaries_are_indexed() {
        let file = transcript(&[
            r#"{"type":"summary","summary":"first"}"#,
            r#"{"type":"assistant","message":{"content":[]}}"#,
            r#"{"type":"compact","message":{"content":[{"type":"text","text":"second"}]}}"#,
        ]);
        let summaries = extract_compaction_summaries(file.path());
        assert_eq!(
            summaries,
            vec![
                CompactionSummary {
                    index: 0,
                    text: "first".to_string()
                },
                CompactionSummary {
                    index: 1,
                    text: "second".to_string()
                },
            ]
        );
        assert!(extract_compaction_summaries("/nope.jsonl").is_empty());
    }

    #[test]
    fn subagents_prefer_nested_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = dir.path().join("abc.jsonl");
        fs::write(&session, "").expect("session file");

        let alt = dir.path().join("subagents");
        fs::create_dir_all(&alt).expect("alt dir");
        fs::write(alt.join("other.jsonl"), "{\"message\":{\"content\":\"alt\"}}\n").expect("alt");
        assert_eq!(list_subagent_transcripts(&session).len(), 1);

        let nested = dir.path().join("abc").join("subagents");
        fs::create_dir_all(&nested).expect("nested dir");
        fs::write(
            nested.join("agent-1.jsonl"),
            "{\"agentId\":\"a1\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"Explore the repo\"}]}}\n",
        )
        .expect("nested");
        fs::write(nested.join("notes.txt"), "ignored").expect("txt");

        let found = list_subagent_transcripts(&session);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].agent_id.as_deref(), Some("a1"));
        assert_eq!(found[0].prompt.as_deref(), Some("Explore the repo"));
    }

    #[test]
    fn turn_response_starts_after_last_real_prompt() {
        let file = transcript(&[
            r#"{"type":"user","message":{"content":"old question"}}"#,
            r#"{"type":"assistant","message":{"usage":{"input_tokens":999},"content":[{"type":"text","text":"old answer"}]}}"#,
            r#"{"type":"user","message":{"content":"new question"}}"#,
            r#"{"type":"assistant","message":{"usage":{"input_tokens":10,"output_tokens":4},"content":[{"type":"text","text":"Checking"},{"type":"tool_use","id":"t9","name":"Grep","input":{}}]}}"#,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t9","content":"hit"}]}}"#,
            r#"{"type":"assistant","message":{"usage":{"input_tokens":12,"output_tokens":6,"cache_read_input_tokens":3},"content":[{"type":"text","text":"Found it"}]}}"#,
        ]);
        let response = extract_turn_response(file.path()).expect("response");
        assert_eq!(response.text, "Checking\nFound it");
        assert_eq!(response.tool_names, vec!["Grep".to_string()]);
        assert_eq!(response.tokens_in, 22);
        assert_eq!(response.tokens_out, 10);
        assert_eq!(response.cache_read, 3);

        assert_eq!(transcript_tool_use_ids(file.path()), vec!["t9".to_string()]);
    }

    #[test]
    fn turn_response_needs_assistant_output() {
        let file = transcript(&[r#"{"type":"user","message":{"content":"hello"}}"#]);
        assert!(extract_turn_response(file.path()).is_none());
    }
}
