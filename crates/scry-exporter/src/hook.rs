//! Turns a raw hook payload (whatever the host hands the hook on stdin) into a
//! typed [`HookEvent`], correlating sub-agent dispatches and completions on
//! the way.

use crate::tasks::{extract_plan_data, extract_task_data};
use crate::ExportError;
use scry_core::events::{
    AgentComplete, AgentSpawn, AgentStart, AgentStop, Compaction, EventPayload, EventType,
    Notification, PermissionRequest, SessionEnd, SessionStart, TaskCompleted, TeammateIdle,
    ToolEnd, ToolError, ToolStart, UserPrompt, UNKNOWN_AGENT_ID,
};
use scry_core::spawn::{record_dispatch, resolve_completion, spawn_agent_id, SpawnMailbox};
use scry_core::{truncate_chars, HookEvent, MAIN_AGENT_ID, MAIN_AGENT_LABEL};
use serde_json::{Map, Value};
use tracing::{debug, warn};

const PARAM_COUNT: usize = 3;
const PARAM_VALUE_CHARS: usize = 60;
const RESPONSE_PREVIEW_CHARS: usize = 80;
const ERROR_CHARS: usize = 200;

pub struct BuildContext<'a> {
    pub mailbox: &'a dyn SpawnMailbox,
    pub now_ms: i64,
    pub fallback_session: Option<&'a str>,
}

fn text(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .map(ToString::to_string)
}

fn count(payload: &Value, key: &str) -> u64 {
    payload.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn flag(payload: &Value, key: &str) -> bool {
    payload.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn strings(payload: &Value, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// `key=value` for the first three tool inputs, each value cut to 60
/// characters, space separated.
pub fn summarize_params(tool_input: &Map<String, Value>) -> String {
    tool_input
        .iter()
        .take(PARAM_COUNT)
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            format!("{key}={}", truncate_chars(&rendered, PARAM_VALUE_CHARS))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Error flag and a one-line preview of a finished tool's response.
///
/// Non-empty stderr marks the call as failed and wins the preview; otherwise
/// the preview is the plain response text or its stdout/output field.
pub fn response_preview(response: &Value) -> (bool, String) {
    let stderr = response
        .get("stderr")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    let has_error = !stderr.is_empty();
    let preview = if has_error {
        stderr.to_string()
    } else {
        match response {
            Value::String(raw) => raw.clone(),
            other => ["stdout", "output"]
                .iter()
                .find_map(|key| other.get(*key).and_then(Value::as_str))
                .unwrap_or("")
                .to_string(),
        }
    };
    (
        has_error,
        truncate_chars(&preview, RESPONSE_PREVIEW_CHARS).replace('\n', " "),
    )
}

/// Build the event for one hook invocation.
///
/// Unknown `event_type` values are kept as [`EventPayload::Other`]; every
/// kind gets the payload's `cwd`.
pub fn build_event(
    event_type: &str,
    payload: &Value,
    ctx: &BuildContext<'_>,
) -> Result<HookEvent, ExportError> {
    let session_id = text(payload, "session_id")
        .or_else(|| ctx.fallback_session.map(ToString::to_string))
        .unwrap_or_else(|| format!("ses_{}", ctx.now_ms));
    let empty = Map::new();
    let tool_input = payload
        .get("tool_input")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let agent_or = |fallback: &str| text(payload, "agent_id").unwrap_or_else(|| fallback.to_string());

    let kind = event_type.trim().parse::<EventType>().ok();
    let body = match kind {
        Some(EventType::SessionStart) => EventPayload::SessionStart(SessionStart {
            agent_id: MAIN_AGENT_ID.to_string(),
            agent_label: MAIN_AGENT_LABEL.to_string(),
            transcript_path: text(payload, "transcript_path"),
            model: text(payload, "model"),
            source: text(payload, "source"),
        }),
        Some(EventType::SessionEnd) => EventPayload::SessionEnd(SessionEnd {
            reason: text(payload, "reason"),
        }),
        Some(EventType::UserPrompt) => EventPayload::UserPrompt(UserPrompt {
            prompt_text: text(payload, "prompt").unwrap_or_default(),
        }),
        Some(EventType::Compaction) => EventPayload::Compaction(Compaction {
            agent_id: MAIN_AGENT_ID.to_string(),
            trigger: text(payload, "trigger").unwrap_or_else(|| "auto".to_string()),
            pre_tokens: payload.get("pre_tokens").and_then(Value::as_u64),
        }),
        Some(EventType::AgentStop) => EventPayload::AgentStop(AgentStop {
            agent_id: MAIN_AGENT_ID.to_string(),
            stop_hook_active: flag(payload, "stop_hook_active"),
            transcript_path: text(payload, "transcript_path"),
        }),
        Some(EventType::AgentStart) => EventPayload::AgentStart(AgentStart {
            agent_id: agent_or(UNKNOWN_AGENT_ID),
            agent_type: text(payload, "agent_type").unwrap_or_else(|| "unknown".to_string()),
        }),
        Some(EventType::ToolError) => EventPayload::ToolError(ToolError {
            agent_id: agent_or(MAIN_AGENT_ID),
            tool_name: text(payload, "tool_name").unwrap_or_else(|| "unknown".to_string()),
            tool_use_id: text(payload, "tool_use_id"),
            tool_params_summary: summarize_params(tool_input),
            error: text(payload, "error")
                .or_else(|| text(payload, "tool_response"))
                .map(|error| truncate_chars(&error, ERROR_CHARS))
                .unwrap_or_default(),
        }),
        Some(EventType::PermissionRequest) => EventPayload::PermissionRequest(PermissionRequest {
            tool_name: text(payload, "tool_name"),
        }),
        Some(EventType::Notification) => EventPayload::Notification(Notification {
            message: text(payload, "message"),
        }),
        Some(EventType::TaskCompleted) => EventPayload::TaskCompleted(TaskCompleted {}),
        Some(EventType::TeammateIdle) => EventPayload::TeammateIdle(TeammateIdle {
            agent_id: agent_or(MAIN_AGENT_ID),
            agent_type: text(payload, "agent_type"),
        }),
        Some(EventType::ToolStart) => {
            let tool_name = text(payload, "tool_name").unwrap_or_else(|| "unknown".to_string());
            EventPayload::ToolStart(ToolStart {
                agent_id: agent_or(MAIN_AGENT_ID),
                agent_label: text(payload, "agent_label")
                    .unwrap_or_else(|| MAIN_AGENT_LABEL.to_string()),
                tool_params_summary: summarize_params(tool_input),
                tool_use_id: text(payload, "tool_use_id"),
                task_data: extract_task_data(&tool_name, tool_input, None),
                plan_data: extract_plan_data(&tool_name, tool_input),
                tool_name,
                ..ToolStart::default()
            })
        }
        Some(EventType::ToolEnd) => {
            let tool_name = text(payload, "tool_name").unwrap_or_else(|| "unknown".to_string());
            let response = payload.get("tool_response").cloned().unwrap_or(Value::Null);
            let (has_error, preview) = response_preview(&response);
            let response = Some(&response).filter(|value| !value.is_null());
            EventPayload::ToolEnd(ToolEnd {
                agent_id: agent_or(MAIN_AGENT_ID),
                agent_label: text(payload, "agent_label")
                    .unwrap_or_else(|| MAIN_AGENT_LABEL.to_string()),
                tool_params_summary: summarize_params(tool_input),
                tool_use_id: text(payload, "tool_use_id"),
                tokens_in: count(payload, "tokens_in"),
                tokens_out: count(payload, "tokens_out"),
                duration_ms: count(payload, "duration_ms"),
                has_error,
                tool_response_summary: Some(preview),
                task_data: extract_task_data(&tool_name, tool_input, response),
                tool_name,
            })
        }
        Some(EventType::AgentSpawn) => EventPayload::AgentSpawn(AgentSpawn {
            agent_id: text(payload, "agent_id")
                .unwrap_or_else(|| spawn_agent_id(&session_id, ctx.now_ms, "")),
            parent_agent_id: text(payload, "parent_agent_id"),
            agent_label: text(payload, "agent_label")
                .unwrap_or_else(|| "general-purpose".to_string()),
            task_description: text(payload, "task_description").unwrap_or_default(),
            task_tags: strings(payload, "task_tags"),
        }),
        Some(EventType::AgentComplete) => EventPayload::AgentComplete(AgentComplete {
            // Left empty so the correlator always gets a chance to claim.
            agent_id: String::new(),
            parent_agent_id: text(payload, "parent_agent_id"),
            agent_label: text(payload, "agent_label").unwrap_or_default(),
            task_description: text(payload, "task_description").unwrap_or_default(),
            model: text(payload, "model"),
            task_tags: strings(payload, "task_tags"),
            tokens_in: count(payload, "tokens_in"),
            tokens_out: count(payload, "tokens_out"),
            duration_ms: count(payload, "duration_ms"),
            status: text(payload, "status").unwrap_or_else(|| "success".to_string()),
            contributes_to: strings(payload, "contributes_to"),
            transcript_path: text(payload, "transcript_path"),
            agent_transcript_path: text(payload, "agent_transcript_path"),
        }),
        Some(EventType::AssistantResponse) | Some(EventType::Attribution) | None => {
            EventPayload::Other(event_type.trim().to_string())
        }
    };

    let mut event = HookEvent::new(session_id, ctx.now_ms, body);
    event.cwd = text(payload, "cwd");

    match kind {
        Some(EventType::ToolStart) => {
            if let Some(spawn) = record_dispatch(ctx.mailbox, &mut event, Some(tool_input))? {
                debug!(event = "spawn_recorded", agent_id = %spawn.agent_id, label = %spawn.agent_label);
            }
        }
        Some(EventType::AgentComplete) => {
            for key in ["agent_type", "subagent_type"] {
                if let Some(value) = text(payload, key) {
                    event.extra.insert(key.to_string(), Value::String(value));
                }
            }
            let claimed = resolve_completion(ctx.mailbox, &mut event)?;
            if claimed.is_none() {
                if let EventPayload::AgentComplete(body) = &mut event.payload {
                    if let Some(reported) = text(payload, "agent_id") {
                        body.agent_id = reported;
                    } else {
                        warn!(event = "spawn_unmatched", session_id = %event.session_id);
                    }
                }
            }
        }
        _ => {}
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scry_core::spawn::MemoryMailbox;
    use serde_json::json;

    fn build(mailbox: &MemoryMailbox, event_type: &str, payload: Value, now_ms: i64) -> HookEvent {
        let ctx = BuildContext {
            mailbox,
            now_ms,
            fallback_session: None,
        };
        build_event(event_type, &payload, &ctx).expect("event")
    }

    #[test]
    fn session_start_is_attributed_to_main() {
        let mailbox = MemoryMailbox::new();
        let event = build(
            &mailbox,
            "session_start",
            json!({"session_id": "s1", "cwd": "/w", "model": "opus", "transcript_path": "/t.jsonl"}),
            1,
        );
        assert_eq!(event.session_id, "s1");
        assert_eq!(event.cwd.as_deref(), Some("/w"));
        assert_eq!(event.agent_id(), Some("ag_main"));
        assert_eq!(event.transcript_path(), Some("/t.jsonl"));
        assert!(event.id.starts_with("evt_"));
    }

    #[test]
    fn missing_session_falls_back() {
        let mailbox = MemoryMailbox::new();
        let event = build(&mailbox, "notification", json!({}), 42);
        assert_eq!(event.session_id, "ses_42");

        let ctx = BuildContext {
            mailbox: &mailbox,
            now_ms: 42,
            fallback_session: Some("env-session"),
        };
        let event = build_event("notification", &json!({}), &ctx).expect("event");
        assert_eq!(event.session_id, "env-session");
    }

    #[test]
    fn params_summary_keeps_three_short_values() {
        let input = json!({
            "command": "x".repeat(90),
            "timeout": 5,
            "description": "build",
            "ignored": true
        });
        let summary = summarize_params(input.as_object().expect("object"));
        assert_eq!(summary, format!("command={} timeout=5 description=build", "x".repeat(60)));
    }

    #[test]
    fn dispatch_then_completion_share_identity() {
        let mailbox = MemoryMailbox::new();
        let start = build(
            &mailbox,
            "tool_start",
            json!({
                "session_id": "s1",
                "tool_name": "Task",
                "tool_input": {"subagent_type": "explore", "description": "Map storage", "model": "haiku"}
            }),
            1_000,
        );
        let EventPayload::ToolStart(body) = &start.payload else {
            panic!("tool_start payload");
        };
        let spawned = body.spawns_agent_id.clone().expect("spawn id");
        assert_eq!(spawned, spawn_agent_id("s1", 1_000, "Map storage"));
        assert_eq!(body.agent_spawn_label.as_deref(), Some("explore"));
        assert_eq!(body.agent_spawn_model.as_deref(), Some("haiku"));

        let done = build(
            &mailbox,
            "agent_complete",
            json!({"session_id": "s1", "agent_type": "explore", "agent_id": "host-id"}),
            2_000,
        );
        let EventPayload::AgentComplete(body) = &done.payload else {
            panic!("agent_complete payload");
        };
        assert_eq!(body.agent_id, spawned);
        assert_eq!(body.parent_agent_id.as_deref(), Some("ag_main"));
        assert_eq!(body.task_description, "Map storage");
        assert_eq!(body.model.as_deref(), Some("haiku"));
        assert_eq!(body.status, "success");
        assert_eq!(done.extra.get("agent_type"), Some(&json!("explore")));
    }

    #[test]
    fn unmatched_completion_keeps_reported_or_unknown_id() {
        let mailbox = MemoryMailbox::new();
        let reported = build(
            &mailbox,
            "agent_complete",
            json!({"session_id": "s1", "agent_id": "host-id"}),
            1,
        );
        assert_eq!(reported.agent_id(), Some("host-id"));

        let anonymous = build(&mailbox, "agent_complete", json!({"session_id": "s1"}), 2);
        assert_eq!(anonymous.agent_id(), Some("ag_unknown"));
    }

    #[test]
    fn tool_end_flags_stderr_and_previews_output() {
        let mailbox = MemoryMailbox::new();
        let failed = build(
            &mailbox,
            "tool_end",
            json!({
                "session_id": "s1",
                "tool_name": "Bash",
                "tool_input": {"command": "make"},
                "tool_response": {"stdout": "ok", "stderr": "  make: *** [all] Error 2\nstop  "}
            }),
            1,
        );
        let EventPayload::ToolEnd(body) = &failed.payload else {
            panic!("tool_end payload");
        };
        assert!(body.has_error);
        assert_eq!(
            body.tool_response_summary.as_deref(),
            Some("make: *** [all] Error 2 stop")
        );
        assert_eq!(body.tool_params_summary, "command=make");

        let (has_error, preview) = response_preview(&json!({"stdout": "y".repeat(100)}));
        assert!(!has_error);
        assert_eq!(preview.chars().count(), 80);
        assert_eq!(response_preview(&json!("line1\nline2")).1, "line1 line2");
    }

    #[test]
    fn task_tools_carry_task_and_plan_data() {
        let mailbox = MemoryMailbox::new();
        let start = build(
            &mailbox,
            "tool_start",
            json!({"session_id": "s1", "tool_name": "TaskCreate", "tool_input": {"subject": "Ship"}}),
            1,
        );
        let EventPayload::ToolStart(body) = &start.payload else {
            panic!("tool_start payload");
        };
        assert_eq!(
            body.task_data.as_ref().map(|data| data["task_type"].clone()),
            Some(json!("task_create"))
        );
        assert!(body.spawns_agent_id.is_none());
        assert!(mailbox.pending().expect("pending").is_empty());
    }

    #[test]
    fn tool_error_prefers_error_text() {
        let mailbox = MemoryMailbox::new();
        let event = build(
            &mailbox,
            "tool_error",
            json!({"session_id": "s1", "tool_name": "Read", "tool_response": "e".repeat(300)}),
            1,
        );
        let EventPayload::ToolError(body) = &event.payload else {
            panic!("tool_error payload");
        };
        assert_eq!(body.error.len(), 200);
        assert_eq!(body.agent_id, "ag_main");
    }

    #[test]
    fn unknown_kinds_are_kept() {
        let mailbox = MemoryMailbox::new();
        let event = build(&mailbox, "pre_compact_v2", json!({"session_id": "s1"}), 1);
        assert_eq!(event.event_type(), "pre_compact_v2");
        assert_eq!(event.to_wire()["event_type"], "pre_compact_v2");
    }
}
