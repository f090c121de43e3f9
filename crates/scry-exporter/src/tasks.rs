//! Structured task and plan details pulled out of task-management tool calls.

use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

const PLAN_PREVIEW_CHARS: usize = 200;

fn plan_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"plans/.*\.md$").expect("valid regex"))
}

fn text(input: &Map<String, Value>, key: &str) -> Option<String> {
    input
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn text_or_null(input: &Map<String, Value>, key: &str) -> Value {
    text(input, key).map(Value::String).unwrap_or(Value::Null)
}

/// `task_data` for `TaskCreate`, `TaskUpdate`, `TaskList` and `TaskGet`.
///
/// `response` is only available once the tool has finished; list and get
/// calls carry their payload there.
pub fn extract_task_data(
    tool_name: &str,
    input: &Map<String, Value>,
    response: Option<&Value>,
) -> Option<Value> {
    match tool_name {
        "TaskCreate" => Some(json!({
            "task_type": "task_create",
            "subject": text(input, "subject").unwrap_or_default(),
            "description": text(input, "description").unwrap_or_default(),
            "activeForm": text(input, "activeForm").unwrap_or_default(),
        })),
        "TaskUpdate" => Some(json!({
            "task_type": "task_update",
            "taskId": text(input, "taskId").unwrap_or_default(),
            "status": text_or_null(input, "status"),
            "owner": text_or_null(input, "owner"),
            "subject": text_or_null(input, "subject"),
        })),
        "TaskList" => {
            let tasks = response.and_then(task_list).unwrap_or_default();
            Some(json!({ "task_type": "task_list", "tasks": tasks }))
        }
        "TaskGet" => {
            let task = response.and_then(single_task)?;
            Some(json!({ "task_type": "task_get", "task": task }))
        }
        _ => None,
    }
}

/// `plan_data` for plan-mode transitions and writes to a `plans/*.md` file.
pub fn extract_plan_data(tool_name: &str, input: &Map<String, Value>) -> Option<Value> {
    match tool_name {
        "EnterPlanMode" => Some(json!({ "plan_event": "enter_plan_mode" })),
        "ExitPlanMode" => Some(json!({ "plan_event": "exit_plan_mode" })),
        "Write" => {
            let file_path = text(input, "file_path")?;
            if !plan_file_pattern().is_match(&file_path) {
                return None;
            }
            let content = text(input, "content").unwrap_or_default();
            Some(json!({
                "plan_event": "plan_write",
                "file_path": file_path,
                "content_preview": scry_core::truncate_chars(&content, PLAN_PREVIEW_CHARS),
            }))
        }
        _ => None,
    }
}

/// Tool responses sometimes arrive as a JSON document encoded in a string.
fn decoded(response: &Value) -> Option<Value> {
    match response {
        Value::String(raw) => serde_json::from_str(raw).ok(),
        other => Some(other.clone()),
    }
}

fn task_list(response: &Value) -> Option<Vec<Value>> {
    match decoded(response)? {
        Value::Array(tasks) => Some(tasks),
        Value::Object(mut object) => match object.remove("tasks") {
            Some(Value::Array(tasks)) => Some(tasks),
            _ => None,
        },
        _ => None,
    }
}

fn single_task(response: &Value) -> Option<Value> {
    let task = decoded(response)?;
    let object = task.as_object()?;
    let identified = ["subject", "taskId", "id"].iter().any(|key| {
        object
            .get(*key)
            .map(|value| !value.is_null() && value.as_str() != Some(""))
            .unwrap_or(false)
    });
    identified.then_some(task)
}
