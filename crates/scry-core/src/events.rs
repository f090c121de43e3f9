use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub const MAIN_AGENT_ID: &str = "ag_main";
pub const MAIN_AGENT_LABEL: &str = "main";
pub const UNKNOWN_AGENT_ID: &str = "ag_unknown";

/// Fields every event carries on the wire, independent of its kind.
const ENVELOPE_FIELDS: [&str; 6] = [
    "id",
    "session_id",
    "event_type",
    "timestamp",
    "cwd",
    "prompt_id",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("event body must be a JSON object")]
    NotAnObject,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("invalid {event_type} payload: {message}")]
    InvalidPayload { event_type: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    SessionStart,
    SessionEnd,
    UserPrompt,
    ToolStart,
    ToolEnd,
    ToolError,
    AgentSpawn,
    AgentStart,
    AgentComplete,
    AgentStop,
    Compaction,
    Notification,
    PermissionRequest,
    TaskCompleted,
    TeammateIdle,
    AssistantResponse,
    Attribution,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionStart => "session_start",
            EventType::SessionEnd => "session_end",
            EventType::UserPrompt => "user_prompt",
            EventType::ToolStart => "tool_start",
            EventType::ToolEnd => "tool_end",
            EventType::ToolError => "tool_error",
            EventType::AgentSpawn => "agent_spawn",
            EventType::AgentStart => "agent_start",
            EventType::AgentComplete => "agent_complete",
            EventType::AgentStop => "agent_stop",
            EventType::Compaction => "compaction",
            EventType::Notification => "notification",
            EventType::PermissionRequest => "permission_request",
            EventType::TaskCompleted => "task_completed",
            EventType::TeammateIdle => "teammate_idle",
            EventType::AssistantResponse => "assistant_response",
            EventType::Attribution => "attribution",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "session_start" => Ok(EventType::SessionStart),
            "session_end" => Ok(EventType::SessionEnd),
            "user_prompt" => Ok(EventType::UserPrompt),
            "tool_start" => Ok(EventType::ToolStart),
            "tool_end" => Ok(EventType::ToolEnd),
            "tool_error" => Ok(EventType::ToolError),
            "agent_spawn" => Ok(EventType::AgentSpawn),
            "agent_start" => Ok(EventType::AgentStart),
            "agent_complete" => Ok(EventType::AgentComplete),
            "agent_stop" => Ok(EventType::AgentStop),
            "compaction" => Ok(EventType::Compaction),
            "notification" => Ok(EventType::Notification),
            "permission_request" => Ok(EventType::PermissionRequest),
            "task_completed" => Ok(EventType::TaskCompleted),
            "teammate_idle" => Ok(EventType::TeammateIdle),
            "assistant_response" => Ok(EventType::AssistantResponse),
            "attribution" => Ok(EventType::Attribution),
            other => Err(format!("Unknown event type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStart {
    #[serde(deserialize_with = "lenient_string")]
    pub agent_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub agent_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub transcript_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionEnd {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPrompt {
    #[serde(deserialize_with = "lenient_string")]
    pub prompt_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolStart {
    #[serde(deserialize_with = "lenient_string")]
    pub agent_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub agent_label: String,
    #[serde(deserialize_with = "lenient_string")]
    pub tool_name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub tool_params_summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub spawns_agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub agent_spawn_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub agent_spawn_task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub agent_spawn_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolEnd {
    #[serde(deserialize_with = "lenient_string")]
    pub agent_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub agent_label: String,
    #[serde(deserialize_with = "lenient_string")]
    pub tool_name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub tool_params_summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub tool_use_id: Option<String>,
    #[serde(deserialize_with = "lenient_u64")]
    pub tokens_in: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub tokens_out: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub duration_ms: u64,
    #[serde(deserialize_with = "lenient_bool")]
    pub has_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub tool_response_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolError {
    #[serde(deserialize_with = "lenient_string")]
    pub agent_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub tool_use_id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub tool_params_summary: String,
    #[serde(deserialize_with = "lenient_string")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSpawn {
    #[serde(deserialize_with = "lenient_string")]
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub parent_agent_id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub agent_label: String,
    #[serde(deserialize_with = "lenient_string")]
    pub task_description: String,
    #[serde(deserialize_with = "lenient_strings")]
    pub task_tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentStart {
    #[serde(deserialize_with = "lenient_string")]
    pub agent_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub agent_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentComplete {
    #[serde(deserialize_with = "lenient_string")]
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub parent_agent_id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub agent_label: String,
    #[serde(deserialize_with = "lenient_string")]
    pub task_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub model: Option<String>,
    #[serde(deserialize_with = "lenient_strings")]
    pub task_tags: Vec<String>,
    #[serde(deserialize_with = "lenient_u64")]
    pub tokens_in: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub tokens_out: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub duration_ms: u64,
    #[serde(deserialize_with = "lenient_string")]
    pub status: String,
    #[serde(deserialize_with = "lenient_strings")]
    pub contributes_to: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub transcript_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub agent_transcript_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentStop {
    #[serde(deserialize_with = "lenient_string")]
    pub agent_id: String,
    #[serde(deserialize_with = "lenient_bool")]
    pub stop_hook_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub transcript_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Compaction {
    #[serde(deserialize_with = "lenient_string")]
    pub agent_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub trigger: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_u64")]
    pub pre_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Notification {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub tool_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskCompleted {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeammateIdle {
    #[serde(deserialize_with = "lenient_string")]
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(deserialize_with = "lenient_opt_string")]
    pub agent_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantResponse {
    #[serde(deserialize_with = "lenient_string")]
    pub agent_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub text: String,
    #[serde(deserialize_with = "lenient_strings")]
    pub tool_names: Vec<String>,
    #[serde(deserialize_with = "lenient_u64")]
    pub tokens_in: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub tokens_out: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub cache_read: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub cache_create: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Attribution {
    #[serde(deserialize_with = "lenient_string")]
    pub agent_id: String,
    #[serde(deserialize_with = "lenient_strings")]
    pub tool_use_ids: Vec<String>,
}

/// Kind-specific body of an event, keyed on the wire by `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionStart(SessionStart),
    SessionEnd(SessionEnd),
    UserPrompt(UserPrompt),
    ToolStart(ToolStart),
    ToolEnd(ToolEnd),
    ToolError(ToolError),
    AgentSpawn(AgentSpawn),
    AgentStart(AgentStart),
    AgentComplete(AgentComplete),
    AgentStop(AgentStop),
    Compaction(Compaction),
    Notification(Notification),
    PermissionRequest(PermissionRequest),
    TaskCompleted(TaskCompleted),
    TeammateIdle(TeammateIdle),
    AssistantResponse(AssistantResponse),
    Attribution(Attribution),
    /// A kind this build does not model; every field lands in `HookEvent::extra`.
    #[serde(skip)]
    Other(String),
}

impl EventPayload {
    pub fn event_type(&self) -> &str {
        match self {
            EventPayload::SessionStart(_) => EventType::SessionStart.as_str(),
            EventPayload::SessionEnd(_) => EventType::SessionEnd.as_str(),
            EventPayload::UserPrompt(_) => EventType::UserPrompt.as_str(),
            EventPayload::ToolStart(_) => EventType::ToolStart.as_str(),
            EventPayload::ToolEnd(_) => EventType::ToolEnd.as_str(),
            EventPayload::ToolError(_) => EventType::ToolError.as_str(),
            EventPayload::AgentSpawn(_) => EventType::AgentSpawn.as_str(),
            EventPayload::AgentStart(_) => EventType::AgentStart.as_str(),
            EventPayload::AgentComplete(_) => EventType::AgentComplete.as_str(),
            EventPayload::AgentStop(_) => EventType::AgentStop.as_str(),
            EventPayload::Compaction(_) => EventType::Compaction.as_str(),
            EventPayload::Notification(_) => EventType::Notification.as_str(),
            EventPayload::PermissionRequest(_) => EventType::PermissionRequest.as_str(),
            EventPayload::TaskCompleted(_) => EventType::TaskCompleted.as_str(),
            EventPayload::TeammateIdle(_) => EventType::TeammateIdle.as_str(),
            EventPayload::AssistantResponse(_) => EventType::AssistantResponse.as_str(),
            EventPayload::Attribution(_) => EventType::Attribution.as_str(),
            EventPayload::Other(event_type) => event_type,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        let agent_id = match self {
            EventPayload::SessionStart(body) => &body.agent_id,
            EventPayload::ToolStart(body) => &body.agent_id,
            EventPayload::ToolEnd(body) => &body.agent_id,
            EventPayload::ToolError(body) => &body.agent_id,
            EventPayload::AgentSpawn(body) => &body.agent_id,
            EventPayload::AgentStart(body) => &body.agent_id,
            EventPayload::AgentComplete(body) => &body.agent_id,
            EventPayload::AgentStop(body) => &body.agent_id,
            EventPayload::Compaction(body) => &body.agent_id,
            EventPayload::TeammateIdle(body) => &body.agent_id,
            EventPayload::AssistantResponse(body) => &body.agent_id,
            EventPayload::Attribution(body) => &body.agent_id,
            _ => return None,
        };
        Some(agent_id.as_str()).filter(|value| !value.is_empty())
    }

    fn wire_fields(&self) -> Map<String, Value> {
        if matches!(self, EventPayload::Other(_)) {
            return Map::new();
        }
        match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => fields,
            _ => Map::new(),
        }
    }
}

/// One immutable lifecycle fact emitted by a hook.
#[derive(Debug, Clone, PartialEq)]
pub struct HookEvent {
    pub id: String,
    pub session_id: String,
    pub timestamp: i64,
    pub cwd: Option<String>,
    pub prompt_id: Option<String>,
    pub payload: EventPayload,
    /// Wire fields the payload variant does not model, re-emitted verbatim.
    pub extra: Map<String, Value>,
}

impl HookEvent {
    pub fn new(session_id: impl Into<String>, timestamp: i64, payload: EventPayload) -> Self {
        Self {
            id: new_event_id(),
            session_id: session_id.into(),
            timestamp,
            cwd: None,
            prompt_id: None,
            payload,
            extra: Map::new(),
        }
    }

    pub fn event_type(&self) -> &str {
        self.payload.event_type()
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.payload.agent_id()
    }

    /// Transcript file this event points at, when the hook reported one.
    pub fn transcript_path(&self) -> Option<&str> {
        let modelled = match &self.payload {
            EventPayload::SessionStart(body) => body.transcript_path.as_deref(),
            EventPayload::AgentComplete(body) => body
                .agent_transcript_path
                .as_deref()
                .or(body.transcript_path.as_deref()),
            EventPayload::AgentStop(body) => body.transcript_path.as_deref(),
            _ => None,
        };
        modelled
            .or_else(|| self.extra.get("transcript_path").and_then(Value::as_str))
            .filter(|value| !value.trim().is_empty())
    }

    pub fn from_wire(value: Value) -> Result<Self, EventError> {
        let Value::Object(mut map) = value else {
            return Err(EventError::NotAnObject);
        };

        let event_type = map
            .get("event_type")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
            .ok_or(EventError::MissingField("event_type"))?;
        let timestamp = match map.get("timestamp") {
            None | Some(Value::Null) => return Err(EventError::MissingField("timestamp")),
            Some(value) => parse_wire_timestamp(value)?,
        };

        let payload = if event_type.parse::<EventType>().is_ok() {
            serde_json::from_value::<EventPayload>(Value::Object(map.clone())).map_err(|err| {
                EventError::InvalidPayload {
                    event_type: event_type.clone(),
                    message: err.to_string(),
                }
            })?
        } else {
            EventPayload::Other(event_type)
        };

        let id = take_string(&mut map, "id").unwrap_or_else(new_event_id);
        let session_id = take_string(&mut map, "session_id").unwrap_or_default();
        let cwd = take_string(&mut map, "cwd");
        let prompt_id = take_string(&mut map, "prompt_id");
        let modelled = payload.wire_fields();
        map.retain(|key, _| !ENVELOPE_FIELDS.contains(&key.as_str()) && !modelled.contains_key(key));

        Ok(Self {
            id,
            session_id,
            timestamp,
            cwd,
            prompt_id,
            payload,
            extra: map,
        })
    }

    pub fn to_wire(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        map.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );
        map.insert(
            "event_type".to_string(),
            Value::String(self.event_type().to_string()),
        );
        map.insert("timestamp".to_string(), Value::from(self.timestamp));
        if let Some(cwd) = &self.cwd {
            map.insert("cwd".to_string(), Value::String(cwd.clone()));
        }
        if let Some(prompt_id) = &self.prompt_id {
            map.insert("prompt_id".to_string(), Value::String(prompt_id.clone()));
        }
        for (key, value) in self.payload.wire_fields() {
            map.insert(key, value);
        }
        for (key, value) in &self.extra {
            map.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Value::Object(map)
    }
}

impl Serialize for HookEvent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HookEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        HookEvent::from_wire(value).map_err(serde::de::Error::custom)
    }
}

pub fn new_event_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("evt_{}", &simple[..16])
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Accepts epoch milliseconds (integer, float or numeric string) or RFC 3339.
pub fn parse_wire_timestamp(value: &Value) -> Result<i64, EventError> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float.round() as i64))
            .ok_or_else(|| EventError::InvalidTimestamp(number.to_string())),
        Value::String(text) => {
            let trimmed = text.trim();
            if let Ok(ms) = trimmed.parse::<i64>() {
                return Ok(ms);
            }
            DateTime::parse_from_rfc3339(trimmed)
                .map(|parsed| parsed.with_timezone(&Utc).timestamp_millis())
                .map_err(|_| EventError::InvalidTimestamp(text.clone()))
        }
        other => Err(EventError::InvalidTimestamp(other.to_string())),
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(value)) if !value.trim().is_empty() => Some(value),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => String::new(),
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        other => other.to_string(),
    })
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
            .unwrap_or(0),
        Value::String(text) => text.trim().parse::<u64>().unwrap_or(0),
        _ => 0,
    })
}

fn lenient_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    })
}

/// Unparseable counts become `None`; the raw value stays in `HookEvent::extra`.
fn lenient_opt_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64)),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    })
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(flag) => flag,
        Value::Number(number) => number.as_i64().map(|n| n != 0).unwrap_or(false),
        Value::String(text) => matches!(text.trim().to_lowercase().as_str(), "1" | "true" | "yes"),
        _ => false,
    })
}

fn lenient_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let mut out = Vec::new();
    match value {
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(text) => out.push(text),
                    Value::Number(number) => out.push(number.to_string()),
                    _ => {}
                }
            }
        }
        Value::String(text) if !text.trim().is_empty() => {
            out.extend(
                text.split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(ToString::to_string),
            );
        }
        _ => {}
    }
    Ok(out)
}
