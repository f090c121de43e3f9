//! OTLP/HTTP JSON log payloads built from hook events.

use scry_core::HookEvent;
use serde::Serialize;
use serde_json::{Map, Value};

pub const SERVICE_NAME: &str = "ai-scry";
pub const SCOPE_NAME: &str = "ai-scry.hooks";
pub const BODY_PREFIX: &str = "ai_scry";

const SEVERITY_INFO: u8 = 9;
const ENVELOPE_KEYS: [&str; 3] = ["id", "event_type", "timestamp"];

/// OTLP `AnyValue`; 64-bit integers travel as decimal strings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AnyValue {
    StringValue(String),
    IntValue(String),
    DoubleValue(f64),
    BoolValue(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyValue {
    pub key: String,
    pub value: AnyValue,
}

impl KeyValue {
    fn string(key: &str, value: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            value: AnyValue::StringValue(value.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub time_unix_nano: String,
    pub severity_number: u8,
    pub severity_text: String,
    pub body: AnyValue,
    pub attributes: Vec<KeyValue>,
    pub trace_id: String,
    pub span_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsPayload {
    pub resource_logs: Vec<ResourceLogs>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLogs {
    pub resource: Resource,
    pub scope_logs: Vec<ScopeLogs>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeLogs {
    pub scope: Scope,
    pub log_records: Vec<LogRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scope {
    pub name: String,
}

/// One attribute per event field, in wire order.
///
/// Nested objects expand to `parent_child` keys, arrays collapse into a
/// comma-joined string and nulls are dropped. `id`, `event_type` and
/// `timestamp` are carried elsewhere in the record.
pub fn flatten_attributes(wire: &Map<String, Value>) -> Vec<KeyValue> {
    let mut attributes = Vec::new();
    for (key, value) in wire {
        if ENVELOPE_KEYS.contains(&key.as_str()) {
            continue;
        }
        push_attribute(&mut attributes, key, value);
    }
    attributes
}

fn push_attribute(attributes: &mut Vec<KeyValue>, key: &str, value: &Value) {
    let converted = match value {
        Value::Null => return,
        Value::Bool(flag) => AnyValue::BoolValue(*flag),
        Value::Number(number) => number_value(number),
        Value::String(text) => AnyValue::StringValue(text.clone()),
        Value::Array(items) => AnyValue::StringValue(
            items
                .iter()
                .map(|item| match item {
                    Value::String(text) => text.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Object(children) => {
            for (child, nested) in children {
                push_attribute(attributes, &format!("{key}_{child}"), nested);
            }
            return;
        }
    };
    attributes.push(KeyValue {
        key: key.to_string(),
        value: converted,
    });
}

fn number_value(number: &serde_json::Number) -> AnyValue {
    if let Some(int) = number.as_i64() {
        return AnyValue::IntValue(int.to_string());
    }
    if let Some(int) = number.as_u64() {
        return AnyValue::IntValue(int.to_string());
    }
    let float = number.as_f64().unwrap_or(0.0);
    if float.is_finite() && float.fract() == 0.0 && float.abs() < i64::MAX as f64 {
        AnyValue::IntValue((float as i64).to_string())
    } else {
        AnyValue::DoubleValue(float)
    }
}

pub fn log_record(event: &HookEvent) -> LogRecord {
    let wire = match event.to_wire() {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let mut attributes = vec![KeyValue::string("event_id", event.id.as_str())];
    attributes.extend(flatten_attributes(&wire));
    LogRecord {
        time_unix_nano: (i128::from(event.timestamp) * 1_000_000).to_string(),
        severity_number: SEVERITY_INFO,
        severity_text: "INFO".to_string(),
        body: AnyValue::StringValue(format!("{BODY_PREFIX}.{}", event.event_type())),
        attributes,
        trace_id: String::new(),
        span_id: String::new(),
    }
}

/// Wrap records in the single resource/scope envelope the collector expects.
pub fn logs_payload(records: Vec<LogRecord>, host_name: &str) -> LogsPayload {
    LogsPayload {
        resource_logs: vec![ResourceLogs {
            resource: Resource {
                attributes: vec![
                    KeyValue::string("service.name", SERVICE_NAME),
                    KeyValue::string("host.name", host_name),
                ],
            },
            scope_logs: vec![ScopeLogs {
                scope: Scope {
                    name: SCOPE_NAME.to_string(),
                },
                log_records: records,
            }],
        }],
    }
}

pub fn local_host_name() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scry_core::events::{EventPayload, ToolEnd};
    use serde_json::json;

    fn wire(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn flattening_maps_every_json_kind() {
        let attributes = flatten_attributes(&wire(json!({
            "id": "evt_1",
            "event_type": "tool_end",
            "timestamp": 5,
            "tokens_in": 12,
            "ratio": 0.5,
            "whole": 3.0,
            "has_error": false,
            "tags": ["a", "b"],
            "missing": null,
            "task_data": {"task_type": "task_update", "status": "done", "owner": null}
        })));
        let keys: Vec<&str> = attributes.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "tokens_in",
                "ratio",
                "whole",
                "has_error",
                "tags",
                "task_data_task_type",
                "task_data_status"
            ]
        );
        assert_eq!(attributes[0].value, AnyValue::IntValue("12".to_string()));
        assert_eq!(attributes[1].value, AnyValue::DoubleValue(0.5));
        assert_eq!(attributes[2].value, AnyValue::IntValue("3".to_string()));
        assert_eq!(attributes[3].value, AnyValue::BoolValue(false));
        assert_eq!(attributes[4].value, AnyValue::StringValue("a,b".to_string()));
    }

    #[test]
    fn record_carries_envelope_outside_attributes() {
        let mut event = HookEvent::new(
            "s1",
            1_700_000_000_123,
            EventPayload::ToolEnd(ToolEnd {
                agent_id: "ag_main".to_string(),
                tool_name: "Bash".to_string(),
                duration_ms: 40,
                ..ToolEnd::default()
            }),
        );
        event.cwd = Some("/work".to_string());
        let record = log_record(&event);

        assert_eq!(record.time_unix_nano, "1700000000123000000");
        assert_eq!(record.severity_number, 9);
        assert_eq!(record.body, AnyValue::StringValue("ai_scry.tool_end".to_string()));
        assert_eq!(record.attributes[0].key, "event_id");
        assert_eq!(record.attributes[0].value, AnyValue::StringValue(event.id.clone()));
        assert!(record
            .attributes
            .iter()
            .all(|kv| kv.key != "timestamp" && kv.key != "event_type" && kv.key != "id"));

        let encoded = serde_json::to_value(&record).expect("encode");
        assert_eq!(encoded["severityText"], "INFO");
        assert_eq!(encoded["attributes"][0]["value"]["stringValue"], event.id);
        assert_eq!(encoded["traceId"], "");
    }

    #[test]
    fn payload_names_service_host_and_scope() {
        let payload = logs_payload(Vec::new(), "devbox");
        let encoded = serde_json::to_value(&payload).expect("encode");
        let resource = &encoded["resourceLogs"][0];
        assert_eq!(resource["resource"]["attributes"][0]["key"], "service.name");
        assert_eq!(resource["resource"]["attributes"][0]["value"]["stringValue"], "ai-scry");
        assert_eq!(resource["resource"]["attributes"][1]["value"]["stringValue"], "devbox");
        assert_eq!(resource["scopeLogs"][0]["scope"]["name"], "ai-scry.hooks");
        assert_eq!(resource["scopeLogs"][0]["logRecords"], json!([]));
    }
}
