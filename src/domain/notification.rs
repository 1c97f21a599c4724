use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw change pushed by the external event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEvent {
    pub path: String,
    pub data: serde_json::Value,
    pub event_type: String,
}

/// What notification subscribers receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// Only `put` events below the root carrying a truthy payload become notifications.
    pub fn from_source(event: &SourceEvent, now: DateTime<Utc>) -> Option<Self> {
        if event.event_type != "put" || !is_truthy(&event.data) {
            return None;
        }
        let id = event.path.trim_start_matches('/');
        if id.is_empty() {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            data: event.data.clone(),
            timestamp: now,
        })
    }
}

/// Null, false, zero, "" and empty containers carry nothing worth announcing.
fn is_truthy(value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}
