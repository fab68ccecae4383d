//! Alert events as they arrive from the ingestion side.
//!
//! Alerts are immutable once ingested. They live only inside the pattern
//! mining window and the bounded execution history.

use crate::error::{RemedyError, Result};
use crate::types::Priority;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: String,
    #[serde(default)]
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl Alert {
    pub fn new(alert_type: impl Into<String>, priority: Priority, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            alert_type: alert_type.into(),
            priority,
            timestamp,
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Build an alert from a loosely-shaped JSON object.
    ///
    /// `timestamp` may be an RFC 3339 string or epoch milliseconds. A missing
    /// `id` is generated and a missing `priority` defaults to `medium`.
    pub fn from_value(value: Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| RemedyError::Validation("alert must be a JSON object".into()))?;

        let alert_type = obj
            .get("type")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RemedyError::Validation("alert is missing 'type'".into()))?
            .to_string();

        let timestamp = match obj.get("timestamp") {
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    RemedyError::Validation(format!("alert timestamp '{s}' is not RFC 3339: {e}"))
                })?,
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .ok_or_else(|| {
                    RemedyError::Validation(format!("alert timestamp {n} is out of range"))
                })?,
            _ => {
                return Err(RemedyError::Validation(
                    "alert is missing 'timestamp'".into(),
                ))
            }
        };

        let priority = match obj.get("priority") {
            None | Some(Value::Null) => Priority::default(),
            Some(Value::String(s)) => s.parse()?,
            Some(other) => {
                return Err(RemedyError::Validation(format!(
                    "alert priority must be a string, got {other}"
                )))
            }
        };

        let id = obj
            .get("id")
            .and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(Self {
            id,
            alert_type,
            priority,
            timestamp,
            data: obj.get("data").cloned().unwrap_or(Value::Null),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.alert_type.trim().is_empty() {
            return Err(RemedyError::Validation(format!(
                "alert '{}' has an empty type",
                self.id
            )));
        }
        if self.id.is_empty() {
            return Err(RemedyError::Validation("alert has an empty id".into()));
        }
        Ok(())
    }

    /// Resolve a dotted path (`"cpu.usage"`) inside `data` to a number.
    ///
    /// Numeric strings are accepted; anything else yields `None`.
    pub fn metric(&self, path: &str) -> Option<f64> {
        let mut cur = &self.data;
        for part in path.split('.') {
            cur = match cur {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        match cur {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_accepts_rfc3339_and_defaults() {
        let alert = Alert::from_value(json!({
            "type": "performance",
            "timestamp": "2026-03-01T10:00:00Z",
        }))
        .unwrap();
        assert_eq!(alert.alert_type, "performance");
        assert_eq!(alert.priority, Priority::Medium);
        assert!(!alert.id.is_empty());
    }

    #[test]
    fn from_value_accepts_epoch_millis() {
        let alert = Alert::from_value(json!({
            "id": 7,
            "type": "disk",
            "priority": "critical",
            "timestamp": 1_700_000_000_000i64,
            "data": {"usage": 97.5},
        }))
        .unwrap();
        assert_eq!(alert.id, "7");
        assert_eq!(alert.priority, Priority::Critical);
        assert_eq!(alert.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(alert.metric("usage"), Some(97.5));
    }

    #[test]
    fn from_value_rejects_missing_fields() {
        let no_type = Alert::from_value(json!({"timestamp": "2026-03-01T10:00:00Z"}));
        assert!(matches!(no_type, Err(RemedyError::Validation(_))));

        let no_ts = Alert::from_value(json!({"type": "cpu"}));
        assert!(matches!(no_ts, Err(RemedyError::Validation(_))));

        let bad_priority = Alert::from_value(json!({
            "type": "cpu",
            "timestamp": "2026-03-01T10:00:00Z",
            "priority": "urgent",
        }));
        assert!(bad_priority.is_err());
    }

    #[test]
    fn metric_resolves_nested_paths() {
        let alert = Alert::new("cpu", Priority::High, Utc::now()).with_data(json!({
            "host": {"cpu": {"usage": "88.5"}},
            "samples": [1, 2, 3],
        }));
        assert_eq!(alert.metric("host.cpu.usage"), Some(88.5));
        assert_eq!(alert.metric("samples.2"), Some(3.0));
        assert_eq!(alert.metric("host.memory"), None);
        assert_eq!(alert.metric("host"), None);
    }
}
