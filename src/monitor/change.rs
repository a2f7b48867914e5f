use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::MonitorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    /// Append to a feedback/comment table.
    Feedback,
}

impl Operation {
    /// Maps a provider event kind for a primary table.
    pub fn from_event_kind(kind: &str) -> Option<Self> {
        match kind.to_ascii_uppercase().as_str() {
            "INSERT" => Some(Operation::Insert),
            "UPDATE" => Some(Operation::Update),
            "DELETE" => Some(Operation::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Feedback => "FEEDBACK",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-neutral description of one remote mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseChange {
    pub table: String,
    pub operation: Operation,
    pub record: Value,
    pub old_record: Option<Value>,
    pub user_id: Option<String>,
}

/// A change as the provider delivers it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChangeEvent {
    pub table: String,
    pub event_type: String,
    pub new: Value,
    pub old: Value,
}

impl RawChangeEvent {
    pub fn new(table: impl Into<String>, event_type: impl Into<String>, new: Value) -> Self {
        Self {
            table: table.into(),
            event_type: event_type.into(),
            new,
            old: Value::Null,
        }
    }

    pub fn with_old(mut self, old: Value) -> Self {
        self.old = old;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChangeError {
    #[error("Unrecognized change operation '{kind}' on table {table}")]
    UnrecognizedOperation { table: String, kind: String },
    #[error("Malformed change record on table {table}")]
    MalformedRecord { table: String },
}

impl ChangeError {
    pub fn table(&self) -> &str {
        match self {
            ChangeError::UnrecognizedOperation { table, .. } => table,
            ChangeError::MalformedRecord { table } => table,
        }
    }
}

/// Which record fields identify the user behind a change.
#[derive(Debug, Clone)]
pub struct UserFields {
    pub owner_fields: Vec<String>,
    pub user_field: String,
    pub sender_field: String,
}

impl UserFields {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            owner_fields: config.owner_fields(),
            user_field: config.user_field().to_string(),
            sender_field: config.sender_field().to_string(),
        }
    }
}

impl Default for UserFields {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }
}

pub fn normalize_primary(
    event: RawChangeEvent,
    fields: &UserFields,
) -> Result<DatabaseChange, ChangeError> {
    let operation = Operation::from_event_kind(&event.event_type).ok_or_else(|| {
        ChangeError::UnrecognizedOperation {
            table: event.table.clone(),
            kind: event.event_type.clone(),
        }
    })?;
    let record = record_value(&event.table, event.new)?;
    let user_id = fields
        .owner_fields
        .iter()
        .chain(std::iter::once(&fields.user_field))
        .find_map(|field| user_field(&record, field));
    Ok(DatabaseChange {
        table: event.table,
        operation,
        record,
        old_record: previous_value(event.old),
        user_id,
    })
}

/// Feedback feeds are subscribed for inserts only; anything else is an error.
/// The change is attributed to `primary_table`.
pub fn normalize_feedback(
    event: RawChangeEvent,
    primary_table: &str,
    fields: &UserFields,
) -> Result<DatabaseChange, ChangeError> {
    if Operation::from_event_kind(&event.event_type) != Some(Operation::Insert) {
        return Err(ChangeError::UnrecognizedOperation {
            table: event.table,
            kind: event.event_type,
        });
    }
    let record = record_value(&event.table, event.new)?;
    let user_id = user_field(&record, &fields.sender_field);
    Ok(DatabaseChange {
        table: primary_table.to_string(),
        operation: Operation::Feedback,
        record,
        old_record: None,
        user_id,
    })
}

fn record_value(table: &str, value: Value) -> Result<Value, ChangeError> {
    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Ok(Value::Object(Map::new())),
        _ => Err(ChangeError::MalformedRecord {
            table: table.to_string(),
        }),
    }
}

fn previous_value(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(ref map) if map.is_empty() => None,
        other => Some(other),
    }
}

fn user_field(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(value) if !value.is_empty() => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn insert_takes_owner_before_user_field() {
        let event = RawChangeEvent::new(
            "hr_meetings",
            "INSERT",
            json!({"id": 1, "responsible_bdm": "u1", "user_id": "u9"}),
        )
        .with_old(json!({}));
        let change = normalize_primary(event, &UserFields::default()).unwrap();
        assert_eq!(change.operation, Operation::Insert);
        assert_eq!(change.user_id.as_deref(), Some("u1"));
        assert_eq!(change.old_record, None);
    }

    #[test]
    fn update_falls_back_to_user_field_then_none() {
        let fields = UserFields::default();
        let event = RawChangeEvent::new("tasks", "update", json!({"id": 2, "user_id": 42}))
            .with_old(json!({"id": 2}));
        let change = normalize_primary(event, &fields).unwrap();
        assert_eq!(change.operation, Operation::Update);
        assert_eq!(change.user_id.as_deref(), Some("42"));
        assert_eq!(change.old_record, Some(json!({"id": 2})));

        let event = RawChangeEvent::new("tasks", "DELETE", Value::Null).with_old(json!({"id": 2}));
        let change = normalize_primary(event, &fields).unwrap();
        assert_eq!(change.operation, Operation::Delete);
        assert_eq!(change.user_id, None);
        assert_eq!(change.record, json!({}));
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let event = RawChangeEvent::new("tasks", "TRUNCATE", json!({}));
        let err = normalize_primary(event, &UserFields::default()).unwrap_err();
        assert_eq!(
            err,
            ChangeError::UnrecognizedOperation {
                table: "tasks".to_string(),
                kind: "TRUNCATE".to_string(),
            }
        );
    }

    #[test]
    fn feedback_uses_sender_and_primary_table() {
        let event = RawChangeEvent::new(
            "hr_meetings_feedback",
            "INSERT",
            json!({"sender_id": "u2", "responsible_bdm": "u1", "message": "hi"}),
        );
        let change = normalize_feedback(event, "hr_meetings", &UserFields::default()).unwrap();
        assert_eq!(change.table, "hr_meetings");
        assert_eq!(change.operation, Operation::Feedback);
        assert_eq!(change.user_id.as_deref(), Some("u2"));
        assert_eq!(change.old_record, None);
    }

    #[test]
    fn feedback_update_is_rejected() {
        let event = RawChangeEvent::new("hr_meetings_feedback", "UPDATE", json!({}));
        assert!(normalize_feedback(event, "hr_meetings", &UserFields::default()).is_err());
    }

    #[test]
    fn scalar_record_is_malformed() {
        let event = RawChangeEvent::new("tasks", "INSERT", json!("oops"));
        let err = normalize_primary(event, &UserFields::default()).unwrap_err();
        assert_eq!(err.table(), "tasks");
    }
}
