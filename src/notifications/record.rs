use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of a notification. The four named kinds are the ones the
/// presenter knows how to render; anything else is carried verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationKind {
    Success,
    #[default]
    Info,
    Warning,
    Error,
    Other(String),
}

impl NotificationKind {
    pub fn as_str(&self) -> &str {
        match self {
            NotificationKind::Success => "success",
            NotificationKind::Info => "info",
            NotificationKind::Warning => "warning",
            NotificationKind::Error => "error",
            NotificationKind::Other(kind) => kind.as_str(),
        }
    }
}

impl From<String> for NotificationKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "success" => NotificationKind::Success,
            "info" => NotificationKind::Info,
            "warning" => NotificationKind::Warning,
            "error" => NotificationKind::Error,
            _ => NotificationKind::Other(value),
        }
    }
}

impl From<&str> for NotificationKind {
    fn from(value: &str) -> Self {
        NotificationKind::from(value.to_string())
    }
}

impl From<NotificationKind> for String {
    fn from(kind: NotificationKind) -> Self {
        match kind {
            NotificationKind::Other(kind) => kind,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub read: bool,
    /// Insertion sequence, breaks `created_at` ties.
    #[serde(default)]
    pub seq: u64,
}

/// Input to `NotificationStore::add`. A missing kind is stored as `info`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewNotification {
    pub kind: Option<NotificationKind>,
    pub title: String,
    pub description: Option<String>,
    pub meta: Option<Value>,
}

impl NewNotification {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: NotificationKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// What observers receive: the log ordered newest first plus its unread count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationSnapshot {
    pub records: Vec<NotificationRecord>,
    pub unread: usize,
}

impl NotificationSnapshot {
    pub(crate) fn from_records(records: &[NotificationRecord]) -> Self {
        let mut records = records.to_vec();
        sort_newest_first(&mut records);
        let unread = records.iter().filter(|record| !record.read).count();
        Self { records, unread }
    }
}

pub(crate) fn sort_newest_first(records: &mut [NotificationRecord]) {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.seq.cmp(&a.seq))
    });
}
