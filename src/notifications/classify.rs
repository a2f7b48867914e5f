use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

use crate::monitor::change::{DatabaseChange, Operation};
use crate::notifications::record::NotificationKind;

const PREVIEW_CHARS: usize = 120;
const DEDUP_SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: NotificationKind,
    pub title: String,
    pub description: Option<String>,
}

/// Turns a change into user-facing text. `label` is the display name of the
/// table, `id_field` the record field holding its identifier.
pub fn classify(change: &DatabaseChange, label: &str, id_field: &str) -> Classification {
    let reference = record_reference(change, id_field)
        .map(|id| format!(" #{id}"))
        .unwrap_or_default();
    let actor = change.user_id.as_deref();
    match change.operation {
        Operation::Insert => Classification {
            kind: NotificationKind::Success,
            title: format!("New {label} record"),
            description: Some(match actor {
                Some(user) => format!("Record{reference} was added by {user}"),
                None => format!("Record{reference} was added"),
            }),
        },
        Operation::Update => Classification {
            kind: NotificationKind::Info,
            title: format!("{} updated", capitalize(label)),
            description: Some(match actor {
                Some(user) => format!("Record{reference} was changed by {user}"),
                None => format!("Record{reference} was changed"),
            }),
        },
        Operation::Delete => Classification {
            kind: NotificationKind::Warning,
            title: format!("{} record removed", capitalize(label)),
            description: Some(format!("Record{reference} was deleted")),
        },
        Operation::Feedback => {
            let who = actor.unwrap_or("Someone");
            let description = match message_preview(&change.record) {
                Some(preview) => format!("{who} commented: {preview}"),
                None => format!("{who} left a comment"),
            };
            Classification {
                kind: NotificationKind::Info,
                title: format!("New comment on {label}"),
                description: Some(description),
            }
        }
    }
}

fn record_reference(change: &DatabaseChange, id_field: &str) -> Option<String> {
    let value = change.record.get(id_field).or_else(|| {
        change
            .old_record
            .as_ref()
            .and_then(|record| record.get(id_field))
    })?;
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn message_preview(record: &Value) -> Option<String> {
    let text = ["message", "content", "comment", "body"]
        .iter()
        .find_map(|field| record.get(*field).and_then(Value::as_str))?
        .trim();
    if text.is_empty() {
        return None;
    }
    if text.chars().count() <= PREVIEW_CHARS {
        return Some(text.to_string());
    }
    let cut: String = text.chars().take(PREVIEW_CHARS).collect();
    Some(format!("{cut}…"))
}

fn capitalize(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Suppresses repeats of the same (table, operation, record id) inside a window.
#[derive(Debug)]
pub struct ChangeDeduplicator {
    window: Duration,
    seen: DashMap<(String, Operation, String), Instant>,
}

impl ChangeDeduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: DashMap::new(),
        }
    }

    /// True when the change should be surfaced. Changes without an id are
    /// never deduplicated.
    pub fn admit(&self, change: &DatabaseChange, id_field: &str) -> bool {
        if self.window.is_zero() {
            return true;
        }
        let Some(id) = record_reference(change, id_field) else {
            return true;
        };
        let now = Instant::now();
        if self.seen.len() > DEDUP_SWEEP_THRESHOLD {
            self.seen
                .retain(|_, last| now.duration_since(*last) < self.window);
        }
        let key = (change.table.clone(), change.operation, id);
        let mut admitted = true;
        self.seen
            .entry(key)
            .and_modify(|last| {
                if now.duration_since(*last) < self.window {
                    admitted = false;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);
        admitted
    }
}
