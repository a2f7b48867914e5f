use std::fmt::Display;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::config::{Config, MonitorConfig};
use crate::monitor::change::{ChangeError, DatabaseChange, Operation};
use crate::notifications::classify::{ChangeDeduplicator, classify};
use crate::notifications::presenter::{Alert, AlertKind, AlertPresenter, Placement};
use crate::notifications::record::{NewNotification, NotificationKind};
use crate::notifications::store::NotificationStore;

#[derive(Debug, Clone, PartialEq)]
pub struct AlertOptions {
    pub title: String,
    pub description: Option<String>,
    pub key: Option<String>,
    pub duration: Option<Duration>,
    pub placement: Option<Placement>,
    /// Also append to the notification log.
    pub log: bool,
    pub meta: Option<Value>,
}

impl AlertOptions {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            key: None,
            duration: None,
            placement: None,
            log: true,
            meta: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = Some(placement);
        self
    }

    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn without_log(mut self) -> Self {
        self.log = false;
        self
    }
}

/// Titles for the three states of [`Notifier::promise`].
#[derive(Debug, Clone, PartialEq)]
pub struct PromiseMessages {
    pub loading: String,
    pub success: String,
    pub error: String,
    pub meta: Option<Value>,
}

impl PromiseMessages {
    pub fn new(
        loading: impl Into<String>,
        success: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            loading: loading.into(),
            success: success.into(),
            error: error.into(),
            meta: None,
        }
    }

    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Entry point for everything user-facing: shows transient alerts through the
/// presenter and records them in the notification log.
#[derive(Clone)]
pub struct Notifier {
    store: NotificationStore,
    presenter: Arc<dyn AlertPresenter>,
    dedup: Arc<ChangeDeduplicator>,
    monitor: Arc<MonitorConfig>,
    self_user_id: Option<Arc<String>>,
    default_duration: Duration,
    placement: Placement,
}

impl Notifier {
    pub fn new(
        store: NotificationStore,
        presenter: Arc<dyn AlertPresenter>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            presenter,
            dedup: Arc::new(ChangeDeduplicator::new(
                config.notifications.dedup_window(),
            )),
            monitor: Arc::new(config.monitor.clone()),
            self_user_id: config.notifications.self_user_id.clone().map(Arc::new),
            default_duration: config.notifications.default_duration(),
            placement: config.notifications.placement(),
        }
    }

    pub fn store(&self) -> &NotificationStore {
        &self.store
    }

    /// Shows an alert and, unless `log` is off, records it. Returns the
    /// record id when one was written.
    pub fn open(&self, kind: NotificationKind, options: AlertOptions) -> Option<String> {
        self.presenter.show(Alert {
            kind: AlertKind::from(&kind),
            message: options.title.clone(),
            description: options.description.clone(),
            key: options.key.unwrap_or_else(new_alert_key),
            duration: Some(options.duration.unwrap_or(self.default_duration)),
            placement: options.placement.unwrap_or(self.placement),
        });
        if !options.log {
            return None;
        }
        Some(self.store.add(NewNotification {
            kind: Some(kind),
            title: options.title,
            description: options.description,
            meta: options.meta,
        }))
    }

    pub fn success(&self, options: AlertOptions) -> Option<String> {
        self.open(NotificationKind::Success, options)
    }

    pub fn info(&self, options: AlertOptions) -> Option<String> {
        self.open(NotificationKind::Info, options)
    }

    pub fn warning(&self, options: AlertOptions) -> Option<String> {
        self.open(NotificationKind::Warning, options)
    }

    pub fn error(&self, options: AlertOptions) -> Option<String> {
        self.open(NotificationKind::Error, options)
    }

    /// Tracks `operation` with one alert that goes from loading to success or
    /// error in place. The outcome is logged; a failure is returned unchanged.
    pub async fn promise<F, T, E>(&self, operation: F, messages: PromiseMessages) -> Result<T, E>
    where
        F: IntoFuture<Output = Result<T, E>>,
        E: Display,
    {
        let key = new_alert_key();
        self.presenter.show(Alert {
            kind: AlertKind::Loading,
            message: messages.loading.clone(),
            description: None,
            key: key.clone(),
            duration: None,
            placement: self.placement,
        });
        let result = operation.await;
        let (kind, title, description) = match &result {
            Ok(_) => (NotificationKind::Success, messages.success, None),
            Err(err) => (
                NotificationKind::Error,
                messages.error,
                Some(err.to_string()),
            ),
        };
        let mut options = AlertOptions::new(title).key(key);
        options.description = description;
        options.meta = messages.meta;
        self.open(kind, options);
        result
    }

    /// Logs a remote change. Changes made by this client are logged without
    /// an alert, and its own comments are skipped entirely. Repeats of the
    /// same record change inside the dedup window are dropped.
    pub fn database_change(&self, change: DatabaseChange) -> Option<String> {
        let own = match (&self.self_user_id, &change.user_id) {
            (Some(me), Some(actor)) => me.as_str() == actor.as_str(),
            _ => false,
        };
        if own && change.operation == Operation::Feedback {
            tracing::debug!(
                event = "change_skipped",
                table = %change.table,
                reason = "own_feedback",
                "ignoring own comment"
            );
            return None;
        }
        let id_field = self.monitor.record_id_field();
        if !self.dedup.admit(&change, id_field) {
            tracing::debug!(
                event = "change_skipped",
                table = %change.table,
                operation = %change.operation,
                reason = "duplicate",
                "ignoring repeated change"
            );
            return None;
        }
        let label = self.monitor.label_for(&change.table);
        let classification = classify(&change, &label, id_field);
        let meta = serde_json::to_value(&change).ok();
        let mut options = AlertOptions::new(classification.title);
        options.description = classification.description;
        options.meta = meta;
        if own {
            return Some(self.store.add(NewNotification {
                kind: Some(classification.kind),
                title: options.title,
                description: options.description,
                meta: options.meta,
            }));
        }
        self.open(classification.kind, options)
    }

    /// Surfaces a change that could not be normalised.
    pub fn change_error(&self, err: &ChangeError) -> Option<String> {
        tracing::warn!(
            event = "change_rejected",
            table = %err.table(),
            error = %err,
            "unrecognized change event"
        );
        self.error(
            AlertOptions::new(format!("Unreadable change on {}", err.table()))
                .description(err.to_string())
                .meta(json!({ "table": err.table() })),
        )
    }
}

fn new_alert_key() -> String {
    format!("alert:{}", uuid::Uuid::new_v4())
}
