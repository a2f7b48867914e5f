use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::notifications::record::NotificationKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Success,
    Info,
    Warning,
    Error,
    Loading,
    /// Neutral rendering for kinds the presenter has no style for.
    Open,
}

impl From<&NotificationKind> for AlertKind {
    fn from(kind: &NotificationKind) -> Self {
        match kind {
            NotificationKind::Success => AlertKind::Success,
            NotificationKind::Info => AlertKind::Info,
            NotificationKind::Warning => AlertKind::Warning,
            NotificationKind::Error => AlertKind::Error,
            NotificationKind::Other(_) => AlertKind::Open,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Top,
    TopLeft,
    #[default]
    TopRight,
    Bottom,
    BottomLeft,
    BottomRight,
}

/// A transient alert. `duration: None` keeps it on screen until replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub description: Option<String>,
    /// Alerts sharing a key replace each other in place.
    pub key: String,
    pub duration: Option<Duration>,
    pub placement: Placement,
}

/// Renders transient alerts. Implemented by the UI layer.
pub trait AlertPresenter: Send + Sync {
    fn show(&self, alert: Alert);
}

/// Presenter for headless use: alerts become log lines.
#[derive(Debug, Default, Clone)]
pub struct TracingPresenter;

impl AlertPresenter for TracingPresenter {
    fn show(&self, alert: Alert) {
        tracing::info!(
            event = "alert_shown",
            kind = ?alert.kind,
            key = %alert.key,
            placement = ?alert.placement,
            description = alert.description.as_deref().unwrap_or(""),
            "{}",
            alert.message
        );
    }
}
