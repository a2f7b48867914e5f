use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::notifications::presenter::Placement;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config read failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("Config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Config invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.monitor.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct NotificationsConfig {
    pub storage_dir: Option<String>,
    pub storage_key: Option<String>,
    pub max_records: Option<usize>,
    pub default_duration_ms: Option<u64>,
    pub placement: Option<Placement>,
    pub self_user_id: Option<String>,
    pub dedup_window_ms: Option<u64>,
}

impl NotificationsConfig {
    pub fn storage_key(&self) -> &str {
        self.storage_key.as_deref().unwrap_or("notifications.v1")
    }

    /// Zero (the default) means unbounded.
    pub fn max_records(&self) -> usize {
        self.max_records.unwrap_or(0)
    }

    pub fn default_duration(&self) -> Duration {
        Duration::from_millis(self.default_duration_ms.unwrap_or(4500))
    }

    pub fn placement(&self) -> Placement {
        self.placement.unwrap_or_default()
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms.unwrap_or(2000))
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct MonitorConfig {
    #[serde(default)]
    pub tables: Vec<String>,
    /// Primary table -> its feedback/comment table.
    #[serde(default)]
    pub feedback: HashMap<String, String>,
    pub owner_fields: Option<Vec<String>>,
    pub user_field: Option<String>,
    pub sender_field: Option<String>,
    pub record_id_field: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub retry_max_attempts: Option<usize>,
    pub retry_base_backoff_ms: Option<u64>,
    pub retry_max_backoff_ms: Option<u64>,
}

impl MonitorConfig {
    pub fn owner_fields(&self) -> Vec<String> {
        self.owner_fields.clone().unwrap_or_else(|| {
            vec![
                "responsible_bdm".to_string(),
                "assigned_to".to_string(),
                "owner_id".to_string(),
            ]
        })
    }

    pub fn user_field(&self) -> &str {
        self.user_field.as_deref().unwrap_or("user_id")
    }

    pub fn sender_field(&self) -> &str {
        self.sender_field.as_deref().unwrap_or("sender_id")
    }

    pub fn record_id_field(&self) -> &str {
        self.record_id_field.as_deref().unwrap_or("id")
    }

    pub fn label_for(&self, table: &str) -> String {
        self.labels
            .get(table)
            .cloned()
            .unwrap_or_else(|| table.replace('_', " "))
    }

    /// Primary table for a configured feedback table. Loaded configs map
    /// each feedback table to one primary; otherwise the first by name wins.
    pub fn primary_for_feedback(&self, feedback_table: &str) -> Option<&str> {
        self.feedback
            .iter()
            .filter(|(_, feedback)| feedback.as_str() == feedback_table)
            .map(|(primary, _)| primary.as_str())
            .min()
    }

    /// Rejects a feedback table shared by several primary tables.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut owners: HashMap<&str, &str> = HashMap::new();
        for (primary, feedback) in &self.feedback {
            if let Some(other) = owners.insert(feedback.as_str(), primary.as_str()) {
                let (first, second) = if other < primary.as_str() {
                    (other, primary.as_str())
                } else {
                    (primary.as_str(), other)
                };
                return Err(ConfigError::Invalid(format!(
                    "feedback table {feedback} is configured for both {first} and {second}"
                )));
            }
        }
        Ok(())
    }

    pub fn retry_max_attempts(&self) -> usize {
        self.retry_max_attempts.unwrap_or(5)
    }

    pub fn retry_base_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_base_backoff_ms.unwrap_or(500))
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms.unwrap_or(30_000))
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct LoggingConfig {
    pub level: Option<String>,
}

impl LoggingConfig {
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }
}
