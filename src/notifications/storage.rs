use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::NotificationsConfig;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Client-scoped string key-value storage that survives restarts.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
}

/// One file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    dir: Arc<PathBuf>,
}

impl FileKeyValueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Arc::new(dir.into()),
        }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Readers only ever see a complete file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryKeyValueStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.inner.lock().ok()?.get(key).cloned()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let map = self
            .inner
            .lock()
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut map = self
            .inner
            .lock()
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// File-backed storage when `storage_dir` is set, otherwise memory only.
pub fn open_storage(config: &NotificationsConfig) -> Arc<dyn KeyValueStore> {
    match config.storage_dir.as_deref() {
        Some(dir) => Arc::new(FileKeyValueStore::new(dir)),
        None => Arc::new(MemoryKeyValueStore::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trips_and_sanitizes_keys() {
        let dir = std::env::temp_dir().join(format!("feedbus-kv-{}", uuid::Uuid::new_v4()));
        let store = FileKeyValueStore::new(&dir);
        assert!(store.get("notifications/v1").unwrap().is_none());
        store.set("notifications/v1", "[]").unwrap();
        assert_eq!(store.get("notifications/v1").unwrap().as_deref(), Some("[]"));
        assert!(dir.join("notifications_v1.json").exists());
        let _ = fs::remove_dir_all(dir);
    }
}
