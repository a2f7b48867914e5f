use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use feedbus::config::NotificationsConfig;
use feedbus::notifications::record::{NewNotification, NotificationKind};
use feedbus::notifications::storage::{
    FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, StorageError, StorageResult,
};
use feedbus::notifications::store::NotificationStore;
use serde_json::json;

struct BrokenStorage;

impl KeyValueStore for BrokenStorage {
    fn get(&self, _key: &str) -> StorageResult<Option<String>> {
        Err(StorageError::Unavailable("disk gone".to_string()))
    }

    fn set(&self, _key: &str, _value: &str) -> StorageResult<()> {
        Err(StorageError::Unavailable("disk gone".to_string()))
    }
}

fn memory_store() -> (NotificationStore, MemoryKeyValueStore) {
    let kv = MemoryKeyValueStore::new();
    let store = NotificationStore::init(Arc::new(kv.clone()), &NotificationsConfig::default());
    (store, kv)
}

#[test]
fn add_appends_unread_record_with_fresh_id() {
    let (store, _) = memory_store();
    let first = store.add(
        NewNotification::new("Meeting created")
            .kind(NotificationKind::Success)
            .description("HR sync")
            .meta(json!({"table": "hr_meetings"})),
    );
    let second = store.add(NewNotification::new("Defaults to info"));
    assert_ne!(first, second);

    let records = store.get();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, second);
    assert_eq!(records[0].kind, NotificationKind::Info);
    let created = records.iter().find(|r| r.id == first).unwrap();
    assert_eq!(created.kind, NotificationKind::Success);
    assert_eq!(created.title, "Meeting created");
    assert_eq!(created.description.as_deref(), Some("HR sync"));
    assert_eq!(created.meta, Some(json!({"table": "hr_meetings"})));
    assert!(!created.read);
}

#[test]
fn unread_count_tracks_read_flags() {
    let (store, _) = memory_store();
    let a = store.add(NewNotification::new("a"));
    store.add(NewNotification::new("b"));
    store.add(NewNotification::new("c"));
    assert_eq!(store.unread_count(), 3);

    store.mark_read(&a, true);
    assert_eq!(store.unread_count(), 2);
    assert_eq!(
        store.unread_count(),
        store.get().iter().filter(|r| !r.read).count()
    );

    store.mark_read(&a, false);
    assert_eq!(store.unread_count(), 3);

    store.mark_read("missing", true);
    assert_eq!(store.unread_count(), 3);
}

#[test]
fn mark_all_read_keeps_ids_and_timestamps() {
    let (store, _) = memory_store();
    for title in ["a", "b", "c"] {
        store.add(NewNotification::new(title));
    }
    let before: Vec<_> = store
        .get()
        .into_iter()
        .map(|r| (r.id, r.created_at))
        .collect();
    store.mark_all_read();
    assert_eq!(store.unread_count(), 0);
    let after: Vec<_> = store
        .get()
        .into_iter()
        .map(|r| (r.id, r.created_at))
        .collect();
    assert_eq!(before, after);
}

#[test]
fn remove_deletes_only_the_target() {
    let (store, _) = memory_store();
    let ids: Vec<String> = ["a", "b", "c", "d"]
        .iter()
        .map(|title| store.add(NewNotification::new(*title)))
        .collect();
    let before: Vec<String> = store.get().into_iter().map(|r| r.id).collect();

    store.remove(&ids[1]);
    store.remove("missing");

    let after: Vec<String> = store.get().into_iter().map(|r| r.id).collect();
    let expected: Vec<String> = before.into_iter().filter(|id| id != &ids[1]).collect();
    assert_eq!(after, expected);

    store.clear();
    assert!(store.get().is_empty());
}

#[test]
fn reload_restores_the_same_records() {
    let kv = MemoryKeyValueStore::new();
    let config = NotificationsConfig::default();
    let store = NotificationStore::init(Arc::new(kv.clone()), &config);
    let read_id = store.add(NewNotification::new("a"));
    store.add(NewNotification::new("b").meta(json!({"n": 1})));
    store.mark_read(&read_id, true);
    let before = store.get();
    assert!(kv.raw(config.storage_key()).is_some());

    let reloaded = NotificationStore::init(Arc::new(kv), &config);
    assert_eq!(reloaded.get(), before);

    let next = reloaded.add(NewNotification::new("c"));
    assert_eq!(reloaded.get()[0].id, next);
}

#[test]
fn corrupt_or_unavailable_storage_yields_empty_log() {
    let kv = MemoryKeyValueStore::new();
    let config = NotificationsConfig::default();
    kv.set(config.storage_key(), "{not json").unwrap();
    let store = NotificationStore::init(Arc::new(kv), &config);
    assert!(store.get().is_empty());

    let broken = NotificationStore::init(Arc::new(BrokenStorage), &config);
    assert!(broken.get().is_empty());
    let calls = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&calls);
    let _handle = broken.on_change(move |_, _| *counter.lock().unwrap() += 1);
    broken.add(NewNotification::new("still works"));
    assert_eq!(broken.unread_count(), 1);
    assert_eq!(*calls.lock().unwrap(), 2);
}

#[test]
fn observers_get_initial_state_and_one_call_per_mutation() {
    let (store, _) = memory_store();
    store.add(NewNotification::new("existing"));
    let seen: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = store.on_change(move |records, unread| {
        sink.lock().unwrap().push((records.len(), unread));
    });
    assert_eq!(*seen.lock().unwrap(), vec![(1, 1)]);

    store.add(NewNotification::new("a"));
    store.add(NewNotification::new("b"));
    store.mark_all_read();
    store.mark_read("missing", true);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(1, 1), (2, 2), (3, 3), (3, 0)]
    );

    handle.unsubscribe();
    store.clear();
    assert_eq!(seen.lock().unwrap().len(), 4);
}

#[test]
fn observer_sees_persisted_state() {
    let kv = MemoryKeyValueStore::new();
    let config = NotificationsConfig::default();
    let store = NotificationStore::init(Arc::new(kv.clone()), &config);
    let mismatches = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&mismatches);
    let key = config.storage_key().to_string();
    let _handle = store.on_change(move |records, _| {
        let persisted = kv.raw(&key).unwrap_or_else(|| "[]".to_string());
        let persisted: Vec<serde_json::Value> = serde_json::from_str(&persisted).unwrap();
        if persisted.len() != records.len() {
            *counter.lock().unwrap() += 1;
        }
    });
    store.add(NewNotification::new("a"));
    store.add(NewNotification::new("b"));
    assert_eq!(*mismatches.lock().unwrap(), 0);
}

#[test]
fn dispose_drops_observers() {
    let (store, _) = memory_store();
    let calls = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&calls);
    let _handle = store.on_change(move |_, _| *counter.lock().unwrap() += 1);
    store.dispose();
    store.add(NewNotification::new("a"));
    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(store.get().len(), 1);
}

#[test]
fn max_records_prunes_oldest_read_first() {
    let config = NotificationsConfig {
        max_records: Some(3),
        ..Default::default()
    };
    let store = NotificationStore::init(Arc::new(MemoryKeyValueStore::new()), &config);
    let keep_unread = store.add(NewNotification::new("old unread"));
    let read = store.add(NewNotification::new("old read"));
    store.mark_read(&read, true);
    store.add(NewNotification::new("c"));
    store.add(NewNotification::new("d"));

    let ids: HashSet<String> = store.get().into_iter().map(|r| r.id).collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.contains(&keep_unread));
    assert!(!ids.contains(&read));
}

#[tokio::test]
async fn watch_receiver_follows_mutations() {
    let (store, _) = memory_store();
    let mut rx = store.watch();
    assert_eq!(rx.borrow().unread, 0);
    store.add(NewNotification::new("a"));
    rx.changed().await.unwrap();
    let snapshot = rx.borrow_and_update().clone();
    assert_eq!(snapshot.records.len(), 1);
    assert_eq!(snapshot.unread, 1);
}

#[test]
fn file_storage_survives_restart() {
    let dir = std::env::temp_dir().join(format!("feedbus-store-{}", uuid::Uuid::new_v4()));
    let config = NotificationsConfig::default();
    let store = NotificationStore::init(Arc::new(FileKeyValueStore::new(&dir)), &config);
    let id = store.add(NewNotification::new("persisted").kind(NotificationKind::Warning));

    let reopened = NotificationStore::init(Arc::new(FileKeyValueStore::new(&dir)), &config);
    let records = reopened.get();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].kind, NotificationKind::Warning);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn slow_observer_ends_on_the_latest_log() {
    let (store, _) = memory_store();
    let last_seen = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&last_seen);
    let _handle = store.on_change(move |records, _| {
        if records.len() == 1 {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        *sink.lock().unwrap() = records.len();
    });

    let first = std::thread::spawn({
        let store = store.clone();
        move || store.add(NewNotification::new("first"))
    });
    std::thread::sleep(std::time::Duration::from_millis(10));
    let second = std::thread::spawn({
        let store = store.clone();
        move || store.add(NewNotification::new("second"))
    });
    first.join().unwrap();
    second.join().unwrap();

    assert_eq!(store.get().len(), 2);
    assert_eq!(*last_seen.lock().unwrap(), 2);
}

#[test]
fn observer_may_add_from_inside_a_callback() {
    let (store, kv) = memory_store();
    let views = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&views);
    let inner = store.clone();
    let _handle = store.on_change(move |records, _| {
        sink.lock().unwrap().push(records.len());
        if records.first().is_some_and(|r| r.title == "Import failed") {
            inner.add(NewNotification::new("Retry scheduled"));
        }
    });

    store.add(NewNotification::new("Import failed").kind(NotificationKind::Error));

    assert_eq!(*views.lock().unwrap(), vec![0, 1, 2]);
    let titles: Vec<_> = store.get().into_iter().map(|r| r.title).collect();
    assert_eq!(titles, vec!["Retry scheduled", "Import failed"]);
    let persisted: Vec<serde_json::Value> =
        serde_json::from_str(&kv.raw("notifications.v1").unwrap()).unwrap();
    assert_eq!(persisted.len(), 2);
}
