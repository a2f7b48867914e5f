use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;

use crate::config::NotificationsConfig;
use crate::notifications::record::{
    NewNotification, NotificationRecord, NotificationSnapshot, sort_newest_first,
};
use crate::notifications::storage::{KeyValueStore, StorageError};

type Observer = Arc<dyn Fn(&[NotificationRecord], usize) + Send + Sync>;
type ObserverMap = Mutex<BTreeMap<u64, Observer>>;

/// Snapshots waiting to reach observers, in commit order. `draining` marks
/// that some caller is already delivering them.
#[derive(Debug, Default)]
struct Delivery {
    pending: VecDeque<NotificationSnapshot>,
    draining: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    records: Vec<NotificationRecord>,
    next_seq: u64,
}

/// Persisted notification log with read tracking and change observers.
///
/// Every mutation updates memory, writes the whole log to the key-value store
/// under one versioned key, then notifies observers. Storage failures are
/// logged and otherwise ignored.
#[derive(Clone)]
pub struct NotificationStore {
    state: Arc<Mutex<StoreState>>,
    observers: Arc<ObserverMap>,
    delivery: Arc<Mutex<Delivery>>,
    next_observer: Arc<AtomicU64>,
    watch_tx: Arc<watch::Sender<NotificationSnapshot>>,
    storage: Arc<dyn KeyValueStore>,
    key: Arc<String>,
    max_records: usize,
}

/// Returned by [`NotificationStore::on_change`].
#[must_use = "dropping the handle keeps the observer registered"]
pub struct ObserverHandle {
    id: u64,
    observers: Weak<ObserverMap>,
}

impl ObserverHandle {
    pub fn unsubscribe(self) {
        if let Some(observers) = self.observers.upgrade()
            && let Ok(mut map) = observers.lock()
        {
            map.remove(&self.id);
        }
    }
}

impl NotificationStore {
    /// Loads the log from `storage`. Missing, unreadable or corrupt content
    /// yields an empty log.
    pub fn init(storage: Arc<dyn KeyValueStore>, config: &NotificationsConfig) -> Self {
        let key = config.storage_key().to_string();
        let records = load_records(storage.as_ref(), &key);
        let next_seq = records.iter().map(|r| r.seq + 1).max().unwrap_or(0);
        let snapshot = NotificationSnapshot::from_records(&records);
        tracing::debug!(
            event = "notifications_loaded",
            key = %key,
            records = snapshot.records.len(),
            unread = snapshot.unread,
            "notification log loaded"
        );
        let (watch_tx, _) = watch::channel(snapshot);
        Self {
            state: Arc::new(Mutex::new(StoreState { records, next_seq })),
            observers: Arc::new(Mutex::new(BTreeMap::new())),
            delivery: Arc::new(Mutex::new(Delivery::default())),
            next_observer: Arc::new(AtomicU64::new(0)),
            watch_tx: Arc::new(watch_tx),
            storage,
            key: Arc::new(key),
            max_records: config.max_records(),
        }
    }

    /// Drops every registered observer. The log itself stays usable.
    pub fn dispose(&self) {
        if let Ok(mut map) = self.observers.lock() {
            map.clear();
        }
    }

    pub fn add(&self, entry: NewNotification) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let max_records = self.max_records;
        let record_id = id.clone();
        self.commit(move |state| {
            let record = NotificationRecord {
                id: record_id,
                kind: entry.kind.unwrap_or_default(),
                title: entry.title,
                description: entry.description,
                meta: entry.meta,
                created_at: chrono::Utc::now(),
                read: false,
                seq: state.next_seq,
            };
            state.next_seq += 1;
            state.records.push(record);
            prune_records(&mut state.records, max_records);
            true
        });
        id
    }

    /// Newest first.
    pub fn get(&self) -> Vec<NotificationRecord> {
        self.snapshot().records
    }

    pub fn snapshot(&self) -> NotificationSnapshot {
        self.state
            .lock()
            .map(|state| NotificationSnapshot::from_records(&state.records))
            .unwrap_or_default()
    }

    pub fn unread_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.records.iter().filter(|r| !r.read).count())
            .unwrap_or(0)
    }

    pub fn mark_read(&self, id: &str, read: bool) {
        self.commit(|state| match state.records.iter_mut().find(|r| r.id == id) {
            Some(record) if record.read != read => {
                record.read = read;
                true
            }
            _ => false,
        });
    }

    pub fn mark_all_read(&self) {
        self.commit(|state| {
            for record in state.records.iter_mut() {
                record.read = true;
            }
            true
        });
    }

    pub fn remove(&self, id: &str) {
        self.commit(|state| {
            let before = state.records.len();
            state.records.retain(|r| r.id != id);
            state.records.len() != before
        });
    }

    pub fn clear(&self) {
        self.commit(|state| {
            state.records.clear();
            true
        });
    }

    /// Registers `observer` and immediately calls it with the current log.
    pub fn on_change<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&[NotificationRecord], usize) + Send + Sync + 'static,
    {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        let observer: Observer = Arc::new(observer);
        if let Ok(mut map) = self.observers.lock() {
            map.insert(id, Arc::clone(&observer));
        }
        let snapshot = self.snapshot();
        observer(&snapshot.records, snapshot.unread);
        ObserverHandle {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    /// Async alternative to `on_change`; the receiver starts at the current log.
    pub fn watch(&self) -> watch::Receiver<NotificationSnapshot> {
        self.watch_tx.subscribe()
    }

    fn commit<F>(&self, mutate: F)
    where
        F: FnOnce(&mut StoreState) -> bool,
    {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if !mutate(&mut *state) {
                return;
            }
            self.persist(&state.records);
            let snapshot = NotificationSnapshot::from_records(&state.records);
            self.watch_tx.send_replace(snapshot.clone());
            // Queued under the state lock so observers see commits in order.
            if let Ok(mut delivery) = self.delivery.lock() {
                delivery.pending.push_back(snapshot);
            }
        }
        self.drain_deliveries();
    }

    /// Delivers queued snapshots unless another caller is already doing so,
    /// in which case that caller picks ours up. Commits made from inside an
    /// observer are delivered after the current snapshot.
    fn drain_deliveries(&self) {
        match self.delivery.lock() {
            Ok(mut delivery) if !delivery.draining => delivery.draining = true,
            _ => return,
        }
        loop {
            let next = match self.delivery.lock() {
                Ok(mut delivery) => match delivery.pending.pop_front() {
                    Some(snapshot) => snapshot,
                    None => {
                        delivery.draining = false;
                        return;
                    }
                },
                Err(_) => return,
            };
            self.broadcast(&next);
        }
    }

    fn persist(&self, records: &[NotificationRecord]) {
        let result = serde_json::to_string(records)
            .map_err(StorageError::from)
            .and_then(|raw| self.storage.set(&self.key, &raw));
        if let Err(err) = result {
            tracing::warn!(
                event = "notifications_persist_failed",
                key = %self.key,
                error = %err,
                "failed to persist notification log"
            );
        }
    }

    fn broadcast(&self, snapshot: &NotificationSnapshot) {
        let observers: Vec<Observer> = self
            .observers
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        for observer in observers {
            observer(&snapshot.records, snapshot.unread);
        }
    }
}

fn load_records(storage: &dyn KeyValueStore, key: &str) -> Vec<NotificationRecord> {
    let raw = match storage.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(err) => {
            tracing::warn!(event = "notifications_load_failed", key = %key, error = %err, "notification storage unavailable");
            return Vec::new();
        }
    };
    let mut records: Vec<NotificationRecord> = match serde_json::from_str(&raw) {
        Ok(records) => records,
        Err(err) => {
            tracing::warn!(event = "notifications_load_failed", key = %key, error = %err, "discarding unreadable notification log");
            return Vec::new();
        }
    };
    let mut seen = HashSet::new();
    records.retain(|record| seen.insert(record.id.clone()));
    // Restore insertion order; older logs without `seq` fall back to time order.
    sort_newest_first(&mut records);
    records.reverse();
    records
}

/// Keeps the log within `max_records`, dropping the oldest read records first.
fn prune_records(records: &mut Vec<NotificationRecord>, max_records: usize) {
    if max_records == 0 || records.len() <= max_records {
        return;
    }
    let mut excess = records.len() - max_records;
    let mut kept = Vec::with_capacity(records.len());
    for record in records.drain(..) {
        if excess > 0 && record.read {
            excess -= 1;
        } else {
            kept.push(record);
        }
    }
    records.extend(kept);
    if records.len() > max_records {
        let drop_count = records.len() - max_records;
        records.drain(0..drop_count);
    }
}
