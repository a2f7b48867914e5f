use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::monitor::change::RawChangeEvent;
use crate::monitor::provider::{
    ChangeFeedProvider, ChannelHandle, EventFilter, FeedCallback, FeedMessage,
};

struct LocalSubscription {
    table: String,
    filter: EventFilter,
    callback: FeedCallback,
}

/// In-process change feed. Producers call [`LocalChangeFeed::emit`] after a
/// write; every matching subscriber is called on the emitting thread.
#[derive(Clone, Default)]
pub struct LocalChangeFeed {
    subscriptions: Arc<DashMap<String, LocalSubscription>>,
    failing_subscribes: Arc<AtomicUsize>,
    close_on_unsubscribe: bool,
}

impl LocalChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `Closed` to a channel's callback when it is unsubscribed, like
    /// hosted realtime providers do.
    pub fn closing_on_unsubscribe(mut self) -> Self {
        self.close_on_unsubscribe = true;
        self
    }

    /// Returns how many subscribers received the event.
    pub fn emit(&self, event: RawChangeEvent) -> usize {
        let callbacks: Vec<FeedCallback> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.table == event.table && entry.filter.accepts(&event.event_type))
            .map(|entry| Arc::clone(&entry.callback))
            .collect();
        for callback in &callbacks {
            callback(FeedMessage::Change(event.clone()));
        }
        callbacks.len()
    }

    /// Drops every subscription on `table`, telling each subscriber why.
    pub fn close(&self, table: &str, reason: &str) -> usize {
        let ids: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.table == table)
            .map(|entry| entry.key().clone())
            .collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, subscription)) = self.subscriptions.remove(&id) {
                (subscription.callback)(FeedMessage::Closed {
                    reason: reason.to_string(),
                });
                closed += 1;
            }
        }
        closed
    }

    /// Makes the next `count` subscribe calls fail.
    pub fn fail_next_subscriptions(&self, count: usize) {
        self.failing_subscribes.store(count, Ordering::SeqCst);
    }

    pub fn active_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn active_for(&self, table: &str) -> usize {
        self.subscriptions
            .iter()
            .filter(|entry| entry.table == table)
            .count()
    }
}

#[async_trait]
impl ChangeFeedProvider for LocalChangeFeed {
    async fn subscribe(
        &self,
        table: &str,
        filter: EventFilter,
        callback: FeedCallback,
    ) -> Result<ChannelHandle, anyhow::Error> {
        let should_fail = self
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            anyhow::bail!("subscription to {table} rejected");
        }
        let id = format!("local:{table}:{}", uuid::Uuid::new_v4());
        self.subscriptions.insert(
            id.clone(),
            LocalSubscription {
                table: table.to_string(),
                filter,
                callback,
            },
        );
        Ok(ChannelHandle {
            table: table.to_string(),
            id,
        })
    }

    async fn unsubscribe(&self, handle: ChannelHandle) -> Result<(), anyhow::Error> {
        let Some((_, subscription)) = self.subscriptions.remove(&handle.id) else {
            anyhow::bail!("unknown channel {}", handle.id);
        };
        if self.close_on_unsubscribe {
            (subscription.callback)(FeedMessage::Closed {
                reason: "unsubscribed".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn insert_filter_skips_updates() {
        let feed = LocalChangeFeed::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: FeedCallback = Arc::new(move |message: FeedMessage| sink.lock().unwrap().push(message));
        let handle = feed
            .subscribe("notes_feedback", EventFilter::Insert, callback)
            .await
            .unwrap();

        assert_eq!(feed.emit(RawChangeEvent::new("notes_feedback", "UPDATE", json!({}))), 0);
        assert_eq!(feed.emit(RawChangeEvent::new("notes_feedback", "INSERT", json!({}))), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);

        feed.unsubscribe(handle.clone()).await.unwrap();
        assert!(feed.unsubscribe(handle).await.is_err());
        assert_eq!(feed.active_count(), 0);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let feed = LocalChangeFeed::new();
        feed.fail_next_subscriptions(1);
        let callback: FeedCallback = Arc::new(|_: FeedMessage| {});
        assert!(feed.subscribe("t", EventFilter::All, Arc::clone(&callback)).await.is_err());
        assert!(feed.subscribe("t", EventFilter::All, callback).await.is_ok());
        assert_eq!(feed.active_for("t"), 1);
    }

    #[tokio::test]
    async fn closing_feed_reports_unsubscribe() {
        let feed = LocalChangeFeed::new().closing_on_unsubscribe();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: FeedCallback = Arc::new(move |message: FeedMessage| sink.lock().unwrap().push(message));
        let handle = feed.subscribe("t", EventFilter::All, callback).await.unwrap();
        feed.unsubscribe(handle).await.unwrap();
        assert!(matches!(
            seen.lock().unwrap().as_slice(),
            [FeedMessage::Closed { reason }] if reason == "unsubscribed"
        ));
    }
}
