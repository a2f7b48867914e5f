use std::sync::Arc;

use async_trait::async_trait;

use crate::monitor::change::RawChangeEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    /// Inserts, updates and deletes.
    All,
    Insert,
}

impl EventFilter {
    pub fn accepts(&self, event_type: &str) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Insert => event_type.eq_ignore_ascii_case("INSERT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Change(RawChangeEvent),
    /// The provider dropped the subscription; no more changes will follow.
    Closed { reason: String },
}

pub type FeedCallback = Arc<dyn Fn(FeedMessage) + Send + Sync>;

/// Opaque provider-issued subscription handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    pub table: String,
    pub id: String,
}

/// Push-based change feed of a remote collection store.
#[async_trait]
pub trait ChangeFeedProvider: Send + Sync {
    async fn subscribe(
        &self,
        table: &str,
        filter: EventFilter,
        callback: FeedCallback,
    ) -> Result<ChannelHandle, anyhow::Error>;

    async fn unsubscribe(&self, handle: ChannelHandle) -> Result<(), anyhow::Error>;
}
