use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;

use crate::config::MonitorConfig;
use crate::monitor::change::{RawChangeEvent, UserFields, normalize_feedback, normalize_primary};
use crate::monitor::provider::{
    ChangeFeedProvider, ChannelHandle, EventFilter, FeedCallback, FeedMessage,
};
use crate::notifications::facade::Notifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Monitoring,
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Subscription to {table} failed: {message}")]
    Subscribe { table: String, message: String },
    #[error("No feedback table configured for {0}")]
    UnknownFeedbackTable(String),
}

pub type MonitorResult<T> = Result<T, MonitorError>;

/// Backoff for re-establishing failed or dropped subscriptions.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts(),
            base_backoff: config.retry_base_backoff(),
            max_backoff: config.retry_max_backoff(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FeedTarget {
    Primary(String),
    Feedback { table: String, primary: String },
}

impl FeedTarget {
    fn table(&self) -> &str {
        match self {
            FeedTarget::Primary(table) => table,
            FeedTarget::Feedback { table, .. } => table,
        }
    }

    fn filter(&self) -> EventFilter {
        match self {
            FeedTarget::Primary(_) => EventFilter::All,
            FeedTarget::Feedback { .. } => EventFilter::Insert,
        }
    }
}

/// A live channel plus the token its callback was created with.
struct Subscription {
    token: u64,
    handle: ChannelHandle,
}

struct MonitorInner {
    provider: Arc<dyn ChangeFeedProvider>,
    notifier: Notifier,
    config: MonitorConfig,
    fields: UserFields,
    retry: RetryPolicy,
    lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<MonitorState>,
    handles: Mutex<HashMap<String, Subscription>>,
    next_token: AtomicU64,
    /// Bumped by `stop`; callbacks from older subscriptions are ignored.
    generation: AtomicU64,
}

/// Owns the change-feed subscriptions for the configured tables and feeds
/// every normalised change into the [`Notifier`].
#[derive(Clone)]
pub struct ChangeFeedMonitor {
    inner: Arc<MonitorInner>,
}

impl ChangeFeedMonitor {
    pub fn new(
        provider: Arc<dyn ChangeFeedProvider>,
        notifier: Notifier,
        config: MonitorConfig,
    ) -> Self {
        let fields = UserFields::from_config(&config);
        let retry = RetryPolicy::from_config(&config);
        Self {
            inner: Arc::new(MonitorInner {
                provider,
                notifier,
                config,
                fields,
                retry,
                lifecycle: tokio::sync::Mutex::new(()),
                state: Mutex::new(MonitorState::Idle),
                handles: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> MonitorState {
        self.inner
            .state
            .lock()
            .map(|state| *state)
            .unwrap_or(MonitorState::Idle)
    }

    pub fn is_monitoring(&self) -> bool {
        self.state() == MonitorState::Monitoring
    }

    /// Tables with a live subscription, sorted.
    pub fn active_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .inner
            .handles
            .lock()
            .map(|handles| handles.keys().cloned().collect())
            .unwrap_or_default();
        tables.sort();
        tables
    }

    /// Subscribes to every configured primary and feedback table. A no-op
    /// while already monitoring. Tables that fail to subscribe are retried in
    /// the background.
    pub async fn start(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        if self.is_monitoring() {
            tracing::debug!(event = "monitor_start_skipped", "already monitoring");
            return;
        }
        self.set_state(MonitorState::Monitoring);
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let targets = self.targets(None);
        self.attach_all(targets, generation).await;
        tracing::info!(
            event = "monitor_started",
            tables = self.active_tables().len(),
            "change monitoring started"
        );
    }

    /// Releases every subscription. Callbacks arriving after this call are
    /// dropped even if the provider still delivers them.
    pub async fn stop(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let _guard = self.inner.lifecycle.lock().await;
        self.release_all().await;
    }

    /// Replaces the current monitoring with just `tables` and their
    /// configured feedback tables.
    pub async fn monitor_only<I, S>(&self, tables: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tables: Vec<String> = tables
            .into_iter()
            .map(|table| table.as_ref().to_string())
            .collect();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = self.inner.lifecycle.lock().await;
        self.release_all().await;
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.set_state(MonitorState::Monitoring);
        let targets = self.targets(Some(tables.as_slice()));
        self.attach_all(targets, generation).await;
    }

    /// Subscribes to one primary table, replacing any existing subscription
    /// on it.
    pub async fn monitor_table(&self, table: &str) -> MonitorResult<()> {
        let _guard = self.inner.lifecycle.lock().await;
        let generation = self.inner.generation.load(Ordering::SeqCst);
        attach(&self.inner, FeedTarget::Primary(table.to_string()), generation).await?;
        self.set_state(MonitorState::Monitoring);
        Ok(())
    }

    /// Subscribes to inserts on a configured feedback table.
    pub async fn monitor_feedback_table(&self, feedback_table: &str) -> MonitorResult<()> {
        let primary = self
            .inner
            .config
            .primary_for_feedback(feedback_table)
            .ok_or_else(|| MonitorError::UnknownFeedbackTable(feedback_table.to_string()))?
            .to_string();
        let _guard = self.inner.lifecycle.lock().await;
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let target = FeedTarget::Feedback {
            table: feedback_table.to_string(),
            primary,
        };
        attach(&self.inner, target, generation).await?;
        self.set_state(MonitorState::Monitoring);
        Ok(())
    }

    /// Primary targets for `tables`, then the feedback tables configured for
    /// them. `None` selects every configured table and feedback table.
    fn targets(&self, tables: Option<&[String]>) -> Vec<FeedTarget> {
        let config = &self.inner.config;
        let primaries = tables.unwrap_or(config.tables.as_slice());
        let mut feedback: Vec<FeedTarget> = config
            .feedback
            .iter()
            .filter(|(primary, _)| tables.is_none_or(|tables| tables.contains(*primary)))
            .map(|(primary, table)| FeedTarget::Feedback {
                table: table.clone(),
                primary: primary.clone(),
            })
            .collect();
        feedback.sort_by(|a, b| a.table().cmp(b.table()));
        primaries
            .iter()
            .map(|table| FeedTarget::Primary(table.clone()))
            .chain(feedback)
            .collect()
    }

    async fn attach_all(&self, targets: Vec<FeedTarget>, generation: u64) {
        let runtime = Handle::current();
        for target in targets {
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Err(err) = attach(&self.inner, target.clone(), generation).await {
                tracing::warn!(
                    event = "monitor_subscribe_failed",
                    table = %target.table(),
                    error = %err,
                    "subscription failed, scheduling retry"
                );
                schedule_retry(Arc::downgrade(&self.inner), target, generation, 1, &runtime);
            }
        }
    }

    async fn release_all(&self) {
        let handles: Vec<ChannelHandle> = self
            .inner
            .handles
            .lock()
            .map(|mut handles| handles.drain().map(|(_, sub)| sub.handle).collect())
            .unwrap_or_default();
        let was_monitoring = self.is_monitoring();
        self.set_state(MonitorState::Idle);
        if !was_monitoring && handles.is_empty() {
            return;
        }
        let released = handles.len();
        for handle in handles {
            release(self.inner.provider.as_ref(), handle).await;
        }
        tracing::info!(
            event = "monitor_stopped",
            released,
            "change monitoring stopped"
        );
    }

    fn set_state(&self, next: MonitorState) {
        if let Ok(mut state) = self.inner.state.lock() {
            *state = next;
        }
    }
}

/// Caller holds the lifecycle lock.
async fn attach(inner: &Arc<MonitorInner>, target: FeedTarget, generation: u64) -> MonitorResult<()> {
    let token = inner.next_token.fetch_add(1, Ordering::SeqCst);
    let callback = feed_callback(Arc::downgrade(inner), target.clone(), generation, token);
    let handle = inner
        .provider
        .subscribe(target.table(), target.filter(), callback)
        .await
        .map_err(|err| MonitorError::Subscribe {
            table: target.table().to_string(),
            message: err.to_string(),
        })?;
    if inner.generation.load(Ordering::SeqCst) != generation {
        release(inner.provider.as_ref(), handle).await;
        return Ok(());
    }
    let previous = inner
        .handles
        .lock()
        .ok()
        .and_then(|mut handles| {
            handles.insert(target.table().to_string(), Subscription { token, handle })
        });
    if let Some(previous) = previous {
        release(inner.provider.as_ref(), previous.handle).await;
    }
    tracing::debug!(
        event = "monitor_subscribed",
        table = %target.table(),
        filter = ?target.filter(),
        "subscribed to change feed"
    );
    Ok(())
}

async fn release(provider: &dyn ChangeFeedProvider, handle: ChannelHandle) {
    let table = handle.table.clone();
    if let Err(err) = provider.unsubscribe(handle).await {
        tracing::debug!(
            event = "monitor_unsubscribe_failed",
            table = %table,
            error = %err,
            "failed to release subscription"
        );
    }
}

fn feed_callback(
    inner: Weak<MonitorInner>,
    target: FeedTarget,
    generation: u64,
    token: u64,
) -> FeedCallback {
    let runtime = Handle::current();
    Arc::new(move |message: FeedMessage| {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        if strong.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        match message {
            FeedMessage::Change(event) => dispatch(&strong, &target, event),
            FeedMessage::Closed { reason } => {
                // Only the channel currently registered for the table may
                // clear it; a replaced channel reports Closed when released.
                let current = strong
                    .handles
                    .lock()
                    .map(|mut handles| {
                        let owned = handles
                            .get(target.table())
                            .is_some_and(|sub| sub.token == token);
                        if owned {
                            handles.remove(target.table());
                        }
                        owned
                    })
                    .unwrap_or(false);
                if !current {
                    tracing::debug!(
                        event = "monitor_stale_close_ignored",
                        table = %target.table(),
                        reason = %reason,
                        "close from a released channel"
                    );
                    return;
                }
                tracing::warn!(
                    event = "monitor_subscription_closed",
                    table = %target.table(),
                    reason = %reason,
                    "change feed closed by provider"
                );
                schedule_retry(Weak::clone(&inner), target.clone(), generation, 1, &runtime);
            }
        }
    })
}

fn dispatch(inner: &MonitorInner, target: &FeedTarget, event: RawChangeEvent) {
    let normalized = match target {
        FeedTarget::Primary(_) => normalize_primary(event, &inner.fields),
        FeedTarget::Feedback { primary, .. } => normalize_feedback(event, primary, &inner.fields),
    };
    match normalized {
        Ok(change) => {
            inner.notifier.database_change(change);
        }
        Err(err) => {
            inner.notifier.change_error(&err);
        }
    }
}

fn schedule_retry(
    inner: Weak<MonitorInner>,
    target: FeedTarget,
    generation: u64,
    attempt: usize,
    runtime: &Handle,
) {
    let Some(strong) = inner.upgrade() else {
        return;
    };
    if attempt > strong.retry.max_attempts {
        tracing::warn!(
            event = "monitor_retry_exhausted",
            table = %target.table(),
            attempts = attempt - 1,
            "giving up on change feed"
        );
        return;
    }
    let delay = compute_backoff(attempt, &strong.retry);
    drop(strong);
    let next_runtime = runtime.clone();
    runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let _guard = strong.lifecycle.lock().await;
        let current = strong.generation.load(Ordering::SeqCst) == generation;
        let monitoring = strong
            .state
            .lock()
            .map(|state| *state == MonitorState::Monitoring)
            .unwrap_or(false);
        if !current || !monitoring {
            return;
        }
        match attach(&strong, target.clone(), generation).await {
            Ok(()) => tracing::info!(
                event = "monitor_resubscribed",
                table = %target.table(),
                attempts = attempt,
                "change feed restored"
            ),
            Err(err) => {
                tracing::debug!(
                    event = "monitor_retry_failed",
                    table = %target.table(),
                    attempts = attempt,
                    error = %err,
                    "retry failed"
                );
                schedule_retry(inner, target, generation, attempt + 1, &next_runtime);
            }
        }
    });
}

fn compute_backoff(attempt: usize, policy: &RetryPolicy) -> Duration {
    let exp = attempt.saturating_sub(1) as u32;
    let multiplier = 1u64.checked_shl(exp.min(10)).unwrap_or(u64::MAX);
    let base = policy.base_backoff.as_millis() as u64;
    let backoff = base.saturating_mul(multiplier);
    let max = policy.max_backoff.as_millis() as u64;
    Duration::from_millis(std::cmp::min(backoff, max))
}
