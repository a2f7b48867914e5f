use std::sync::Arc;

use crate::config::Config;
use crate::monitor::provider::ChangeFeedProvider;
use crate::monitor::service::ChangeFeedMonitor;
use crate::notifications::facade::Notifier;
use crate::notifications::presenter::AlertPresenter;
use crate::notifications::storage::open_storage;
use crate::notifications::store::NotificationStore;

/// The store, notifier and monitor wired together from one config.
#[derive(Clone)]
pub struct NotificationBus {
    store: NotificationStore,
    notifier: Notifier,
    monitor: ChangeFeedMonitor,
}

impl NotificationBus {
    pub fn init(
        config: &Config,
        provider: Arc<dyn ChangeFeedProvider>,
        presenter: Arc<dyn AlertPresenter>,
    ) -> Self {
        let store = NotificationStore::init(open_storage(&config.notifications), &config.notifications);
        let notifier = Notifier::new(store.clone(), presenter, config);
        let monitor = ChangeFeedMonitor::new(provider, notifier.clone(), config.monitor.clone());
        Self {
            store,
            notifier,
            monitor,
        }
    }

    pub fn store(&self) -> &NotificationStore {
        &self.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn monitor(&self) -> &ChangeFeedMonitor {
        &self.monitor
    }

    pub async fn start(&self) {
        self.monitor.start().await;
    }

    /// Stops monitoring and drops every store observer.
    pub async fn dispose(&self) {
        self.monitor.stop().await;
        self.store.dispose();
    }
}
