//! Subscription entry point.
//!
//! A `NotificationHub` owns one session per subscription key. Subscribing an
//! already followed subscriber returns another handle to the live session;
//! the session stops when its last handle is released.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::alerts::AlertNotifier;
use super::listener::NotificationListener;
use super::session::{self, Command, SessionParts, SessionShared};
use super::SubscribeError;
use crate::backend::NotificationBackend;
use crate::channel::{ChannelManager, ChannelStatus, PushTransport, RetryRegistry};
use crate::config::{SubscriptionOptions, SyncSettings};
use crate::notifications::{
    NewNotification, NotificationQuery, NotificationRecord, NotificationView, SubscriberId,
};
use crate::poll::{BackendPoll, PollSchedule, PollScheduler};
use crate::sync::{MutationError, Reconciler};

const SNAPSHOT_BUFFER: usize = 4;

pub struct NotificationHub {
    backend: Arc<dyn NotificationBackend>,
    transport: Arc<dyn PushTransport>,
    notifier: Arc<dyn AlertNotifier>,
    settings: SyncSettings,
    retries: Arc<RetryRegistry>,
    sessions: Mutex<HashMap<String, Weak<SessionShared>>>,
}

impl NotificationHub {
    pub fn new(
        backend: Arc<dyn NotificationBackend>,
        transport: Arc<dyn PushTransport>,
        notifier: Arc<dyn AlertNotifier>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            backend,
            transport,
            notifier,
            settings,
            retries: Arc::new(RetryRegistry::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Retry counters shared by the channels of this hub.
    pub fn retry_registry(&self) -> Arc<RetryRegistry> {
        self.retries.clone()
    }

    /// Start following a subscriber, or join the existing session.
    ///
    /// Options only take effect when a new session is started.
    pub async fn subscribe(
        &self,
        subscriber: SubscriberId,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        if subscriber.is_empty() {
            return Err(SubscribeError::MissingSubscriber);
        }
        options.validate().map_err(SubscribeError::InvalidOptions)?;

        let key = subscriber.subscription_key();
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, session| session.strong_count() > 0);

        if let Some(shared) = sessions.get(&key).and_then(Weak::upgrade) {
            debug!("Joining existing subscription {}", key);
            return Ok(SubscriptionHandle { shared });
        }

        let shared = self.start_session(subscriber, options).await;
        sessions.insert(key.clone(), Arc::downgrade(&shared));
        info!("Subscribed {} ({} active)", key, sessions.len());
        Ok(SubscriptionHandle { shared })
    }

    /// Number of live sessions.
    pub async fn active_subscriptions(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, session| session.strong_count() > 0);
        sessions.len()
    }

    async fn start_session(
        &self,
        subscriber: SubscriberId,
        options: SubscriptionOptions,
    ) -> Arc<SessionShared> {
        let cancel = CancellationToken::new();
        // Releases whatever was started if setup does not complete
        let guard = cancel.clone().drop_guard();

        let reconciler = Reconciler::new(&self.settings.reconcile);

        let (channel, events, states) = if options.real_time {
            let channel = Arc::new(ChannelManager::new(
                subscriber.clone(),
                self.transport.clone(),
                self.retries.clone(),
                &self.settings.channel,
            ));
            // Register before connecting so nothing is missed
            let events = channel.on_event().await;
            let states = channel.state_changes();
            channel.connect().await;
            (Some(channel), Some(events), Some(states))
        } else {
            (None, None, None)
        };

        let schedule = if options.auto_refresh {
            PollSchedule::Every(Duration::from_millis(options.refresh_interval_ms))
        } else {
            PollSchedule::Once
        };
        let source = Arc::new(BackendPoll::new(
            self.backend.clone(),
            subscriber.clone(),
            NotificationQuery::latest(options.limit),
        ));
        let (snapshot_tx, snapshots) = mpsc::channel(SNAPSHOT_BUFFER);
        let poll = PollScheduler::start(schedule, source, snapshot_tx, &cancel);

        let shared = session::spawn(SessionParts {
            subscriber,
            options,
            backend: self.backend.clone(),
            notifier: self.notifier.clone(),
            reconciler,
            channel,
            events,
            states,
            poll,
            snapshots,
            mutation_timeout: Duration::from_millis(self.settings.reconcile.mutation_timeout_ms),
            cancel,
        });
        guard.disarm();
        shared
    }
}

/// Reference to a live subscription. Clones share the session; dropping the
/// last one stops it.
#[derive(Clone)]
pub struct SubscriptionHandle {
    shared: Arc<SessionShared>,
}

impl SubscriptionHandle {
    pub fn subscriber(&self) -> &SubscriberId {
        &self.shared.subscriber
    }

    pub fn options(&self) -> &SubscriptionOptions {
        &self.shared.options
    }

    /// Current records and unread count.
    pub fn view(&self) -> NotificationView {
        self.shared.view.borrow().clone()
    }

    pub fn records(&self) -> Vec<NotificationRecord> {
        self.shared.view.borrow().records.clone()
    }

    pub fn unread_count(&self) -> usize {
        self.shared.view.borrow().unread_count
    }

    /// Observe the full view on every change.
    pub fn watch(&self) -> watch::Receiver<NotificationView> {
        self.shared.view.clone()
    }

    /// Register a listener for changes applied from now on.
    pub async fn add_listener(&self, listener: Arc<dyn NotificationListener>) {
        if self
            .shared
            .commands
            .send(Command::AddListener(listener))
            .await
            .is_err()
        {
            debug!("Subscription {} closed, listener dropped", self.shared.subscriber);
        }
    }

    /// Push channel status, when the subscription is real-time.
    pub async fn connection_status(&self) -> Option<ChannelStatus> {
        match &self.shared.channel {
            Some(channel) => Some(channel.status().await),
            None => None,
        }
    }

    pub async fn force_reconnect(&self) {
        if let Some(channel) = &self.shared.channel {
            channel.force_reconnect().await;
        }
    }

    /// Fetch the latest records now.
    pub async fn refresh(&self) {
        let _ = self.shared.commands.send(Command::Refresh).await;
    }

    pub async fn mark_read(&self, id: &str) -> Result<(), MutationError> {
        let id = id.to_string();
        self.request(|respond| Command::MarkRead { id, respond })
            .await
    }

    pub async fn mark_all_read(&self) -> Result<(), MutationError> {
        self.request(|respond| Command::MarkAllRead { respond })
            .await
    }

    pub async fn dismiss(&self, id: &str) -> Result<(), MutationError> {
        let id = id.to_string();
        self.request(|respond| Command::Dismiss { id, respond })
            .await
    }

    /// Create a notification through the backend and cache the stored record.
    pub async fn create(&self, new: NewNotification) -> Result<NotificationRecord, MutationError> {
        self.request(|respond| Command::Create { new, respond })
            .await
    }

    /// Release this handle. The last release stops the session and waits for
    /// its teardown.
    pub async fn unsubscribe(self) {
        let subscriber = self.shared.subscriber.clone();
        match Arc::try_unwrap(self.shared) {
            Ok(shared) => {
                shared.close().await;
                info!("Unsubscribed {}", subscriber);
            }
            Err(_) => debug!("Released one handle of {}", subscriber),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, MutationError>>) -> Command,
    ) -> Result<T, MutationError> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .commands
            .send(build(tx))
            .await
            .map_err(|_| MutationError::SessionClosed)?;
        rx.await.map_err(|_| MutationError::SessionClosed)?
    }
}
