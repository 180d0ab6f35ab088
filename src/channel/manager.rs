//! Push channel lifecycle for one subscriber.
//!
//! A `ChannelManager` owns at most one runner task. The runner opens the
//! channel through the configured `PushTransport`, fans every event out to the
//! registered consumers, and reconnects with backoff when the channel fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry_policy::RetryPolicy;
use super::retry_state::RetryRegistry;
use super::state::{ChannelStatus, ConnectionState};
use super::transport::{ChannelError, PushStream, PushTransport};
use crate::config::ChannelSettings;
use crate::metrics;
use crate::notifications::{PushEvent, SubscriberId};

const STATE_HISTORY: usize = 64;

/// Current state plus the stream of every transition.
struct StateCell {
    current: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    exhausted: AtomicBool,
}

impl StateCell {
    fn new() -> Self {
        let (current, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(STATE_HISTORY);
        Self {
            current,
            transitions,
            exhausted: AtomicBool::new(false),
        }
    }

    fn get(&self) -> ConnectionState {
        *self.current.borrow()
    }

    fn set(&self, key: &str, state: ConnectionState) {
        let previous = self.current.send_replace(state);
        if previous == state {
            return;
        }
        debug!("Channel {} state {} -> {}", key, previous, state);
        metrics::record_state_transition(previous, state);
        // No receivers is fine
        let _ = self.transitions.send(state);
    }
}

struct Runner {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Manages the push connection of one subscriber.
pub struct ChannelManager {
    subscriber: SubscriberId,
    key: String,
    transport: Arc<dyn PushTransport>,
    retries: Arc<RetryRegistry>,
    retry_owner: u64,
    policy: RetryPolicy,
    connect_timeout: Duration,
    event_buffer: usize,
    consumers: Arc<RwLock<Vec<mpsc::Sender<PushEvent>>>>,
    state: Arc<StateCell>,
    runner: Mutex<Option<Runner>>,
    shutdown_token: CancellationToken,
}

impl ChannelManager {
    pub fn new(
        subscriber: SubscriberId,
        transport: Arc<dyn PushTransport>,
        retries: Arc<RetryRegistry>,
        settings: &ChannelSettings,
    ) -> Self {
        let key = subscriber.subscription_key();
        let retry_owner = retries.register();
        Self {
            subscriber,
            key,
            transport,
            retries,
            retry_owner,
            policy: RetryPolicy::new(settings),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            event_buffer: settings.event_buffer.max(1),
            consumers: Arc::new(RwLock::new(Vec::new())),
            state: Arc::new(StateCell::new()),
            runner: Mutex::new(None),
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn subscription_key(&self) -> &str {
        &self.key
    }

    /// Start connecting.
    ///
    /// Does nothing while a runner is alive, which covers the connecting,
    /// connected and waiting-for-retry phases.
    pub async fn connect(&self) {
        let mut runner = self.runner.lock().await;
        if let Some(existing) = runner.as_ref() {
            if !existing.task.is_finished() {
                debug!("Channel {} already running, connect ignored", self.key);
                return;
            }
        }

        self.state.exhausted.store(false, Ordering::SeqCst);
        let cancel = self.shutdown_token.child_token();
        let worker = Worker {
            subscriber: self.subscriber.clone(),
            key: self.key.clone(),
            transport: self.transport.clone(),
            retries: self.retries.clone(),
            retry_owner: self.retry_owner,
            policy: self.policy.clone(),
            connect_timeout: self.connect_timeout,
            consumers: self.consumers.clone(),
            state: self.state.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());
        *runner = Some(Runner { cancel, task });
    }

    /// Register a consumer. Every consumer receives every event once, in
    /// arrival order.
    pub async fn on_event(&self) -> mpsc::Receiver<PushEvent> {
        let (tx, rx) = mpsc::channel(self.event_buffer);
        self.consumers.write().await.push(tx);
        rx
    }

    /// Tear the channel down without scheduling a retry.
    pub async fn disconnect(&self) {
        let runner = self.runner.lock().await.take();
        if let Some(runner) = runner {
            runner.cancel.cancel();
            if let Err(e) = runner.task.await {
                if e.is_panic() {
                    error!("Channel {} runner panicked: {}", self.key, e);
                }
            }
        }
        self.state.set(&self.key, ConnectionState::Disconnected);
    }

    /// Drop the current channel or pending retry and start over.
    pub async fn force_reconnect(&self) {
        info!("Forcing reconnect of channel {}", self.key);
        self.disconnect().await;
        self.retries.reset(&self.key).await;
        self.connect().await;
    }

    /// Disconnect and release the shared retry entry.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.consumers.write().await.clear();
        self.retries.forget(&self.key, self.retry_owner).await;
    }

    pub async fn status(&self) -> ChannelStatus {
        let subscription_count = self
            .consumers
            .read()
            .await
            .iter()
            .filter(|c| !c.is_closed())
            .count();
        ChannelStatus {
            state: self.state.get(),
            subscription_count,
            retry_attempts: self.retries.attempts(&self.key).await,
            retries_exhausted: self.state.exhausted.load(Ordering::SeqCst),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Latest connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.current.subscribe()
    }

    /// Every state transition, in order.
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.state.transitions.subscribe()
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

/// Everything the runner task needs, detached from the manager.
struct Worker {
    subscriber: SubscriberId,
    key: String,
    transport: Arc<dyn PushTransport>,
    retries: Arc<RetryRegistry>,
    retry_owner: u64,
    policy: RetryPolicy,
    connect_timeout: Duration,
    consumers: Arc<RwLock<Vec<mpsc::Sender<PushEvent>>>>,
    state: Arc<StateCell>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            self.state.set(&self.key, ConnectionState::Connecting);

            let attempt =
                tokio::time::timeout(self.connect_timeout, self.transport.open(&self.subscriber));
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = attempt => match result {
                    Ok(opened) => opened,
                    Err(_) => Err(ChannelError::ConnectTimeout(self.connect_timeout)),
                },
            };

            let failure = match opened {
                Ok(stream) => {
                    self.retries.reset(&self.key).await;
                    self.state.set(&self.key, ConnectionState::Connected);
                    info!("Channel {} connected", self.key);
                    match self.pump(stream).await {
                        Some(e) => e,
                        None => break,
                    }
                }
                Err(e) => e,
            };

            let attempts = self.retries.increment(&self.key, self.retry_owner).await;
            if !self.policy.should_retry(attempts) {
                warn!(
                    "Channel {} giving up after {} failed attempts: {}",
                    self.key, attempts, failure
                );
                self.state.exhausted.store(true, Ordering::SeqCst);
                self.state.set(&self.key, ConnectionState::Disconnected);
                return;
            }

            let delay = self.policy.backoff_with_jitter(attempts);
            metrics::record_reconnect_attempt(failure_reason(&failure));
            warn!(
                "Channel {} failed (attempt {}): {}. Retrying in {:?}",
                self.key, attempts, failure, delay
            );
            self.state.set(&self.key, ConnectionState::Error);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.set(&self.key, ConnectionState::Disconnected);
        debug!("Channel {} runner stopped", self.key);
    }

    /// Forward events until the channel fails. Returns `None` when cancelled.
    async fn pump(&self, mut stream: PushStream) -> Option<ChannelError> {
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(event)) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = self.fan_out(event) => {}
                    }
                }
                Some(Err(e)) => return Some(e),
                None => return Some(ChannelError::Closed),
            }
        }
    }

    async fn fan_out(&self, event: PushEvent) {
        metrics::record_push_event(event.event_type.as_str());

        // Send outside the lock so a slow consumer cannot block registration
        let senders = self.consumers.read().await.clone();
        let mut failed = 0;
        for sender in &senders {
            if sender.send(event.clone()).await.is_err() {
                failed += 1;
            }
        }

        if failed > 0 {
            debug!("Pruning {} closed consumers of channel {}", failed, self.key);
            self.consumers.write().await.retain(|c| !c.is_closed());
        }
    }
}

fn failure_reason(error: &ChannelError) -> &'static str {
    match error {
        ChannelError::ConnectFailed(_) => "connect_failed",
        ChannelError::ConnectTimeout(_) => "connect_timeout",
        ChannelError::Closed => "closed",
        ChannelError::Protocol(_) => "protocol",
        ChannelError::Transport(_) => "transport",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::transport::PushItem;
    use crate::notifications::{NotificationKind, NotificationRecord};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    enum Attempt {
        Fail,
        Hang,
    }

    /// Transport that follows a script of failures, then opens channels whose
    /// feeding senders are handed to the test.
    struct ScriptedTransport {
        script: std::sync::Mutex<VecDeque<Attempt>>,
        opened: mpsc::UnboundedSender<mpsc::Sender<PushItem>>,
        opens: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Attempt>) -> (Arc<Self>, mpsc::UnboundedReceiver<mpsc::Sender<PushItem>>) {
            let (opened, rx) = mpsc::unbounded_channel();
            let transport = Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
                opened,
                opens: AtomicUsize::new(0),
            });
            (transport, rx)
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PushTransport for ScriptedTransport {
        async fn open(&self, _subscriber: &SubscriberId) -> Result<PushStream, ChannelError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Attempt::Fail) => Err(ChannelError::ConnectFailed("refused".to_string())),
                Some(Attempt::Hang) => std::future::pending().await,
                None => {
                    let (tx, stream) = PushStream::channel(16);
                    let _ = self.opened.send(tx);
                    Ok(stream)
                }
            }
        }
    }

    fn settings() -> ChannelSettings {
        ChannelSettings {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.0,
            max_attempts: None,
            connect_timeout_ms: 500,
            event_buffer: 16,
        }
    }

    fn manager(transport: Arc<ScriptedTransport>, settings: &ChannelSettings) -> ChannelManager {
        ChannelManager::new(
            SubscriberId::patient("p-1"),
            transport,
            Arc::new(RetryRegistry::new()),
            settings,
        )
    }

    fn event(id: &str) -> PushEvent {
        PushEvent::insert(NotificationRecord {
            id: id.to_string(),
            subscriber_id: "p-1".to_string(),
            kind: NotificationKind::AppointmentBooked,
            is_read: false,
            created_at: 1,
            updated_at: None,
            payload: serde_json::Value::Null,
        })
    }

    async fn collect_until(
        rx: &mut broadcast::Receiver<ConnectionState>,
        target: ConnectionState,
    ) -> Vec<ConnectionState> {
        let mut seen = Vec::new();
        loop {
            let state = rx.recv().await.unwrap();
            seen.push(state);
            if state == target {
                return seen;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_failures_and_resets_retries() {
        use ConnectionState::*;
        let (transport, _opened) =
            ScriptedTransport::new(vec![Attempt::Fail, Attempt::Fail, Attempt::Fail]);
        let manager = manager(transport.clone(), &settings());
        let mut changes = manager.state_changes();

        manager.connect().await;
        let seen = collect_until(&mut changes, Connected).await;

        assert_eq!(
            seen,
            vec![Connecting, Error, Connecting, Error, Connecting, Error, Connecting, Connected]
        );
        let status = manager.status().await;
        assert_eq!(status.state, Connected);
        assert_eq!(status.retry_attempts, 0);
        assert!(!status.retries_exhausted);
        assert_eq!(transport.opens(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let (transport, mut opened) = ScriptedTransport::new(vec![]);
        let manager = manager(transport.clone(), &settings());

        manager.connect().await;
        let _feed = opened.recv().await.unwrap();
        manager.connect().await;
        manager.connect().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(transport.opens(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_fan_out_to_every_consumer_in_order() {
        let (transport, mut opened) = ScriptedTransport::new(vec![]);
        let manager = manager(transport, &settings());
        let mut first = manager.on_event().await;
        let mut second = manager.on_event().await;

        manager.connect().await;
        let feed = opened.recv().await.unwrap();
        for id in ["a", "b", "c"] {
            feed.send(Ok(event(id))).await.unwrap();
        }

        for consumer in [&mut first, &mut second] {
            for id in ["a", "b", "c"] {
                assert_eq!(consumer.recv().await.unwrap().record.id, id);
            }
        }
        assert_eq!(manager.status().await.subscription_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_consumers_are_pruned() {
        let (transport, mut opened) = ScriptedTransport::new(vec![]);
        let manager = manager(transport, &settings());
        let mut kept = manager.on_event().await;
        let dropped = manager.on_event().await;
        drop(dropped);

        manager.connect().await;
        let feed = opened.recv().await.unwrap();
        feed.send(Ok(event("a"))).await.unwrap();

        assert_eq!(kept.recv().await.unwrap().record.id, "a");
        assert_eq!(manager.status().await.subscription_count, 1);
        assert_eq!(manager.consumers.read().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_failure() {
        use ConnectionState::*;
        let (transport, _opened) = ScriptedTransport::new(vec![Attempt::Hang]);
        let manager = manager(transport.clone(), &settings());
        let mut changes = manager.state_changes();

        manager.connect().await;
        let seen = collect_until(&mut changes, Connected).await;

        assert_eq!(seen, vec![Connecting, Error, Connecting, Connected]);
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_triggers_reconnect() {
        use ConnectionState::*;
        let (transport, mut opened) = ScriptedTransport::new(vec![]);
        let manager = manager(transport.clone(), &settings());
        let mut changes = manager.state_changes();

        manager.connect().await;
        let feed = opened.recv().await.unwrap();
        collect_until(&mut changes, Connected).await;

        drop(feed);
        let seen = collect_until(&mut changes, Connected).await;
        assert_eq!(seen, vec![Error, Connecting, Connected]);
        assert_eq!(transport.opens(), 2);
        assert_eq!(manager.status().await.retry_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_triggers_reconnect() {
        let (transport, mut opened) = ScriptedTransport::new(vec![]);
        let manager = manager(transport.clone(), &settings());
        let mut changes = manager.state_changes();

        manager.connect().await;
        let feed = opened.recv().await.unwrap();
        collect_until(&mut changes, ConnectionState::Connected).await;

        feed.send(Err(ChannelError::Protocol("bad frame".to_string())))
            .await
            .unwrap();
        collect_until(&mut changes, ConnectionState::Error).await;
        collect_until(&mut changes, ConnectionState::Connected).await;
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts_exhausts_retries() {
        let mut settings = settings();
        settings.max_attempts = Some(2);
        let (transport, _opened) =
            ScriptedTransport::new(vec![Attempt::Fail, Attempt::Fail, Attempt::Fail]);
        let manager = manager(transport.clone(), &settings);
        let mut changes = manager.state_changes();

        manager.connect().await;
        collect_until(&mut changes, ConnectionState::Error).await;
        collect_until(&mut changes, ConnectionState::Disconnected).await;

        let status = manager.status().await;
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.retries_exhausted);
        assert_eq!(status.retry_attempts, 2);
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let script = (0..10).map(|_| Attempt::Fail).collect();
        let (transport, _opened) = ScriptedTransport::new(script);
        let manager = manager(transport.clone(), &settings());
        let mut changes = manager.state_changes();

        manager.connect().await;
        collect_until(&mut changes, ConnectionState::Error).await;
        manager.disconnect().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.opens(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_discards_in_flight_attempt() {
        let (transport, _opened) = ScriptedTransport::new(vec![Attempt::Hang]);
        let manager = manager(transport.clone(), &settings());
        let mut changes = manager.state_changes();

        manager.connect().await;
        collect_until(&mut changes, ConnectionState::Connecting).await;
        manager.disconnect().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.opens(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reconnect_passes_through_disconnected() {
        use ConnectionState::*;
        let (transport, mut opened) = ScriptedTransport::new(vec![]);
        let manager = manager(transport.clone(), &settings());
        let mut changes = manager.state_changes();

        manager.connect().await;
        let _first = opened.recv().await.unwrap();
        collect_until(&mut changes, Connected).await;

        manager.force_reconnect().await;
        let seen = collect_until(&mut changes, Connected).await;
        assert_eq!(seen, vec![Disconnected, Connecting, Connected]);
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_forgets_retry_entry() {
        let (transport, _opened) = ScriptedTransport::new(vec![Attempt::Fail]);
        let retries = Arc::new(RetryRegistry::new());
        let manager = ChannelManager::new(
            SubscriberId::doctor("d-3"),
            transport,
            retries.clone(),
            &settings(),
        );
        let mut changes = manager.state_changes();

        manager.connect().await;
        collect_until(&mut changes, ConnectionState::Error).await;
        assert_eq!(retries.attempts("notifications:doctor:d-3").await, 1);

        manager.shutdown().await;
        assert_eq!(retries.tracked_keys().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_shutdown_keeps_successor_retries() {
        let retries = Arc::new(RetryRegistry::new());
        let (old_transport, _old_opened) = ScriptedTransport::new(vec![Attempt::Fail]);
        let old = ChannelManager::new(
            SubscriberId::doctor("d-3"),
            old_transport,
            retries.clone(),
            &settings(),
        );
        let mut old_changes = old.state_changes();
        old.connect().await;
        collect_until(&mut old_changes, ConnectionState::Error).await;
        old.disconnect().await;

        // A new session for the same subscriber starts failing
        let slow = ChannelSettings {
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            ..settings()
        };
        let (new_transport, _new_opened) =
            ScriptedTransport::new(vec![Attempt::Fail, Attempt::Fail, Attempt::Fail]);
        let new = ChannelManager::new(
            SubscriberId::doctor("d-3"),
            new_transport,
            retries.clone(),
            &slow,
        );
        let mut new_changes = new.state_changes();
        new.connect().await;
        collect_until(&mut new_changes, ConnectionState::Error).await;

        old.shutdown().await;
        assert_eq!(retries.tracked_keys().await, 1);
        assert!(new.status().await.retry_attempts >= 1);

        new.shutdown().await;
        assert_eq!(retries.tracked_keys().await, 0);
    }
}
