//! Session task of one subscription.
//!
//! The session task is the only writer of the subscriber's store. It selects
//! over push events, poll snapshots, caller commands, settled backend calls,
//! connection state changes and cancellation.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::alerts::{AlertKinds, AlertNotifier};
use super::listener::{self, NotificationListener};
use crate::backend::{BackendError, NotificationBackend};
use crate::channel::{ChannelManager, ConnectionState};
use crate::config::SubscriptionOptions;
use crate::metrics;
use crate::notifications::{
    NewNotification, NotificationId, NotificationRecord, NotificationView, PushEvent,
    SubscriberId,
};
use crate::poll::PollHandle;
use crate::sync::{
    LocalMutation, MutationError, MutationTicket, NotificationChange, PollSnapshot, Reconciler,
};

const COMMAND_BUFFER: usize = 32;

type Respond<T> = oneshot::Sender<Result<T, MutationError>>;

/// Request sent by a handle to its session.
pub(crate) enum Command {
    MarkRead { id: NotificationId, respond: Respond<()> },
    MarkAllRead { respond: Respond<()> },
    Dismiss { id: NotificationId, respond: Respond<()> },
    Create { new: NewNotification, respond: Respond<NotificationRecord> },
    Refresh,
    AddListener(Arc<dyn NotificationListener>),
}

/// Result of a backend call started by a command.
enum Settlement {
    Mutation {
        kind: &'static str,
        tickets: Vec<MutationTicket>,
        result: Result<(), MutationError>,
        respond: Respond<()>,
    },
    Created {
        result: Result<NotificationRecord, MutationError>,
        respond: Respond<NotificationRecord>,
    },
}

/// State shared by every handle of one session.
///
/// Dropping the last reference cancels the session task, which then tears
/// down the channel and the poll timer.
pub(crate) struct SessionShared {
    pub(crate) subscriber: SubscriberId,
    pub(crate) options: SubscriptionOptions,
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) view: watch::Receiver<NotificationView>,
    pub(crate) channel: Option<Arc<ChannelManager>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionShared {
    /// Stop the session and wait for its teardown to finish.
    pub(crate) async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Session {} panicked: {}", self.subscriber, e);
                }
            }
        }
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Everything the session task needs.
pub(crate) struct SessionParts {
    pub subscriber: SubscriberId,
    pub options: SubscriptionOptions,
    pub backend: Arc<dyn NotificationBackend>,
    pub notifier: Arc<dyn AlertNotifier>,
    pub reconciler: Reconciler,
    pub channel: Option<Arc<ChannelManager>>,
    pub events: Option<mpsc::Receiver<PushEvent>>,
    pub states: Option<broadcast::Receiver<ConnectionState>>,
    pub poll: PollHandle,
    pub snapshots: mpsc::Receiver<PollSnapshot>,
    pub mutation_timeout: Duration,
    pub cancel: CancellationToken,
}

/// Spawn the session task and return the state its handles share.
pub(crate) fn spawn(parts: SessionParts) -> Arc<SessionShared> {
    let SessionParts {
        subscriber,
        options,
        backend,
        notifier,
        reconciler,
        channel,
        events,
        states,
        poll,
        snapshots,
        mutation_timeout,
        cancel,
    } = parts;

    let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
    let (settle_tx, settlements) = mpsc::channel(COMMAND_BUFFER);
    let view = reconciler.subscribe();

    let session = Session {
        subscriber: subscriber.clone(),
        alerts: AlertKinds::from_options(&options),
        backend,
        notifier,
        reconciler,
        channel: channel.clone(),
        poll,
        listeners: Vec::new(),
        mutation_timeout,
        settle_tx,
        initial_load_done: false,
        was_connected: false,
    };
    let inputs = Inputs {
        commands,
        settlements,
        events,
        states,
        snapshots,
    };
    let task = tokio::spawn(session.run(inputs, cancel.clone()));
    metrics::session_started();

    Arc::new(SessionShared {
        subscriber,
        options,
        commands: command_tx,
        view,
        channel,
        cancel,
        task: Mutex::new(Some(task)),
    })
}

struct Inputs {
    commands: mpsc::Receiver<Command>,
    settlements: mpsc::Receiver<Settlement>,
    events: Option<mpsc::Receiver<PushEvent>>,
    states: Option<broadcast::Receiver<ConnectionState>>,
    snapshots: mpsc::Receiver<PollSnapshot>,
}

struct Session {
    subscriber: SubscriberId,
    alerts: AlertKinds,
    backend: Arc<dyn NotificationBackend>,
    notifier: Arc<dyn AlertNotifier>,
    reconciler: Reconciler,
    channel: Option<Arc<ChannelManager>>,
    poll: PollHandle,
    listeners: Vec<Arc<dyn NotificationListener>>,
    mutation_timeout: Duration,
    settle_tx: mpsc::Sender<Settlement>,
    initial_load_done: bool,
    was_connected: bool,
}

impl Session {
    async fn run(mut self, mut inputs: Inputs, cancel: CancellationToken) {
        info!("Subscription {} started", self.subscriber);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(command) = inputs.commands.recv() => self.handle_command(command),
                Some(settlement) = inputs.settlements.recv() => self.settle(settlement),
                Some(event) = next_event(&mut inputs.events) => self.on_push(event),
                Some(snapshot) = inputs.snapshots.recv() => self.on_snapshot(snapshot),
                Some(state) = next_state(&mut inputs.states) => self.on_state(state),
            }
        }

        if let Some(channel) = self.channel.take() {
            channel.shutdown().await;
        }
        self.poll.stop().await;
        self.reconciler.clear();
        metrics::session_stopped();
        info!("Subscription {} stopped", self.subscriber);
    }

    // ===== Server state =====

    fn on_push(&mut self, event: PushEvent) {
        debug!(
            "Push {} for {} on {}",
            event.event_type.as_str(),
            event.record.id,
            self.subscriber
        );
        let changes = self.reconciler.apply_push(event);
        self.dispatch(&changes, true);
    }

    fn on_snapshot(&mut self, snapshot: PollSnapshot) {
        let changes = self.reconciler.apply_snapshot(snapshot);
        if !self.initial_load_done {
            self.initial_load_done = true;
            debug!(
                "Initial load of {}: {} notifications, {} unread",
                self.subscriber,
                self.reconciler.store().len(),
                self.reconciler.store().unread_count()
            );
            return;
        }
        self.dispatch(&changes, true);
    }

    fn on_state(&mut self, state: ConnectionState) {
        info!("Subscription {} channel {}", self.subscriber, state);
        if state != ConnectionState::Connected {
            return;
        }
        if self.was_connected {
            // Catch up on whatever was missed while the channel was down
            self.poll.trigger();
        }
        self.was_connected = true;
    }

    // ===== Commands =====

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::MarkRead { id, respond } => match self.reconciler.begin_mark_read(&id) {
                Ok(local) => {
                    let backend = self.backend.clone();
                    self.start_mutation("mark_read", local, respond, async move {
                        backend.mark_read(&id).await
                    });
                }
                Err(e) => {
                    let _ = respond.send(Err(e));
                }
            },
            Command::MarkAllRead { respond } => {
                let local = self.reconciler.begin_mark_all_read();
                let backend = self.backend.clone();
                let ids = local.ids();
                self.start_mutation("mark_all_read", local, respond, async move {
                    backend.mark_many_read(&ids).await
                });
            }
            Command::Dismiss { id, respond } => match self.reconciler.begin_dismiss(&id) {
                Ok(local) => {
                    let backend = self.backend.clone();
                    self.start_mutation("dismiss", local, respond, async move {
                        backend.delete(&[id]).await
                    });
                }
                Err(e) => {
                    let _ = respond.send(Err(e));
                }
            },
            Command::Create { new, respond } => {
                let backend = self.backend.clone();
                let call = async move { backend.create(new).await }.boxed();
                let settle_tx = self.settle_tx.clone();
                let limit = self.mutation_timeout;
                tokio::spawn(async move {
                    let result = bounded(limit, call).await;
                    let _ = settle_tx.send(Settlement::Created { result, respond }).await;
                });
            }
            Command::Refresh => self.poll.trigger(),
            Command::AddListener(listener) => self.listeners.push(listener),
        }
    }

    /// Show the local change right away and run the backend call in the
    /// background. The caller is answered once the call settles.
    fn start_mutation<F>(
        &mut self,
        kind: &'static str,
        local: LocalMutation,
        respond: Respond<()>,
        call: F,
    ) where
        F: std::future::Future<Output = Result<(), BackendError>> + Send + 'static,
    {
        if local.is_empty() {
            let _ = respond.send(Ok(()));
            return;
        }
        self.dispatch(&local.changes, false);

        let call = call.boxed();
        let tickets = local.tickets;
        let settle_tx = self.settle_tx.clone();
        let limit = self.mutation_timeout;
        tokio::spawn(async move {
            let result = bounded(limit, call).await;
            let settlement = Settlement::Mutation {
                kind,
                tickets,
                result,
                respond,
            };
            let _ = settle_tx.send(settlement).await;
        });
    }

    fn settle(&mut self, settlement: Settlement) {
        match settlement {
            Settlement::Mutation {
                kind,
                tickets,
                result,
                respond,
            } => {
                metrics::record_mutation(kind, result.is_ok());
                match &result {
                    Ok(()) => self.reconciler.confirm(&tickets),
                    Err(e) => {
                        warn!(
                            "{} of {} notifications failed for {}, rolling back: {}",
                            kind,
                            tickets.len(),
                            self.subscriber,
                            e
                        );
                        let changes = self.reconciler.rollback(&tickets);
                        self.dispatch(&changes, false);
                    }
                }
                let _ = respond.send(result);
            }
            Settlement::Created { result, respond } => {
                metrics::record_mutation("create", result.is_ok());
                match &result {
                    Ok(record) => {
                        let changes = self.reconciler.apply_created(record.clone());
                        self.dispatch(&changes, false);
                    }
                    Err(e) => warn!("Creating notification for {} failed: {}", self.subscriber, e),
                }
                let _ = respond.send(result);
            }
        }
    }

    // ===== Fan-out =====

    fn dispatch(&self, changes: &[NotificationChange], alert: bool) {
        for change in changes {
            for listener in &self.listeners {
                listener::deliver(listener.as_ref(), change);
            }
            if let NotificationChange::Received(record) = change {
                if alert && !record.is_read {
                    self.alert(record);
                }
            }
        }
    }

    fn alert(&self, record: &NotificationRecord) {
        if !self.alerts.any() {
            return;
        }
        if let Err(e) = self.notifier.notify(record, self.alerts) {
            warn!("Alert for notification {} failed: {}", record.id, e);
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    call: BoxFuture<'static, Result<T, BackendError>>,
) -> Result<T, MutationError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(MutationError::from),
        Err(_) => Err(MutationError::Timeout(limit)),
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<PushEvent>>) -> Option<PushEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_state(
    states: &mut Option<broadcast::Receiver<ConnectionState>>,
) -> Option<ConnectionState> {
    let Some(states) = states else {
        return std::future::pending().await;
    };
    loop {
        match states.recv().await {
            Ok(state) => return Some(state),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Skipped {} connection state changes", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
