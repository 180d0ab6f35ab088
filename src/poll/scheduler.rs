//! Periodic full-refresh fetches.
//!
//! The scheduler fetches immediately, then on every interval tick or manual
//! trigger, and forwards each successful result as a `PollSnapshot`. A failed
//! fetch is logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::backend::{BackendError, NotificationBackend};
use crate::metrics;
use crate::notifications::{NotificationQuery, NotificationRecord, SubscriberId};
use crate::sync::PollSnapshot;

/// When to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollSchedule {
    /// Fetch once; further fetches only on trigger.
    Once,
    /// Fetch now and then at a fixed interval.
    Every(Duration),
}

/// Something that can be polled for the current records.
#[async_trait]
pub trait PollSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<NotificationRecord>, BackendError>;

    /// Page size of each fetch, if paged.
    fn page_size(&self) -> Option<usize> {
        None
    }
}

/// Polls a backend with a fixed query.
pub struct BackendPoll {
    backend: Arc<dyn NotificationBackend>,
    subscriber: SubscriberId,
    query: NotificationQuery,
}

impl BackendPoll {
    pub fn new(
        backend: Arc<dyn NotificationBackend>,
        subscriber: SubscriberId,
        query: NotificationQuery,
    ) -> Self {
        Self {
            backend,
            subscriber,
            query,
        }
    }
}

#[async_trait]
impl PollSource for BackendPoll {
    async fn fetch(&self) -> Result<Vec<NotificationRecord>, BackendError> {
        self.backend.query(&self.subscriber, &self.query).await
    }

    fn page_size(&self) -> Option<usize> {
        self.query.limit
    }
}

/// Running poll loop. Dropping the handle stops it.
pub struct PollHandle {
    trigger: Arc<Notify>,
    task: JoinHandle<()>,
    _guard: DropGuard,
}

impl PollHandle {
    /// Request an out-of-band fetch.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop and wait for the loop to exit.
    pub async fn stop(self) {
        let PollHandle {
            task, _guard: guard, ..
        } = self;
        drop(guard);
        let _ = task.await;
    }
}

pub struct PollScheduler;

impl PollScheduler {
    /// Spawn the poll loop. It stops when the handle is dropped, when `parent`
    /// is cancelled, or when `sink` is closed.
    pub fn start(
        schedule: PollSchedule,
        source: Arc<dyn PollSource>,
        sink: mpsc::Sender<PollSnapshot>,
        parent: &CancellationToken,
    ) -> PollHandle {
        let cancel = parent.child_token();
        let trigger = Arc::new(Notify::new());
        let task = tokio::spawn(run(
            schedule,
            source,
            sink,
            trigger.clone(),
            cancel.clone(),
        ));
        PollHandle {
            trigger,
            task,
            _guard: cancel.drop_guard(),
        }
    }
}

async fn run(
    schedule: PollSchedule,
    source: Arc<dyn PollSource>,
    sink: mpsc::Sender<PollSnapshot>,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut ticker = match schedule {
        PollSchedule::Once => None,
        PollSchedule::Every(interval) => {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(ticker)
        }
    };
    debug!("Poll loop started with schedule {:?}", schedule);

    loop {
        if !poll_once(source.as_ref(), &sink, &cancel).await {
            break;
        }
        if let Some(ticker) = ticker.as_mut() {
            ticker.reset();
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = trigger.notified() => debug!("Poll triggered manually"),
            _ = next_tick(&mut ticker) => {}
        }
    }

    debug!("Poll loop stopped");
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Fetch and forward one snapshot. Returns false when the loop should stop.
async fn poll_once(
    source: &dyn PollSource,
    sink: &mpsc::Sender<PollSnapshot>,
    cancel: &CancellationToken,
) -> bool {
    let requested_at = Instant::now();
    let result = tokio::select! {
        _ = cancel.cancelled() => return false,
        result = source.fetch() => result,
    };

    match result {
        Ok(records) => {
            metrics::record_poll_fetch(true);
            let snapshot = PollSnapshot {
                records,
                requested_at,
                limit: source.page_size(),
            };
            sink.send(snapshot).await.is_ok()
        }
        Err(e) => {
            metrics::record_poll_fetch(false);
            warn!("Notification poll failed, retrying on next tick: {}", e);
            true
        }
    }
}
