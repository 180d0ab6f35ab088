//! In-process notification backend and push transport.
//!
//! Keeps records in memory, publishes push events to open channels the way the
//! hosted store would, and lets callers inject connection and request faults.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{BackendError, NotificationBackend};
use crate::channel::{ChannelError, PushItem, PushStream, PushTransport};
use crate::notifications::{
    now_millis, NewNotification, NotificationId, NotificationQuery, NotificationRecord, PushEvent,
    SubscriberId,
};

const FEED_BUFFER: usize = 64;

struct Feed {
    account_id: String,
    sender: mpsc::Sender<PushItem>,
}

#[derive(Default)]
struct BackendState {
    records: HashMap<NotificationId, NotificationRecord>,
    feeds: Vec<Feed>,
    fail_connects: u32,
    hang_connects: u32,
    fail_queries: bool,
    fail_mutations: bool,
    mute_echo: bool,
}

/// In-memory store implementing both `NotificationBackend` and `PushTransport`.
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
    connects: AtomicUsize,
    queries: AtomicUsize,
    mutations: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== Server-side writes =====

    /// Store records without publishing anything, as pre-existing data.
    pub async fn seed(&self, records: impl IntoIterator<Item = NotificationRecord>) {
        let mut state = self.state.lock().await;
        for record in records {
            state.records.insert(record.id.clone(), record);
        }
    }

    /// Store a record and publish an insert event.
    pub async fn insert(&self, record: NotificationRecord) {
        let version = now_millis();
        self.state
            .lock()
            .await
            .records
            .insert(record.id.clone(), record.clone());
        self.publish(PushEvent::insert(record).at(version)).await;
    }

    /// Replace a record and publish an update event.
    pub async fn update(&self, mut record: NotificationRecord) {
        let version = now_millis();
        record.updated_at = Some(version);
        self.state
            .lock()
            .await
            .records
            .insert(record.id.clone(), record.clone());
        self.publish(PushEvent::update(record).at(version)).await;
    }

    /// Delete a record and publish a delete event. Returns false if unknown.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.state.lock().await.records.remove(id);
        match removed {
            Some(record) => {
                self.publish(PushEvent::delete(record).at(now_millis())).await;
                true
            }
            None => false,
        }
    }

    /// Deliver an arbitrary event without touching the stored records.
    pub async fn push_raw(&self, event: PushEvent) {
        self.publish(event).await;
    }

    // ===== Fault injection =====

    /// Fail the next `count` connect attempts.
    pub async fn fail_next_connects(&self, count: u32) {
        self.state.lock().await.fail_connects = count;
    }

    /// Make the next `count` connect attempts never complete.
    pub async fn hang_next_connects(&self, count: u32) {
        self.state.lock().await.hang_connects = count;
    }

    /// Close every open channel, as if the server dropped them.
    pub async fn drop_connections(&self) {
        let dropped = std::mem::take(&mut self.state.lock().await.feeds);
        debug!("Dropping {} push connections", dropped.len());
    }

    /// Send an error on every open channel.
    pub async fn break_connections(&self, error: ChannelError) {
        let senders = self.live_senders(None).await;
        for sender in senders {
            let _ = sender.send(Err(error.clone())).await;
        }
    }

    pub async fn set_fail_queries(&self, fail: bool) {
        self.state.lock().await.fail_queries = fail;
    }

    pub async fn set_fail_mutations(&self, fail: bool) {
        self.state.lock().await.fail_mutations = fail;
    }

    /// When disabled, local mutations are stored but not echoed on the push
    /// channel.
    pub async fn set_push_echo(&self, echo: bool) {
        self.state.lock().await.mute_echo = !echo;
    }

    // ===== Inspection =====

    pub async fn record(&self, id: &str) -> Option<NotificationRecord> {
        self.state.lock().await.records.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn open_connections(&self) -> usize {
        self.live_senders(None).await.len()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    // ===== Internals =====

    async fn live_senders(&self, account_id: Option<&str>) -> Vec<mpsc::Sender<PushItem>> {
        let mut state = self.state.lock().await;
        state.feeds.retain(|feed| !feed.sender.is_closed());
        state
            .feeds
            .iter()
            .filter(|feed| account_id.map_or(true, |id| feed.account_id == id))
            .map(|feed| feed.sender.clone())
            .collect()
    }

    async fn publish(&self, event: PushEvent) {
        let senders = self.live_senders(Some(&event.record.subscriber_id)).await;
        for sender in senders {
            let _ = sender.send(Ok(event.clone())).await;
        }
    }

    /// Start a mutation; returns whether its effect should be echoed.
    async fn begin_mutation(&self) -> Result<bool, BackendError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        if state.fail_mutations {
            return Err(BackendError::Unavailable("injected mutation failure".to_string()));
        }
        Ok(!state.mute_echo)
    }

    /// Mark records read and return the changed ones.
    async fn set_read(&self, ids: &[NotificationId]) -> Vec<NotificationRecord> {
        let version = now_millis();
        let mut state = self.state.lock().await;
        let mut changed = Vec::new();
        for id in ids {
            if let Some(record) = state.records.get_mut(id) {
                if !record.is_read {
                    record.is_read = true;
                    record.updated_at = Some(version);
                    changed.push(record.clone());
                }
            }
        }
        changed
    }
}

#[async_trait]
impl NotificationBackend for InMemoryBackend {
    async fn query(
        &self,
        subscriber: &SubscriberId,
        query: &NotificationQuery,
    ) -> Result<Vec<NotificationRecord>, BackendError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        if state.fail_queries {
            return Err(BackendError::Unavailable("injected query failure".to_string()));
        }

        let mut records: Vec<NotificationRecord> = state
            .records
            .values()
            .filter(|r| r.subscriber_id == subscriber.account_id && query.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn mark_read(&self, id: &str) -> Result<(), BackendError> {
        let echo = self.begin_mutation().await?;
        if !self.state.lock().await.records.contains_key(id) {
            return Err(BackendError::NotFound(id.to_string()));
        }
        let changed = self.set_read(&[id.to_string()]).await;
        if echo {
            for record in changed {
                let version = record.updated_at.unwrap_or_else(now_millis);
                self.publish(PushEvent::update(record).at(version)).await;
            }
        }
        Ok(())
    }

    async fn mark_many_read(&self, ids: &[NotificationId]) -> Result<(), BackendError> {
        let echo = self.begin_mutation().await?;
        let changed = self.set_read(ids).await;
        if echo {
            for record in changed {
                let version = record.updated_at.unwrap_or_else(now_millis);
                self.publish(PushEvent::update(record).at(version)).await;
            }
        }
        Ok(())
    }

    async fn delete(&self, ids: &[NotificationId]) -> Result<(), BackendError> {
        let echo = self.begin_mutation().await?;
        let removed: Vec<NotificationRecord> = {
            let mut state = self.state.lock().await;
            ids.iter().filter_map(|id| state.records.remove(id)).collect()
        };
        if echo {
            let version = now_millis();
            for record in removed {
                self.publish(PushEvent::delete(record).at(version)).await;
            }
        }
        Ok(())
    }

    async fn create(
        &self,
        notification: NewNotification,
    ) -> Result<NotificationRecord, BackendError> {
        let echo = self.begin_mutation().await?;
        if notification.subscriber_id.trim().is_empty() {
            return Err(BackendError::Rejected("subscriber_id is required".to_string()));
        }
        let created_at = now_millis();
        let record = NotificationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            subscriber_id: notification.subscriber_id,
            kind: notification.kind,
            is_read: false,
            created_at,
            updated_at: Some(created_at),
            payload: notification.payload,
        };
        self.state
            .lock()
            .await
            .records
            .insert(record.id.clone(), record.clone());
        if echo {
            self.publish(PushEvent::insert(record.clone()).at(created_at))
                .await;
        }
        Ok(record)
    }
}

#[async_trait]
impl PushTransport for InMemoryBackend {
    async fn open(&self, subscriber: &SubscriberId) -> Result<PushStream, ChannelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let hang = {
            let mut state = self.state.lock().await;
            if state.hang_connects > 0 {
                state.hang_connects -= 1;
                true
            } else if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(ChannelError::ConnectFailed(
                    "injected connect failure".to_string(),
                ));
            } else {
                false
            }
        };
        if hang {
            return std::future::pending().await;
        }

        let (sender, stream) = PushStream::channel(FEED_BUFFER);
        self.state.lock().await.feeds.push(Feed {
            account_id: subscriber.account_id.clone(),
            sender,
        });
        debug!("Opened in-memory push channel for {}", subscriber);
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{NotificationKind, PushEventType};

    fn record(id: &str, account: &str, created_at: i64) -> NotificationRecord {
        NotificationRecord {
            id: id.to_string(),
            subscriber_id: account.to_string(),
            kind: NotificationKind::AppointmentReminder,
            is_read: false,
            created_at,
            updated_at: None,
            payload: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_query_filters_and_orders() {
        let backend = InMemoryBackend::new();
        backend
            .seed(vec![
                record("a", "p-1", 10),
                record("b", "p-1", 30),
                record("c", "p-2", 20),
                record("d", "p-1", 30),
            ])
            .await;

        let subscriber = SubscriberId::patient("p-1");
        let all = backend
            .query(&subscriber, &NotificationQuery::default())
            .await
            .unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d", "a"]);

        let page = NotificationQuery {
            limit: Some(1),
            offset: Some(1),
            ..Default::default()
        };
        let paged = backend.query(&subscriber, &page).await.unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].id, "d");
        assert_eq!(backend.query_count(), 2);
    }

    #[tokio::test]
    async fn test_push_only_reaches_owner() {
        let backend = InMemoryBackend::new();
        let mut mine = backend.open(&SubscriberId::patient("p-1")).await.unwrap();
        let mut other = backend.open(&SubscriberId::doctor("d-1")).await.unwrap();

        backend.insert(record("a", "p-1", 1)).await;
        backend.insert(record("b", "d-1", 2)).await;

        let event = mine.next().await.unwrap().unwrap();
        assert_eq!(event.event_type, PushEventType::Insert);
        assert_eq!(event.record.id, "a");
        assert!(event.commit_timestamp.is_some());

        let event = other.next().await.unwrap().unwrap();
        assert_eq!(event.record.id, "b");
        assert_eq!(backend.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_mark_read_echoes_update() {
        let backend = InMemoryBackend::new();
        backend.seed(vec![record("a", "p-1", 1)]).await;
        let mut stream = backend.open(&SubscriberId::patient("p-1")).await.unwrap();

        backend.mark_read("a").await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.event_type, PushEventType::Update);
        assert!(event.record.is_read);
        assert!(backend.record("a").await.unwrap().is_read);

        assert_eq!(
            backend.mark_read("missing").await,
            Err(BackendError::NotFound("missing".to_string()))
        );
    }

    #[tokio::test]
    async fn test_muted_echo_and_failures() {
        let backend = InMemoryBackend::new();
        backend
            .seed(vec![record("a", "p-1", 1), record("b", "p-1", 2)])
            .await;
        let mut stream = backend.open(&SubscriberId::patient("p-1")).await.unwrap();

        backend.set_push_echo(false).await;
        backend.delete(&["a".to_string()]).await.unwrap();
        assert!(backend.record("a").await.is_none());

        backend.set_fail_mutations(true).await;
        assert!(matches!(
            backend.mark_many_read(&["b".to_string()]).await,
            Err(BackendError::Unavailable(_))
        ));
        assert!(!backend.record("b").await.unwrap().is_read);

        backend.set_push_echo(true).await;
        backend.set_fail_mutations(false).await;
        backend.remove("b").await;
        // The muted delete of "a" never reached the stream
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.event_type, PushEventType::Delete);
        assert_eq!(event.record.id, "b");
    }

    #[tokio::test]
    async fn test_create_assigns_id() {
        let backend = InMemoryBackend::new();
        let created = backend
            .create(NewNotification {
                subscriber_id: "c-1".to_string(),
                kind: NotificationKind::System,
                payload: serde_json::json!({ "title": "Clinic hours updated" }),
            })
            .await
            .unwrap();

        assert!(!created.id.is_empty());
        assert!(!created.is_read);
        assert_eq!(backend.record(&created.id).await, Some(created));

        let rejected = backend
            .create(NewNotification {
                subscriber_id: " ".to_string(),
                kind: NotificationKind::System,
                payload: serde_json::Value::Null,
            })
            .await;
        assert!(matches!(rejected, Err(BackendError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_connect_fault_injection() {
        let backend = InMemoryBackend::new();
        let subscriber = SubscriberId::patient("p-1");
        backend.fail_next_connects(2).await;

        assert!(backend.open(&subscriber).await.is_err());
        assert!(backend.open(&subscriber).await.is_err());
        let mut stream = backend.open(&subscriber).await.unwrap();
        assert_eq!(backend.open_connections().await, 1);

        backend.drop_connections().await;
        assert!(stream.next().await.is_none());
        assert_eq!(backend.open_connections().await, 0);
    }
}
