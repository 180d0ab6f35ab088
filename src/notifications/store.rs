//! Ordered local cache of notification records for one subscriber.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use tokio::sync::watch;

use super::models::{NotificationId, NotificationRecord};

/// Position of a record in the exposed list: newest first, ties by id.
type OrderKey = (Reverse<i64>, NotificationId);

fn order_key(record: &NotificationRecord) -> OrderKey {
    (Reverse(record.created_at), record.id.clone())
}

/// Derived view published to store observers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationView {
    pub records: Vec<NotificationRecord>,
    pub unread_count: usize,
}

/// Deduplicated, ordered notification cache.
///
/// Records are kept in a `BTreeMap` keyed by `(Reverse(created_at), id)` with an
/// id index on the side, so upsert and remove are O(log n). The unread count is
/// maintained on every mutation and never recomputed.
pub struct NotificationStore {
    records: BTreeMap<OrderKey, NotificationRecord>,
    index: HashMap<NotificationId, OrderKey>,
    unread: usize,
    publisher: watch::Sender<NotificationView>,
    batch_depth: usize,
    dirty: bool,
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationStore {
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(NotificationView::default());
        Self {
            records: BTreeMap::new(),
            index: HashMap::new(),
            unread: 0,
            publisher,
            batch_depth: 0,
            dirty: false,
        }
    }

    /// Register an observer. The receiver always holds the latest view.
    pub fn subscribe(&self) -> watch::Receiver<NotificationView> {
        self.publisher.subscribe()
    }

    // ===== Getters =====

    pub fn get(&self, id: &str) -> Option<&NotificationRecord> {
        self.index.get(id).and_then(|key| self.records.get(key))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.unread
    }

    /// Ordered snapshot of the cached records.
    pub fn list(&self) -> Vec<NotificationRecord> {
        self.records.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NotificationRecord> {
        self.records.values()
    }

    pub fn ids(&self) -> Vec<NotificationId> {
        self.records.keys().map(|(_, id)| id.clone()).collect()
    }

    pub fn unread_ids(&self) -> Vec<NotificationId> {
        self.records
            .values()
            .filter(|r| !r.is_read)
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn view(&self) -> NotificationView {
        NotificationView {
            records: self.list(),
            unread_count: self.unread,
        }
    }

    // ===== Mutations =====

    /// Insert the record, or replace the one with the same id.
    ///
    /// Returns the replaced record, if any. Replacing with an identical record
    /// does not notify observers.
    pub fn upsert(&mut self, record: NotificationRecord) -> Option<NotificationRecord> {
        if self.get(&record.id) == Some(&record) {
            return Some(record);
        }

        let previous = self.detach(&record.id);
        if !record.is_read {
            self.unread += 1;
        }
        let key = order_key(&record);
        self.index.insert(record.id.clone(), key.clone());
        self.records.insert(key, record);
        self.publish();
        previous
    }

    /// Remove a record. Removing an unknown id is a no-op.
    pub fn remove(&mut self, id: &str) -> Option<NotificationRecord> {
        let removed = self.detach(id);
        if removed.is_some() {
            self.publish();
        }
        removed
    }

    /// Set the read flag of one record. Returns the previous flag if the
    /// record exists.
    pub fn set_read(&mut self, id: &str, is_read: bool) -> Option<bool> {
        let key = self.index.get(id)?;
        let record = self.records.get_mut(key)?;
        let previous = record.is_read;
        if previous == is_read {
            return Some(previous);
        }
        record.is_read = is_read;
        if is_read {
            self.unread = self.unread.saturating_sub(1);
        } else {
            self.unread += 1;
        }
        self.publish();
        Some(previous)
    }

    pub fn clear(&mut self) {
        if self.records.is_empty() {
            return;
        }
        self.records.clear();
        self.index.clear();
        self.unread = 0;
        self.publish();
    }

    /// Run several mutations and publish a single view at the end.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.batch_depth += 1;
        let result = f(self);
        self.batch_depth -= 1;
        if self.batch_depth == 0 && self.dirty {
            self.publish();
        }
        result
    }

    fn detach(&mut self, id: &str) -> Option<NotificationRecord> {
        let key = self.index.remove(id)?;
        let removed = self.records.remove(&key)?;
        if !removed.is_read {
            self.unread = self.unread.saturating_sub(1);
        }
        Some(removed)
    }

    fn publish(&mut self) {
        if self.batch_depth > 0 {
            self.dirty = true;
            return;
        }
        self.dirty = false;
        self.publisher.send_replace(self.view());
    }
}
