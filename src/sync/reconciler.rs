//! Single merge point for every source of notification state.
//!
//! Push events, poll snapshots and local optimistic mutations all go through
//! the `Reconciler`, which owns the subscriber's `NotificationStore` and
//! returns the visible diff of each application.
//!
//! Merge rules:
//! - push insert/update are idempotent upserts; a delete leaves a tombstone
//!   that hides older (versioned) re-inserts of the same id;
//! - a snapshot replaces the queried window, except for ids a push touched
//!   after the snapshot was requested;
//! - a local mutation wins until a server state at least as new as the
//!   mutation arrives. A server delete always wins.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::MutationError;
use crate::config::ReconcileSettings;
use crate::notifications::{
    now_millis, NotificationId, NotificationRecord, NotificationStore, NotificationView,
    PushEvent, PushEventType,
};

/// Visible effect of one application, as reported to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationChange {
    Received(NotificationRecord),
    Updated(NotificationRecord),
    Removed(NotificationId),
}

impl NotificationChange {
    pub fn id(&self) -> &str {
        match self {
            NotificationChange::Received(record) | NotificationChange::Updated(record) => {
                &record.id
            }
            NotificationChange::Removed(id) => id,
        }
    }
}

/// Result of one poll.
#[derive(Debug, Clone)]
pub struct PollSnapshot {
    pub records: Vec<NotificationRecord>,
    /// When the query was issued.
    pub requested_at: Instant,
    /// Page size of the query, if it was paged.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationKind {
    MarkRead { was_read: bool },
    /// `prior` is the mark-read still in flight when the dismiss started.
    Dismiss {
        previous: NotificationRecord,
        prior: Option<Box<PendingMutation>>,
    },
}

/// A local change not yet reflected by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub kind: MutationKind,
    pub seq: u64,
    /// Wall clock time of the mutation, compared with server versions.
    pub issued_at: i64,
    pub issued: Instant,
    /// Set once the backend accepted the call.
    pub acknowledged_at: Option<Instant>,
}

impl PendingMutation {
    /// Whether server state with this version is newer than the mutation.
    fn superseded_by(&self, version: Option<i64>) -> bool {
        version.is_some_and(|v| v >= self.issued_at)
    }
}

/// Identifies one pending mutation when the backend call settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationTicket {
    pub id: NotificationId,
    pub seq: u64,
}

/// Outcome of starting a local mutation.
#[derive(Debug, Clone, Default)]
pub struct LocalMutation {
    pub tickets: Vec<MutationTicket>,
    pub changes: Vec<NotificationChange>,
}

impl LocalMutation {
    /// Ids the backend has to be told about.
    pub fn ids(&self) -> Vec<NotificationId> {
        self.tickets.iter().map(|t| t.id.clone()).collect()
    }

    /// Nothing changed locally, so there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Tombstone {
    version: Option<i64>,
    recorded_at: Instant,
}

pub struct Reconciler {
    store: NotificationStore,
    pending: HashMap<NotificationId, PendingMutation>,
    tombstones: HashMap<NotificationId, Tombstone>,
    /// Last push arrival per id.
    touched: HashMap<NotificationId, Instant>,
    next_seq: u64,
    pending_ttl: Duration,
    tombstone_ttl: Duration,
}

impl Reconciler {
    pub fn new(settings: &ReconcileSettings) -> Self {
        Self {
            store: NotificationStore::new(),
            pending: HashMap::new(),
            tombstones: HashMap::new(),
            touched: HashMap::new(),
            next_seq: 0,
            pending_ttl: Duration::from_millis(settings.pending_ttl_ms),
            tombstone_ttl: Duration::from_millis(settings.tombstone_ttl_ms),
        }
    }

    pub fn store(&self) -> &NotificationStore {
        &self.store
    }

    pub fn subscribe(&self) -> watch::Receiver<NotificationView> {
        self.store.subscribe()
    }

    pub fn pending(&self, id: &str) -> Option<&PendingMutation> {
        self.pending.get(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains_key(id)
    }

    // ===== Server state =====

    pub fn apply_push(&mut self, event: PushEvent) -> Vec<NotificationChange> {
        let now = Instant::now();
        self.expire(now);

        let version = event.version();
        let id = event.record.id.clone();
        self.touched.insert(id.clone(), now);

        match event.event_type {
            PushEventType::Delete => {
                self.tombstones.insert(
                    id.clone(),
                    Tombstone {
                        version,
                        recorded_at: now,
                    },
                );
                if self.pending.remove(&id).is_some() {
                    debug!("Server delete of {} settles its pending mutation", id);
                }
                match self.store.remove(&id) {
                    Some(_) => vec![NotificationChange::Removed(id)],
                    None => Vec::new(),
                }
            }
            PushEventType::Insert | PushEventType::Update => {
                if let Some(tombstone) = self.tombstones.get(&id) {
                    if let (Some(deleted), Some(v)) = (tombstone.version, version) {
                        if v <= deleted {
                            debug!("Ignoring stale {:?} for deleted {}", event.event_type, id);
                            return Vec::new();
                        }
                    }
                    self.tombstones.remove(&id);
                }
                match self.merge_pending(event.record, version) {
                    Some(record) => upsert_change(&mut self.store, record).into_iter().collect(),
                    None => Vec::new(),
                }
            }
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: PollSnapshot) -> Vec<NotificationChange> {
        let now = Instant::now();
        self.expire(now);

        let PollSnapshot {
            records,
            requested_at,
            limit,
        } = snapshot;

        // A full page only speaks for records at least as new as its oldest.
        // Older cached records fall out of the window and are evicted.
        let floor = match limit {
            Some(limit) if limit > 0 && records.len() >= limit => {
                records.iter().map(|r| r.created_at).min()
            }
            _ => None,
        };
        let seen: HashSet<NotificationId> = records.iter().map(|r| r.id.clone()).collect();

        let mut upserts = Vec::with_capacity(records.len());
        for record in records {
            if self.pushed_since(&record.id, requested_at) {
                continue;
            }
            if let Some(tombstone) = self.tombstones.get(&record.id) {
                let stale = matches!(
                    (tombstone.version, record.server_version()),
                    (Some(deleted), Some(v)) if v <= deleted
                );
                if stale {
                    continue;
                }
                self.tombstones.remove(&record.id);
            }
            let version = record.server_version();
            if let Some(record) = self.merge_pending(record, version) {
                upserts.push(record);
            }
        }

        // Acknowledged dismissals the server no longer reports are done
        self.pending.retain(|id, p| {
            let confirmed = matches!(p.kind, MutationKind::Dismiss { .. })
                && p.acknowledged_at.is_some_and(|ack| requested_at >= ack)
                && !seen.contains(id);
            !confirmed
        });

        let removals: Vec<NotificationId> = self
            .store
            .iter()
            .filter(|r| !seen.contains(&r.id))
            .filter(|r| match floor {
                Some(floor) if r.created_at < floor => !self.pending.contains_key(&r.id),
                _ => true,
            })
            .filter(|r| !self.pushed_since(&r.id, requested_at))
            .map(|r| r.id.clone())
            .collect();
        for id in &removals {
            self.pending.remove(id);
        }

        self.store.batch(|store| {
            let mut changes = Vec::new();
            for record in upserts {
                changes.extend(upsert_change(store, record));
            }
            for id in removals {
                if store.remove(&id).is_some() {
                    changes.push(NotificationChange::Removed(id));
                }
            }
            changes
        })
    }

    /// Record returned by a successful local create.
    pub fn apply_created(&mut self, record: NotificationRecord) -> Vec<NotificationChange> {
        let now = Instant::now();
        self.expire(now);
        if self.tombstones.contains_key(&record.id) {
            return Vec::new();
        }
        self.touched.insert(record.id.clone(), now);
        upsert_change(&mut self.store, record).into_iter().collect()
    }

    // ===== Local optimistic mutations =====

    pub fn begin_mark_read(&mut self, id: &str) -> Result<LocalMutation, MutationError> {
        match self.store.get(id) {
            None => Err(MutationError::NotFound(id.to_string())),
            Some(record) if record.is_read => Ok(LocalMutation::default()),
            Some(_) => Ok(self.mark_ids_read(vec![id.to_string()])),
        }
    }

    pub fn begin_mark_all_read(&mut self) -> LocalMutation {
        let ids = self.store.unread_ids();
        self.mark_ids_read(ids)
    }

    pub fn begin_dismiss(&mut self, id: &str) -> Result<LocalMutation, MutationError> {
        let previous = self
            .store
            .remove(id)
            .ok_or_else(|| MutationError::NotFound(id.to_string()))?;

        let prior = match self.pending.remove(id) {
            Some(p) if matches!(p.kind, MutationKind::MarkRead { .. }) => Some(Box::new(p)),
            _ => None,
        };
        let seq = self.issue_seq();
        self.pending.insert(
            id.to_string(),
            PendingMutation {
                kind: MutationKind::Dismiss { previous, prior },
                seq,
                issued_at: now_millis(),
                issued: Instant::now(),
                acknowledged_at: None,
            },
        );
        Ok(LocalMutation {
            tickets: vec![MutationTicket {
                id: id.to_string(),
                seq,
            }],
            changes: vec![NotificationChange::Removed(id.to_string())],
        })
    }

    /// The backend accepted the mutations.
    pub fn confirm(&mut self, tickets: &[MutationTicket]) {
        let now = Instant::now();
        for ticket in tickets {
            let Some(pending) = self.pending.get_mut(&ticket.id) else {
                continue;
            };
            if pending.seq == ticket.seq {
                pending.acknowledged_at = Some(now);
            } else if let MutationKind::Dismiss {
                prior: Some(prior), ..
            } = &mut pending.kind
            {
                if prior.seq == ticket.seq {
                    prior.acknowledged_at = Some(now);
                }
            }
        }
    }

    /// The backend rejected the mutations; restore what they changed.
    ///
    /// Mutations already settled by newer server state are left alone.
    pub fn rollback(&mut self, tickets: &[MutationTicket]) -> Vec<NotificationChange> {
        let Reconciler {
            store,
            pending,
            tombstones,
            ..
        } = self;

        store.batch(|store| {
            let mut changes = Vec::new();
            for ticket in tickets {
                let current = matches!(pending.get(&ticket.id), Some(p) if p.seq == ticket.seq);
                if !current {
                    // A mark-read under a later dismiss: restoring the record
                    // on dismiss rollback must bring back its original read state
                    if let Some(PendingMutation {
                        kind: MutationKind::Dismiss { previous, prior },
                        ..
                    }) = pending.get_mut(&ticket.id)
                    {
                        if let Some(MutationKind::MarkRead { was_read }) = prior
                            .as_ref()
                            .filter(|p| p.seq == ticket.seq)
                            .map(|p| p.kind.clone())
                        {
                            previous.is_read = was_read;
                            *prior = None;
                        }
                    }
                    continue;
                }
                let Some(mutation) = pending.remove(&ticket.id) else {
                    continue;
                };
                match mutation.kind {
                    MutationKind::MarkRead { was_read } => {
                        if !was_read && store.set_read(&ticket.id, false) == Some(true) {
                            if let Some(record) = store.get(&ticket.id) {
                                changes.push(NotificationChange::Updated(record.clone()));
                            }
                        }
                    }
                    MutationKind::Dismiss { previous, prior } => {
                        if !store.contains(&ticket.id) && !tombstones.contains_key(&ticket.id) {
                            store.upsert(previous.clone());
                            changes.push(NotificationChange::Received(previous));
                            // The mark-read underneath is still unsettled
                            if let Some(prior) = prior {
                                pending.insert(ticket.id.clone(), *prior);
                            }
                        }
                    }
                }
            }
            changes
        })
    }

    /// Forget everything, including the cached records.
    pub fn clear(&mut self) {
        self.store.clear();
        self.pending.clear();
        self.tombstones.clear();
        self.touched.clear();
    }

    // ===== Internals =====

    fn issue_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn mark_ids_read(&mut self, ids: Vec<NotificationId>) -> LocalMutation {
        let issued_at = now_millis();
        let issued = Instant::now();
        let Reconciler {
            store,
            pending,
            next_seq,
            ..
        } = self;

        store.batch(|store| {
            let mut mutation = LocalMutation::default();
            for id in ids {
                if store.set_read(&id, true) != Some(false) {
                    continue;
                }
                *next_seq += 1;
                let seq = *next_seq;
                pending.insert(
                    id.clone(),
                    PendingMutation {
                        kind: MutationKind::MarkRead { was_read: false },
                        seq,
                        issued_at,
                        issued,
                        acknowledged_at: None,
                    },
                );
                if let Some(record) = store.get(&id) {
                    mutation
                        .changes
                        .push(NotificationChange::Updated(record.clone()));
                }
                mutation.tickets.push(MutationTicket { id, seq });
            }
            mutation
        })
    }

    /// Apply the pending local mutation of a record to incoming server state.
    /// Returns `None` when the record stays hidden by a local dismiss.
    fn merge_pending(
        &mut self,
        mut record: NotificationRecord,
        version: Option<i64>,
    ) -> Option<NotificationRecord> {
        let (dismissed, superseded) = match self.pending.get(&record.id) {
            None => return Some(record),
            Some(p) => (
                matches!(p.kind, MutationKind::Dismiss { .. }),
                p.superseded_by(version),
            ),
        };

        if dismissed {
            if superseded {
                debug!("Server state of {} supersedes local dismiss", record.id);
                self.pending.remove(&record.id);
                return Some(record);
            }
            return None;
        }

        if record.is_read || superseded {
            // Echo of our mark-read, or newer server state
            self.pending.remove(&record.id);
        } else {
            record.is_read = true;
        }
        Some(record)
    }

    fn pushed_since(&self, id: &str, instant: Instant) -> bool {
        self.touched.get(id).is_some_and(|t| *t >= instant)
    }

    fn expire(&mut self, now: Instant) {
        let pending_ttl = self.pending_ttl;
        self.pending.retain(|id, p| match p.acknowledged_at {
            Some(ack) if now.duration_since(ack) >= pending_ttl => {
                debug!("Pending mutation of {} expired without echo", id);
                false
            }
            _ => true,
        });

        let tombstone_ttl = self.tombstone_ttl;
        self.tombstones
            .retain(|_, t| now.duration_since(t.recorded_at) < tombstone_ttl);
        self.touched
            .retain(|_, t| now.duration_since(*t) < tombstone_ttl);
    }
}

/// Upsert and describe the visible effect, if any.
fn upsert_change(
    store: &mut NotificationStore,
    record: NotificationRecord,
) -> Option<NotificationChange> {
    match store.upsert(record.clone()) {
        None => Some(NotificationChange::Received(record)),
        Some(previous) if previous == record => None,
        Some(_) => Some(NotificationChange::Updated(record)),
    }
}
