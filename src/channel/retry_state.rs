//! Retry counters shared by all channel managers of one hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy)]
struct RetryEntry {
    /// Manager that last wrote the counter.
    owner: u64,
    attempts: u32,
}

/// Consecutive failed connect attempts, keyed by subscription key.
///
/// Concurrent subscriptions for different subscribers use different keys and
/// never see each other's counters. Each manager registers an owner id so a
/// late teardown of a previous session cannot drop its successor's entry.
#[derive(Debug, Default)]
pub struct RetryRegistry {
    attempts: RwLock<HashMap<String, RetryEntry>>,
    next_owner: AtomicU64,
}

impl RetryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner id for a new channel manager.
    pub fn register(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a failed attempt and return the new count.
    ///
    /// An entry left behind by another owner starts over from zero.
    pub async fn increment(&self, key: &str, owner: u64) -> u32 {
        let mut attempts = self.attempts.write().await;
        let entry = attempts
            .entry(key.to_string())
            .or_insert(RetryEntry { owner, attempts: 0 });
        if entry.owner != owner {
            *entry = RetryEntry { owner, attempts: 0 };
        }
        entry.attempts = entry.attempts.saturating_add(1);
        entry.attempts
    }

    /// Reset the counter after a successful connect.
    pub async fn reset(&self, key: &str) {
        let mut attempts = self.attempts.write().await;
        if let Some(entry) = attempts.get_mut(key) {
            entry.attempts = 0;
        }
    }

    pub async fn attempts(&self, key: &str) -> u32 {
        self.attempts
            .read()
            .await
            .get(key)
            .map(|e| e.attempts)
            .unwrap_or(0)
    }

    /// Drop the entry of a torn down subscription, if `owner` still holds it.
    pub async fn forget(&self, key: &str, owner: u64) {
        let mut attempts = self.attempts.write().await;
        if attempts.get(key).is_some_and(|e| e.owner == owner) {
            attempts.remove(key);
        }
    }

    pub async fn tracked_keys(&self) -> usize {
        self.attempts.read().await.len()
    }
}
