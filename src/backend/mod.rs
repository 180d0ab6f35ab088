//! Persistent notification store seam.
//!
//! `NotificationBackend` is the query/mutation side of the hosted store; push
//! delivery goes through `channel::PushTransport`. Two implementations ship
//! with the crate: an in-process one for tests and demos, and a remote one
//! speaking JSON over HTTP and WebSocket.

pub mod memory;
pub mod remote;

use async_trait::async_trait;
use thiserror::Error;

use crate::notifications::{
    NewNotification, NotificationId, NotificationQuery, NotificationRecord, SubscriberId,
};

pub use memory::InMemoryBackend;
pub use remote::{HttpBackend, WebSocketTransport};

/// Errors returned by a notification backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("notification not found: {0}")]
    NotFound(NotificationId),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

/// Query and mutation operations of the persistent notification store.
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait NotificationBackend: Send + Sync {
    /// Records of one subscriber, newest first.
    async fn query(
        &self,
        subscriber: &SubscriberId,
        query: &NotificationQuery,
    ) -> Result<Vec<NotificationRecord>, BackendError>;

    async fn mark_read(&self, id: &str) -> Result<(), BackendError>;

    /// Mark several records read. Unknown ids are ignored.
    async fn mark_many_read(&self, ids: &[NotificationId]) -> Result<(), BackendError>;

    /// Delete records. Unknown ids are ignored.
    async fn delete(&self, ids: &[NotificationId]) -> Result<(), BackendError>;

    /// Persist a new notification and return it with its assigned id.
    async fn create(&self, notification: NewNotification)
        -> Result<NotificationRecord, BackendError>;
}
