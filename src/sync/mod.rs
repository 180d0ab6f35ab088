//! Reconciliation of push events, poll snapshots and local mutations.

mod reconciler;

use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;
use crate::notifications::NotificationId;

pub use reconciler::{
    LocalMutation, MutationKind, MutationTicket, NotificationChange, PendingMutation,
    PollSnapshot, Reconciler,
};

/// Failure of a local mutation. The optimistic change has been rolled back
/// by the time the caller sees it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutationError {
    #[error("notification not found: {0}")]
    NotFound(NotificationId),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),

    #[error("subscription closed")]
    SessionClosed,
}
