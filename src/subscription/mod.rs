//! Public subscribe/unsubscribe surface.
//!
//! `NotificationHub::subscribe` composes a push channel, a poll scheduler and
//! a reconciler into one session per subscriber. Callers interact with the
//! session through `SubscriptionHandle`.

mod alerts;
mod hub;
mod listener;
mod session;

use thiserror::Error;

pub use alerts::{AlertError, AlertKinds, AlertNotifier, LogNotifier, NoopNotifier};
pub use hub::{NotificationHub, SubscriptionHandle};
pub use listener::{LoggingListener, NotificationListener};

#[cfg(feature = "mock")]
pub use alerts::MockAlertNotifier;

/// Reasons a subscription could not be started. Nothing is started when one
/// of these is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubscribeError {
    #[error("subscriber account id is missing")]
    MissingSubscriber,

    #[error("invalid subscription options: {0}")]
    InvalidOptions(String),
}
