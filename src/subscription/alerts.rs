//! Sound, banner and vibration side effects for new notifications.

use thiserror::Error;
use tracing::info;

use crate::config::SubscriptionOptions;
use crate::notifications::NotificationRecord;

/// Which side effects to produce for one notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertKinds {
    pub sound: bool,
    pub banner: bool,
    pub vibrate: bool,
}

impl AlertKinds {
    pub fn from_options(options: &SubscriptionOptions) -> Self {
        Self {
            sound: options.play_sound,
            banner: options.show_browser_notification,
            vibrate: options.vibrate,
        }
    }

    pub fn any(&self) -> bool {
        self.sound || self.banner || self.vibrate
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("alert failed: {0}")]
pub struct AlertError(pub String);

/// Produces user-facing alerts. Called only for newly received unread
/// notifications; a failure is logged and never affects the cached state.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait AlertNotifier: Send + Sync {
    fn notify(&self, record: &NotificationRecord, kinds: AlertKinds) -> Result<(), AlertError>;
}

/// Drops every alert.
#[derive(Debug, Default, Clone)]
pub struct NoopNotifier;

impl AlertNotifier for NoopNotifier {
    fn notify(&self, _record: &NotificationRecord, _kinds: AlertKinds) -> Result<(), AlertError> {
        Ok(())
    }
}

/// Writes alerts to the log. Used by the command line client.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl AlertNotifier for LogNotifier {
    fn notify(&self, record: &NotificationRecord, kinds: AlertKinds) -> Result<(), AlertError> {
        let title = record
            .payload
            .get("title")
            .and_then(|t| t.as_str())
            .unwrap_or(record.kind.as_str());
        info!(
            id = %record.id,
            sound = kinds.sound,
            banner = kinds.banner,
            vibrate = kinds.vibrate,
            "New notification: {}",
            title
        );
        Ok(())
    }
}
