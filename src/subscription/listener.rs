//! Callbacks for visible notification changes.

use tracing::info;

use crate::notifications::NotificationRecord;
use crate::sync::NotificationChange;

/// Receives the visible changes of a subscription.
///
/// Listeners are called from the session task and must return quickly.
pub trait NotificationListener: Send + Sync {
    fn on_notification_received(&self, _record: &NotificationRecord) {}

    fn on_notification_updated(&self, _record: &NotificationRecord) {}

    fn on_notification_deleted(&self, _id: &str) {}
}

/// Route one change to the matching callback.
pub(crate) fn deliver(listener: &dyn NotificationListener, change: &NotificationChange) {
    match change {
        NotificationChange::Received(record) => listener.on_notification_received(record),
        NotificationChange::Updated(record) => listener.on_notification_updated(record),
        NotificationChange::Removed(id) => listener.on_notification_deleted(id),
    }
}

/// Logs every change at `info`.
#[derive(Debug, Default, Clone)]
pub struct LoggingListener;

impl NotificationListener for LoggingListener {
    fn on_notification_received(&self, record: &NotificationRecord) {
        info!(
            id = %record.id,
            kind = record.kind.as_str(),
            read = record.is_read,
            "Notification received"
        );
    }

    fn on_notification_updated(&self, record: &NotificationRecord) {
        info!(id = %record.id, read = record.is_read, "Notification updated");
    }

    fn on_notification_deleted(&self, id: &str) {
        info!(id = %id, "Notification deleted");
    }
}
