//! Notification records and the local per-subscriber cache.

mod models;
mod store;

pub use models::{
    now_millis, NewNotification, NotificationId, NotificationKind, NotificationQuery,
    NotificationRecord, PushEvent, PushEventType, SubscriberId, SubscriberRole,
};
pub use store::{NotificationStore, NotificationView};
