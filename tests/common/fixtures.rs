//! Record builders and listeners shared by the tests

#![allow(dead_code)]

use std::sync::Mutex;

use igabay_notification_sync::notifications::{NotificationKind, NotificationRecord};
use igabay_notification_sync::subscription::NotificationListener;

pub fn notification(id: &str, account_id: &str, created_at: i64) -> NotificationRecord {
    NotificationRecord {
        id: id.to_string(),
        subscriber_id: account_id.to_string(),
        kind: NotificationKind::AppointmentReminder,
        is_read: false,
        created_at,
        updated_at: None,
        payload: serde_json::json!({ "title": format!("Reminder {}", id) }),
    }
}

pub fn read_notification(id: &str, account_id: &str, created_at: i64) -> NotificationRecord {
    NotificationRecord {
        is_read: true,
        ..notification(id, account_id, created_at)
    }
}

/// Listener collecting every callback as a short string.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl NotificationListener for RecordingListener {
    fn on_notification_received(&self, record: &NotificationRecord) {
        self.events
            .lock()
            .unwrap()
            .push(format!("received:{}", record.id));
    }

    fn on_notification_updated(&self, record: &NotificationRecord) {
        self.events
            .lock()
            .unwrap()
            .push(format!("updated:{}", record.id));
    }

    fn on_notification_deleted(&self, id: &str) {
        self.events.lock().unwrap().push(format!("deleted:{}", id));
    }
}
