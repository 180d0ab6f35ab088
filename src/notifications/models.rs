//! Notification data models

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque notification identifier assigned by the backing store.
pub type NotificationId = String;

/// Role of the account a subscription belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberRole {
    Patient,
    Doctor,
    Clinic,
}

impl SubscriberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberRole::Patient => "patient",
            SubscriberRole::Doctor => "doctor",
            SubscriberRole::Clinic => "clinic",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "patient" => Some(SubscriberRole::Patient),
            "doctor" => Some(SubscriberRole::Doctor),
            "clinic" => Some(SubscriberRole::Clinic),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The account whose notifications are being tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId {
    pub role: SubscriberRole,
    pub account_id: String,
}

impl SubscriberId {
    pub fn new(role: SubscriberRole, account_id: impl Into<String>) -> Self {
        Self {
            role,
            account_id: account_id.into(),
        }
    }

    pub fn patient(account_id: impl Into<String>) -> Self {
        Self::new(SubscriberRole::Patient, account_id)
    }

    pub fn doctor(account_id: impl Into<String>) -> Self {
        Self::new(SubscriberRole::Doctor, account_id)
    }

    pub fn clinic(account_id: impl Into<String>) -> Self {
        Self::new(SubscriberRole::Clinic, account_id)
    }

    /// Key used for every per-subscription map (sessions, retry counters).
    pub fn subscription_key(&self) -> String {
        format!("notifications:{}:{}", self.role, self.account_id)
    }

    pub fn is_empty(&self) -> bool {
        self.account_id.trim().is_empty()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.account_id)
    }
}

/// Notification category.
///
/// Only used for filtering; unknown categories coming from the store
/// deserialize to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    AppointmentBooked,
    AppointmentConfirmed,
    AppointmentCancelled,
    AppointmentRescheduled,
    AppointmentReminder,
    AppointmentCompleted,
    Prescription,
    MedicalRecord,
    Milestone,
    System,
    #[serde(other)]
    Other,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::AppointmentBooked => "appointment_booked",
            NotificationKind::AppointmentConfirmed => "appointment_confirmed",
            NotificationKind::AppointmentCancelled => "appointment_cancelled",
            NotificationKind::AppointmentRescheduled => "appointment_rescheduled",
            NotificationKind::AppointmentReminder => "appointment_reminder",
            NotificationKind::AppointmentCompleted => "appointment_completed",
            NotificationKind::Prescription => "prescription",
            NotificationKind::MedicalRecord => "medical_record",
            NotificationKind::Milestone => "milestone",
            NotificationKind::System => "system",
            NotificationKind::Other => "other",
        }
    }
}

/// A notification as cached locally.
///
/// Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: NotificationId,
    pub subscriber_id: String,
    pub kind: NotificationKind,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: i64,
    /// Last server-side write, when the store reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NotificationRecord {
    /// Version used to order server writes against each other.
    pub fn server_version(&self) -> Option<i64> {
        self.updated_at
    }
}

/// Request for a locally issued notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNotification {
    pub subscriber_id: String,
    pub kind: NotificationKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Query options recognized by the backing store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    #[serde(default)]
    pub unread_only: bool,
    pub kind: Option<NotificationKind>,
}

impl NotificationQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    /// Whether a record would be returned by this query, ignoring paging.
    pub fn matches(&self, record: &NotificationRecord) -> bool {
        if self.unread_only && record.is_read {
            return false;
        }
        match self.kind {
            Some(kind) => record.kind == kind,
            None => true,
        }
    }
}

/// Type of a push event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushEventType {
    Insert,
    Update,
    Delete,
}

impl PushEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushEventType::Insert => "insert",
            PushEventType::Update => "update",
            PushEventType::Delete => "delete",
        }
    }
}

/// An event delivered by the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub event_type: PushEventType,
    pub record: NotificationRecord,
    /// Server commit time of the change, when the store provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<i64>,
}

impl PushEvent {
    pub fn insert(record: NotificationRecord) -> Self {
        Self {
            event_type: PushEventType::Insert,
            record,
            commit_timestamp: None,
        }
    }

    pub fn update(record: NotificationRecord) -> Self {
        Self {
            event_type: PushEventType::Update,
            record,
            commit_timestamp: None,
        }
    }

    pub fn delete(record: NotificationRecord) -> Self {
        Self {
            event_type: PushEventType::Delete,
            record,
            commit_timestamp: None,
        }
    }

    pub fn at(mut self, commit_timestamp: i64) -> Self {
        self.commit_timestamp = Some(commit_timestamp);
        self
    }

    /// Best available server version for this event.
    pub fn version(&self) -> Option<i64> {
        self.commit_timestamp.or(self.record.updated_at)
    }
}

/// Current time in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
