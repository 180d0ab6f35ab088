//! Real-time notification synchronization.
//!
//! Keeps a per-subscriber notification list and its unread count correct
//! across a push channel, a polling fallback and local optimistic mutations.

pub mod backend;
pub mod channel;
pub mod config;
pub mod metrics;
pub mod notifications;
pub mod poll;
pub mod subscription;
pub mod sync;

// Re-export commonly used types for convenience
pub use backend::{HttpBackend, InMemoryBackend, NotificationBackend, WebSocketTransport};
pub use channel::{ChannelManager, ChannelStatus, ConnectionState, PushTransport};
pub use notifications::{NotificationRecord, SubscriberId, SubscriberRole};
pub use subscription::{NotificationHub, SubscriptionHandle};
