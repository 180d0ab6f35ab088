//! Hub wired to an in-memory backend

#![allow(dead_code)]

use std::sync::Arc;

use igabay_notification_sync::backend::InMemoryBackend;
use igabay_notification_sync::channel::ConnectionState;
use igabay_notification_sync::config::{ChannelSettings, SubscriptionOptions, SyncSettings};
use igabay_notification_sync::notifications::{NotificationView, SubscriberId};
use igabay_notification_sync::subscription::{
    NoopNotifier, NotificationHub, SubscriptionHandle,
};

use super::constants::{PATIENT_ID, WAIT_TIMEOUT};

pub struct TestHarness {
    pub backend: Arc<InMemoryBackend>,
    pub hub: NotificationHub,
}

impl TestHarness {
    /// Harness with deterministic backoff (no jitter).
    pub fn new() -> Self {
        Self::with_settings(SyncSettings {
            channel: ChannelSettings {
                jitter_ratio: 0.0,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    pub fn with_settings(settings: SyncSettings) -> Self {
        let backend = Arc::new(InMemoryBackend::new());
        let hub = NotificationHub::new(
            backend.clone(),
            backend.clone(),
            Arc::new(NoopNotifier),
            settings,
        );
        Self { backend, hub }
    }

    pub async fn subscribe(
        &self,
        subscriber: SubscriberId,
        options: SubscriptionOptions,
    ) -> SubscriptionHandle {
        self.hub
            .subscribe(subscriber, options)
            .await
            .expect("subscribe failed")
    }

    pub async fn subscribe_patient(&self) -> SubscriptionHandle {
        self.subscribe(SubscriberId::patient(PATIENT_ID), SubscriptionOptions::default())
            .await
    }
}

pub async fn wait_for_view<F>(handle: &SubscriptionHandle, condition: F)
where
    F: Fn(&NotificationView) -> bool,
{
    let mut rx = handle.watch();
    tokio::time::timeout(WAIT_TIMEOUT, rx.wait_for(|view| condition(view)))
        .await
        .expect("timed out waiting for view")
        .expect("subscription store dropped");
}

pub async fn wait_for_len(handle: &SubscriptionHandle, len: usize) {
    wait_for_view(handle, |view| view.records.len() == len).await;
}

pub async fn wait_for_state(handle: &SubscriptionHandle, state: ConnectionState) {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            let status = handle
                .connection_status()
                .await
                .expect("subscription is not real-time");
            if status.state == state {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for connection state");
}
