//! Push transport abstraction.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::notifications::{PushEvent, SubscriberId};

/// Errors raised by a push channel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("connect attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("channel closed by remote")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Item delivered by an open push stream.
pub type PushItem = Result<PushEvent, ChannelError>;

/// An open push channel.
///
/// The stream ends (`next` returns `None`) when the remote side closes it.
/// Dropping the stream tears the channel down.
pub struct PushStream {
    events: mpsc::Receiver<PushItem>,
}

impl PushStream {
    pub fn new(events: mpsc::Receiver<PushItem>) -> Self {
        Self { events }
    }

    /// Create a stream together with the sender feeding it.
    pub fn channel(buffer: usize) -> (mpsc::Sender<PushItem>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self::new(rx))
    }

    pub async fn next(&mut self) -> Option<PushItem> {
        self.events.recv().await
    }
}

/// Opens push channels for a subscriber.
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Open a channel delivering insert/update/delete events for the subscriber.
    async fn open(&self, subscriber: &SubscriberId) -> Result<PushStream, ChannelError>;
}
