//! WebSocket envelope used by the remote push endpoint.
//!
//! Every frame is `{"type": ..., "payload": ...}`. Notification payloads are
//! `PushEvent`s; the other types are connection housekeeping.

use serde::{Deserialize, Serialize};

use crate::channel::ChannelError;
use crate::notifications::PushEvent;

pub mod msg_types {
    pub const NOTIFICATION: &str = "notification";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const SUBSCRIBED: &str = "subscribed";
}

/// Message envelope shared by both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(msg_type: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            msg_type: msg_type.into(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn empty(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            payload: serde_json::Value::Null,
        }
    }
}

/// What a received frame means for the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(PushEvent),
    /// Server heartbeat; answer with a pong.
    Ping,
    /// Housekeeping frame with nothing to forward.
    Ignored,
}

pub fn decode(text: &str) -> Result<Inbound, ChannelError> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| ChannelError::Protocol(format!("malformed frame: {}", e)))?;

    match envelope.msg_type.as_str() {
        msg_types::NOTIFICATION => serde_json::from_value(envelope.payload)
            .map(Inbound::Event)
            .map_err(|e| ChannelError::Protocol(format!("malformed notification: {}", e))),
        msg_types::PING => Ok(Inbound::Ping),
        msg_types::ERROR => {
            let message = envelope
                .payload
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unspecified server error")
                .to_string();
            Err(ChannelError::Transport(message))
        }
        _ => Ok(Inbound::Ignored),
    }
}
