//! WebSocket push transport.
//!
//! Each `open` performs one connect and spawns a reader task that decodes
//! frames into `PushEvent`s. Reconnecting is the channel manager's job.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::messages::{self, msg_types, Envelope, Inbound};
use crate::channel::{ChannelError, PushItem, PushStream, PushTransport};
use crate::notifications::SubscriberId;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const STREAM_BUFFER: usize = 64;

/// `PushTransport` backed by the store's WebSocket endpoint.
pub struct WebSocketTransport {
    ws_url: String,
    api_key: Option<String>,
}

impl WebSocketTransport {
    pub fn new(ws_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            api_key,
        }
    }

    fn subscription_url(&self, subscriber: &SubscriberId) -> String {
        let separator = if self.ws_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}role={}&account_id={}",
            self.ws_url,
            separator,
            subscriber.role.as_str(),
            urlencoding::encode(&subscriber.account_id)
        )
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn open(&self, subscriber: &SubscriberId) -> Result<PushStream, ChannelError> {
        let url = self.subscription_url(subscriber);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::ConnectFailed(format!("invalid url {}: {}", url, e)))?;
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| ChannelError::ConnectFailed(format!("invalid api key: {}", e)))?;
            request.headers_mut().insert("Authorization", value);
        }

        debug!("Connecting push WebSocket for {}", subscriber);
        let (mut socket, _) = connect_async(request)
            .await
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;

        let subscribe = Envelope::new(
            msg_types::SUBSCRIBE,
            serde_json::json!({ "channel": subscriber.subscription_key() }),
        );
        let frame = serde_json::to_string(&subscribe)
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        socket
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
        info!("Push WebSocket open for {}", subscriber);

        let (tx, stream) = PushStream::channel(STREAM_BUFFER);
        tokio::spawn(read_loop(socket, tx, subscriber.subscription_key()));
        Ok(stream)
    }
}

/// Forward decoded frames until the socket or the consumer goes away.
async fn read_loop(socket: Socket, tx: mpsc::Sender<PushItem>, key: String) {
    let (mut write, mut read) = socket.split();

    loop {
        let msg = tokio::select! {
            _ = tx.closed() => {
                debug!("Push stream for {} dropped, closing socket", key);
                let _ = write.send(Message::Close(None)).await;
                return;
            }
            msg = read.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => match messages::decode(text.as_str()) {
                Ok(Inbound::Event(event)) => {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                Ok(Inbound::Ping) => {
                    let pong = serde_json::to_string(&Envelope::empty(msg_types::PONG))
                        .unwrap_or_default();
                    if let Err(e) = write.send(Message::Text(pong.into())).await {
                        let _ = tx.send(Err(ChannelError::Transport(e.to_string()))).await;
                        return;
                    }
                }
                Ok(Inbound::Ignored) => {}
                Err(e) => {
                    warn!("Push WebSocket for {} sent a bad frame: {}", key, e);
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            },
            Some(Ok(Message::Ping(data))) => {
                if let Err(e) = write.send(Message::Pong(data)).await {
                    let _ = tx.send(Err(ChannelError::Transport(e.to_string()))).await;
                    return;
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                info!("Push WebSocket for {} closed by server", key);
                // Dropping tx ends the stream
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                let _ = tx.send(Err(ChannelError::Transport(e.to_string()))).await;
                return;
            }
        }
    }
}
