//! Remote notification store: REST for queries and mutations, WebSocket for
//! push delivery.

mod http;
pub mod messages;
mod websocket;

pub use http::HttpBackend;
pub use websocket::WebSocketTransport;
