//! Push channel management: transport seam, connection state, reconnect
//! policy and the per-subscriber channel manager.

mod manager;
mod retry_policy;
mod retry_state;
mod state;
mod transport;

pub use manager::ChannelManager;
pub use retry_policy::RetryPolicy;
pub use retry_state::RetryRegistry;
pub use state::{ChannelStatus, ConnectionState};
#[cfg(feature = "mock")]
pub use transport::MockPushTransport;
pub use transport::{ChannelError, PushItem, PushStream, PushTransport};
