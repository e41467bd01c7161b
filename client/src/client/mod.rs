//! Tunnel client implementation.
//!
//! This module provides the core tunnel functionality:
//! - [`Tunnel`] - Controller that allocates a tunnel and owns its lifecycle
//! - Transport pool of WebSocket channels to the tunnel service
//! - HTTP/2 multiplex session served over the pooled channels
//! - HTTP proxy for forwarding requests to local services
//! - WebSocket bridge for upgrade requests
//! - Relaxed TLS for a local HTTPS upstream

mod allocation;
mod channel;
mod events;
mod http_proxy;
mod options;
mod pool;
mod session;
mod state;
mod tls;
mod tunnel;
mod ws_proxy;

#[cfg(test)]
mod testutil;

pub use allocation::TunnelInfo;
pub use channel::{ChannelAdapter, ChannelState, SocketCapabilities};
pub use events::{EventReceiver, TunnelEvent};
pub use http_proxy::HOP_BY_HOP_HEADERS;
pub use options::TunnelOptions;
pub use pool::{pool_size, MAX_CHANNELS};
pub use state::SessionState;
pub use tunnel::Tunnel;
