//! Transport pool: a fixed set of WebSocket channels to the tunnel service.

use std::num::NonZeroUsize;
use std::sync::Arc;

use futures_util::future::try_join_all;
use http::header::{AUTHORIZATION, USER_AGENT};
use http::HeaderValue;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::allocation::TunnelInfo;
use super::channel::{ChannelAdapter, ChannelState, ControlSender};
use super::options::TunnelOptions;
use crate::error::{Result, TunnelError};

/// Upper bound on pooled channels per tunnel.
pub const MAX_CHANNELS: usize = 16;

pub type Transport = MaybeTlsStream<TcpStream>;

/// Number of channels to open for a given hardware parallelism.
pub fn pool_size(parallelism: usize) -> usize {
    parallelism.clamp(1, MAX_CHANNELS)
}

pub fn detected_pool_size() -> usize {
    let parallelism = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    pool_size(parallelism)
}

struct ChannelSlot {
    index: usize,
    state: ChannelState,
    cancel: CancellationToken,
}

/// Owns the channel set. Appended to during setup, cleared on teardown.
#[derive(Default)]
pub struct TransportPool {
    slots: Mutex<Vec<ChannelSlot>>,
}

impl TransportPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `size` channels to the service. Either all handshakes succeed or
    /// every channel opened so far is closed again.
    pub async fn open(
        &self,
        opts: &TunnelOptions,
        info: &TunnelInfo,
        size: usize,
        control_tx: ControlSender,
    ) -> Result<Vec<ChannelAdapter<Transport>>> {
        let url = format!(
            "{}/connect?tunnel_id={}",
            opts.transport_base(),
            info.tunnel_id
        );
        let addr = format!("{}:{}", info.remote_host, info.remote_port);

        let tokens: Vec<CancellationToken> = {
            let mut slots = self.slots.lock().await;
            (0..size)
                .map(|index| {
                    let cancel = CancellationToken::new();
                    slots.push(ChannelSlot {
                        index,
                        state: ChannelState::Connecting,
                        cancel: cancel.clone(),
                    });
                    cancel
                })
                .collect()
        };

        info!("Opening {} transport channels to {}", size, addr);

        let handshakes = tokens.into_iter().enumerate().map(|(index, cancel)| {
            open_channel(
                index,
                &url,
                opts.token.as_deref(),
                info,
                control_tx.clone(),
                cancel,
            )
        });

        match try_join_all(handshakes).await {
            Ok(channels) => {
                let mut slots = self.slots.lock().await;
                for slot in slots.iter_mut() {
                    if slot.state == ChannelState::Connecting {
                        slot.state = ChannelState::Open;
                    }
                }
                debug!("All {} transport channels open", channels.len());
                Ok(channels)
            }
            Err(e) => {
                warn!("Transport setup failed, closing pool: {}", e);
                self.close_all().await;
                Err(e)
            }
        }
    }

    /// Record that a channel's connection ended on its own.
    pub async fn mark_closed(&self, index: usize) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.iter_mut().find(|s| s.index == index) {
            slot.state = ChannelState::Closed;
        }
    }

    /// Close every Open or Connecting channel and clear the set.
    pub async fn close_all(&self) {
        let slots = std::mem::take(&mut *self.slots.lock().await);
        for slot in slots {
            if slot.state != ChannelState::Closed {
                debug!("Closing transport channel {}", slot.index);
                slot.cancel.cancel();
            }
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }
}

async fn open_channel(
    index: usize,
    url: &str,
    token: Option<&str>,
    info: &TunnelInfo,
    control_tx: ControlSender,
    cancel: CancellationToken,
) -> Result<ChannelAdapter<Transport>> {
    let addr = format!("{}:{}", info.remote_host, info.remote_port);
    let handshake_err = |e: WsError| TunnelError::HandshakeFailed {
        addr: addr.clone(),
        source: Arc::new(e),
    };

    let mut request = url.into_client_request().map_err(handshake_err)?;
    let headers = request.headers_mut();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(concat!("ci-tunnel/", env!("CARGO_PKG_VERSION"))),
    );
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| TunnelError::InvalidOptions(format!("invalid token: {}", e)))?;
        headers.insert(AUTHORIZATION, value);
    }

    debug!("Channel {} connecting to {}", index, url);
    let (ws, _) = tokio::select! {
        result = connect_async(request) => result.map_err(handshake_err)?,
        _ = cancel.cancelled() => return Err(TunnelError::Closed),
    };
    debug!("Channel {} open", index);

    Ok(ChannelAdapter::new(
        index,
        ws,
        info.remote_host.clone(),
        info.remote_port,
        control_tx,
        cancel,
    ))
}
