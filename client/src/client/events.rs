use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TunnelError;

/// Notifications surfaced by a [`Tunnel`](super::Tunnel)
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// Tunnel is established and reachable at `url`
    Open { url: String },
    /// Inbound virtual request, emitted before it reaches a forwarder
    Request { method: String, path: String },
    /// The service reported the tunnel's job as finished
    TunnelDone { payload: Option<Value> },
    /// Tunnel-level failure
    Error(TunnelError),
    /// Tunnel torn down; emitted exactly once
    Close,
}

pub type EventReceiver = mpsc::UnboundedReceiver<TunnelEvent>;

/// Sending half of the event stream. Emitting never blocks and is a no-op
/// once the receiver is gone.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<TunnelEvent>,
}

impl EventSender {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: TunnelEvent) {
        let _ = self.tx.send(event);
    }

    pub fn error(&self, err: TunnelError) {
        self.emit(TunnelEvent::Error(err));
    }
}
