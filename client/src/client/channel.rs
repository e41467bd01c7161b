//! Transport channel adapter.
//!
//! A pooled WebSocket connection carries the multiplexed session as binary
//! frames and out-of-band [`ControlFrame`]s as text frames. [`ChannelAdapter`]
//! exposes the binary side as a plain byte stream (`AsyncRead + AsyncWrite`)
//! and routes text frames to the tunnel controller.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::ControlFrame;

/// Socket-level knobs a session server expects from an incoming connection.
///
/// Transports that cannot honour a knob leave the default no-op in place.
pub trait SocketCapabilities {
    fn set_timeout(&mut self, _timeout: Option<Duration>) {}

    fn set_keep_alive(&mut self, _enable: bool) {}

    fn set_no_delay(&mut self, _no_delay: bool) {}

    fn encrypted(&self) -> bool {
        false
    }

    fn remote_address(&self) -> &str;

    fn remote_port(&self) -> u16 {
        0
    }
}

/// Lifecycle of one pooled channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// A control frame together with the channel it arrived on.
#[derive(Debug, Clone)]
pub struct ControlNotice {
    pub channel: usize,
    pub frame: ControlFrame,
}

pub type ControlSender = mpsc::UnboundedSender<ControlNotice>;

/// Byte-stream view over one WebSocket transport connection.
pub struct ChannelAdapter<S> {
    index: usize,
    ws: WebSocketStream<S>,
    pending: Bytes,
    eof: bool,
    control_tx: ControlSender,
    cancel: CancellationToken,
    remote_address: String,
    remote_port: u16,
}

impl<S> ChannelAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        index: usize,
        ws: WebSocketStream<S>,
        remote_address: impl Into<String>,
        remote_port: u16,
        control_tx: ControlSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            index,
            ws,
            pending: Bytes::new(),
            eof: false,
            control_tx,
            cancel,
            remote_address: remote_address.into(),
            remote_port,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Token that tears this channel down when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn handle_text(&self, text: &str) {
        match ControlFrame::from_json(text) {
            Ok(frame) => {
                debug!("Channel {} received control frame: {:?}", self.index, frame);
                let notice = ControlNotice {
                    channel: self.index,
                    frame,
                };
                if self.control_tx.send(notice).is_err() {
                    debug!("Channel {} control frame dropped, tunnel gone", self.index);
                }
            }
            Err(e) => {
                debug!(
                    "Channel {} ignoring malformed control frame: {}",
                    self.index, e
                );
            }
        }
    }
}

impl<S> SocketCapabilities for ChannelAdapter<S> {
    fn remote_address(&self) -> &str {
        &self.remote_address
    }

    fn remote_port(&self) -> u16 {
        self.remote_port
    }
}

fn into_io_error(e: tungstenite::Error) -> io::Error {
    match e {
        tungstenite::Error::Io(e) => e,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, e)
        }
        other => io::Error::other(other),
    }
}

impl<S> AsyncRead for ChannelAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.ws).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.pending = Bytes::from(data),
                Some(Ok(Message::Text(text))) => this.handle_text(&text),
                Some(Ok(Message::Close(frame))) => {
                    debug!(
                        "Channel {} closed by server: {:?}",
                        this.index,
                        frame.map(|f| f.reason.to_string())
                    );
                    this.eof = true;
                }
                Some(Ok(_)) => {}
                Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed))
                | None => this.eof = true,
                Some(Err(e)) => {
                    warn!("Channel {} read error: {}", this.index, e);
                    return Poll::Ready(Err(into_io_error(e)));
                }
            }
        }
    }
}

impl<S> AsyncWrite for ChannelAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.ws).poll_ready(cx)).map_err(into_io_error)?;
        Pin::new(&mut this.ws)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(into_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().ws)
            .poll_flush(cx)
            .map_err(into_io_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(Pin::new(&mut self.get_mut().ws).poll_close(cx)) {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(into_io_error(e))),
        }
    }
}
