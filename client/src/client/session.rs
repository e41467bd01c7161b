//! Multiplex session handler.
//!
//! Every pooled channel is served as its own HTTP/2 connection; together they
//! act as one logical server whose streams are the tunnel's virtual requests.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use hyper::body::Body;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::channel::SocketCapabilities;
use super::events::{EventSender, TunnelEvent};
use super::http_proxy::{text_response, BoxError, HttpForwarder, ProxyBody};
use super::options::TunnelOptions;
use super::state::SessionGuard;
use super::ws_proxy::{is_websocket_upgrade, WsBridge};
use crate::error::Result;

/// Per-stream flow-control window.
pub const STREAM_WINDOW: u32 = 16 * 1024 * 1024;
/// Connection-level window; bounds buffered bytes per channel.
pub const SESSION_WINDOW: u32 = 64 * 1024 * 1024;
/// Upper bound on queued outbound bytes per stream.
pub const MAX_SEND_BUF: usize = 4 * 1024 * 1024;
pub const MAX_CONCURRENT_STREAMS: u32 = 1024;

/// Everything a virtual request needs to reach its forwarder.
pub struct SessionContext {
    options: Arc<TunnelOptions>,
    events: EventSender,
    guard: Arc<SessionGuard>,
    http: HttpForwarder,
    ws: WsBridge,
}

impl SessionContext {
    pub fn new(
        options: Arc<TunnelOptions>,
        events: EventSender,
        guard: Arc<SessionGuard>,
    ) -> Result<Self> {
        let http = HttpForwarder::new(&options)?;
        let ws = WsBridge::new(&options)?;
        Ok(Self {
            options,
            events,
            guard,
            http,
            ws,
        })
    }
}

pub struct SessionHandler {
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
}

impl SessionHandler {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            shutdown: CancellationToken::new(),
        }
    }

    /// Serve one channel until it ends, the channel is cancelled, or the
    /// session is closed.
    pub fn serve<S>(
        &self,
        index: usize,
        mut io: S,
        channel_cancel: CancellationToken,
    ) -> JoinHandle<std::result::Result<(), hyper::Error>>
    where
        S: SocketCapabilities + AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        io.set_timeout(None);
        io.set_keep_alive(true);
        io.set_no_delay(true);
        debug!(
            "Channel {} joined session (peer {}:{}, encrypted: {})",
            index,
            io.remote_address(),
            io.remote_port(),
            io.encrypted()
        );

        let ctx = self.ctx.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| dispatch(ctx.clone(), req));

            let mut builder = http2::Builder::new(TokioExecutor::new());
            builder
                .initial_stream_window_size(STREAM_WINDOW)
                .initial_connection_window_size(SESSION_WINDOW)
                .max_send_buf_size(MAX_SEND_BUF)
                .max_concurrent_streams(MAX_CONCURRENT_STREAMS)
                .enable_connect_protocol();
            let conn = builder.serve_connection(TokioIo::new(io), service);

            tokio::select! {
                result = conn => result,
                _ = shutdown.cancelled() => {
                    debug!("Channel {} stopped: session closed", index);
                    Ok(())
                }
                _ = channel_cancel.cancelled() => {
                    debug!("Channel {} stopped: channel closed", index);
                    Ok(())
                }
            }
        })
    }

    /// Stop serving every channel. Safe to call more than once.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("Stopping multiplex session");
        }
        self.shutdown.cancel();
    }
}

async fn dispatch<B>(
    ctx: Arc<SessionContext>,
    req: Request<B>,
) -> std::result::Result<Response<ProxyBody>, Infallible>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + std::fmt::Display + Send,
{
    if !ctx.guard.is_open() {
        return Ok(text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Tunnel is closing",
        ));
    }

    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    ctx.events.emit(TunnelEvent::Request {
        method: method.clone(),
        path: path.clone(),
    });

    let start = Instant::now();
    let response = if is_websocket_upgrade(&req) {
        ctx.ws.bridge(req).await
    } else {
        ctx.http.forward(req).await
    };

    if ctx.options.log_requests {
        info!(
            "{} {} -> {} ({} ms)",
            method,
            path,
            response.status().as_u16(),
            start.elapsed().as_millis()
        );
    }

    Ok(response)
}
