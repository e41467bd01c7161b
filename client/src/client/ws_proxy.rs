use std::future;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyDataStream, BodyExt, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::UPGRADE;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, connect_async_tls_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    Connector, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::http_proxy::{bad_gateway, filter_request_headers, full_body, BoxError, ProxyBody};
use super::options::TunnelOptions;
use super::tls::local_client_config;
use crate::error::Result;

type LocalSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PUMP_BUFFER: usize = 16 * 1024;

/// Handshake headers the WebSocket client generates itself.
const HANDSHAKE_HEADERS: [&str; 4] = [
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "content-length",
];

fn is_extended_connect<B>(req: &Request<B>) -> bool {
    req.method() == Method::CONNECT
        && req
            .extensions()
            .get::<hyper::ext::Protocol>()
            .is_some_and(|p| p.as_str().eq_ignore_ascii_case("websocket"))
}

/// A virtual request asks for a WebSocket either through an
/// `upgrade: websocket` header or an extended CONNECT (`:protocol websocket`).
///
/// HTTP/2 peers strip `upgrade` as a connection-specific header, so over the
/// multiplex session only the extended CONNECT form arrives in practice.
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let upgrade_header = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    upgrade_header || is_extended_connect(req)
}

/// Bridges virtual upgrade requests to local WebSocket endpoints.
#[derive(Clone)]
pub struct WsBridge {
    base: String,
    connector: Option<Connector>,
}

impl WsBridge {
    pub fn new(opts: &TunnelOptions) -> Result<Self> {
        let connector = if opts.local_https {
            Some(Connector::Rustls(local_client_config()?))
        } else {
            None
        };
        Ok(Self {
            base: opts.local_ws_base(),
            connector,
        })
    }

    /// Bridge a virtual upgrade request to the local WebSocket endpoint.
    ///
    /// A `200` response signals that the local socket is connected. For an
    /// extended CONNECT the bytes then flow over the upgraded stream; for any
    /// other request the request body feeds the local socket and local
    /// messages are streamed back as the response body.
    pub async fn bridge<B>(&self, mut req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display + Send,
    {
        // Must be taken before the request is consumed.
        let on_upgrade = is_extended_connect(&req).then(|| hyper::upgrade::on(&mut req));

        let (parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.base, path);
        debug!("Connecting to local WebSocket: {}", url);

        let mut request = match url.as_str().into_client_request() {
            Ok(r) => r,
            Err(e) => {
                return bad_gateway(&format!("Bad Gateway: invalid WebSocket URL {}: {}", url, e))
            }
        };
        for (name, value) in &filter_request_headers(&parts.headers) {
            if HANDSHAKE_HEADERS.contains(&name.as_str()) {
                continue;
            }
            request.headers_mut().append(name.clone(), value.clone());
        }

        let connected = match &self.connector {
            Some(connector) => {
                connect_async_tls_with_config(request, None, false, Some(connector.clone())).await
            }
            None => connect_async(request).await,
        };
        let (ws_stream, response) = match connected {
            Ok(v) => v,
            Err(e) => {
                warn!("WebSocket upgrade to {} failed: {}", url, e);
                return bad_gateway(&format!(
                    "Bad Gateway: local WebSocket connection to {} failed: {}",
                    url, e
                ));
            }
        };
        info!("Local WebSocket connected: {} ({})", url, response.status());

        match on_upgrade {
            Some(on_upgrade) => {
                tokio::spawn(relay_upgraded(on_upgrade, ws_stream, url));
                let mut resp = Response::new(full_body(Bytes::new()));
                *resp.status_mut() = StatusCode::OK;
                resp
            }
            None => relay_body(body, ws_stream, url),
        }
    }
}

async fn relay_upgraded(on_upgrade: OnUpgrade, mut ws: LocalSocket, url: String) {
    match on_upgrade.await {
        Ok(upgraded) => pump(TokioIo::new(upgraded), ws, &url).await,
        Err(e) => {
            warn!("Virtual stream for {} was not upgraded: {}", url, e);
            let _ = ws.close(None).await;
        }
    }
}

/// Move bytes between an upgraded virtual stream and the local socket until
/// either side closes, then close the other.
async fn pump<T>(io: T, ws: LocalSocket, url: &str)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut io_read, mut io_write) = tokio::io::split(io);
    let (mut ws_write, mut ws_read) = ws.split();
    let local_closed = CancellationToken::new();

    let inbound = async {
        let mut buf = vec![0u8; PUMP_BUFFER];
        loop {
            tokio::select! {
                read = io_read.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if ws_write.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Virtual stream for {} failed: {}", url, e);
                        break;
                    }
                },
                _ = local_closed.cancelled() => break,
            }
        }
        let _ = ws_write.close().await;
        debug!("Local WebSocket {} closed from tunnel side", url);
    };

    let outbound = async {
        while let Some(msg) = ws_read.next().await {
            match msg {
                Ok(m) if m.is_text() || m.is_binary() => {
                    if io_write.write_all(&m.into_data()).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("Local WebSocket {} closed", url);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Local WebSocket {} read error: {}", url, e);
                    break;
                }
            }
        }
        let _ = io_write.shutdown().await;
        local_closed.cancel();
    };

    tokio::join!(inbound, outbound);
}

fn relay_body<B>(body: B, ws: LocalSocket, url: String) -> Response<ProxyBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::fmt::Display + Send,
{
    let (mut write, read) = ws.split();

    // Virtual stream -> local socket. Ending the virtual stream closes it.
    let inbound_url = url.clone();
    tokio::spawn(async move {
        let mut inbound = Box::pin(BodyDataStream::new(body));
        while let Some(chunk) = inbound.next().await {
            match chunk {
                Ok(data) => {
                    if write.send(Message::Binary(data.to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Virtual stream for {} failed: {}", inbound_url, e);
                    break;
                }
            }
        }
        let _ = write.close().await;
        debug!("Local WebSocket {} closed from tunnel side", inbound_url);
    });

    // Local socket -> virtual stream. A close from the local side ends it.
    let outbound = read
        .inspect(move |msg| match msg {
            Ok(Message::Close(_)) => debug!("Local WebSocket {} closed", url),
            Err(e) => debug!("Local WebSocket {} read error: {}", url, e),
            _ => {}
        })
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !m.is_close())))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(m) if m.is_text() || m.is_binary() => {
                    Some(Ok::<_, BoxError>(Frame::data(Bytes::from(m.into_data()))))
                }
                _ => None,
            })
        });

    let mut resp = Response::new(StreamBody::new(outbound).boxed_unsync());
    *resp.status_mut() = StatusCode::OK;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testutil::{closed_port, spawn_ws_echo_server};
    use futures_util::stream;
    use http_body_util::Full;
    use std::convert::Infallible;
    use tokio::sync::mpsc;

    fn ws_bridge(port: u16) -> WsBridge {
        let opts = TunnelOptions::new(port, "tunnel.example").with_local_host("127.0.0.1");
        WsBridge::new(&opts).unwrap()
    }

    type Inbound = mpsc::Sender<Bytes>;

    /// Upgrade-header request whose body is fed through the returned sender.
    fn streaming_request(
        path: &str,
    ) -> (Inbound, Request<impl Body<Data = Bytes, Error = Infallible>>) {
        let (tx, rx) = mpsc::channel::<Bytes>(8);
        let inbound = stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|data| (Ok::<_, Infallible>(Frame::data(data)), rx))
        });
        let req = Request::get(path)
            .header(UPGRADE, "websocket")
            .body(StreamBody::new(inbound))
            .unwrap();
        (tx, req)
    }

    #[test]
    fn test_upgrade_detection() {
        let req = Request::get("/ws")
            .header(UPGRADE, "WebSocket")
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(&req));

        let req = Request::get("/plain").body(()).unwrap();
        assert!(!is_websocket_upgrade(&req));

        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("/ws")
            .extension(hyper::ext::Protocol::from_static("websocket"))
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(&req));

        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("/ws")
            .body(())
            .unwrap();
        assert!(!is_websocket_upgrade(&req));
    }

    #[test]
    fn test_local_https_uses_relaxed_connector() {
        assert!(ws_bridge(3000).connector.is_none());

        let opts = TunnelOptions::new(8443, "tunnel.example").with_local_https(true);
        let bridge = WsBridge::new(&opts).unwrap();
        assert!(matches!(bridge.connector, Some(Connector::Rustls(_))));
        assert_eq!(bridge.base, "wss://localhost:8443");
    }

    #[tokio::test]
    async fn test_bridge_local_unreachable() {
        let port = closed_port().await;
        let req = Request::get("/ws").body(Full::new(Bytes::new())).unwrap();
        let resp = ws_bridge(port).bridge(req).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_bridge_relays_bytes_in_order() {
        let addr = spawn_ws_echo_server().await;
        let (tx, req) = streaming_request("/socket");

        let resp = ws_bridge(addr.port()).bridge(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let mut body = resp.into_body();

        for chunk in [&b"one"[..], b"two", b"three"] {
            tx.send(Bytes::copy_from_slice(chunk)).await.unwrap();
            let frame = body.frame().await.unwrap().unwrap();
            assert_eq!(frame.into_data().unwrap(), Bytes::copy_from_slice(chunk));
        }

        // Ending the virtual stream closes the local socket, which in turn
        // ends the response body.
        drop(tx);
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_local_close_ends_response_body() {
        let addr = spawn_ws_echo_server().await;
        let (tx, req) = streaming_request("/socket");

        let mut body = ws_bridge(addr.port()).bridge(req).await.into_body();
        tx.send(Bytes::from_static(b"bye")).await.unwrap();
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_pump_relays_until_either_side_closes() {
        let addr = spawn_ws_echo_server().await;
        let (ws, _) = connect_async(format!("ws://{}/pump", addr)).await.unwrap();
        let (tunnel_side, mut peer) = tokio::io::duplex(64 * 1024);
        let pumping = tokio::spawn(async move { pump(tunnel_side, ws, "pump").await });

        peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.shutdown().await.unwrap();
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        pumping.await.unwrap();
    }
}
