use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyDataStream, BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{HeaderMap, CONTENT_TYPE, HOST, UPGRADE};
use hyper::{Request, Response, StatusCode};
use reqwest::redirect::Policy;
use reqwest::Client;
use tracing::{debug, warn};

use super::options::TunnelOptions;
use crate::error::Result;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type written back onto virtual streams
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Headers that only apply to a single transport leg.
pub const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Headers to forward from a virtual request to the local server.
pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name_str = name.as_str();
        if name_str.starts_with(':')
            || is_hop_by_hop(name_str)
            || *name == HOST
            || *name == UPGRADE
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Headers to relay from a local response back onto the virtual stream.
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Plain-text response for failures that happen before headers are sent.
pub fn text_response(status: StatusCode, msg: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(msg.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("text/plain"));
    resp
}

pub fn bad_gateway(msg: &str) -> Response<ProxyBody> {
    text_response(StatusCode::BAD_GATEWAY, msg)
}

/// Forwards virtual requests to the local HTTP server.
#[derive(Clone)]
pub struct HttpForwarder {
    client: Client,
    base: String,
    local_addr: String,
}

impl HttpForwarder {
    pub fn new(opts: &TunnelOptions) -> Result<Self> {
        // Redirects are relayed verbatim to the public client.
        let client = Client::builder()
            .redirect(Policy::none())
            .pool_max_idle_per_host(10)
            .danger_accept_invalid_certs(opts.local_https)
            .build()?;

        Ok(Self {
            client,
            base: opts.local_http_base(),
            local_addr: opts.local_addr(),
        })
    }

    /// Proxy one virtual request to the local server and stream the answer
    /// back. Failures turn into a 502 on this exchange only.
    pub async fn forward<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.base, path);

        let mut request = self
            .client
            .request(parts.method.clone(), &url)
            .headers(filter_request_headers(&parts.headers));
        if !body.is_end_stream() {
            request = request.body(reqwest::Body::wrap_stream(BodyDataStream::new(body)));
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("{} {} -> local error: {}", parts.method, path, e);
                return bad_gateway(&format!(
                    "Bad Gateway: could not reach local server at {}: {}",
                    self.local_addr, e
                ));
            }
        };

        let status = response.status();
        let headers = filter_response_headers(response.headers());
        debug!("{} {} -> {}", parts.method, path, status);

        let method = parts.method.clone();
        let path = path.to_string();
        let stream = response
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(move |e| {
                // Headers are already on the wire; the stream is reset.
                warn!("{} {} -> response body failed: {}", method, path, e);
                BoxError::from(e)
            });

        let mut resp = Response::new(StreamBody::new(stream).boxed_unsync());
        *resp.status_mut() = status;
        *resp.headers_mut() = headers;
        resp
    }
}
