//! Local reachability probe and tunnel allocation against the service REST API.

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use tracing::{debug, info};
use url::Url;

use super::options::TunnelOptions;
use crate::error::{ProbeFailure, Result, TunnelError};
use crate::protocol::{AllocationResponse, TunnelId};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const ALLOCATION_TIMEOUT: Duration = Duration::from_secs(30);
const ALLOCATION_PATH: &str = "/api/v1/ci-tunnels/";
const EXCERPT_MAX_CHARS: usize = 120;

/// Tunnel identity returned by the service. Set once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub id: u64,
    pub tunnel_id: TunnelId,
    pub url: String,
    pub remote_host: String,
    pub remote_port: u16,
}

/// Issue a HEAD to the local server. Any HTTP answer counts as reachable.
pub async fn probe_local(opts: &TunnelOptions) -> Result<()> {
    let client = Client::builder()
        .timeout(PROBE_TIMEOUT)
        .danger_accept_invalid_certs(opts.local_https)
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    let url = format!("{}/", opts.local_http_base());
    debug!("Probing local server at {}", url);

    match client.head(&url).send().await {
        Ok(resp) => {
            debug!("Local server answered probe with {}", resp.status());
            Ok(())
        }
        Err(e) => {
            let kind = if e.is_timeout() {
                ProbeFailure::Timeout
            } else if io_error_kind(&e) == Some(io::ErrorKind::ConnectionRefused) {
                ProbeFailure::Refused
            } else {
                ProbeFailure::Other
            };
            let detail = (kind == ProbeFailure::Other).then(|| e.to_string());
            Err(TunnelError::LocalServerUnreachable {
                addr: opts.local_addr(),
                kind,
                detail,
            })
        }
    }
}

/// Build the allocation endpoint URL, adding `subdomain` only when requested.
pub fn allocation_url(opts: &TunnelOptions) -> Result<Url> {
    let raw = format!("{}{}", opts.api_base(), ALLOCATION_PATH);
    let mut url = Url::parse(&raw)
        .map_err(|e| TunnelError::InvalidOptions(format!("bad allocation URL {}: {}", raw, e)))?;
    if let Some(subdomain) = &opts.subdomain {
        url.query_pairs_mut().append_pair("subdomain", subdomain);
    }
    Ok(url)
}

/// Allocate a tunnel from the service.
pub async fn allocate(opts: &TunnelOptions) -> Result<TunnelInfo> {
    let url = allocation_url(opts)?;
    let used_https = url.scheme() == "https";
    let host = opts.service_host.as_str();
    let api_port = opts.effective_api_port();

    let client = Client::builder().timeout(ALLOCATION_TIMEOUT).build()?;
    let mut request = client
        .post(url.clone())
        .header(CONTENT_TYPE, "application/json");
    if let Some(token) = &opts.token {
        request = request.bearer_auth(token);
    }

    info!("Allocating tunnel at {}", url);
    let resp = match request.send().await {
        Ok(resp) => resp,
        Err(e) => return Err(classify_transport_error(e, host, api_port).await),
    };

    let status = resp.status();
    let body = match resp.text().await {
        Ok(body) => body,
        Err(e) => return Err(classify_transport_error(e, host, api_port).await),
    };

    if !status.is_success() {
        return Err(classify_status(status, &body));
    }

    let parsed = AllocationResponse::from_json(&body)
        .map_err(|e| TunnelError::AllocationParse(e.to_string()))?;
    let url = normalize_url(&parsed.url, used_https)?;

    info!("Allocated tunnel {} at {}", parsed.tunnel_id, url);

    Ok(TunnelInfo {
        id: parsed.id,
        tunnel_id: parsed.tunnel_id,
        url,
        remote_host: opts.service_host.clone(),
        remote_port: opts.service_port,
    })
}

/// Map a non-2xx allocation answer onto the error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> TunnelError {
    let code = status.as_u16();
    match code {
        502..=504 => TunnelError::ServiceUnavailable { status: code },
        401 | 403 => TunnelError::AuthFailed { status: code },
        429 => TunnelError::RateLimited,
        _ => TunnelError::AllocationHttp {
            status: code,
            excerpt: body_excerpt(body),
        },
    }
}

async fn classify_transport_error(e: reqwest::Error, host: &str, port: u16) -> TunnelError {
    let addr = format!("{}:{}", host, port);
    if e.is_timeout() {
        return TunnelError::NotResponding { addr };
    }
    match io_error_kind(&e) {
        Some(io::ErrorKind::ConnectionRefused) => return TunnelError::ConnectionRefused { addr },
        Some(
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof,
        ) => return TunnelError::NotResponding { addr },
        _ => {}
    }
    if is_dns_failure(&e, host, port).await {
        return TunnelError::HostUnresolvable {
            host: host.to_string(),
        };
    }
    TunnelError::from(e)
}

/// Strip markup, collapse whitespace and cap the length of an error body.
pub fn body_excerpt(body: &str) -> String {
    let mut text = String::with_capacity(body.len());
    let mut in_tag = false;
    for c in body.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }

    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > EXCERPT_MAX_CHARS {
        let truncated: String = collapsed.chars().take(EXCERPT_MAX_CHARS).collect();
        format!("{}...", truncated.trim_end())
    } else if collapsed.is_empty() {
        "empty response body".to_string()
    } else {
        collapsed
    }
}

/// Force the public URL onto https when allocation itself went over https.
pub fn normalize_url(raw: &str, used_https: bool) -> Result<String> {
    let mut url = Url::parse(raw)
        .map_err(|e| TunnelError::AllocationParse(format!("malformed tunnel url '{}': {}", raw, e)))?;
    if !used_https {
        return Ok(raw.to_string());
    }
    if url.scheme() != "https" {
        url.set_scheme("https").map_err(|_| {
            TunnelError::AllocationParse(format!("cannot use https for tunnel url '{}'", raw))
        })?;
    }
    if url.port() == Some(80) {
        let _ = url.set_port(None);
    }
    Ok(url.to_string())
}

fn io_error_kind(e: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut source: Option<&(dyn StdError + 'static)> = Some(e);
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        source = err.source();
    }
    None
}

/// A connect failure is a DNS failure when the host does not resolve now.
/// The error text is only consulted when the lookup itself succeeds.
async fn is_dns_failure(e: &reqwest::Error, host: &str, port: u16) -> bool {
    if e.is_connect() && tokio::net::lookup_host((host, port)).await.is_err() {
        return true;
    }
    mentions_dns(e)
}

fn mentions_dns(e: &(dyn StdError + 'static)) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(e);
    while let Some(err) = source {
        let msg = err.to_string().to_lowercase();
        if msg.contains("dns error")
            || msg.contains("failed to lookup address")
            || msg.contains("name or service not known")
        {
            return true;
        }
        source = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testutil::{closed_port, spawn_http_server};
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::Response;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_allocation_url_with_subdomain() {
        let opts = TunnelOptions::new(3000, "tunnel.example").with_subdomain("foo");
        let url = allocation_url(&opts).unwrap();
        assert_eq!(url.path(), "/api/v1/ci-tunnels/");
        assert_eq!(url.query(), Some("subdomain=foo"));
    }

    #[test]
    fn test_allocation_url_without_subdomain() {
        let opts = TunnelOptions::new(3000, "tunnel.example");
        let url = allocation_url(&opts).unwrap();
        assert_eq!(url.as_str(), "https://tunnel.example/api/v1/ci-tunnels/");
        assert_eq!(url.query(), None);
    }

    #[test]
    fn test_normalize_url_forces_https() {
        assert_eq!(
            normalize_url("http://x.example/", true).unwrap(),
            "https://x.example/"
        );
        assert_eq!(
            normalize_url("http://x.example:80/", true).unwrap(),
            "https://x.example/"
        );
        assert_eq!(
            normalize_url("https://x.example:80/", true).unwrap(),
            "https://x.example/"
        );
        assert_eq!(
            normalize_url("http://x.example:8080/", true).unwrap(),
            "https://x.example:8080/"
        );
    }

    #[test]
    fn test_normalize_url_leaves_plain_allocation_alone() {
        assert_eq!(
            normalize_url("http://x.example/", false).unwrap(),
            "http://x.example/"
        );
        assert!(normalize_url("not a url", false).is_err());
    }

    #[test]
    fn test_classify_status() {
        let err = classify_status(StatusCode::SERVICE_UNAVAILABLE, "");
        let msg = err.to_string();
        assert!(msg.contains("temporarily unavailable"));
        assert!(msg.contains("503"));

        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, ""),
            TunnelError::AuthFailed { status: 403 }
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            TunnelError::RateLimited
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            TunnelError::ServiceUnavailable { status: 502 }
        ));
    }

    #[test]
    fn test_body_excerpt() {
        let body = "<html>\n<body><h1>Bad   request</h1>\n<p>missing field</p></body></html>";
        assert_eq!(body_excerpt(body), "Bad request missing field");

        let long = "x".repeat(500);
        let excerpt = body_excerpt(&long);
        assert_eq!(excerpt.len(), EXCERPT_MAX_CHARS + 3);
        assert!(excerpt.ends_with("..."));

        assert_eq!(body_excerpt("  "), "empty response body");
    }

    #[tokio::test]
    async fn test_allocate_sends_subdomain_and_token() {
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let addr = spawn_http_server(move |req| {
            let auth = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            *seen_clone.lock().unwrap() = Some((req.method().clone(), req.uri().to_string(), auth));
            async move {
                Response::new(Full::new(Bytes::from_static(
                    br#"{"id":1,"tunnel_id":"abc","url":"http://abc.tunnel.example/","created_at":null,"connected_at":null,"completed_at":null,"playwright_result":null}"#,
                )))
            }
        })
        .await;

        let opts = TunnelOptions::new(3000, "127.0.0.1")
            .with_service_tls(false)
            .with_service_port(addr.port())
            .with_subdomain("foo")
            .with_token("secret");
        let info = allocate(&opts).await.unwrap();

        assert_eq!(info.tunnel_id.as_str(), "abc");
        assert_eq!(info.url, "http://abc.tunnel.example/");
        assert_eq!(info.remote_port, addr.port());

        let (method, uri, auth) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(method, hyper::Method::POST);
        assert_eq!(uri, "/api/v1/ci-tunnels/?subdomain=foo");
        assert_eq!(auth.as_deref(), Some("Bearer secret"));
    }

    #[tokio::test]
    async fn test_allocate_reports_outage() {
        let addr = spawn_http_server(|_req| async {
            Response::builder()
                .status(503)
                .body(Full::new(Bytes::from_static(b"<h1>down</h1>")))
                .unwrap()
        })
        .await;

        let opts = TunnelOptions::new(3000, "127.0.0.1")
            .with_service_tls(false)
            .with_service_port(addr.port());
        let err = allocate(&opts).await.unwrap_err();
        assert!(matches!(err, TunnelError::ServiceUnavailable { status: 503 }));
    }

    #[tokio::test]
    async fn test_allocate_rejects_garbage_body() {
        let addr =
            spawn_http_server(|_req| async { Response::new(Full::new(Bytes::from_static(b"ok"))) })
                .await;

        let opts = TunnelOptions::new(3000, "127.0.0.1")
            .with_service_tls(false)
            .with_service_port(addr.port());
        let err = allocate(&opts).await.unwrap_err();
        assert!(matches!(err, TunnelError::AllocationParse(_)));
    }

    #[tokio::test]
    async fn test_allocate_connection_refused() {
        let port = closed_port().await;
        let opts = TunnelOptions::new(3000, "127.0.0.1")
            .with_service_tls(false)
            .with_service_port(port);
        let err = allocate(&opts).await.unwrap_err();
        assert!(matches!(err, TunnelError::ConnectionRefused { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_allocate_unresolvable_host() {
        let opts = TunnelOptions::new(3000, "tunnel.invalid").with_service_tls(false);
        let err = allocate(&opts).await.unwrap_err();
        match err {
            TunnelError::HostUnresolvable { host } => assert_eq!(host, "tunnel.invalid"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_probe_reachable_server() {
        let addr = spawn_http_server(|_req| async {
            Response::builder()
                .status(404)
                .body(Full::new(Bytes::new()))
                .unwrap()
        })
        .await;

        let opts = TunnelOptions::new(addr.port(), "tunnel.example").with_local_host("127.0.0.1");
        probe_local(&opts).await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_refused() {
        let port = closed_port().await;
        let opts = TunnelOptions::new(port, "tunnel.example").with_local_host("127.0.0.1");
        let err = probe_local(&opts).await.unwrap_err();
        match err {
            TunnelError::LocalServerUnreachable { addr, kind, .. } => {
                assert_eq!(addr, format!("127.0.0.1:{}", port));
                assert_eq!(kind, ProbeFailure::Refused);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
