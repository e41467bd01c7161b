//! Typed input for a tunnel session.

use crate::error::{Result, TunnelError};

pub const DEFAULT_LOCAL_HOST: &str = "localhost";
pub const DEFAULT_SERVICE_PORT: u16 = 443;

/// Immutable options describing one tunnel session.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub local_port: u16,
    pub local_host: String,
    pub local_https: bool,
    pub service_host: String,
    pub service_port: u16,
    /// Port of the allocation API. Defaults to `service_port`.
    pub api_port: Option<u16>,
    /// Use https/wss toward the tunnel service. Defaults to true unless the
    /// service port is 80.
    pub service_tls: Option<bool>,
    pub subdomain: Option<String>,
    pub token: Option<String>,
    pub log_requests: bool,
}

impl TunnelOptions {
    pub fn new(local_port: u16, service_host: impl Into<String>) -> Self {
        Self {
            local_port,
            local_host: DEFAULT_LOCAL_HOST.to_string(),
            local_https: false,
            service_host: service_host.into(),
            service_port: DEFAULT_SERVICE_PORT,
            api_port: None,
            service_tls: None,
            subdomain: None,
            token: None,
            log_requests: false,
        }
    }

    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    pub fn with_local_https(mut self, local_https: bool) -> Self {
        self.local_https = local_https;
        self
    }

    pub fn with_service_port(mut self, port: u16) -> Self {
        self.service_port = port;
        self
    }

    pub fn with_api_port(mut self, port: u16) -> Self {
        self.api_port = Some(port);
        self
    }

    pub fn with_service_tls(mut self, tls: bool) -> Self {
        self.service_tls = Some(tls);
        self
    }

    pub fn with_subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_log_requests(mut self, log_requests: bool) -> Self {
        self.log_requests = log_requests;
        self
    }

    /// Checked once when the tunnel is constructed.
    pub fn validate(&self) -> Result<()> {
        if self.local_port == 0 {
            return Err(TunnelError::InvalidOptions(
                "local port must be non-zero".to_string(),
            ));
        }
        if self.local_host.trim().is_empty() {
            return Err(TunnelError::InvalidOptions(
                "local host must not be empty".to_string(),
            ));
        }
        if self.service_host.trim().is_empty() || self.service_host.contains('/') {
            return Err(TunnelError::InvalidOptions(format!(
                "invalid tunnel service host '{}'",
                self.service_host
            )));
        }
        if self.service_port == 0 || self.api_port == Some(0) {
            return Err(TunnelError::InvalidOptions(
                "tunnel service ports must be non-zero".to_string(),
            ));
        }
        if let Some(subdomain) = &self.subdomain {
            let valid = !subdomain.is_empty()
                && subdomain
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-');
            if !valid {
                return Err(TunnelError::InvalidOptions(format!(
                    "invalid subdomain '{}'",
                    subdomain
                )));
            }
        }
        if self.token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(TunnelError::InvalidOptions(
                "token must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn effective_api_port(&self) -> u16 {
        self.api_port.unwrap_or(self.service_port)
    }

    pub fn uses_tls(&self) -> bool {
        self.service_tls.unwrap_or(self.service_port != 80)
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn local_http_base(&self) -> String {
        let scheme = if self.local_https { "https" } else { "http" };
        format!("{}://{}", scheme, self.local_addr())
    }

    pub fn local_ws_base(&self) -> String {
        let scheme = if self.local_https { "wss" } else { "ws" };
        format!("{}://{}", scheme, self.local_addr())
    }

    /// Base URL of the allocation API, omitting the port when it is the
    /// scheme default.
    pub fn api_base(&self) -> String {
        let scheme = if self.uses_tls() { "https" } else { "http" };
        authority_url(scheme, &self.service_host, self.effective_api_port())
    }

    /// Base URL for transport channel handshakes.
    pub fn transport_base(&self) -> String {
        let scheme = if self.uses_tls() { "wss" } else { "ws" };
        authority_url(scheme, &self.service_host, self.service_port)
    }
}

fn authority_url(scheme: &str, host: &str, port: u16) -> String {
    let default_port = match scheme {
        "https" | "wss" => 443,
        _ => 80,
    };
    if port == default_port {
        format!("{}://{}", scheme, host)
    } else {
        format!("{}://{}:{}", scheme, host, port)
    }
}
