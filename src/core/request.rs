use std::net::IpAddr;

use bytes::Bytes;
use hyper::{HeaderMap, Method, Uri};

use crate::models::Identity;

/// Represents a request travelling through the gateway
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    /// HTTP method
    pub method: Method,

    /// Request URI (original path and query)
    pub uri: Uri,

    /// HTTP headers
    pub headers: HeaderMap,

    /// Request body, read fully up front so it can be replayed upstream
    pub body: Bytes,

    /// Client IP address
    pub client_ip: Option<IpAddr>,

    /// Original Host header value
    pub host: String,

    /// Request scheme as seen by the gateway
    pub scheme: String,

    /// Request ID for tracing
    pub request_id: String,

    /// Authenticated identity, published by the auth middleware
    pub identity: Option<Identity>,
}

impl GatewayRequest {
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        client_ip: Option<IpAddr>,
    ) -> Self {
        let host = headers
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        // Honor an inbound X-Request-ID so ids correlate across hops
        let request_id = headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(generate_request_id);

        Self {
            method,
            uri,
            headers,
            body,
            client_ip,
            host,
            scheme: "http".to_string(),
            request_id,
            identity: None,
        }
    }

    /// Get a header value as a string
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    /// Request path
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Raw query string, if any
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// User-Agent header value, or empty string
    pub fn user_agent(&self) -> String {
        self.header("user-agent").unwrap_or_default()
    }

    /// Client IP rendered for forwarding headers
    pub fn client_ip_string(&self) -> String {
        self.client_ip.map(|ip| ip.to_string()).unwrap_or_default()
    }
}

/// Generate a unique request ID
pub fn generate_request_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);

    format!("{:x}-{:x}", timestamp, counter)
}
