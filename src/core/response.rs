use bytes::Bytes;
use hyper::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical response envelope every proxied response is normalized into.
///
/// Exactly these three keys at the top level; the envelope itself carries
/// error state, so enveloped responses always travel under HTTP 200.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardResponse {
    pub data: Value,

    pub success: bool,

    #[serde(rename = "errorMessage")]
    pub error_message: Option<String>,
}

/// Error payload placed in `data` when the upstream body is not JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: u16,
    pub message: String,
    pub path: String,
    pub method: String,
}

/// Check whether a parsed body already has the standard envelope shape:
/// a JSON object with exactly `data`, `success` and `errorMessage`, where
/// `success` is a boolean and `errorMessage` is a string or null.
pub fn is_standard_format(value: &Value) -> bool {
    let object = match value.as_object() {
        Some(object) => object,
        None => return false,
    };

    if object.len() != 3 {
        return false;
    }

    if !object.contains_key("data") {
        return false;
    }

    match object.get("success") {
        Some(Value::Bool(_)) => {}
        _ => return false,
    }

    match object.get("errorMessage") {
        Some(Value::Null) | Some(Value::String(_)) => true,
        _ => false,
    }
}

/// Canonical short error string for an upstream status code
pub fn status_error_message(status: u16) -> String {
    match status {
        400 => "Bad Request".to_string(),
        401 => "Unauthorized".to_string(),
        403 => "Forbidden".to_string(),
        404 => "Not Found".to_string(),
        422 => "Validation Error".to_string(),
        500 => "Internal Server Error".to_string(),
        502 => "Bad Gateway".to_string(),
        503 => "Service Unavailable".to_string(),
        504 => "Gateway Timeout".to_string(),
        other => format!("Service Error ({})", other),
    }
}

/// Represents a response leaving the gateway
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// HTTP status code
    pub status: StatusCode,

    /// HTTP headers
    pub headers: HeaderMap,

    /// Response body
    pub body: Bytes,

    /// Status the upstream actually answered with, when a call was made
    pub upstream_status: Option<u16>,

    /// Whether the upstream call failed at the transport level
    pub transport_failed: bool,
}

impl GatewayResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            upstream_status: None,
            transport_failed: false,
        }
    }

    /// Serialize `body` as JSON with the right content type
    pub fn json<T: Serialize>(status: StatusCode, body: &T) -> Self {
        let bytes = serde_json::to_vec(body).unwrap_or_default();

        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json"),
        );

        Self::new(status, headers, Bytes::from(bytes))
    }

    /// Create a raw error response with an `{"error": …}` body
    pub fn error(status: StatusCode, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "error": message }))
    }

    pub fn with_upstream_status(mut self, status: u16) -> Self {
        self.upstream_status = Some(status);
        self
    }

    pub fn with_transport_failure(mut self) -> Self {
        self.transport_failed = true;
        self
    }

    /// Whether this response counts as a success for breaker accounting.
    ///
    /// Transport failures and upstream 5xx are failures; anything below 500
    /// (including 4xx) is a success. Responses that never reached an
    /// upstream are judged on the outer status.
    pub fn upstream_success(&self) -> bool {
        if self.transport_failed {
            return false;
        }

        match self.upstream_status {
            Some(status) => status < 500,
            None => self.status.as_u16() < 500,
        }
    }
}
