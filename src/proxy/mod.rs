use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ServiceConfig;
use crate::core::request::GatewayRequest;
use crate::core::response::{
    is_standard_format, status_error_message, ErrorData, GatewayResponse, StandardResponse,
};
use crate::error::GatewayError;
use crate::middleware::load_balancer::LoadBalancer;
use crate::middleware::MiddlewareHandler;

/// Hop-by-hop headers never forwarded upstream
const SKIP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Upstream headers worth preserving on enveloped responses
const IMPORTANT_HEADERS: &[&str] = &["cache-control", "etag", "last-modified", "expires"];

pub const GATEWAY_NAME: &str = "api-gateway";
pub const GATEWAY_VERSION: &str = "1.0.0";

/// Terminal handler of every service chain: resolves the target backend,
/// forwards the request and rewraps the upstream response into the
/// standard envelope.
pub struct ProxyHandler {
    service: ServiceConfig,
    client: reqwest::Client,
    load_balancer: Option<Arc<LoadBalancer>>,
}

impl ProxyHandler {
    pub fn new(
        service: ServiceConfig,
        client: reqwest::Client,
        load_balancer: Option<Arc<LoadBalancer>>,
    ) -> Self {
        Self {
            service,
            client,
            load_balancer,
        }
    }

    /// Resolve the base URL for this request: load balancer pick when one
    /// is configured, the service base URL otherwise.
    fn resolve_base_url(&self) -> Result<String, ()> {
        match &self.load_balancer {
            Some(lb) => match lb.next_backend() {
                Some(backend) if !backend.is_empty() => Ok(backend),
                _ => Err(()),
            },
            None => Ok(self.service.base_url.clone()),
        }
    }

    fn build_target_url(&self, base_url: &str, request: &GatewayRequest) -> String {
        let path = strip_service_prefix(request.path(), &self.service.prefix);

        let mut target = format!("{}{}", base_url, path);
        if let Some(query) = request.query() {
            target.push('?');
            target.push_str(query);
        }

        target
    }

    fn forward_headers(&self, request: &GatewayRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in request.headers.iter() {
            if !SKIP_HEADERS.contains(&name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }

        insert_header(&mut headers, "x-forwarded-for", &request.client_ip_string());
        insert_header(&mut headers, "x-forwarded-proto", &request.scheme);
        insert_header(&mut headers, "x-forwarded-host", &request.host);
        insert_header(&mut headers, "x-gateway", GATEWAY_NAME);
        insert_header(&mut headers, "x-gateway-version", GATEWAY_VERSION);
        insert_header(&mut headers, "x-request-id", &request.request_id);

        if let Some(identity) = &request.identity {
            if !identity.user_id.is_empty() {
                insert_header(&mut headers, "x-user-id", &identity.user_id);
            }
            if !identity.username.is_empty() {
                insert_header(&mut headers, "x-username", &identity.username);
            }
            if !identity.role.is_empty() {
                insert_header(&mut headers, "x-user-role", &identity.role);
            }
        }

        headers
    }

    /// Build the standard error envelope the original would have produced
    /// for a gateway-side failure, always shipped under HTTP 200.
    fn error_envelope(
        &self,
        code: u16,
        message: &str,
        detail: Option<&str>,
        request: &GatewayRequest,
    ) -> GatewayResponse {
        let error_message = match detail {
            Some(detail) => format!("{}: {}", message, detail),
            None => message.to_string(),
        };

        let envelope = StandardResponse {
            data: serde_json::to_value(ErrorData {
                code,
                message: message.to_string(),
                path: request.path().to_string(),
                method: request.method.to_string(),
            })
            .unwrap_or(Value::Null),
            success: false,
            error_message: Some(error_message),
        };

        let mut response = GatewayResponse::json(StatusCode::OK, &envelope);
        add_gateway_headers(&mut response.headers);
        response.with_upstream_status(code)
    }

    /// Rewrap an upstream response into the standard envelope.
    ///
    /// The pass-through test runs regardless of the upstream status: a body
    /// already in standard format carries its own error state and is
    /// returned byte-for-byte under HTTP 200.
    fn transform_response(
        &self,
        upstream_status: u16,
        upstream_headers: &HeaderMap,
        body: Bytes,
        request: &GatewayRequest,
    ) -> GatewayResponse {
        let mut headers = HeaderMap::new();
        add_gateway_headers(&mut headers);

        if !body.is_empty() {
            if let Ok(value) = serde_json::from_slice::<Value>(&body) {
                if is_standard_format(&value) {
                    debug!(
                        service = %self.service.name,
                        upstream_status,
                        "Standard format detected, passing through"
                    );
                    copy_important_headers(upstream_headers, &mut headers);
                    return GatewayResponse::new(StatusCode::OK, headers, body)
                        .with_upstream_status(upstream_status);
                }
            }
        }

        let is_success = (200..300).contains(&upstream_status);

        let envelope = if is_success {
            let data = if body.is_empty() {
                Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_slice(&body).unwrap_or_else(|_| {
                    Value::String(String::from_utf8_lossy(&body).into_owned())
                })
            };

            StandardResponse {
                data,
                success: true,
                error_message: None,
            }
        } else {
            debug!(
                service = %self.service.name,
                upstream_status,
                "Upstream error without standard format, transforming"
            );

            let data = if body.is_empty() {
                fallback_error_data(upstream_status, &body, request)
            } else {
                serde_json::from_slice(&body)
                    .unwrap_or_else(|_| fallback_error_data(upstream_status, &body, request))
            };

            StandardResponse {
                data,
                success: false,
                error_message: Some(status_error_message(upstream_status)),
            }
        };

        copy_important_headers(upstream_headers, &mut headers);

        let body = Bytes::from(serde_json::to_vec(&envelope).unwrap_or_default());
        GatewayResponse::new(StatusCode::OK, headers, body).with_upstream_status(upstream_status)
    }
}

#[async_trait]
impl MiddlewareHandler for ProxyHandler {
    async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let base_url = match self.resolve_base_url() {
            Ok(base_url) => base_url,
            Err(()) => {
                warn!(service = %self.service.name, "No healthy backends available");
                return Ok(self.error_envelope(
                    502,
                    "Error determining target URL",
                    Some("no healthy backends available"),
                    &request,
                ));
            }
        };

        let target = self.build_target_url(&base_url, &request);
        debug!(
            service = %self.service.name,
            method = %request.method,
            target = %target,
            "Proxying request"
        );

        let upstream = self
            .client
            .request(request.method.clone(), &target)
            .headers(self.forward_headers(&request))
            .body(request.body.clone())
            .timeout(Duration::from_secs(self.service.timeout))
            .send()
            .await;

        let response = match upstream {
            Ok(response) => response,
            Err(e) => {
                if let Some(lb) = &self.load_balancer {
                    lb.mark_backend_down(&base_url);
                    lb.release_connection(&base_url);
                }

                warn!(service = %self.service.name, error = %e, "Upstream request failed");
                return Ok(self
                    .error_envelope(502, "Service unavailable", Some(&e.to_string()), &request)
                    .with_transport_failure());
            }
        };

        if let Some(lb) = &self.load_balancer {
            lb.mark_backend_up(&base_url);
            lb.release_connection(&base_url);
        }

        let upstream_status = response.status().as_u16();
        let upstream_headers = response.headers().clone();

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                warn!(service = %self.service.name, error = %e, "Error reading upstream body");
                return Ok(self
                    .error_envelope(
                        502,
                        "Error reading service response",
                        Some(&e.to_string()),
                        &request,
                    )
                    .with_transport_failure());
            }
        };

        Ok(self.transform_response(upstream_status, &upstream_headers, body, &request))
    }
}

/// Strip the service prefix from a request path, keeping it rooted
fn strip_service_prefix(path: &str, prefix: &str) -> String {
    let stripped = path.strip_prefix(prefix).unwrap_or(path);

    if stripped.is_empty() {
        return "/".to_string();
    }

    if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{}", stripped)
    }
}

fn fallback_error_data(status: u16, body: &Bytes, request: &GatewayRequest) -> Value {
    serde_json::to_value(ErrorData {
        code: status,
        message: String::from_utf8_lossy(body).into_owned(),
        path: request.path().to_string(),
        method: request.method.to_string(),
    })
    .unwrap_or(Value::Null)
}

fn add_gateway_headers(headers: &mut HeaderMap) {
    insert_header(headers, "x-gateway", GATEWAY_NAME);
    insert_header(headers, "x-gateway-version", GATEWAY_VERSION);
    insert_header(headers, "x-response-time", &chrono::Utc::now().to_rfc3339());
    headers.insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
}

fn copy_important_headers(upstream: &HeaderMap, headers: &mut HeaderMap) {
    for name in IMPORTANT_HEADERS {
        if let Some(value) = upstream.get(*name) {
            if let Ok(name) = name.parse::<HeaderName>() {
                headers.insert(name, value.clone());
            }
        }
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
