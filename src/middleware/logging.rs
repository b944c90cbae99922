use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hyper::header::HeaderValue;

use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;
use crate::middleware::{Middleware, MiddlewareHandler};

/// Per-service request logging.
///
/// Emits one structured event per completed request, INFO below 400, WARN
/// for 4xx and ERROR for 5xx, and stamps the request id onto the response.
pub struct LoggingMiddleware {
    service: String,
}

impl LoggingMiddleware {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn process_request(
        &self,
        request: GatewayRequest,
        next: Arc<dyn MiddlewareHandler>,
    ) -> Result<GatewayResponse, GatewayError> {
        let start = Instant::now();

        let method = request.method.clone();
        let path = request.path().to_string();
        let client_ip = request.client_ip_string();
        let request_id = request.request_id.clone();

        let result = next.handle(request).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => {
                let status = response.status.as_u16();

                if status >= 500 {
                    tracing::error!(
                        service = %self.service,
                        method = %method,
                        path = %path,
                        status,
                        elapsed_ms,
                        client_ip = %client_ip,
                        request_id = %request_id,
                        "Request completed"
                    );
                } else if status >= 400 {
                    tracing::warn!(
                        service = %self.service,
                        method = %method,
                        path = %path,
                        status,
                        elapsed_ms,
                        client_ip = %client_ip,
                        request_id = %request_id,
                        "Request completed"
                    );
                } else {
                    tracing::info!(
                        service = %self.service,
                        method = %method,
                        path = %path,
                        status,
                        elapsed_ms,
                        client_ip = %client_ip,
                        request_id = %request_id,
                        "Request completed"
                    );
                }
            }
            Err(error) => {
                tracing::error!(
                    service = %self.service,
                    method = %method,
                    path = %path,
                    error = %error,
                    elapsed_ms,
                    client_ip = %client_ip,
                    request_id = %request_id,
                    "Request failed"
                );
            }
        }

        result.map(|mut response| {
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers.insert("x-request-id", value);
            }
            response
        })
    }

    fn name(&self) -> &str {
        "logging"
    }
}
