pub mod auth;
pub mod circuit_breaker;
pub mod load_balancer;
pub mod logging;
pub mod rate_limit;

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;

/// Middleware trait for processing requests before the proxy handler.
///
/// A middleware either passes the (possibly enriched) request to `next` or
/// short-circuits with its own response (401, 429, 503, …).
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn process_request(
        &self,
        request: GatewayRequest,
        next: Arc<dyn MiddlewareHandler>,
    ) -> Result<GatewayResponse, GatewayError>;

    /// Get the name of this middleware
    fn name(&self) -> &str;
}

/// Handler for the next middleware in the chain
#[async_trait]
pub trait MiddlewareHandler: Send + Sync {
    async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError>;
}

/// Chain of middleware handlers built once per service
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    /// Add a middleware to the chain
    pub fn add<M: Middleware + 'static>(&mut self, middleware: M) {
        self.middlewares.push(Arc::new(middleware));
    }

    /// Build the chain around a final handler, outermost middleware first
    pub fn build(self, final_handler: Arc<dyn MiddlewareHandler>) -> Arc<dyn MiddlewareHandler> {
        let mut handler = final_handler;

        for middleware in self.middlewares.into_iter().rev() {
            handler = Arc::new(MiddlewareLink {
                middleware,
                next: handler,
            });
        }

        handler
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Link in the middleware chain
struct MiddlewareLink {
    middleware: Arc<dyn Middleware>,
    next: Arc<dyn MiddlewareHandler>,
}

#[async_trait]
impl MiddlewareHandler for MiddlewareLink {
    async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        self.middleware.process_request(request, self.next.clone()).await
    }
}
