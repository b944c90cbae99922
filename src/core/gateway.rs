use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::routing::get;
use hyper::StatusCode;
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::request::GatewayRequest;
use crate::core::response::{GatewayResponse, StandardResponse};
use crate::core::router::ServiceRouter;
use crate::error::GatewayError;
use crate::health::HealthChecker;
use crate::middleware::auth::AuthMiddleware;
use crate::middleware::circuit_breaker::{CircuitBreakerManager, CircuitBreakerMiddleware};
use crate::middleware::load_balancer::LoadBalancer;
use crate::middleware::logging::LoggingMiddleware;
use crate::middleware::rate_limit::{RateLimitMiddleware, RateLimiter};
use crate::middleware::{MiddlewareChain, MiddlewareHandler};
use crate::proxy::{ProxyHandler, GATEWAY_VERSION};

/// How long in-flight requests get to finish on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The assembled gateway: service router, per-service middleware chains
/// and the shared policy engines they consult.
pub struct ApiGateway {
    config: Config,
    router: ServiceRouter,
    chains: HashMap<String, Arc<dyn MiddlewareHandler>>,
    health: Arc<HealthChecker>,
    breakers: Arc<CircuitBreakerManager>,
    load_balancers: HashMap<String, Arc<LoadBalancer>>,
    rate_limiters: Vec<Arc<RateLimiter>>,
    shutdown_tx: watch::Sender<bool>,
    start_time: Instant,
}

impl ApiGateway {
    /// Build the gateway from configuration: one upstream client, one
    /// breaker and optional load balancer per service, and the middleware
    /// chain (auth, rate limit, breaker, logging, proxy) for each.
    pub async fn new(config: Config) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| GatewayError::InternalError(format!("failed to build client: {}", e)))?;

        let health = Arc::new(HealthChecker::new());
        let breakers = Arc::new(CircuitBreakerManager::new());
        let (shutdown_tx, _) = watch::channel(false);

        let mut load_balancers = HashMap::new();
        let mut rate_limiters = Vec::new();
        let mut chains: HashMap<String, Arc<dyn MiddlewareHandler>> = HashMap::new();

        for service in &config.gateway.services {
            if service.health_check.enabled {
                let health_url = format!("{}{}", service.base_url, service.health_check.endpoint);
                let interval = Duration::from_secs(service.health_check.interval_seconds);
                health.add_service(&service.name, &health_url, interval).await;
            }

            let load_balancer = LoadBalancer::from_config(&service.load_balancer).map(Arc::new);
            if let Some(lb) = &load_balancer {
                load_balancers.insert(service.name.clone(), lb.clone());
            }

            let breaker = breakers.get_or_create(&service.name);

            let mut chain = MiddlewareChain::new();

            if config.auth.enabled {
                chain.add(AuthMiddleware::new(&config.auth));
            }

            if service.rate_limit.enabled {
                let limiter = Arc::new(RateLimiter::new(service.rate_limit.clone()));
                rate_limiters.push(limiter.clone());
                chain.add(RateLimitMiddleware::new(limiter));
            }

            chain.add(CircuitBreakerMiddleware::new(&service.name, breaker));
            chain.add(LoggingMiddleware::new(&service.name));

            let proxy = ProxyHandler::new(service.clone(), client.clone(), load_balancer);
            chains.insert(service.name.clone(), chain.build(Arc::new(proxy)));

            info!(
                service = %service.name,
                prefix = %service.prefix,
                base_url = %service.base_url,
                "Service configured"
            );
        }

        Ok(Self {
            router: ServiceRouter::new(config.gateway.services.clone()),
            config,
            chains,
            health,
            breakers,
            load_balancers,
            rate_limiters,
            shutdown_tx,
            start_time: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn health(&self) -> Arc<HealthChecker> {
        self.health.clone()
    }

    pub fn breakers(&self) -> Arc<CircuitBreakerManager> {
        self.breakers.clone()
    }

    pub fn load_balancer(&self, service: &str) -> Option<Arc<LoadBalancer>> {
        self.load_balancers.get(service).cloned()
    }

    /// Start the health probes and rate limiter sweeps
    pub async fn start_background_tasks(&self) {
        self.health.start().await;

        for limiter in &self.rate_limiters {
            limiter.start_sweep(self.shutdown_tx.subscribe());
        }
    }

    /// Stop every periodic task
    pub fn shutdown_background_tasks(&self) {
        self.health.shutdown();
        let _ = self.shutdown_tx.send(true);
    }

    /// Route a request through its service's middleware chain
    pub async fn process_request(
        &self,
        request: GatewayRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        let service = self
            .router
            .find(request.path())
            .ok_or_else(|| GatewayError::RouteNotFound(request.path().to_string()))?;

        let chain = self
            .chains
            .get(&service.name)
            .ok_or_else(|| GatewayError::InternalError(format!("no chain for {}", service.name)))?;

        chain.handle(request).await
    }

    /// Build the axum application: admin endpoints plus the catch-all
    /// proxy dispatcher.
    pub fn app(self: &Arc<Self>) -> axum::Router {
        axum::Router::new()
            .route("/health", get(health_endpoint))
            .route("/health/services", get(services_health_endpoint))
            .route("/metrics", get(metrics_endpoint))
            .fallback(proxy_endpoint)
            .with_state(self.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind, serve and block until a shutdown signal, then drain in-flight
    /// requests for up to the grace period.
    pub async fn run(self: Arc<Self>) -> Result<(), GatewayError> {
        self.start_background_tasks().await;

        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.gateway.port)
            .parse()
            .map_err(|e| GatewayError::InternalError(format!("invalid listen address: {}", e)))?;

        let server = axum::Server::try_bind(&addr)
            .map_err(|e| GatewayError::InternalError(format!("failed to bind {}: {}", addr, e)))?
            .serve(self.app().into_make_service_with_connect_info::<SocketAddr>());

        info!(%addr, services = self.config.gateway.services.len(), "API Gateway listening");
        for service in self.router.services() {
            info!(name = %service.name, "  {} -> {}", service.prefix, service.base_url);
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
        });

        shutdown_signal().await;
        info!("Shutdown signal received, stopping API Gateway");

        self.shutdown_background_tasks();
        let _ = shutdown_tx.send(());

        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(Ok(()))) => {
                info!("API Gateway stopped gracefully");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(GatewayError::InternalError(format!("server error: {}", e))),
            Ok(Err(e)) => Err(GatewayError::InternalError(format!("server task failed: {}", e))),
            Err(_) => {
                warn!("Graceful shutdown timed out, forcing close");
                Ok(())
            }
        }
    }

    fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn health_endpoint(State(gateway): State<Arc<ApiGateway>>) -> axum::response::Response {
    let envelope = StandardResponse {
        data: json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "services": gateway.config.gateway.services.len(),
            "version": GATEWAY_VERSION,
            "uptime": format!("{:?}", gateway.uptime()),
        }),
        success: true,
        error_message: None,
    };

    into_axum_response(GatewayResponse::json(StatusCode::OK, &envelope))
}

async fn services_health_endpoint(
    State(gateway): State<Arc<ApiGateway>>,
) -> axum::response::Response {
    let mut services = serde_json::Map::new();
    let mut all_healthy = true;

    for service in &gateway.config.gateway.services {
        let entry = if service.health_check.enabled {
            let healthy = gateway.health.is_healthy(&service.name).await;
            if !healthy {
                all_healthy = false;
            }

            let last_check: Value = gateway
                .health
                .last_check(&service.name)
                .await
                .map(|t| json!(chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339()))
                .unwrap_or(Value::Null);

            json!({
                "healthy": healthy,
                "last_check": last_check,
                "status": if healthy { "operational" } else { "down" },
            })
        } else {
            json!({
                "healthy": true,
                "health_check": "disabled",
                "status": "unknown",
            })
        };

        services.insert(service.name.clone(), entry);
    }

    let envelope = StandardResponse {
        data: json!({
            "services": services,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "overall_status": if all_healthy { "all_systems_operational" } else { "degraded_performance" },
            "total_services": gateway.config.gateway.services.len(),
        }),
        success: all_healthy,
        error_message: if all_healthy {
            None
        } else {
            Some("Some services are not healthy".to_string())
        },
    };

    into_axum_response(GatewayResponse::json(StatusCode::OK, &envelope))
}

async fn metrics_endpoint(State(gateway): State<Arc<ApiGateway>>) -> axum::response::Response {
    let mut circuit_breakers = serde_json::Map::new();
    for (name, breaker) in gateway.breakers.all() {
        let counts = breaker.counts();
        circuit_breakers.insert(
            name,
            json!({
                "state": breaker.state().to_string(),
                "requests": counts.requests,
                "successes": counts.total_successes,
                "failures": counts.total_failures,
                "consecutive_failures": counts.consecutive_failures,
            }),
        );
    }

    let mut load_balancers = serde_json::Map::new();
    for (name, lb) in &gateway.load_balancers {
        load_balancers.insert(
            name.clone(),
            json!({ "healthy_backends": lb.healthy_backends() }),
        );
    }

    let envelope = StandardResponse {
        data: json!({
            "gateway": {
                "uptime_seconds": gateway.uptime().as_secs_f64(),
                "total_services": gateway.config.gateway.services.len(),
                "gateway_version": GATEWAY_VERSION,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            },
            "proxy": {
                "circuit_breakers": circuit_breakers,
                "load_balancers": load_balancers,
            },
        }),
        success: true,
        error_message: None,
    };

    into_axum_response(GatewayResponse::json(StatusCode::OK, &envelope))
}

/// Catch-all dispatcher: convert the inbound request, match a service
/// prefix and run the service's middleware chain.
async fn proxy_endpoint(
    State(gateway): State<Arc<ApiGateway>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: axum::http::Request<axum::body::Body>,
) -> axum::response::Response {
    let (parts, body) = request.into_parts();

    let body_bytes = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("Failed to read request body: {}", e);
            return into_axum_response(GatewayResponse::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read request body",
            ));
        }
    };

    // Trust the first X-Forwarded-For hop, fall back to the socket peer
    let client_ip = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse().ok())
        .or(Some(remote.ip()));

    let gateway_request =
        GatewayRequest::new(parts.method, parts.uri, parts.headers, body_bytes, client_ip);

    match gateway.process_request(gateway_request).await {
        Ok(response) => into_axum_response(response),
        Err(e) => {
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            into_axum_response(GatewayResponse::error(status, &e.to_string()))
        }
    }
}

fn into_axum_response(response: GatewayResponse) -> axum::response::Response {
    use axum::response::IntoResponse;

    let mut builder = axum::http::Response::builder().status(response.status);

    for (name, value) in response.headers.iter() {
        builder = builder.header(name, value);
    }

    builder
        .body(axum::body::Body::from(response.body))
        .unwrap_or_else(|_| {
            axum::http::Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(axum::body::Body::empty())
                .unwrap()
        })
        .into_response()
}
