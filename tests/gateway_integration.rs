use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::get;
use axum::Router as AxumRouter;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use portico::config::{AuthConfig, Config};
use portico::core::gateway::ApiGateway;
use portico::middleware::auth::AuthService;

/// Test backend server
struct TestBackend {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TestBackend {
    async fn start(name: &'static str) -> Self {
        let app = AxumRouter::new()
            .route("/health", get(|| async { Json(json!({"status": "UP"})) }))
            .route(
                "/plain",
                get(|| async { Json(json!({"foo": 1})) }),
            )
            .route(
                "/enveloped-error",
                get(|| async {
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        [("content-type", "application/json")],
                        r#"{"data":{"x":1},"success":true,"errorMessage":null}"#,
                    )
                }),
            )
            .route(
                "/missing",
                get(|| async { (StatusCode::NOT_FOUND, "not a json") }),
            )
            .route(
                "/boom",
                get(|| async {
                    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "exploded"})))
                }),
            )
            .route(
                "/whoami",
                get(move |headers: HeaderMap| async move {
                    let header = |n: &str| {
                        headers
                            .get(n)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string()
                    };
                    Json(json!({
                        "server": name,
                        "user_id": header("x-user-id"),
                        "username": header("x-username"),
                        "role": header("x-user-role"),
                        "gateway": header("x-gateway"),
                        "forwarded_host": header("x-forwarded-host"),
                        "request_id": header("x-request-id"),
                    }))
                }),
            )
            .route(
                "/delay/:ms",
                get(|Path(ms): Path<u64>| async move {
                    sleep(Duration::from_millis(ms)).await;
                    Json(json!({"delayed": ms}))
                }),
            );

        let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap())
            .serve(app.into_make_service());
        let addr = server.local_addr();

        let handle = tokio::spawn(async move {
            let _ = server.await;
        });

        sleep(Duration::from_millis(50)).await;

        Self { addr, handle }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Running gateway under test
struct TestGateway {
    gateway: Arc<ApiGateway>,
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TestGateway {
    async fn start(config_json: Value) -> Self {
        let mut config: Config = serde_json::from_value(config_json).unwrap();
        config.apply_defaults();

        let gateway = Arc::new(ApiGateway::new(config).await.unwrap());
        gateway.start_background_tasks().await;

        let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap())
            .serve(gateway.app().into_make_service_with_connect_info::<SocketAddr>());
        let addr = server.local_addr();

        let handle = tokio::spawn(async move {
            let _ = server.await;
        });

        sleep(Duration::from_millis(50)).await;

        Self {
            gateway,
            addr,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.gateway.shutdown_background_tasks();
        self.handle.abort();
    }
}

fn single_service_config(prefix: &str, base_url: &str) -> Value {
    json!({
        "gateway": {
            "port": "0",
            "services": [
                { "name": "svc", "base_url": base_url, "prefix": prefix }
            ]
        },
        "auth": { "enabled": false, "jwt_secret": "" }
    })
}

#[tokio::test]
async fn test_standard_format_passes_through_unchanged() {
    let backend = TestBackend::start("b1").await;
    let gateway = TestGateway::start(single_service_config("/svc", &backend.url())).await;

    let response = reqwest::get(gateway.url("/svc/enveloped-error")).await.unwrap();

    // Upstream said 500, but the envelope carries the error state
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    assert!(response.headers().contains_key("x-gateway"));

    let body = response.text().await.unwrap();
    assert_eq!(body, r#"{"data":{"x":1},"success":true,"errorMessage":null}"#);
}

#[tokio::test]
async fn test_plain_json_gets_wrapped() {
    let backend = TestBackend::start("b1").await;
    let gateway = TestGateway::start(single_service_config("/svc", &backend.url())).await;

    let response = reqwest::get(gateway.url("/svc/plain")).await.unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"data": {"foo": 1}, "success": true, "errorMessage": null}));
}

#[tokio::test]
async fn test_non_json_error_gets_error_data() {
    let backend = TestBackend::start("b1").await;
    let gateway = TestGateway::start(single_service_config("/svc", &backend.url())).await;

    let response = reqwest::get(gateway.url("/svc/missing")).await.unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["errorMessage"], "Not Found");
    assert_eq!(body["data"]["code"], 404);
    assert_eq!(body["data"]["message"], "not a json");
    assert_eq!(body["data"]["path"], "/svc/missing");
    assert_eq!(body["data"]["method"], "GET");
}

#[tokio::test]
async fn test_proxy_headers_reach_backend() {
    let backend = TestBackend::start("b1").await;
    let gateway = TestGateway::start(single_service_config("/svc", &backend.url())).await;

    let response = reqwest::get(gateway.url("/svc/whoami")).await.unwrap();
    let body: Value = response.json().await.unwrap();

    assert_eq!(body["data"]["gateway"], "api-gateway");
    assert!(!body["data"]["request_id"].as_str().unwrap().is_empty());
    assert!(!body["data"]["forwarded_host"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_round_robin_rotation_and_mark_down() {
    let a = TestBackend::start("a").await;
    let b = TestBackend::start("b").await;
    let c = TestBackend::start("c").await;

    let config = json!({
        "gateway": {
            "port": "0",
            "services": [{
                "name": "svc",
                "base_url": a.url(),
                "prefix": "/svc",
                "load_balancer": {
                    "enabled": true,
                    "strategy": "round_robin",
                    "backends": [a.url(), b.url(), c.url()]
                }
            }]
        }
    });
    let gateway = TestGateway::start(config).await;

    let server_for = |body: &Value| body["data"]["server"].as_str().unwrap().to_string();

    let mut seen = Vec::new();
    for _ in 0..6 {
        let body: Value = reqwest::get(gateway.url("/svc/whoami"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        seen.push(server_for(&body));
    }

    // One full cycle visits every backend twice, in a repeating order
    for name in ["a", "b", "c"] {
        assert_eq!(seen.iter().filter(|s| *s == name).count(), 2, "{:?}", seen);
    }
    assert_eq!(seen[0..3].to_vec(), seen[3..6].to_vec());

    // Kill b: the request that hits it fails and marks it down
    b.stop();

    let mut failures = 0;
    for _ in 0..3 {
        let response = reqwest::get(gateway.url("/svc/whoami")).await.unwrap();
        let body: Value = response.json().await.unwrap();
        if body["success"] == false {
            failures += 1;
        }
    }
    assert_eq!(failures, 1, "exactly one request should hit the dead backend");

    let mut after = Vec::new();
    for _ in 0..4 {
        let body: Value = reqwest::get(gateway.url("/svc/whoami"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["success"], true);
        after.push(server_for(&body));
    }

    assert!(after.iter().all(|s| s != "b"), "{:?}", after);
    assert_ne!(after[0], after[1]);
    assert_eq!(after[0], after[2]);
    assert_eq!(after[1], after[3]);

    let lb = gateway.gateway.load_balancer("svc").unwrap();
    assert_eq!(lb.healthy_backends().len(), 2);
}

#[tokio::test]
async fn test_transport_failure_returns_error_envelope() {
    // Point at a port nothing listens on
    let gateway =
        TestGateway::start(single_service_config("/svc", "http://127.0.0.1:39999")).await;

    let response = reqwest::get(gateway.url("/svc/anything")).await.unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["errorMessage"]
        .as_str()
        .unwrap()
        .starts_with("Service unavailable"));
    assert_eq!(body["data"]["code"], 502);
}

#[tokio::test]
async fn test_circuit_breaker_opens_after_failures() {
    let backend = TestBackend::start("b1").await;
    let gateway = TestGateway::start(single_service_config("/svc", &backend.url())).await;

    // Five consecutive upstream 500s trip the default breaker
    for _ in 0..5 {
        let response = reqwest::get(gateway.url("/svc/boom")).await.unwrap();
        assert_eq!(response.status(), 200);

        let body: Value = response.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["errorMessage"], "Internal Server Error");
    }

    // Sixth request is rejected by the breaker without reaching upstream
    let response = reqwest::get(gateway.url("/svc/plain")).await.unwrap();
    assert_eq!(response.status(), 503);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Service temporarily unavailable");
    assert_eq!(body["reason"], "Circuit breaker is open");
    assert_eq!(body["service"], "svc");
    assert_eq!(body["state"], "OPEN");

    let breaker = gateway.gateway.breakers().get("svc").unwrap();
    assert_eq!(breaker.state().to_string(), "OPEN");
}

#[tokio::test]
async fn test_rate_limit_burst_and_recovery() {
    let backend = TestBackend::start("b1").await;

    let config = json!({
        "gateway": {
            "port": "0",
            "services": [{
                "name": "svc",
                "base_url": backend.url(),
                "prefix": "/svc",
                "rate_limit": {
                    "enabled": true,
                    "requests_per_second": 2,
                    "burst_size": 2
                }
            }]
        }
    });
    let gateway = TestGateway::start(config).await;
    let client = reqwest::Client::new();

    let mut statuses = Vec::new();
    for _ in 0..5 {
        let response = client.get(gateway.url("/svc/plain")).send().await.unwrap();

        if response.status() == 429 {
            let retry_after: u64 = response
                .headers()
                .get("retry-after")
                .unwrap()
                .to_str()
                .unwrap()
                .parse()
                .unwrap();
            assert!(retry_after > 0);
        }

        statuses.push(response.status().as_u16());
    }

    assert_eq!(&statuses[..2], &[200, 200]);
    assert_eq!(&statuses[2..], &[429, 429, 429]);

    sleep(Duration::from_millis(1100)).await;

    for _ in 0..2 {
        let response = client.get(gateway.url("/svc/plain")).send().await.unwrap();
        assert_eq!(response.status(), 200);
    }
}

#[tokio::test]
async fn test_auth_required_and_identity_forwarded() {
    let backend = TestBackend::start("b1").await;

    let config = json!({
        "gateway": {
            "port": "0",
            "services": [
                { "name": "svc", "base_url": backend.url(), "prefix": "/svc" }
            ]
        },
        "auth": {
            "enabled": true,
            "jwt_secret": "integration-secret",
            "token_expiry_hours": 1,
            "refresh_expiry_hours": 24
        }
    });
    let gateway = TestGateway::start(config).await;
    let client = reqwest::Client::new();

    // Missing token is rejected before the proxy ever runs
    let response = client.get(gateway.url("/svc/whoami")).send().await.unwrap();
    assert_eq!(response.status(), 401);

    // Garbage token is rejected too
    let response = client
        .get(gateway.url("/svc/whoami"))
        .header("authorization", "Bearer not-a-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // A valid token gets through and its identity reaches the backend
    let auth = AuthService::new(AuthConfig {
        enabled: true,
        jwt_secret: "integration-secret".to_string(),
        token_expiry_hours: 1,
        refresh_expiry_hours: 24,
    });
    let token = auth.generate_token("u-1", "alice", "editor").unwrap();

    let response = client
        .get(gateway.url("/svc/whoami"))
        .header("authorization", format!("Bearer {}", token))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["user_id"], "u-1");
    assert_eq!(body["data"]["username"], "alice");
    assert_eq!(body["data"]["role"], "editor");
}

#[tokio::test]
async fn test_health_endpoint() {
    let backend = TestBackend::start("b1").await;
    let gateway = TestGateway::start(single_service_config("/svc", &backend.url())).await;

    let body: Value = reqwest::get(gateway.url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "healthy");
    assert_eq!(body["data"]["services"], 1);
    assert_eq!(body["data"]["version"], "1.0.0");
}

#[tokio::test]
async fn test_services_health_endpoint() {
    let backend = TestBackend::start("b1").await;

    let config = json!({
        "gateway": {
            "port": "0",
            "services": [
                {
                    "name": "probed",
                    "base_url": backend.url(),
                    "prefix": "/probed",
                    "health_check": {
                        "enabled": true,
                        "endpoint": "/health",
                        "interval_seconds": 30
                    }
                },
                { "name": "dark", "base_url": backend.url(), "prefix": "/dark" }
            ]
        }
    });
    let gateway = TestGateway::start(config).await;

    // The first probe fires immediately on start
    sleep(Duration::from_millis(200)).await;

    let body: Value = reqwest::get(gateway.url("/health/services"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["overall_status"], "all_systems_operational");
    assert_eq!(body["data"]["total_services"], 2);
    assert_eq!(body["data"]["services"]["probed"]["status"], "operational");
    assert_eq!(body["data"]["services"]["dark"]["health_check"], "disabled");
    assert_eq!(body["data"]["services"]["dark"]["status"], "unknown");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let backend = TestBackend::start("b1").await;

    let config = json!({
        "gateway": {
            "port": "0",
            "services": [{
                "name": "svc",
                "base_url": backend.url(),
                "prefix": "/svc",
                "load_balancer": {
                    "enabled": true,
                    "strategy": "least_connections",
                    "backends": [backend.url()]
                }
            }]
        }
    });
    let gateway = TestGateway::start(config).await;

    // Drive one request so the breaker has counts
    reqwest::get(gateway.url("/svc/plain")).await.unwrap();

    let body: Value = reqwest::get(gateway.url("/metrics"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["gateway"]["gateway_version"], "1.0.0");
    assert_eq!(body["data"]["gateway"]["total_services"], 1);

    let breaker = &body["data"]["proxy"]["circuit_breakers"]["svc"];
    assert_eq!(breaker["state"], "CLOSED");
    assert_eq!(breaker["requests"], 1);

    let lb = &body["data"]["proxy"]["load_balancers"]["svc"];
    assert_eq!(lb["healthy_backends"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unmatched_prefix_is_404() {
    let backend = TestBackend::start("b1").await;
    let gateway = TestGateway::start(single_service_config("/svc", &backend.url())).await;

    let response = reqwest::get(gateway.url("/elsewhere/x")).await.unwrap();
    assert_eq!(response.status(), 404);

    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("/elsewhere/x"));
}

#[tokio::test]
async fn test_query_string_forwarded_and_post_body_replayed() {
    let backend_app = AxumRouter::new().route(
        "/echo",
        axum::routing::post(
            |axum::extract::RawQuery(query): axum::extract::RawQuery, body: String| async move {
                Json(json!({"query": query, "body": body}))
            },
        ),
    );

    let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap())
        .serve(backend_app.into_make_service());
    let addr = server.local_addr();
    let _handle = tokio::spawn(async move {
        let _ = server.await;
    });
    sleep(Duration::from_millis(50)).await;

    let gateway =
        TestGateway::start(single_service_config("/svc", &format!("http://{}", addr))).await;

    let response = reqwest::Client::new()
        .post(gateway.url("/svc/echo?page=2&size=5"))
        .body("payload-bytes")
        .send()
        .await
        .unwrap();

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["query"], "page=2&size=5");
    assert_eq!(body["data"]["body"], "payload-bytes");
}
