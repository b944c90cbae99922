use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use hyper::StatusCode;
use jwt::{SignWithKey, VerifyWithKey};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::{AuthError, GatewayError};
use crate::middleware::{Middleware, MiddlewareHandler};
use crate::models::{Claims, Identity};

/// Issuer stamped into and required from every gateway token
const ISSUER: &str = "api-gateway";

/// API keys accepted by the API-key authentication mode
const VALID_API_KEYS: &[&str] = &[
    "dev-key-001",
    "dev-key-002",
    "prod-key-101",
    "prod-key-102",
    "admin-key-900",
];

/// HMAC-SHA256 token service: signs and validates gateway access tokens
pub struct AuthService {
    config: AuthConfig,
}

impl AuthService {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    fn key(&self) -> Result<Hmac<Sha256>, AuthError> {
        Hmac::new_from_slice(self.config.jwt_secret.as_bytes())
            .map_err(|_| AuthError::SigningError("invalid secret key".to_string()))
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Verify a token and return its claims
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let key = self.key()?;

        let claims: Claims = token.verify_with_key(&key).map_err(|_| AuthError::InvalidToken)?;

        let now = Self::now();
        if claims.is_expired(now) {
            return Err(AuthError::TokenExpired);
        }
        if claims.is_not_valid_yet(now) {
            return Err(AuthError::InvalidToken);
        }
        if claims.iss != ISSUER {
            return Err(AuthError::InvalidToken);
        }

        Ok(claims)
    }

    /// Sign an arbitrary claim set
    pub fn sign_claims(&self, claims: &Claims) -> Result<String, AuthError> {
        let key = self.key()?;
        claims
            .sign_with_key(&key)
            .map_err(|e| AuthError::SigningError(e.to_string()))
    }

    /// Generate an access token for a user
    pub fn generate_token(
        &self,
        user_id: &str,
        username: &str,
        role: &str,
    ) -> Result<String, AuthError> {
        let now = Self::now();

        let claims = Claims {
            user_id: user_id.to_string(),
            username: username.to_string(),
            role: role.to_string(),
            exp: now + self.config.token_expiry_hours * 3600,
            iat: now,
            nbf: now,
            iss: ISSUER.to_string(),
        };

        self.sign_claims(&claims)
    }
}

/// Bearer-token authentication middleware.
///
/// Verifies the Authorization header and publishes the authenticated
/// identity onto the request for downstream middlewares and the proxy.
pub struct AuthMiddleware {
    enabled: bool,
    service: Arc<AuthService>,
}

impl AuthMiddleware {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            enabled: config.enabled,
            service: Arc::new(AuthService::new(config.clone())),
        }
    }

    pub fn service(&self) -> Arc<AuthService> {
        self.service.clone()
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn process_request(
        &self,
        mut request: GatewayRequest,
        next: Arc<dyn MiddlewareHandler>,
    ) -> Result<GatewayResponse, GatewayError> {
        if !self.enabled {
            return next.handle(request).await;
        }

        let auth_header = match request.header("authorization") {
            Some(value) => value,
            None => {
                return Ok(GatewayResponse::error(
                    StatusCode::UNAUTHORIZED,
                    "Authorization header required",
                ))
            }
        };

        let token = match auth_header.strip_prefix("Bearer ") {
            Some(token) if !token.is_empty() => token.to_string(),
            Some(_) => {
                return Ok(GatewayResponse::error(
                    StatusCode::UNAUTHORIZED,
                    "Token is required",
                ))
            }
            None => {
                return Ok(GatewayResponse::error(
                    StatusCode::UNAUTHORIZED,
                    "Invalid authorization format",
                ))
            }
        };

        match self.service.validate_token(&token) {
            Ok(claims) => {
                debug!(user_id = %claims.user_id, "Authentication successful");
                request.identity = Some(Identity::from_claims(claims));
                next.handle(request).await
            }
            Err(err) => {
                warn!(error = %err, "Authentication failed");
                Ok(GatewayResponse::error(
                    StatusCode::UNAUTHORIZED,
                    &format!("Invalid token: {}", err),
                ))
            }
        }
    }

    fn name(&self) -> &str {
        "auth"
    }
}

/// API-key authentication middleware, an alternative to bearer tokens.
///
/// Accepts the key from the `X-API-Key` header or the `api_key` query
/// parameter and checks it against the configured allowlist.
pub struct ApiKeyMiddleware {
    enabled: bool,
}

impl ApiKeyMiddleware {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            enabled: config.enabled,
        }
    }

    fn extract_key(request: &GatewayRequest) -> Option<String> {
        if let Some(key) = request.header("x-api-key") {
            if !key.is_empty() {
                return Some(key);
            }
        }

        request.query().and_then(|query| {
            query.split('&').find_map(|pair| {
                pair.strip_prefix("api_key=")
                    .filter(|v| !v.is_empty())
                    .map(|v| v.to_string())
            })
        })
    }

    fn is_valid(key: &str) -> bool {
        VALID_API_KEYS.contains(&key)
    }
}

#[async_trait]
impl Middleware for ApiKeyMiddleware {
    async fn process_request(
        &self,
        request: GatewayRequest,
        next: Arc<dyn MiddlewareHandler>,
    ) -> Result<GatewayResponse, GatewayError> {
        if !self.enabled {
            return next.handle(request).await;
        }

        let key = match Self::extract_key(&request) {
            Some(key) => key,
            None => {
                return Ok(GatewayResponse::error(
                    StatusCode::UNAUTHORIZED,
                    "API Key required",
                ))
            }
        };

        if !Self::is_valid(&key) {
            return Ok(GatewayResponse::error(
                StatusCode::UNAUTHORIZED,
                "Invalid API Key",
            ));
        }

        next.handle(request).await
    }

    fn name(&self) -> &str {
        "api_key"
    }
}

/// Role guard: allows the required role or `admin`
pub struct RequireRoleMiddleware {
    enabled: bool,
    required: String,
}

impl RequireRoleMiddleware {
    pub fn new(config: &AuthConfig, required: impl Into<String>) -> Self {
        Self {
            enabled: config.enabled,
            required: required.into(),
        }
    }
}

#[async_trait]
impl Middleware for RequireRoleMiddleware {
    async fn process_request(
        &self,
        request: GatewayRequest,
        next: Arc<dyn MiddlewareHandler>,
    ) -> Result<GatewayResponse, GatewayError> {
        if !self.enabled {
            return next.handle(request).await;
        }

        let role = match &request.identity {
            Some(identity) => identity.role.clone(),
            None => {
                return Ok(GatewayResponse::error(
                    StatusCode::FORBIDDEN,
                    "Role information not found",
                ))
            }
        };

        if role != self.required && role != "admin" {
            return Ok(GatewayResponse::error(
                StatusCode::FORBIDDEN,
                &format!("Required role: {}", self.required),
            ));
        }

        next.handle(request).await
    }

    fn name(&self) -> &str {
        "require_role"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::OkHandler;
    use bytes::Bytes;
    use hyper::{HeaderMap, Method, Uri};
    use std::sync::Mutex;

    fn auth_config() -> AuthConfig {
        AuthConfig {
            enabled: true,
            jwt_secret: "test-secret".to_string(),
            token_expiry_hours: 1,
            refresh_expiry_hours: 24,
        }
    }

    fn request_with_headers(headers: HeaderMap) -> GatewayRequest {
        GatewayRequest::new(
            Method::GET,
            Uri::from_static("/svc/x"),
            headers,
            Bytes::new(),
            None,
        )
    }

    /// Final handler capturing the request it receives
    struct CapturingHandler {
        seen: Mutex<Option<GatewayRequest>>,
    }

    #[async_trait]
    impl MiddlewareHandler for CapturingHandler {
        async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
            *self.seen.lock().unwrap() = Some(request);
            Ok(GatewayResponse::new(
                StatusCode::OK,
                HeaderMap::new(),
                Bytes::new(),
            ))
        }
    }

    #[test]
    fn test_token_round_trip() {
        let service = AuthService::new(auth_config());

        let token = service.generate_token("u-1", "alice", "editor").unwrap();
        let claims = service.validate_token(&token).unwrap();

        assert_eq!(claims.user_id, "u-1");
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.role, "editor");
        assert_eq!(claims.iss, "api-gateway");
    }

    #[test]
    fn test_expired_token_rejected() {
        let service = AuthService::new(auth_config());

        let claims = Claims {
            user_id: "u-1".to_string(),
            username: "alice".to_string(),
            role: "editor".to_string(),
            exp: 1,
            iat: 0,
            nbf: 0,
            iss: ISSUER.to_string(),
        };
        let token = service.sign_claims(&claims).unwrap();

        assert!(matches!(
            service.validate_token(&token),
            Err(AuthError::TokenExpired)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let service = AuthService::new(auth_config());
        let token = service.generate_token("u-1", "alice", "editor").unwrap();

        let mut other_config = auth_config();
        other_config.jwt_secret = "other-secret".to_string();
        let other = AuthService::new(other_config);

        assert!(matches!(
            other.validate_token(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_wrong_issuer_rejected() {
        let service = AuthService::new(auth_config());

        let claims = Claims {
            user_id: "u-1".to_string(),
            username: "alice".to_string(),
            role: "editor".to_string(),
            exp: u64::MAX,
            iat: 0,
            nbf: 0,
            iss: "someone-else".to_string(),
        };
        let token = service.sign_claims(&claims).unwrap();

        assert!(matches!(
            service.validate_token(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_missing_header_rejected() {
        let middleware = AuthMiddleware::new(&auth_config());

        let response = middleware
            .process_request(request_with_headers(HeaderMap::new()), Arc::new(OkHandler))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_non_bearer_scheme_rejected() {
        let middleware = AuthMiddleware::new(&auth_config());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic dXNlcjpwYXNz".parse().unwrap());

        let response = middleware
            .process_request(request_with_headers(headers), Arc::new(OkHandler))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_valid_token_publishes_identity() {
        let middleware = AuthMiddleware::new(&auth_config());
        let token = middleware
            .service()
            .generate_token("u-7", "bob", "viewer")
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {}", token).parse().unwrap(),
        );

        let capture = Arc::new(CapturingHandler {
            seen: Mutex::new(None),
        });

        let response = middleware
            .process_request(request_with_headers(headers), capture.clone())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);

        let seen = capture.seen.lock().unwrap();
        let identity = seen.as_ref().unwrap().identity.as_ref().unwrap();
        assert_eq!(identity.user_id, "u-7");
        assert_eq!(identity.username, "bob");
        assert_eq!(identity.role, "viewer");
    }

    #[tokio::test]
    async fn test_disabled_auth_passes_through() {
        let mut config = auth_config();
        config.enabled = false;
        let middleware = AuthMiddleware::new(&config);

        let response = middleware
            .process_request(request_with_headers(HeaderMap::new()), Arc::new(OkHandler))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_key_header_accepted() {
        let middleware = ApiKeyMiddleware::new(&auth_config());

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "dev-key-001".parse().unwrap());

        let response = middleware
            .process_request(request_with_headers(headers), Arc::new(OkHandler))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_key_query_param_accepted() {
        let middleware = ApiKeyMiddleware::new(&auth_config());

        let request = GatewayRequest::new(
            Method::GET,
            Uri::from_static("/svc/x?api_key=admin-key-900"),
            HeaderMap::new(),
            Bytes::new(),
            None,
        );

        let response = middleware
            .process_request(request, Arc::new(OkHandler))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_key_invalid_rejected() {
        let middleware = ApiKeyMiddleware::new(&auth_config());

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "wrong".parse().unwrap());

        let response = middleware
            .process_request(request_with_headers(headers), Arc::new(OkHandler))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_require_role_allows_admin() {
        let middleware = RequireRoleMiddleware::new(&auth_config(), "editor");

        let service = AuthService::new(auth_config());
        let token = service.generate_token("u-1", "root", "admin").unwrap();
        let claims = service.validate_token(&token).unwrap();

        let mut request = request_with_headers(HeaderMap::new());
        request.identity = Some(Identity::from_claims(claims));

        let response = middleware
            .process_request(request, Arc::new(OkHandler))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_require_role_rejects_mismatch() {
        let middleware = RequireRoleMiddleware::new(&auth_config(), "editor");

        let service = AuthService::new(auth_config());
        let token = service.generate_token("u-1", "eve", "viewer").unwrap();
        let claims = service.validate_token(&token).unwrap();

        let mut request = request_with_headers(HeaderMap::new());
        request.identity = Some(Identity::from_claims(claims));

        let response = middleware
            .process_request(request, Arc::new(OkHandler))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_require_role_without_identity() {
        let middleware = RequireRoleMiddleware::new(&auth_config(), "editor");

        let response = middleware
            .process_request(request_with_headers(HeaderMap::new()), Arc::new(OkHandler))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::FORBIDDEN);
    }
}
