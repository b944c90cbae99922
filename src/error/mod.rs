use thiserror::Error;

/// Gateway error types
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

/// HTTP status code mapping for gateway errors
impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::ConfigError(_) => 500,
            GatewayError::AuthError(_) => 401,
            GatewayError::RouteNotFound(_) => 404,
            GatewayError::InternalError(_) => 500,
        }
    }
}

/// Authentication specific errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Signing error: {0}")]
    SigningError(String),
}

/// Configuration specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}
