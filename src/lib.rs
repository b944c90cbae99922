// API Gateway Library

pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod middleware;
pub mod models;
pub mod proxy;

// Re-export commonly used types
pub use crate::config::Config;
pub use crate::core::gateway::ApiGateway;
pub use crate::core::request::GatewayRequest;
pub use crate::core::response::{GatewayResponse, StandardResponse};
pub use crate::error::{AuthError, ConfigError, GatewayError};
pub use crate::models::{Claims, Identity};
