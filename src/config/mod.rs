use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Top-level configuration loaded from the JSON config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Gateway configuration (port and services)
    pub gateway: GatewayConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Gateway server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Port to listen on
    #[serde(default)]
    pub port: String,

    /// Configured upstream services
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// One upstream service fronted by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name, used as the key for health and breaker state
    pub name: String,

    /// Fallback upstream URL when no load balancer is configured
    pub base_url: String,

    /// Routing path prefix
    pub prefix: String,

    /// Upstream request timeout in seconds
    #[serde(default)]
    pub timeout: u64,

    /// Rate limiting policy
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Load balancing policy
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,

    /// Health check policy
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Cache settings; parsed for compatibility, consumed by nothing
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub requests_per_second: u32,

    #[serde(default)]
    pub burst_size: u32,
}

/// Load balancer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// round_robin, random, weighted or least_connections
    #[serde(default)]
    pub strategy: String,

    #[serde(default)]
    pub backends: Vec<String>,
}

/// Health check configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Probe path appended to the service base URL
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub interval_seconds: u64,

    #[serde(default)]
    pub timeout_seconds: u64,
}

/// Cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub ttl_seconds: u64,
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub jwt_secret: String,

    #[serde(default)]
    pub token_expiry_hours: u64,

    #[serde(default)]
    pub refresh_expiry_hours: u64,
}

impl Config {
    /// Load configuration from a JSON file and apply defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::LoadError(format!("{}: {}", path.as_ref().display(), e)))?;

        let mut config: Config = serde_json::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.apply_defaults();
        config.validate()?;

        Ok(config)
    }

    /// Apply default values for fields the file leaves unset
    pub fn apply_defaults(&mut self) {
        if self.gateway.port.is_empty() {
            self.gateway.port = "8000".to_string();
        }

        for service in &mut self.gateway.services {
            if service.timeout == 0 {
                service.timeout = 30;
            }

            if !service.rate_limit.enabled {
                service.rate_limit.requests_per_second = 100;
                service.rate_limit.burst_size = 200;
            }

            if service.health_check.interval_seconds == 0 {
                service.health_check.interval_seconds = 30;
            }

            if service.health_check.timeout_seconds == 0 {
                service.health_check.timeout_seconds = 5;
            }

            if service.cache.ttl_seconds == 0 {
                service.cache.ttl_seconds = 300;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for service in &self.gateway.services {
            if service.name.is_empty() {
                return Err(ConfigError::ValidationError(
                    "service name must not be empty".to_string(),
                ));
            }

            if !service.prefix.starts_with('/') {
                return Err(ConfigError::ValidationError(format!(
                    "service {}: prefix must start with '/'",
                    service.name
                )));
            }

            if service.rate_limit.enabled
                && (service.rate_limit.requests_per_second == 0 || service.rate_limit.burst_size == 0)
            {
                return Err(ConfigError::ValidationError(format!(
                    "service {}: rate limit requires requests_per_second and burst_size > 0",
                    service.name
                )));
            }

            Url::parse(&service.base_url).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "service {}: invalid base_url {}: {}",
                    service.name, service.base_url, e
                ))
            })?;

            for backend in &service.load_balancer.backends {
                Url::parse(backend).map_err(|e| {
                    ConfigError::ValidationError(format!(
                        "service {}: invalid backend {}: {}",
                        service.name, backend, e
                    ))
                })?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config_json() -> &'static str {
        r#"{
            "gateway": {
                "services": [
                    {
                        "name": "users",
                        "base_url": "http://localhost:3001",
                        "prefix": "/users"
                    }
                ]
            },
            "auth": { "enabled": false, "jwt_secret": "" }
        }"#
    }

    #[test]
    fn test_defaults_applied() {
        let mut config: Config = serde_json::from_str(minimal_config_json()).unwrap();
        config.apply_defaults();

        assert_eq!(config.gateway.port, "8000");

        let service = &config.gateway.services[0];
        assert_eq!(service.timeout, 30);
        assert_eq!(service.rate_limit.requests_per_second, 100);
        assert_eq!(service.rate_limit.burst_size, 200);
        assert_eq!(service.health_check.interval_seconds, 30);
        assert_eq!(service.health_check.timeout_seconds, 5);
        assert_eq!(service.cache.ttl_seconds, 300);
    }

    #[test]
    fn test_enabled_rate_limit_kept() {
        let json = r#"{
            "gateway": {
                "port": "9000",
                "services": [
                    {
                        "name": "orders",
                        "base_url": "http://localhost:3002",
                        "prefix": "/orders",
                        "rate_limit": { "enabled": true, "requests_per_second": 5, "burst_size": 10 }
                    }
                ]
            }
        }"#;

        let mut config: Config = serde_json::from_str(json).unwrap();
        config.apply_defaults();

        assert_eq!(config.gateway.port, "9000");
        let service = &config.gateway.services[0];
        assert_eq!(service.rate_limit.requests_per_second, 5);
        assert_eq!(service.rate_limit.burst_size, 10);
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let json = r#"{
            "gateway": {
                "services": [
                    { "name": "bad", "base_url": "not a url", "prefix": "/bad" }
                ]
            }
        }"#;

        let mut config: Config = serde_json::from_str(json).unwrap();
        config.apply_defaults();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let json = r#"{
            "gateway": {
                "services": [
                    {
                        "name": "bad",
                        "base_url": "http://localhost:1",
                        "prefix": "/bad",
                        "rate_limit": { "enabled": true, "requests_per_second": 0, "burst_size": 0 }
                    }
                ]
            }
        }"#;

        let mut config: Config = serde_json::from_str(json).unwrap();
        config.apply_defaults();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_prefix_must_be_rooted() {
        let json = r#"{
            "gateway": {
                "services": [
                    { "name": "bad", "base_url": "http://localhost:1", "prefix": "bad" }
                ]
            }
        }"#;

        let mut config: Config = serde_json::from_str(json).unwrap();
        config.apply_defaults();
        assert!(config.validate().is_err());
    }
}
