use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use portico::config::Config;
use portico::core::gateway::ApiGateway;
use portico::error::GatewayError;

#[tokio::main]
async fn main() -> Result<(), GatewayError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/config.json".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        tracing::error!("Failed to load configuration from {}: {}", config_path, e);
        e
    })?;

    tracing::info!(
        path = %config_path,
        services = config.gateway.services.len(),
        "Configuration loaded"
    );

    let gateway = Arc::new(ApiGateway::new(config).await?);
    gateway.run().await
}
