use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{watch, RwLock};
use tracing::{error, info};

/// Probe deadline applied to every health check request
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Health snapshot for one monitored service.
///
/// Queries always return copies, never live references into the map.
#[derive(Debug, Clone)]
pub struct ServiceHealth {
    pub name: String,
    pub url: String,
    pub healthy: bool,
    pub last_check: Option<SystemTime>,
    pub interval: Duration,
    pub error: String,
}

/// Periodic liveness prober for upstream services.
///
/// Each registered service gets its own probe task: one probe immediately
/// on start, then one per interval. The map is shared under a
/// multi-reader/single-writer lock.
pub struct HealthChecker {
    services: Arc<RwLock<HashMap<String, ServiceHealth>>>,
    client: reqwest::Client,
    shutdown_tx: watch::Sender<bool>,
}

impl HealthChecker {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("failed to build health check client");

        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            client,
            shutdown_tx,
        }
    }

    /// Register a service for monitoring; starts out healthy
    pub async fn add_service(&self, name: &str, health_url: &str, interval: Duration) {
        let mut services = self.services.write().await;

        services.insert(
            name.to_string(),
            ServiceHealth {
                name: name.to_string(),
                url: health_url.to_string(),
                healthy: true,
                last_check: None,
                interval,
                error: String::new(),
            },
        );

        info!(service = name, url = health_url, interval_s = interval.as_secs(), "Health check registered");
    }

    /// Spawn one probe task per registered service
    pub async fn start(&self) {
        let services: Vec<ServiceHealth> = {
            let services = self.services.read().await;
            services.values().cloned().collect()
        };

        for service in &services {
            let map = self.services.clone();
            let client = self.client.clone();
            let name = service.name.clone();
            let url = service.url.clone();
            let interval = service.interval;
            let mut shutdown = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            info!(service = %name, "Health checker stopped");
                            break;
                        }
                        // The first tick fires immediately
                        _ = ticker.tick() => {
                            let (healthy, error) = probe(&client, &url).await;
                            update_service_health(&map, &name, healthy, error).await;
                        }
                    }
                }
            });
        }

        info!(count = services.len(), "Health checker started");
    }

    /// Stop every probe task; queries keep answering last-known values
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether a service is currently healthy; false for unknown names
    pub async fn is_healthy(&self, name: &str) -> bool {
        let services = self.services.read().await;
        services.get(name).map(|s| s.healthy).unwrap_or(false)
    }

    /// Timestamp of the last probe, `None` for unknown or never-probed
    pub async fn last_check(&self, name: &str) -> Option<SystemTime> {
        let services = self.services.read().await;
        services.get(name).and_then(|s| s.last_check)
    }

    /// Snapshot of one service's health
    pub async fn get(&self, name: &str) -> Option<ServiceHealth> {
        let services = self.services.read().await;
        services.get(name).cloned()
    }

    /// Snapshot of every monitored service
    pub async fn get_all(&self) -> HashMap<String, ServiceHealth> {
        let services = self.services.read().await;
        services.clone()
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

async fn probe(client: &reqwest::Client, url: &str) -> (bool, String) {
    match client.get(url).send().await {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                (true, String::new())
            } else {
                (false, format!("Unhealthy status code: {}", status.as_u16()))
            }
        }
        Err(e) => (false, format!("Request failed: {}", e)),
    }
}

async fn update_service_health(
    map: &Arc<RwLock<HashMap<String, ServiceHealth>>>,
    name: &str,
    healthy: bool,
    error_msg: String,
) {
    let mut services = map.write().await;

    if let Some(service) = services.get_mut(name) {
        let previous = service.healthy;
        service.healthy = healthy;
        service.last_check = Some(SystemTime::now());
        service.error = error_msg.clone();

        // One log line per transition, not per probe
        if previous != healthy {
            if healthy {
                info!(service = name, "Service is now healthy");
            } else {
                error!(service = name, error = %error_msg, "Service is now unhealthy");
            }
        }
    }
}
