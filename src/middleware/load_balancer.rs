use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use rand::Rng;
use tracing::debug;

use crate::config::LoadBalancerConfig;

/// Load balancer over a fixed pool of backend URLs.
///
/// All strategies share one contract: `next_backend` never blocks and
/// returns `None` only when the configured pool is empty; marking a backend
/// up or down is idempotent, and `mark_backend_up` ignores URLs outside the
/// configured set.
pub enum LoadBalancer {
    RoundRobin(RoundRobinLb),
    Random(RandomLb),
    Weighted(WeightedLb),
    LeastConnections(LeastConnectionsLb),
}

impl LoadBalancer {
    /// Build a balancer from service configuration.
    ///
    /// Returns `None` when load balancing is disabled or no backends are
    /// configured. Unknown strategy names fall back to round robin.
    pub fn from_config(config: &LoadBalancerConfig) -> Option<Self> {
        if !config.enabled || config.backends.is_empty() {
            return None;
        }

        let backends = config.backends.clone();
        let balancer = match config.strategy.as_str() {
            "random" => LoadBalancer::Random(RandomLb::new(backends)),
            "weighted" => LoadBalancer::Weighted(WeightedLb::new(backends)),
            "least_connections" => {
                LoadBalancer::LeastConnections(LeastConnectionsLb::new(backends))
            }
            "round_robin" => LoadBalancer::RoundRobin(RoundRobinLb::new(backends)),
            other => {
                debug!(strategy = other, "Unknown load balancer strategy, using round robin");
                LoadBalancer::RoundRobin(RoundRobinLb::new(backends))
            }
        };

        Some(balancer)
    }

    /// Pick the next backend URL
    pub fn next_backend(&self) -> Option<String> {
        match self {
            LoadBalancer::RoundRobin(lb) => lb.next_backend(),
            LoadBalancer::Random(lb) => lb.next_backend(),
            LoadBalancer::Weighted(lb) => lb.next_backend(),
            LoadBalancer::LeastConnections(lb) => lb.next_backend(),
        }
    }

    pub fn mark_backend_down(&self, backend: &str) {
        match self {
            LoadBalancer::RoundRobin(lb) => lb.mark_backend_down(backend),
            LoadBalancer::Random(lb) => lb.mark_backend_down(backend),
            LoadBalancer::Weighted(lb) => lb.set_health(backend, false),
            LoadBalancer::LeastConnections(lb) => lb.set_health(backend, false),
        }
    }

    pub fn mark_backend_up(&self, backend: &str) {
        match self {
            LoadBalancer::RoundRobin(lb) => lb.mark_backend_up(backend),
            LoadBalancer::Random(lb) => lb.mark_backend_up(backend),
            LoadBalancer::Weighted(lb) => lb.set_health(backend, true),
            LoadBalancer::LeastConnections(lb) => lb.set_health(backend, true),
        }
    }

    /// Snapshot of the backends currently believed healthy
    pub fn healthy_backends(&self) -> Vec<String> {
        match self {
            LoadBalancer::RoundRobin(lb) => lb.healthy_backends(),
            LoadBalancer::Random(lb) => lb.healthy_backends(),
            LoadBalancer::Weighted(lb) => lb.healthy_backends(),
            LoadBalancer::LeastConnections(lb) => lb.healthy_backends(),
        }
    }

    /// Release the in-flight slot taken at pick time.
    ///
    /// Only meaningful for least connections; a no-op elsewhere. The proxy
    /// calls this after every upstream attempt so the counter cannot drift.
    pub fn release_connection(&self, backend: &str) {
        if let LoadBalancer::LeastConnections(lb) = self {
            lb.release_connection(backend);
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        match self {
            LoadBalancer::RoundRobin(_) => "round_robin",
            LoadBalancer::Random(_) => "random",
            LoadBalancer::Weighted(_) => "weighted",
            LoadBalancer::LeastConnections(_) => "least_connections",
        }
    }
}

/// Round robin: monotonic cursor over the healthy subset
pub struct RoundRobinLb {
    backends: Vec<String>,
    healthy: RwLock<Vec<String>>,
    current: AtomicU64,
}

impl RoundRobinLb {
    pub fn new(backends: Vec<String>) -> Self {
        Self {
            healthy: RwLock::new(backends.clone()),
            backends,
            current: AtomicU64::new(0),
        }
    }

    pub fn next_backend(&self) -> Option<String> {
        let healthy = self.healthy.read().unwrap();

        let pool = if healthy.is_empty() {
            self.backends.as_slice()
        } else {
            healthy.as_slice()
        };

        if pool.is_empty() {
            return None;
        }

        let next = self.current.fetch_add(1, Ordering::SeqCst);
        Some(pool[(next as usize) % pool.len()].clone())
    }

    pub fn mark_backend_down(&self, backend: &str) {
        let mut healthy = self.healthy.write().unwrap();
        healthy.retain(|b| b != backend);
    }

    pub fn mark_backend_up(&self, backend: &str) {
        let mut healthy = self.healthy.write().unwrap();

        if healthy.iter().any(|b| b == backend) {
            return;
        }

        if self.backends.iter().any(|b| b == backend) {
            healthy.push(backend.to_string());
        }
    }

    pub fn healthy_backends(&self) -> Vec<String> {
        self.healthy.read().unwrap().clone()
    }
}

/// Random: uniform pick over the healthy subset
pub struct RandomLb {
    backends: Vec<String>,
    healthy: RwLock<Vec<String>>,
}

impl RandomLb {
    pub fn new(backends: Vec<String>) -> Self {
        Self {
            healthy: RwLock::new(backends.clone()),
            backends,
        }
    }

    pub fn next_backend(&self) -> Option<String> {
        let healthy = self.healthy.read().unwrap();

        let pool = if healthy.is_empty() {
            self.backends.as_slice()
        } else {
            healthy.as_slice()
        };

        if pool.is_empty() {
            return None;
        }

        let index = rand::thread_rng().gen_range(0..pool.len());
        Some(pool[index].clone())
    }

    pub fn mark_backend_down(&self, backend: &str) {
        let mut healthy = self.healthy.write().unwrap();
        healthy.retain(|b| b != backend);
    }

    pub fn mark_backend_up(&self, backend: &str) {
        let mut healthy = self.healthy.write().unwrap();

        if healthy.iter().any(|b| b == backend) {
            return;
        }

        if self.backends.iter().any(|b| b == backend) {
            healthy.push(backend.to_string());
        }
    }

    pub fn healthy_backends(&self) -> Vec<String> {
        self.healthy.read().unwrap().clone()
    }
}

struct WeightedBackend {
    url: String,
    weight: i64,
    current_weight: i64,
    healthy: bool,
}

/// Smooth weighted round robin (Nginx style).
///
/// Each pick adds every healthy backend's weight to its current weight,
/// selects the largest, then subtracts the total weight from the winner.
pub struct WeightedLb {
    backends: Mutex<Vec<WeightedBackend>>,
}

impl WeightedLb {
    pub fn new(backends: Vec<String>) -> Self {
        let backends = backends
            .into_iter()
            .map(|url| WeightedBackend {
                url,
                weight: 1,
                current_weight: 0,
                healthy: true,
            })
            .collect();

        Self {
            backends: Mutex::new(backends),
        }
    }

    pub fn next_backend(&self) -> Option<String> {
        let mut backends = self.backends.lock().unwrap();

        if backends.is_empty() {
            return None;
        }

        let mut total_weight = 0;
        let mut selected: Option<usize> = None;

        for i in 0..backends.len() {
            if !backends[i].healthy {
                continue;
            }

            backends[i].current_weight += backends[i].weight;
            total_weight += backends[i].weight;

            match selected {
                Some(s) if backends[i].current_weight <= backends[s].current_weight => {}
                _ => selected = Some(i),
            }
        }

        match selected {
            Some(index) => {
                backends[index].current_weight -= total_weight;
                Some(backends[index].url.clone())
            }
            // No healthy backend: fall back to the first configured one
            None => Some(backends[0].url.clone()),
        }
    }

    fn set_health(&self, backend: &str, healthy: bool) {
        let mut backends = self.backends.lock().unwrap();
        if let Some(entry) = backends.iter_mut().find(|b| b.url == backend) {
            entry.healthy = healthy;
        }
    }

    pub fn healthy_backends(&self) -> Vec<String> {
        self.backends
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.healthy)
            .map(|b| b.url.clone())
            .collect()
    }
}

struct ConnectionBackend {
    url: String,
    connections: u32,
    healthy: bool,
}

/// Least connections: pick the healthy backend with the fewest in-flight
/// requests, first occurrence winning ties. The counter is incremented at
/// pick time and released by `release_connection`, floored at zero.
pub struct LeastConnectionsLb {
    backends: Mutex<Vec<ConnectionBackend>>,
}

impl LeastConnectionsLb {
    pub fn new(backends: Vec<String>) -> Self {
        let backends = backends
            .into_iter()
            .map(|url| ConnectionBackend {
                url,
                connections: 0,
                healthy: true,
            })
            .collect();

        Self {
            backends: Mutex::new(backends),
        }
    }

    pub fn next_backend(&self) -> Option<String> {
        let mut backends = self.backends.lock().unwrap();

        if backends.is_empty() {
            return None;
        }

        let selected = backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.healthy)
            .min_by_key(|(i, b)| (b.connections, *i))
            .map(|(i, _)| i);

        match selected {
            Some(index) => {
                backends[index].connections += 1;
                Some(backends[index].url.clone())
            }
            None => Some(backends[0].url.clone()),
        }
    }

    pub fn release_connection(&self, backend: &str) {
        let mut backends = self.backends.lock().unwrap();
        if let Some(entry) = backends.iter_mut().find(|b| b.url == backend) {
            entry.connections = entry.connections.saturating_sub(1);
        }
    }

    fn set_health(&self, backend: &str, healthy: bool) {
        let mut backends = self.backends.lock().unwrap();
        if let Some(entry) = backends.iter_mut().find(|b| b.url == backend) {
            entry.healthy = healthy;
        }
    }

    pub fn healthy_backends(&self) -> Vec<String> {
        self.backends
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.healthy)
            .map(|b| b.url.clone())
            .collect()
    }
}
