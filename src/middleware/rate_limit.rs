use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hyper::header::HeaderValue;
use hyper::StatusCode;
use tokio::sync::watch;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;
use crate::middleware::{Middleware, MiddlewareHandler};

/// How often idle buckets are reaped
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: refills at `refill_rate` tokens per second up to
/// `capacity`; one token admits one request.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(requests_per_second: u32, burst_size: u32) -> Self {
        Self {
            capacity: burst_size as f64,
            refill_rate: requests_per_second as f64,
            state: Mutex::new(BucketState {
                tokens: burst_size as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();

        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Take one token if available
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token becomes available, without consuming one
    pub fn next_delay(&self) -> Duration {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate)
        }
    }

    /// A bucket is idle once it has refilled to capacity
    pub fn is_idle(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);

        state.tokens >= self.capacity && self.next_delay_locked(&state).is_zero()
    }

    fn next_delay_locked(&self, state: &BucketState) -> Duration {
        if state.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate)
        }
    }
}

/// Per-service rate limiter keyed by client.
///
/// The key map sits behind its own mutex; each bucket is independently
/// thread-safe, so admission only holds the map lock for the lookup.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Derive the identity a bucket is kept under: the authenticated user
    /// when present, otherwise client IP plus truncated user agent.
    fn client_key(&self, request: &GatewayRequest) -> String {
        if let Some(identity) = &request.identity {
            if !identity.user_id.is_empty() {
                return format!("user:{}", identity.user_id);
            }
        }

        let user_agent: String = request.user_agent().chars().take(50).collect();
        format!("ip:{}:ua:{}", request.client_ip_string(), user_agent)
    }

    fn bucket_for(&self, key: &str) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().unwrap();
        buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(TokenBucket::new(
                    self.config.requests_per_second,
                    self.config.burst_size,
                ))
            })
            .clone()
    }

    /// Remove buckets that have refilled completely and owe no delay
    pub fn sweep(&self) {
        let mut buckets = self.buckets.lock().unwrap();
        let before = buckets.len();
        buckets.retain(|_, bucket| !bucket.is_idle());

        let removed = before - buckets.len();
        if removed > 0 {
            debug!(removed, "Rate limiter sweep removed idle buckets");
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }

    /// Periodically reap idle buckets until shutdown is signalled
    pub fn start_sweep(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let limiter = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => limiter.sweep(),
                }
            }
        });
    }

    fn unix_seconds_after(delay: Duration) -> u64 {
        (SystemTime::now() + delay)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    fn rejection_response(&self, delay: Duration) -> GatewayResponse {
        let delay_seconds = delay.as_secs_f64();

        let mut response = GatewayResponse::json(
            StatusCode::TOO_MANY_REQUESTS,
            &serde_json::json!({
                "error": "Rate limit exceeded",
                "retry_after": format!("{:.2} seconds", delay_seconds),
                "limit": self.config.requests_per_second,
            }),
        );

        let headers = &mut response.headers;
        headers.insert(
            "x-ratelimit-limit",
            header_value(self.config.requests_per_second.to_string()),
        );
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert(
            "x-ratelimit-reset",
            header_value(Self::unix_seconds_after(delay).to_string()),
        );
        headers.insert(
            "retry-after",
            header_value(format!("{}", delay_seconds.ceil() as u64)),
        );

        response
    }
}

fn header_value(value: String) -> HeaderValue {
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

/// Middleware enforcing the per-client token bucket
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn process_request(
        &self,
        request: GatewayRequest,
        next: Arc<dyn MiddlewareHandler>,
    ) -> Result<GatewayResponse, GatewayError> {
        if !self.limiter.config.enabled {
            return next.handle(request).await;
        }

        let key = self.limiter.client_key(&request);
        let bucket = self.limiter.bucket_for(&key);

        if !bucket.try_acquire() {
            let delay = bucket.next_delay();
            debug!(client = %key, delay_ms = delay.as_millis() as u64, "Rate limit exceeded");
            return Ok(self.limiter.rejection_response(delay));
        }

        let mut response = next.handle(request).await?;

        let config = &self.limiter.config;
        let headers = &mut response.headers;
        headers.insert(
            "x-ratelimit-limit",
            header_value(config.requests_per_second.to_string()),
        );
        headers.insert(
            "x-ratelimit-remaining",
            header_value(config.burst_size.saturating_sub(1).to_string()),
        );
        headers.insert(
            "x-ratelimit-reset",
            header_value(RateLimiter::unix_seconds_after(Duration::from_secs(60)).to_string()),
        );

        Ok(response)
    }

    fn name(&self) -> &str {
        "rate_limit"
    }
}
