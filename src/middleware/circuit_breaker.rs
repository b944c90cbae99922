use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hyper::StatusCode;
use thiserror::Error;
use tracing::info;

use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;
use crate::middleware::{Middleware, MiddlewareHandler};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    HalfOpen,
    Open,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Closed => write!(f, "CLOSED"),
            State::HalfOpen => write!(f, "HALF_OPEN"),
            State::Open => write!(f, "OPEN"),
        }
    }
}

/// Request counters, cleared on every generation change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

/// Admission errors returned by `before_request`
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BreakerError {
    #[error("circuit breaker is open")]
    Open,

    #[error("circuit breaker is half-open, too many requests")]
    TooManyRequests,
}

type TripFn = Box<dyn Fn(&Counts) -> bool + Send + Sync>;

/// Circuit breaker settings
pub struct Settings {
    /// Admission cap (and close threshold) while half-open
    pub max_requests: u32,

    /// Closed-state counting window; zero disables windowing
    pub interval: Duration,

    /// How long the breaker stays open before probing
    pub timeout: Duration,

    /// Decides, after a failure, whether to trip open
    pub ready_to_trip: TripFn,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_requests: 5,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            ready_to_trip: Box::new(|counts| {
                counts.consecutive_failures >= 5
                    || (counts.requests >= 10
                        && counts.total_failures as f64 / counts.requests as f64 >= 0.5)
            }),
        }
    }
}

struct Shared {
    state: State,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// Per-service circuit breaker.
///
/// The whole `{state, generation, counts, expiry}` tuple lives under one
/// mutex; admission and completion are linearizable on it. Every state
/// change advances the generation and clears the counts, and a completion
/// whose admission generation no longer matches is dropped as stale.
pub struct CircuitBreaker {
    name: String,
    max_requests: u32,
    interval: Duration,
    timeout: Duration,
    ready_to_trip: TripFn,
    shared: Mutex<Shared>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: Settings) -> Self {
        let interval = settings.interval;
        let expiry = if interval.is_zero() {
            None
        } else {
            Some(Instant::now() + interval)
        };

        Self {
            name: name.into(),
            max_requests: settings.max_requests,
            interval,
            timeout: settings.timeout,
            ready_to_trip: settings.ready_to_trip,
            shared: Mutex::new(Shared {
                state: State::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Timeout used when the breaker is open, for retry hints
    pub fn open_timeout(&self) -> Duration {
        self.timeout
    }

    /// Admit a request. Returns the current generation, which must be fed
    /// back into `after_request` with the outcome.
    pub fn before_request(&self) -> Result<u64, BreakerError> {
        let mut shared = self.shared.lock().unwrap();
        let now = Instant::now();
        let (state, generation) = self.current_state(&mut shared, now);

        match state {
            State::Open => Err(BreakerError::Open),
            State::HalfOpen if shared.counts.requests >= self.max_requests => {
                Err(BreakerError::TooManyRequests)
            }
            _ => {
                shared.counts.on_request();
                Ok(generation)
            }
        }
    }

    /// Record the outcome of a request admitted at `before` generation
    pub fn after_request(&self, before: u64, success: bool) {
        let mut shared = self.shared.lock().unwrap();
        let now = Instant::now();
        let (state, generation) = self.current_state(&mut shared, now);

        if generation != before {
            return;
        }

        if success {
            self.on_success(&mut shared, state, now);
        } else {
            self.on_failure(&mut shared, now);
        }
    }

    /// Current state, refreshing expired windows first
    pub fn state(&self) -> State {
        let mut shared = self.shared.lock().unwrap();
        let now = Instant::now();
        self.current_state(&mut shared, now).0
    }

    pub fn counts(&self) -> Counts {
        self.shared.lock().unwrap().counts
    }

    pub fn generation(&self) -> u64 {
        self.shared.lock().unwrap().generation
    }

    fn on_success(&self, shared: &mut Shared, state: State, now: Instant) {
        shared.counts.on_success();

        if state == State::HalfOpen && shared.counts.consecutive_successes >= self.max_requests {
            self.set_state(shared, State::Closed, now);
        }
    }

    fn on_failure(&self, shared: &mut Shared, now: Instant) {
        shared.counts.on_failure();

        if (self.ready_to_trip)(&shared.counts) {
            self.set_state(shared, State::Open, now);
        }
    }

    fn current_state(&self, shared: &mut Shared, now: Instant) -> (State, u64) {
        match shared.state {
            State::Closed => {
                if let Some(expiry) = shared.expiry {
                    if expiry <= now {
                        self.new_generation(shared, now);
                    }
                }
            }
            State::Open => {
                if let Some(expiry) = shared.expiry {
                    if expiry <= now {
                        self.set_state(shared, State::HalfOpen, now);
                    }
                }
            }
            State::HalfOpen => {}
        }

        (shared.state, shared.generation)
    }

    fn set_state(&self, shared: &mut Shared, state: State, now: Instant) {
        if shared.state == state {
            return;
        }

        let prev = shared.state;
        shared.state = state;
        self.new_generation(shared, now);

        info!(
            breaker = %self.name,
            from = %prev,
            to = %state,
            "Circuit breaker state changed"
        );
    }

    fn new_generation(&self, shared: &mut Shared, now: Instant) {
        shared.generation += 1;
        shared.counts = Counts::default();

        shared.expiry = match shared.state {
            State::Closed => {
                if self.interval.is_zero() {
                    None
                } else {
                    Some(now + self.interval)
                }
            }
            State::Open => Some(now + self.timeout),
            State::HalfOpen => None,
        };
    }
}

/// Registry of per-service circuit breakers
pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    pub fn new() -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the breaker for a service, creating it with default settings
    pub fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().unwrap();
            if let Some(breaker) = breakers.get(service) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, Settings::default())))
            .clone()
    }

    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().unwrap().get(service).cloned()
    }

    pub fn all(&self) -> HashMap<String, Arc<CircuitBreaker>> {
        self.breakers.read().unwrap().clone()
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Middleware gating a service behind its circuit breaker
pub struct CircuitBreakerMiddleware {
    service: String,
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerMiddleware {
    pub fn new(service: impl Into<String>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            service: service.into(),
            breaker,
        }
    }

    fn rejection_response(&self, error: &BreakerError) -> GatewayResponse {
        let counts = self.breaker.counts();
        let reason = match error {
            BreakerError::Open => "Circuit breaker is open",
            BreakerError::TooManyRequests => "Too many requests in half-open state",
        };

        GatewayResponse::json(
            StatusCode::SERVICE_UNAVAILABLE,
            &serde_json::json!({
                "error": "Service temporarily unavailable",
                "reason": reason,
                "service": self.service,
                "state": self.breaker.state().to_string(),
                "failures": counts.total_failures,
                "requests": counts.requests,
                "retry_after": self.breaker.open_timeout().as_secs(),
            }),
        )
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    async fn process_request(
        &self,
        request: GatewayRequest,
        next: Arc<dyn MiddlewareHandler>,
    ) -> Result<GatewayResponse, GatewayError> {
        let generation = match self.breaker.before_request() {
            Ok(generation) => generation,
            Err(error) => return Ok(self.rejection_response(&error)),
        };

        let result = next.handle(request).await;

        match &result {
            Ok(response) => self.breaker.after_request(generation, response.upstream_success()),
            Err(_) => self.breaker.after_request(generation, false),
        }

        result
    }

    fn name(&self) -> &str {
        "circuit_breaker"
    }
}
