//! Per-endpoint circuit breaker to prevent retry storms
//!
//! When a regulator endpoint keeps failing, further retries only add load and
//! delay recovery. Each destination endpoint gets its own breaker:
//!
//! ```text
//! ┌─────────┐  failure_threshold reached  ┌──────┐
//! │ Closed  │ ──────────────────────────> │ Open │ <──┐
//! └─────────┘                             └──────┘    │
//!      ^                                     │        │ any failure
//!      │                recovery_timeout     │        │
//!      │                elapsed              v        │
//!      │  half_open_success_threshold  ┌───────────┐  │
//!      └────────────────────────────── │ Half-Open │ ─┘
//!            consecutive successes     └───────────┘
//! ```
//!
//! Breakers are created on the first observed failure. The map is capped at
//! `max_tracked_endpoints`: when full, the least recently used closed breaker
//! is evicted. Open and half-open breakers are never evicted.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures required to open the circuit
    #[serde(default = "defaults::failure_threshold")]
    pub failure_threshold: u32,

    /// How long the circuit stays open before probing recovery (seconds)
    #[serde(default = "defaults::recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,

    /// Consecutive successes needed to close the circuit from half-open
    #[serde(default = "defaults::half_open_success_threshold")]
    pub half_open_success_threshold: u32,

    /// Only count failures within this many seconds of the first one.
    /// When unset, failures accumulate until a success resets them.
    #[serde(default)]
    pub failure_window_secs: Option<u64>,

    /// Upper bound on the number of endpoints with a breaker.
    #[serde(default = "defaults::max_tracked_endpoints")]
    pub max_tracked_endpoints: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::failure_threshold(),
            recovery_timeout_secs: defaults::recovery_timeout_secs(),
            half_open_success_threshold: defaults::half_open_success_threshold(),
            failure_window_secs: None,
            max_tracked_endpoints: defaults::max_tracked_endpoints(),
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub const fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

mod defaults {
    pub const fn failure_threshold() -> u32 {
        5
    }

    pub const fn recovery_timeout_secs() -> u64 {
        60
    }

    pub const fn half_open_success_threshold() -> u32 {
        3
    }

    pub const fn max_tracked_endpoints() -> usize {
        1024
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, requests pass
    Closed,
    /// Tripped, requests are rejected until the recovery timeout elapses
    Open,
    /// Probing recovery, requests pass
    HalfOpen,
}

#[derive(Debug)]
struct CircuitBreakerData {
    state: CircuitState,
    failure_count: u32,
    first_failure_at: Option<Instant>,
    next_attempt_time: Option<Instant>,
    consecutive_successes: u32,
    last_used: Instant,
}

impl CircuitBreakerData {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            first_failure_at: None,
            next_attempt_time: None,
            consecutive_successes: 0,
            last_used: Instant::now(),
        }
    }

    fn is_failure_window_expired(&self, config: &CircuitBreakerConfig) -> bool {
        match (config.failure_window_secs, self.first_failure_at) {
            (Some(window), Some(first_failure)) => {
                first_failure.elapsed() > Duration::from_secs(window)
            }
            (None, _) | (_, None) => false,
        }
    }

    fn open(&mut self, config: &CircuitBreakerConfig) {
        self.state = CircuitState::Open;
        self.consecutive_successes = 0;
        self.next_attempt_time = Some(Instant::now() + config.recovery_timeout());
    }

    /// Returns `true` if the circuit transitioned to Open
    fn record_failure(&mut self, endpoint: &str, config: &CircuitBreakerConfig) -> bool {
        self.last_used = Instant::now();

        match self.state {
            CircuitState::Closed => {
                if self.is_failure_window_expired(config) {
                    self.failure_count = 0;
                    self.first_failure_at = None;
                }

                if self.first_failure_at.is_none() {
                    self.first_failure_at = Some(Instant::now());
                }
                self.failure_count = self.failure_count.saturating_add(1);

                if self.failure_count >= config.failure_threshold {
                    self.open(config);
                    tracing::warn!(
                        endpoint,
                        failure_count = self.failure_count,
                        threshold = config.failure_threshold,
                        recovery_timeout_secs = config.recovery_timeout_secs,
                        "Circuit breaker OPENED - rejecting retries"
                    );
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                self.failure_count = self.failure_count.saturating_add(1);
                self.open(config);
                tracing::warn!(endpoint, "Circuit breaker probe failed - reopening circuit");
                true
            }
            CircuitState::Open => {
                self.failure_count = self.failure_count.saturating_add(1);
                false
            }
        }
    }

    /// Returns `true` if the circuit transitioned to Closed
    fn record_success(&mut self, endpoint: &str, config: &CircuitBreakerConfig) -> bool {
        self.last_used = Instant::now();

        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.first_failure_at = None;
                false
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);

                if self.consecutive_successes >= config.half_open_success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.first_failure_at = None;
                    self.next_attempt_time = None;
                    self.consecutive_successes = 0;
                    tracing::info!(endpoint, "Circuit breaker CLOSED - endpoint recovered");
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => {
                tracing::warn!(endpoint, "Unexpected success while circuit is open");
                false
            }
        }
    }

    fn allow_request(&mut self, endpoint: &str) -> bool {
        self.last_used = Instant::now();

        match self.state {
            CircuitState::Open => {
                if self
                    .next_attempt_time
                    .is_some_and(|next_attempt| Instant::now() >= next_attempt)
                {
                    self.state = CircuitState::HalfOpen;
                    self.consecutive_successes = 0;
                    tracing::info!(endpoint, "Circuit breaker entering HALF-OPEN state");
                    true
                } else {
                    false
                }
            }
            CircuitState::Closed | CircuitState::HalfOpen => true,
        }
    }
}

/// Per-endpoint circuit breaker manager
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<parking_lot::Mutex<CircuitBreakerData>>>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    fn existing(&self, endpoint: &str) -> Option<Arc<parking_lot::Mutex<CircuitBreakerData>>> {
        self.breakers.get(endpoint).map(|entry| Arc::clone(entry.value()))
    }

    fn get_or_create(&self, endpoint: &str) -> Arc<parking_lot::Mutex<CircuitBreakerData>> {
        if let Some(breaker) = self.existing(endpoint) {
            return breaker;
        }

        if self.breakers.len() >= self.config.max_tracked_endpoints {
            self.evict_least_recently_used();
        }

        self.breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(parking_lot::Mutex::new(CircuitBreakerData::new())))
            .clone()
    }

    fn evict_least_recently_used(&self) {
        let candidate = self
            .breakers
            .iter()
            .filter_map(|entry| {
                let data = entry.value().lock();
                (data.state == CircuitState::Closed).then(|| (entry.key().clone(), data.last_used))
            })
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(endpoint, _)| endpoint);

        match candidate {
            Some(endpoint) => {
                let evicted = self
                    .breakers
                    .remove_if(&endpoint, |_, data| data.lock().state == CircuitState::Closed)
                    .is_some();
                if evicted {
                    tracing::debug!(endpoint, "Evicted least recently used circuit breaker");
                }
            }
            None => tracing::warn!(
                tracked = self.breakers.len(),
                limit = self.config.max_tracked_endpoints,
                "Every tracked circuit breaker is open, exceeding the endpoint limit"
            ),
        }
    }

    /// Whether a request to `endpoint` may proceed.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open and
    /// lets the request through. Endpoints without a breaker are always allowed.
    pub fn allow_request(&self, endpoint: &str) -> bool {
        self.existing(endpoint)
            .is_none_or(|breaker| breaker.lock().allow_request(endpoint))
    }

    /// Returns `true` if the circuit transitioned to Closed (recovered)
    pub fn record_success(&self, endpoint: &str) -> bool {
        self.existing(endpoint)
            .is_some_and(|breaker| breaker.lock().record_success(endpoint, &self.config))
    }

    /// Returns `true` if the circuit transitioned to Open (tripped)
    pub fn record_failure(&self, endpoint: &str) -> bool {
        let breaker = self.get_or_create(endpoint);
        let mut breaker_guard = breaker.lock();
        breaker_guard.record_failure(endpoint, &self.config)
    }

    /// Current state, without triggering the open to half-open transition.
    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.existing(endpoint)
            .map_or(CircuitState::Closed, |breaker| breaker.lock().state)
    }

    pub fn stats(&self, endpoint: &str) -> Option<CircuitBreakerStats> {
        self.existing(endpoint).map(|breaker| {
            let data = breaker.lock();
            CircuitBreakerStats {
                state: data.state,
                failure_count: data.failure_count,
                consecutive_successes: data.consecutive_successes,
                retry_after: data
                    .next_attempt_time
                    .map(|next_attempt| next_attempt.saturating_duration_since(Instant::now())),
            }
        })
    }

    pub fn tracked_endpoints(&self) -> usize {
        self.breakers.len()
    }

    /// Number of breakers currently open or half-open.
    pub fn tripped(&self) -> usize {
        self.breakers
            .iter()
            .filter(|entry| entry.value().lock().state != CircuitState::Closed)
            .count()
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    /// Consecutive successes in half-open state
    pub consecutive_successes: u32,
    /// Time left until an open circuit admits a probe
    pub retry_after: Option<Duration>,
}
