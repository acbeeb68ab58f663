//! Circuit breaker.
//!
//! ```text
//! Closed   -> Open      failure_count >= threshold (consecutive failures)
//! Open     -> HalfOpen  reset_timeout elapsed since the last failure
//! HalfOpen -> Closed    probe succeeds
//! HalfOpen -> Open      probe fails
//! ```
//!
//! HalfOpen admits a single probe. If that probe never reports back, another
//! one is admitted after a further `reset_timeout`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    probe_started_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// `threshold` is clamped to at least 1.
    pub fn new(name: impl Into<String>, threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            reset_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                probe_started_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state as last recorded. Does not perform the Open -> HalfOpen
    /// transition; only [`allow_request`](Self::allow_request) does.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Whether a request may be sent now.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .last_failure_at
                    .is_none_or(|at| now.duration_since(at) >= self.reset_timeout);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_started_at = Some(now);
                    info!(breaker = %self.name, "circuit half-open, admitting probe");
                }
                cooled
            }
            CircuitState::HalfOpen => {
                let stale = inner
                    .probe_started_at
                    .is_none_or(|at| now.duration_since(at) >= self.reset_timeout);
                if stale {
                    inner.probe_started_at = Some(now);
                }
                stale
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.probe_started_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.probe_started_at = None;
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
            }
            CircuitState::Closed if inner.failure_count >= self.threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "circuit opened"
                );
            }
            _ => {}
        }
    }

    /// Force the breaker back to Closed with a zero count.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure_at = None;
        inner.probe_started_at = None;
    }
}

/// Lazily created breakers keyed by backend.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    threshold: u32,
    reset_timeout: Duration,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            threshold,
            reset_timeout,
            breakers: DashMap::new(),
        }
    }

    /// The breaker for `key`, created Closed on first use.
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }
        let breaker = self
            .breakers
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.threshold, self.reset_timeout)));
        Arc::clone(breaker.value())
    }

    /// Returns `false` when no breaker exists for `key`.
    pub fn reset(&self, key: &str) -> bool {
        match self.breakers.get(key) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// `(key, state)` for every breaker, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
