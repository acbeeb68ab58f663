//! Backend selection.
//!
//! [`LoadBalancer::select_backend`] only picks a backend. Reserving a
//! connection slot is the caller's job, via [`Backend::acquire`].

mod backend;
mod health;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use backend::{Backend, BackendError, BackendRegistry, ConnectionGuard, DEFAULT_MAX_CONNECTIONS};
pub use health::{HealthCheckHandle, HealthChecker};

/// How [`LoadBalancer`] chooses among backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
    /// Hashes the client IP over the full backend list, ignoring health.
    /// Requests from one client keep landing on the same backend even while
    /// it is down.
    IpHash,
    Random,
}

/// Source of uniform integers for the Weighted and Random strategies.
pub trait RandomSource: Send + Sync {
    /// A value in `0..bound`. `bound` is never zero.
    fn below(&self, bound: u64) -> u64;
}

/// Thread-local RNG; the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn below(&self, bound: u64) -> u64 {
        rand::thread_rng().gen_range(0..bound)
    }
}

/// Deterministic RNG for reproducible selection sequences.
#[derive(Debug)]
pub struct SeededRandom(Mutex<StdRng>);

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }
}

impl RandomSource for SeededRandom {
    fn below(&self, bound: u64) -> u64 {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..bound)
    }
}

pub struct LoadBalancer {
    registry: Arc<BackendRegistry>,
    strategy: LoadBalanceStrategy,
    cursor: AtomicUsize,
    random: Arc<dyn RandomSource>,
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("strategy", &self.strategy)
            .field("backends", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl LoadBalancer {
    pub fn new(registry: Arc<BackendRegistry>, strategy: LoadBalanceStrategy) -> Self {
        Self {
            registry,
            strategy,
            cursor: AtomicUsize::new(0),
            random: Arc::new(ThreadRandom),
        }
    }

    #[must_use]
    pub fn with_random_source(mut self, random: impl RandomSource + 'static) -> Self {
        self.random = Arc::new(random);
        self
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.strategy
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Pick a backend, or `None` when nothing is available.
    ///
    /// `client_ip` only matters for [`LoadBalanceStrategy::IpHash`]; without
    /// it that strategy degrades to round robin.
    pub fn select_backend(&self, client_ip: Option<&str>) -> Option<Arc<Backend>> {
        let selected = match self.strategy {
            LoadBalanceStrategy::RoundRobin => self.round_robin(),
            LoadBalanceStrategy::LeastConnections => self.least_connections(),
            LoadBalanceStrategy::Weighted => self.weighted(),
            LoadBalanceStrategy::IpHash => match client_ip {
                Some(ip) => self.ip_hash(ip),
                None => self.round_robin(),
            },
            LoadBalanceStrategy::Random => self.random(),
        };

        match &selected {
            Some(backend) => debug!(strategy = ?self.strategy, backend = %backend, "backend selected"),
            None => debug!(strategy = ?self.strategy, "no backend available"),
        }
        selected
    }

    /// Like [`select_backend`](Self::select_backend) but prefers a backend
    /// whose key is not in `tried`. Falls back to the first pick when every
    /// candidate has been tried.
    pub fn select_untried(&self, client_ip: Option<&str>, tried: &[String]) -> Option<Arc<Backend>> {
        let first = self.select_backend(client_ip)?;
        if !tried.iter().any(|k| k == first.key()) {
            return Some(first);
        }
        for _ in 1..self.registry.len() {
            match self.select_backend(client_ip) {
                Some(b) if !tried.iter().any(|k| k == b.key()) => return Some(b),
                Some(_) => continue,
                None => break,
            }
        }
        Some(first)
    }

    fn round_robin(&self) -> Option<Arc<Backend>> {
        let backends = self.registry.all();
        let n = backends.len();
        for _ in 0..n {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
            if backends[index].is_available() {
                return Some(Arc::clone(&backends[index]));
            }
        }
        None
    }

    fn least_connections(&self) -> Option<Arc<Backend>> {
        // min_by_key keeps the first of equal minima, so ties go to registration order.
        self.registry
            .available()
            .min_by_key(|b| b.current_connections())
            .cloned()
    }

    fn weighted(&self) -> Option<Arc<Backend>> {
        let available: Vec<&Arc<Backend>> = self.registry.available().collect();
        let total: u64 = available.iter().map(|b| u64::from(b.weight())).sum();
        if total == 0 {
            return self.round_robin();
        }

        let mut point = self.random.below(total);
        for backend in available {
            let weight = u64::from(backend.weight());
            if point < weight {
                return Some(Arc::clone(backend));
            }
            point -= weight;
        }
        None
    }

    fn ip_hash(&self, client_ip: &str) -> Option<Arc<Backend>> {
        let backends = self.registry.all();
        if backends.is_empty() {
            return None;
        }
        let index = ip_hash_index(client_ip, backends.len());
        Some(Arc::clone(&backends[index]))
    }

    fn random(&self) -> Option<Arc<Backend>> {
        let available: Vec<&Arc<Backend>> = self.registry.available().collect();
        if available.is_empty() {
            return None;
        }
        let index = self.random.below(available.len() as u64) as usize;
        Some(Arc::clone(available[index]))
    }
}

/// Polynomial rolling hash (`h = h * 31 + c`) of `ip`, reduced modulo `n`.
fn ip_hash_index(ip: &str, n: usize) -> usize {
    let hash = ip
        .chars()
        .fold(0u32, |h, c| h.wrapping_mul(31).wrapping_add(c as u32));
    hash as usize % n
}
