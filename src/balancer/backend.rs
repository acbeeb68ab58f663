//! Backend descriptors and the registry that owns them.
//!
//! Connection counts, health and request stats are atomics: many requests
//! update them concurrently and readers tolerate brief staleness.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;
use url::Url;

/// Default per-backend connection cap.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid backend url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("backend url {0:?} must use the http scheme")]
    UnsupportedScheme(String),

    #[error("backend url {0:?} has no host")]
    MissingHost(String),
}

/// An upstream server the proxy can forward to.
#[derive(Debug)]
pub struct Backend {
    url: Url,
    weight: u32,
    max_connections: usize,
    current_connections: AtomicUsize,
    healthy: AtomicBool,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl Backend {
    /// Parse `url` into a healthy backend with weight 1.
    pub fn new(url: &str) -> Result<Self, BackendError> {
        let parsed = Url::parse(url).map_err(|source| BackendError::InvalidUrl {
            url: url.to_owned(),
            source,
        })?;
        if parsed.scheme() != "http" {
            return Err(BackendError::UnsupportedScheme(url.to_owned()));
        }
        if parsed.host_str().is_none() {
            return Err(BackendError::MissingHost(url.to_owned()));
        }

        Ok(Self {
            url: parsed,
            weight: 1,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            current_connections: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        })
    }

    /// Weights below 1 are clamped to 1.
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    #[must_use]
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Stable identity used to key circuit breakers and logs.
    pub fn key(&self) -> &str {
        self.url.as_str()
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn current_connections(&self) -> usize {
        self.current_connections.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Set the health flag, returning the previous value.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::Relaxed)
    }

    /// Healthy and below its connection cap.
    pub fn is_available(&self) -> bool {
        self.is_healthy() && self.current_connections() < self.max_connections
    }

    /// Reserve a connection slot for the lifetime of the returned guard.
    ///
    /// The count is released when the guard drops, including when the
    /// request future holding it is cancelled.
    pub fn acquire(self: &Arc<Self>) -> ConnectionGuard {
        self.current_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            backend: Arc::clone(self),
        }
    }

    /// Record the outcome of one proxied attempt.
    pub fn record_outcome(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    /// Fraction of attempts that succeeded; 1.0 before any traffic.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 1.0;
        }
        let failed = self.failed_requests().min(total);
        (total - failed) as f64 / total as f64
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// RAII reservation of one connection slot on a [`Backend`].
#[derive(Debug)]
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl Deref for ConnectionGuard {
    type Target = Backend;

    fn deref(&self) -> &Backend {
        &self.backend
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend
            .current_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Ordered set of backends, fixed once serving starts.
///
/// Registration order is significant: it breaks LeastConnections ties and
/// defines the index space for IpHash.
#[derive(Debug, Default, Clone)]
pub struct BackendRegistry {
    backends: Vec<Arc<Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, backend: Backend) -> Arc<Backend> {
        let backend = Arc::new(backend);
        self.backends.push(Arc::clone(&backend));
        backend
    }

    pub fn all(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn get(&self, key: &str) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|b| b.key() == key)
    }

    pub fn available(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.backends.iter().filter(|b| b.is_available())
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl FromIterator<Backend> for BackendRegistry {
    fn from_iter<I: IntoIterator<Item = Backend>>(iter: I) -> Self {
        Self {
            backends: iter.into_iter().map(Arc::new).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_urls() {
        assert!(matches!(Backend::new("not a url"), Err(BackendError::InvalidUrl { .. })));
        assert!(matches!(
            Backend::new("https://10.0.0.1:443"),
            Err(BackendError::UnsupportedScheme(_))
        ));
        assert!(Backend::new("http://10.0.0.1:8080").is_ok());
    }

    #[test]
    fn weight_is_clamped() {
        let b = Backend::new("http://a:1").unwrap().with_weight(0);
        assert_eq!(b.weight(), 1);
    }

    #[test]
    fn guard_releases_on_drop() {
        let b = Arc::new(Backend::new("http://a:1").unwrap().with_max_connections(2));
        let g1 = b.acquire();
        let g2 = b.acquire();
        assert_eq!(b.current_connections(), 2);
        assert!(!b.is_available());
        drop(g1);
        assert!(b.is_available());
        drop(g2);
        assert_eq!(b.current_connections(), 0);
    }

    #[test]
    fn unhealthy_is_unavailable() {
        let b = Backend::new("http://a:1").unwrap();
        assert!(b.set_healthy(false));
        assert!(!b.is_available());
    }

    #[test]
    fn success_rate_tracks_outcomes() {
        let b = Backend::new("http://a:1").unwrap();
        assert_eq!(b.success_rate(), 1.0);
        b.record_outcome(true);
        b.record_outcome(true);
        b.record_outcome(true);
        b.record_outcome(false);
        assert_eq!(b.failed_requests(), 1);
        assert_eq!(b.total_requests(), 4);
        assert!((b.success_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn registry_preserves_order() {
        let registry: BackendRegistry = ["http://a:1", "http://b:2"]
            .into_iter()
            .map(|u| Backend::new(u).unwrap())
            .collect();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.all()[0].key(), "http://a:1/");
        assert!(registry.get("http://b:2/").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_balance_out() {
        let backend = Arc::new(Backend::new("http://a:1").unwrap());
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let backend = Arc::clone(&backend);
                tokio::spawn(async move {
                    for _ in 0..500 {
                        let guard = backend.acquire();
                        tokio::task::yield_now().await;
                        guard.record_outcome(true);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(backend.current_connections(), 0);
        assert_eq!(backend.total_requests(), 8000);
    }
}
