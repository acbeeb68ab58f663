//! Reverse proxy.
//!
//! Per request: rate limit, select a backend, consult its circuit breaker,
//! reserve a connection slot, forward, then record the outcome. Failed
//! attempts are retried on another backend while the [`RetryPolicy`] allows.

mod upstream;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time;
use tracing::{debug, warn};

use crate::balancer::{BackendRegistry, HealthChecker, LoadBalancer};
use crate::config::{Config, ConfigError, HealthCheckConfig};
use crate::error::DispatchError;
use crate::handler::{BoxFuture, Handler};
use crate::http::response::ResponseError;
use crate::resilience::{CircuitBreakerRegistry, RetryPolicy, SlidingWindowLimiter};
use crate::{Request, Response};

pub use crate::balancer::Backend;
pub use upstream::HttpUpstream;

/// Transport or protocol failure talking to a backend.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(#[from] ResponseError),

    #[error("response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("invalid backend url {0}")]
    InvalidUrl(String),
}

/// Sends one request to one backend.
///
/// The request path is relative to the backend URL; implementations prefix
/// it with the URL's own path.
pub trait Upstream: Send + Sync + 'static {
    fn send(&self, backend: &Backend, request: Request) -> BoxFuture<Result<Response, UpstreamError>>;
}

struct Shared {
    balancer: LoadBalancer,
    breakers: CircuitBreakerRegistry,
    upstream: Arc<dyn Upstream>,
    limiter: Option<Arc<SlidingWindowLimiter>>,
    retry: RetryPolicy,
    timeout: Duration,
}

/// Load-balancing reverse proxy. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ReverseProxy {
    shared: Arc<Shared>,
}

pub struct ReverseProxyBuilder {
    balancer: LoadBalancer,
    upstream: Arc<dyn Upstream>,
    breakers: CircuitBreakerRegistry,
    limiter: Option<Arc<SlidingWindowLimiter>>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ReverseProxyBuilder {
    #[must_use]
    pub fn circuit_breakers(mut self, breakers: CircuitBreakerRegistry) -> Self {
        self.breakers = breakers;
        self
    }

    #[must_use]
    pub fn rate_limiter(mut self, limiter: Arc<SlidingWindowLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound on each backend attempt.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> ReverseProxy {
        ReverseProxy {
            shared: Arc::new(Shared {
                balancer: self.balancer,
                breakers: self.breakers,
                upstream: self.upstream,
                limiter: self.limiter,
                retry: self.retry,
                timeout: self.timeout,
            }),
        }
    }
}

impl ReverseProxy {
    /// Starts with a 5-failure / 30 s breaker per backend, the default retry
    /// policy, a 30 s timeout and no rate limiting.
    pub fn builder(balancer: LoadBalancer, upstream: impl Upstream) -> ReverseProxyBuilder {
        ReverseProxyBuilder {
            balancer,
            upstream: Arc::new(upstream),
            breakers: CircuitBreakerRegistry::new(5, Duration::from_secs(30)),
            limiter: None,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Assemble a proxy speaking HTTP/1.1 to the configured backends.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry: BackendRegistry = config
            .backends
            .iter()
            .map(|b| b.build())
            .collect::<Result<_, _>>()?;
        let balancer = LoadBalancer::new(Arc::new(registry), config.strategy);

        let mut builder = Self::builder(balancer, HttpUpstream::new(config.timeout()))
            .circuit_breakers(CircuitBreakerRegistry::new(
                config.circuit_breaker.threshold,
                Duration::from_millis(config.circuit_breaker.reset_timeout_ms),
            ))
            .retry_policy(RetryPolicy::from(&config.retry))
            .timeout(config.timeout());

        if config.rate_limit.enabled {
            builder = builder.rate_limiter(Arc::new(SlidingWindowLimiter::new(
                config.rate_limit.max_requests,
                Duration::from_millis(config.rate_limit.window_ms),
            )));
        }
        Ok(builder.build())
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.shared.balancer
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.shared.breakers
    }

    pub fn rate_limiter(&self) -> Option<&Arc<SlidingWindowLimiter>> {
        self.shared.limiter.as_ref()
    }

    /// A health checker probing this proxy's backends through its upstream.
    pub fn health_checker(&self, config: &HealthCheckConfig) -> HealthChecker {
        HealthChecker::new(
            Arc::clone(self.shared.balancer.registry()),
            Arc::clone(&self.shared.upstream),
            config,
        )
    }

    /// Forward `request` and map any failure to a response.
    pub async fn handle(&self, request: Request) -> Response {
        match self.forward(request).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    /// Forward `request`, returning the backend's response unmodified.
    ///
    /// A 5xx reply counts as a failed attempt for the breaker and retries;
    /// if no retry remains it is still relayed as received.
    pub async fn forward(&self, request: Request) -> Result<Response, DispatchError> {
        let shared = &*self.shared;
        let client_ip = request.client_ip().map(|ip| ip.to_string());

        if let Some(limiter) = &shared.limiter {
            let key = client_ip.as_deref().unwrap_or("unknown");
            if !limiter.check(key) {
                warn!(client = %key, "rate limit exceeded");
                return Err(DispatchError::RateLimited {
                    retry_after_secs: limiter.retry_after_secs(),
                });
            }
        }

        let mut tried: Vec<String> = Vec::new();
        let mut retries = 0u32;
        loop {
            let selected = if tried.is_empty() {
                shared.balancer.select_backend(client_ip.as_deref())
            } else {
                shared.balancer.select_untried(client_ip.as_deref(), &tried)
            };
            let Some(backend) = selected else {
                return Err(DispatchError::BackendUnavailable);
            };

            let breaker = shared.breakers.get(backend.key());
            if !breaker.allow_request() {
                debug!(backend = %backend, "circuit open, rejecting");
                return Err(DispatchError::CircuitOpen {
                    backend: backend.key().to_owned(),
                });
            }

            let outcome = {
                let guard = backend.acquire();
                match time::timeout(shared.timeout, shared.upstream.send(&guard, request.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(UpstreamError::Timeout {
                        after_ms: shared.timeout.as_millis() as u64,
                    }),
                }
            };
            tried.push(backend.key().to_owned());

            let failure = match outcome {
                Ok(response) if !response.status().is_server_error() => {
                    breaker.record_success();
                    backend.record_outcome(true);
                    debug!(backend = %backend, status = response.status().as_u16(), "proxied");
                    return Ok(response);
                }
                Ok(response) => {
                    warn!(backend = %backend, status = response.status().as_u16(), attempt = retries, "backend returned server error");
                    Ok(response)
                }
                Err(e) => {
                    warn!(backend = %backend, error = %e, attempt = retries, "upstream request failed");
                    Err(e)
                }
            };
            breaker.record_failure();
            backend.record_outcome(false);

            if !shared.retry.should_retry(retries, request.method()) {
                return failure.map_err(DispatchError::from);
            }
            time::sleep(shared.retry.get_delay(retries)).await;
            retries += 1;
        }
    }
}

impl Handler for ReverseProxy {
    fn call(&self, request: Request) -> BoxFuture<Response> {
        let proxy = self.clone();
        Box::pin(async move { proxy.handle(request).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::LoadBalanceStrategy;
    use crate::resilience::CircuitState;
    use crate::{Method, StatusCode};
    use std::sync::Mutex;

    type Script = dyn Fn(&str, &Request) -> Option<Result<Response, UpstreamError>> + Send + Sync;

    /// Upstream driven by a closure of (backend key, request). `None` hangs.
    struct Scripted {
        calls: Arc<Mutex<Vec<String>>>,
        script: Box<Script>,
    }

    impl Upstream for Scripted {
        fn send(&self, backend: &Backend, request: Request) -> BoxFuture<Result<Response, UpstreamError>> {
            self.calls.lock().unwrap().push(backend.key().to_owned());
            let outcome = (self.script)(backend.key(), &request);
            Box::pin(async move {
                match outcome {
                    Some(result) => result,
                    None => std::future::pending().await,
                }
            })
        }
    }

    fn balancer(urls: &[&str]) -> LoadBalancer {
        let registry: BackendRegistry = urls.iter().map(|u| Backend::new(u).unwrap()).collect();
        LoadBalancer::new(Arc::new(registry), LoadBalanceStrategy::RoundRobin)
    }

    fn scripted(
        script: impl Fn(&str, &Request) -> Option<Result<Response, UpstreamError>> + Send + Sync + 'static,
    ) -> (Scripted, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Scripted {
                calls: Arc::clone(&calls),
                script: Box::new(script),
            },
            calls,
        )
    }

    fn refused() -> UpstreamError {
        UpstreamError::Connect(std::io::ErrorKind::ConnectionRefused.into())
    }

    #[tokio::test]
    async fn relays_backend_response_unmodified() {
        let (up, calls) = scripted(|_, req| {
            Some(Ok(Response::new(StatusCode::Created)
                .header("X-Backend", "a")
                .body(format!("{} {}", req.method(), req.path()))))
        });
        let proxy = ReverseProxy::builder(balancer(&["http://a:1"]), up).build();

        let res = proxy.handle(Request::new(Method::Put, "/items/7")).await;
        assert_eq!(res.status(), StatusCode::Created);
        assert_eq!(res.headers().get("x-backend"), Some("a"));
        assert_eq!(res.text(), "PUT /items/7");
        assert_eq!(calls.lock().unwrap().len(), 1);

        let backend = &proxy.balancer().registry().all()[0];
        assert_eq!(backend.current_connections(), 0);
        assert_eq!(backend.total_requests(), 1);
    }

    #[tokio::test]
    async fn no_backend_is_503() {
        let (up, calls) = scripted(|_, _| Some(Ok(Response::new(StatusCode::Ok))));
        let proxy = ReverseProxy::builder(balancer(&[]), up).build();
        let res = proxy.handle(Request::new(Method::Get, "/")).await;
        assert_eq!(res.status(), StatusCode::ServiceUnavailable);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_without_retry_is_502_and_counts() {
        let (up, _) = scripted(|_, _| Some(Err(refused())));
        let proxy = ReverseProxy::builder(balancer(&["http://a:1"]), up)
            .retry_policy(RetryPolicy::none())
            .build();

        let res = proxy.handle(Request::new(Method::Get, "/")).await;
        assert_eq!(res.status(), StatusCode::BadGateway);

        let backend = &proxy.balancer().registry().all()[0];
        assert_eq!(backend.current_connections(), 0);
        assert_eq!(backend.failed_requests(), 1);
        assert_eq!(proxy.breakers().get(backend.key()).failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_on_untried_backend() {
        let (up, calls) = scripted(|key, _| {
            if key.starts_with("http://a") {
                Some(Err(refused()))
            } else {
                Some(Ok(Response::new(StatusCode::Ok).body("from b")))
            }
        });
        let proxy = ReverseProxy::builder(balancer(&["http://a:1", "http://b:1"]), up).build();

        let res = proxy.handle(Request::new(Method::Get, "/")).await;
        assert_eq!(res.text(), "from b");
        assert_eq!(*calls.lock().unwrap(), ["http://a:1/", "http://b:1/"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let (up, calls) = scripted(|_, _| Some(Err(refused())));
        let proxy = ReverseProxy::builder(balancer(&["http://a:1", "http://b:1"]), up)
            .retry_policy(RetryPolicy {
                max_retries: 3,
                ..RetryPolicy::default()
            })
            .build();

        let res = proxy.handle(Request::new(Method::Get, "/")).await;
        assert_eq!(res.status(), StatusCode::BadGateway);
        assert_eq!(calls.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn post_is_not_retried_by_default() {
        let (up, calls) = scripted(|_, _| Some(Err(refused())));
        let proxy = ReverseProxy::builder(balancer(&["http://a:1", "http://b:1"]), up).build();

        let res = proxy.handle(Request::new(Method::Post, "/orders")).await;
        assert_eq!(res.status(), StatusCode::BadGateway);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_is_relayed_after_retries() {
        let (up, calls) = scripted(|_, _| Some(Ok(Response::new(StatusCode::InternalServerError).body("boom"))));
        let proxy = ReverseProxy::builder(balancer(&["http://a:1"]), up)
            .retry_policy(RetryPolicy {
                max_retries: 1,
                ..RetryPolicy::default()
            })
            .build();

        let res = proxy.handle(Request::new(Method::Get, "/")).await;
        assert_eq!(res.status(), StatusCode::InternalServerError);
        assert_eq!(res.text(), "boom");
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(proxy.balancer().registry().all()[0].failed_requests(), 2);
    }

    #[tokio::test]
    async fn open_circuit_is_503_without_reserving() {
        let (up, calls) = scripted(|_, _| Some(Err(refused())));
        let proxy = ReverseProxy::builder(balancer(&["http://a:1"]), up)
            .circuit_breakers(CircuitBreakerRegistry::new(2, Duration::from_secs(30)))
            .retry_policy(RetryPolicy::none())
            .build();

        for _ in 0..2 {
            assert_eq!(proxy.handle(Request::new(Method::Get, "/")).await.status(), StatusCode::BadGateway);
        }
        assert_eq!(proxy.breakers().get("http://a:1/").state(), CircuitState::Open);

        let res = proxy.handle(Request::new(Method::Get, "/")).await;
        assert_eq!(res.status(), StatusCode::ServiceUnavailable);
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(proxy.balancer().registry().all()[0].total_requests(), 2);
    }

    #[tokio::test]
    async fn rate_limited_before_selection() {
        let (up, calls) = scripted(|_, _| Some(Ok(Response::new(StatusCode::Ok))));
        let proxy = ReverseProxy::builder(balancer(&["http://a:1"]), up)
            .rate_limiter(Arc::new(SlidingWindowLimiter::new(1, Duration::from_secs(60))))
            .build();
        let req = || Request::new(Method::Get, "/").with_remote_addr("10.1.1.1:4000".parse().unwrap());

        assert_eq!(proxy.handle(req()).await.status(), StatusCode::Ok);
        let res = proxy.handle(req()).await;
        assert_eq!(res.status(), StatusCode::TooManyRequests);
        assert_eq!(res.headers().get("retry-after"), Some("60"));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_releases_reservation() {
        let (up, _) = scripted(|_, _| None);
        let proxy = ReverseProxy::builder(balancer(&["http://a:1"]), up)
            .retry_policy(RetryPolicy::none())
            .timeout(Duration::from_millis(250))
            .build();

        let err = proxy.forward(Request::new(Method::Get, "/")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Upstream(UpstreamError::Timeout { after_ms: 250 })));
        assert_eq!(proxy.balancer().registry().all()[0].current_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_releases_reservation() {
        let (up, calls) = scripted(|_, _| None);
        let proxy = ReverseProxy::builder(balancer(&["http://a:1"]), up).build();

        let abandoned = time::timeout(Duration::from_millis(10), proxy.handle(Request::new(Method::Get, "/"))).await;
        assert!(abandoned.is_err());
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(proxy.balancer().registry().all()[0].current_connections(), 0);
    }

    #[tokio::test]
    async fn mounts_as_handler() {
        let (up, _) = scripted(|_, req| Some(Ok(Response::new(StatusCode::Ok).body(req.path().to_owned()))));
        let proxy = ReverseProxy::builder(balancer(&["http://a:1"]), up).build();
        let handler: crate::handler::BoxHandler = crate::handler::boxed(proxy);
        assert_eq!(handler.call(Request::new(Method::Get, "/x")).await.text(), "/x");
    }

    #[test]
    fn from_config_wires_everything() {
        let config = Config::from_toml_str(
            r#"
            strategy = "least_connections"
            [rate_limit]
            enabled = false
            [[backends]]
            url = "http://127.0.0.1:9001"
            [[backends]]
            url = "http://127.0.0.1:9002"
            "#,
        )
        .unwrap();
        let proxy = ReverseProxy::from_config(&config).unwrap();
        assert_eq!(proxy.balancer().strategy(), LoadBalanceStrategy::LeastConnections);
        assert_eq!(proxy.balancer().registry().len(), 2);
        assert!(proxy.rate_limiter().is_none());
    }
}
