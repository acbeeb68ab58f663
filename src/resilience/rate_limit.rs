//! Sliding-window rate limiting.
//!
//! Each key keeps the timestamps of its admitted requests. A timestamp
//! expires once it is `window` old, so the live window is `(now - window, now]`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::warn;

use crate::error::DispatchError;
use crate::handler::BoxFuture;
use crate::middleware::{Middleware, Next};
use crate::{Request, Response};

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    windows: DashMap<String, VecDeque<Instant>>,
}

fn evict(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while timestamps
        .front()
        .is_some_and(|&at| now.duration_since(at) >= window)
    {
        timestamps.pop_front();
    }
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit or reject one request for `key`. Admitted requests are recorded.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut timestamps = self.windows.entry(key.to_owned()).or_default();
        evict(&mut timestamps, now, self.window);

        if timestamps.len() < self.max_requests {
            timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    /// Requests `key` may still make in the current window.
    pub fn remaining(&self, key: &str) -> usize {
        let now = Instant::now();
        match self.windows.get_mut(key) {
            Some(mut timestamps) => {
                evict(&mut timestamps, now, self.window);
                self.max_requests.saturating_sub(timestamps.len())
            }
            None => self.max_requests,
        }
    }

    /// `Retry-After` value for a rejected request: the window in whole
    /// seconds, rounded up, at least 1.
    pub fn retry_after_secs(&self) -> u64 {
        self.window.as_millis().div_ceil(1000).max(1) as u64
    }

    pub fn reset(&self, key: &str) {
        self.windows.remove(key);
    }

    /// Drop keys with no live timestamps.
    pub fn purge_idle(&self) {
        let now = Instant::now();
        self.windows.retain(|_, timestamps| {
            evict(timestamps, now, self.window);
            !timestamps.is_empty()
        });
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Applies a [`SlidingWindowLimiter`] per client.
///
/// Clients are keyed by the connection's peer IP. Forwarding headers such as
/// `X-Forwarded-For` are ignored unless named via
/// [`trust_header`](Self::trust_header), since any client can set them.
/// Every response carries `X-RateLimit-Limit` and `X-RateLimit-Remaining`;
/// rejections are `429` with `Retry-After`.
#[derive(Debug, Clone)]
pub struct RateLimitMiddleware {
    limiter: Arc<SlidingWindowLimiter>,
    trusted_header: Option<String>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<SlidingWindowLimiter>) -> Self {
        Self {
            limiter,
            trusted_header: None,
        }
    }

    /// Key clients by the first entry of `header` when present. Only use
    /// behind a proxy that overwrites it.
    #[must_use]
    pub fn trust_header(mut self, header: impl Into<String>) -> Self {
        self.trusted_header = Some(header.into());
        self
    }

    fn client_key(&self, request: &Request) -> String {
        let forwarded = self
            .trusted_header
            .as_deref()
            .and_then(|name| request.headers().list(name).next());

        match (forwarded, request.client_ip()) {
            (Some(ip), _) => ip.to_owned(),
            (None, Some(ip)) => ip.to_string(),
            (None, None) => "unknown".to_owned(),
        }
    }
}

impl Middleware for RateLimitMiddleware {
    fn handle(&self, request: Request, next: Next) -> BoxFuture<Response> {
        let key = self.client_key(&request);
        let limiter = Arc::clone(&self.limiter);

        Box::pin(async move {
            let limit = limiter.max_requests().to_string();
            if !limiter.check(&key) {
                warn!(client = %key, path = %request.path(), "rate limit exceeded");
                let mut resp = DispatchError::RateLimited {
                    retry_after_secs: limiter.retry_after_secs(),
                }
                .into_response();
                resp.add_header("X-RateLimit-Limit", limit);
                resp.add_header("X-RateLimit-Remaining", "0");
                return resp;
            }

            let remaining = limiter.remaining(&key).to_string();
            let mut resp = next.run(request).await;
            resp.add_header("X-RateLimit-Limit", limit);
            resp.add_header("X-RateLimit-Remaining", remaining);
            resp
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Pipeline;
    use crate::{Method, StatusCode};
    use tokio::time::advance;

    fn limiter() -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(3, Duration::from_millis(60_000))
    }

    #[tokio::test(start_paused = true)]
    async fn admits_max_then_rejects_until_window_passes() {
        let rl = limiter();
        assert!(rl.check("k"));
        assert!(rl.check("k"));
        assert!(rl.check("k"));
        assert!(!rl.check("k"));
        assert_eq!(rl.remaining("k"), 0);

        advance(Duration::from_millis(59_999)).await;
        assert!(!rl.check("k"));

        advance(Duration::from_millis(1)).await;
        assert_eq!(rl.remaining("k"), 3);
        assert!(rl.check("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_per_timestamp() {
        let rl = limiter();
        assert!(rl.check("k"));
        advance(Duration::from_secs(30)).await;
        assert!(rl.check("k"));
        assert!(rl.check("k"));
        assert!(!rl.check("k"));

        // Only the first timestamp has expired.
        advance(Duration::from_secs(30)).await;
        assert!(rl.check("k"));
        assert!(!rl.check("k"));
    }

    #[test]
    fn keys_are_independent() {
        let rl = limiter();
        for _ in 0..3 {
            assert!(rl.check("a"));
        }
        assert!(!rl.check("a"));
        assert!(rl.check("b"));
        assert_eq!(rl.remaining("never-seen"), 3);

        rl.reset("a");
        assert!(rl.check("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_idle_keys() {
        let rl = limiter();
        rl.check("a");
        advance(Duration::from_secs(30)).await;
        rl.check("b");
        advance(Duration::from_secs(30)).await;

        rl.purge_idle();
        assert_eq!(rl.len(), 1);
        assert_eq!(rl.remaining("b"), 2);
    }

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(limiter().retry_after_secs(), 60);
        assert_eq!(SlidingWindowLimiter::new(1, Duration::from_millis(1500)).retry_after_secs(), 2);
        assert_eq!(SlidingWindowLimiter::new(1, Duration::from_millis(10)).retry_after_secs(), 1);
    }

    fn chain(mw: RateLimitMiddleware) -> crate::middleware::Chain {
        Pipeline::new()
            .layer(mw)
            .build(|_req: Request| async { Response::new(StatusCode::Ok).body("ok") })
    }

    fn from(ip: &str) -> Request {
        Request::new(Method::Get, "/").with_remote_addr(format!("{ip}:5000").parse().unwrap())
    }

    #[tokio::test]
    async fn middleware_sets_headers_and_rejects() {
        let limiter = Arc::new(SlidingWindowLimiter::new(2, Duration::from_secs(60)));
        let chain = chain(RateLimitMiddleware::new(limiter));

        let res = chain.dispatch(from("10.0.0.1")).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(res.headers().get("x-ratelimit-limit"), Some("2"));
        assert_eq!(res.headers().get("x-ratelimit-remaining"), Some("1"));

        chain.dispatch(from("10.0.0.1")).await;
        let res = chain.dispatch(from("10.0.0.1")).await;
        assert_eq!(res.status(), StatusCode::TooManyRequests);
        assert_eq!(res.headers().get("retry-after"), Some("60"));
        assert_eq!(res.headers().get("x-ratelimit-remaining"), Some("0"));

        let other = chain.dispatch(from("10.0.0.2")).await;
        assert_eq!(other.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn forwarded_header_ignored_unless_trusted() {
        let limiter = Arc::new(SlidingWindowLimiter::new(1, Duration::from_secs(60)));
        let untrusted = chain(RateLimitMiddleware::new(Arc::clone(&limiter)));

        untrusted
            .dispatch(from("10.0.0.1").with_header("X-Forwarded-For", "1.1.1.1"))
            .await;
        let spoofed = untrusted
            .dispatch(from("10.0.0.1").with_header("X-Forwarded-For", "2.2.2.2"))
            .await;
        assert_eq!(spoofed.status(), StatusCode::TooManyRequests);

        let limiter = Arc::new(SlidingWindowLimiter::new(1, Duration::from_secs(60)));
        let trusted = chain(RateLimitMiddleware::new(limiter).trust_header("X-Forwarded-For"));
        trusted
            .dispatch(from("10.0.0.1").with_header("X-Forwarded-For", "1.1.1.1, 10.0.0.1"))
            .await;
        let distinct = trusted
            .dispatch(from("10.0.0.1").with_header("X-Forwarded-For", "2.2.2.2"))
            .await;
        assert_eq!(distinct.status(), StatusCode::Ok);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_admit_exactly_the_limit() {
        let limiter = Arc::new(SlidingWindowLimiter::new(50, Duration::from_secs(60)));
        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.check("10.0.0.1") })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 50);
        assert_eq!(limiter.remaining("10.0.0.1"), 0);
    }
}
