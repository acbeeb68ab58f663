//! Security middleware: CORS and response hardening headers.
//!
//! - [`CorsMiddleware`] answers preflight `OPTIONS` requests itself and adds
//!   `Access-Control-*` headers to responses for allowed origins.
//! - [`SecurityHeadersMiddleware`] adds `nosniff`, frame denial, referrer
//!   policy and optional HSTS to every response.

use crate::{
    Method, Request, Response, StatusCode,
    handler::BoxFuture,
    middleware::{Middleware, Next},
};

/// Cross-Origin Resource Sharing.
///
/// Starts permissive (any origin); the first [`allow_origin`](Self::allow_origin)
/// call switches to an explicit allow-list. Requests without an `Origin`
/// header, or from an origin not on the list, pass through untouched.
///
/// Preflight requests (`OPTIONS` with an allowed `Origin`) are answered with
/// `204 No Content` and never reach the inner layers. When a specific origin is
/// echoed back, `Vary: Origin` is added so caches keep per-origin copies.
///
/// ```rust
/// use switchyard::Method;
/// use switchyard::security::CorsMiddleware;
///
/// let cors = CorsMiddleware::new()
///     .allow_origin("https://app.example.com")
///     .allow_method(Method::Patch)
///     .allow_header("X-Request-Id")
///     .max_age(600);
/// ```
#[derive(Debug, Clone)]
pub struct CorsMiddleware {
    origins: Vec<String>,
    any_origin: bool,
    methods: Vec<Method>,
    headers: Vec<String>,
    max_age_secs: u64,
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl CorsMiddleware {
    /// Any origin; `GET`, `POST`, `PUT`, `DELETE`; `Content-Type` and
    /// `Authorization`; preflight cached for an hour.
    pub fn new() -> Self {
        Self {
            origins: Vec::new(),
            any_origin: true,
            methods: vec![Method::Get, Method::Post, Method::Put, Method::Delete],
            headers: vec!["Content-Type".to_owned(), "Authorization".to_owned()],
            max_age_secs: 3600,
        }
    }

    /// Restrict to listed origins. `"*"` re-enables every origin.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        let origin = origin.into();
        if origin == "*" {
            self.any_origin = true;
        } else {
            if self.origins.is_empty() {
                self.any_origin = false;
            }
            self.origins.push(origin);
        }
        self
    }

    #[must_use]
    pub fn allow_method(mut self, method: impl Into<Method>) -> Self {
        let method = method.into();
        if !self.methods.contains(&method) {
            self.methods.push(method);
        }
        self
    }

    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.headers.push(header.into());
        self
    }

    /// `Access-Control-Max-Age` for preflight replies.
    #[must_use]
    pub fn max_age(mut self, secs: u64) -> Self {
        self.max_age_secs = secs;
        self
    }

    // Value for Access-Control-Allow-Origin, or None when the origin is refused.
    fn allowed_origin(&self, origin: &str) -> Option<String> {
        if self.any_origin {
            Some("*".to_owned())
        } else if self.origins.iter().any(|o| o == origin) {
            Some(origin.to_owned())
        } else {
            None
        }
    }

    fn decorate(&self, response: &mut Response, allow_origin: &str) {
        let methods = self
            .methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        response.add_header("Access-Control-Allow-Origin", allow_origin);
        response.add_header("Access-Control-Allow-Methods", methods);
        response.add_header("Access-Control-Allow-Headers", self.headers.join(", "));
        if allow_origin != "*" {
            response.add_header("Vary", "Origin");
        }
    }
}

impl Middleware for CorsMiddleware {
    fn handle(&self, request: Request, next: Next) -> BoxFuture<Response> {
        let allow_origin = request
            .headers()
            .get("origin")
            .and_then(|origin| self.allowed_origin(origin));
        let Some(allow_origin) = allow_origin else {
            return Box::pin(next.run(request));
        };

        let cors = self.clone();
        if request.method() == &Method::Options {
            let mut preflight = Response::new(StatusCode::NoContent);
            cors.decorate(&mut preflight, &allow_origin);
            preflight.add_header("Access-Control-Max-Age", cors.max_age_secs.to_string());
            return Box::pin(std::future::ready(preflight));
        }

        Box::pin(async move {
            let mut response = next.run(request).await;
            cors.decorate(&mut response, &allow_origin);
            response
        })
    }
}

/// Adds response hardening headers the handler did not set itself.
///
/// | Header                      | Value                                   |
/// |-----------------------------|-----------------------------------------|
/// | `X-Content-Type-Options`    | `nosniff`                               |
/// | `X-Frame-Options`           | `DENY`                                  |
/// | `Referrer-Policy`           | `no-referrer`                           |
/// | `Strict-Transport-Security` | `max-age=<secs>; includeSubDomains` (opt-in via [`hsts`](Self::hsts)) |
#[derive(Debug, Clone, Default)]
pub struct SecurityHeadersMiddleware {
    hsts_max_age: Option<u64>,
}

impl SecurityHeadersMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables `Strict-Transport-Security` with the given `max-age` in seconds.
    #[must_use]
    pub fn hsts(mut self, max_age_secs: u64) -> Self {
        self.hsts_max_age = Some(max_age_secs);
        self
    }
}

impl Middleware for SecurityHeadersMiddleware {
    fn handle(&self, request: Request, next: Next) -> BoxFuture<Response> {
        let hsts = self
            .hsts_max_age
            .map(|age| format!("max-age={age}; includeSubDomains"));

        Box::pin(async move {
            let mut resp = next.run(request).await;
            let defaults = [
                ("X-Content-Type-Options", Some("nosniff".to_owned())),
                ("X-Frame-Options", Some("DENY".to_owned())),
                ("Referrer-Policy", Some("no-referrer".to_owned())),
                ("Strict-Transport-Security", hsts),
            ];
            for (name, value) in defaults {
                if let Some(value) = value {
                    if !resp.headers().contains(name) {
                        resp.add_header(name, value);
                    }
                }
            }
            resp
        })
    }
}
