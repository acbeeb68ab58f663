//! Middleware pipeline: composable before/after request handler logic.
//!
//! Middleware is registered on a [`Pipeline`] and frozen into a [`Chain`] by
//! [`Pipeline::build`]. The chain follows the onion model: the first
//! registered middleware is the outermost layer, sees the request first and
//! the response last.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: per-request cursor into the remaining chain; call [`Next::run`]
//!   to advance to the next layer.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`]: converts a [`Middleware`] into a [`MiddlewareHandler`].
//! - [`Pipeline`] / [`Chain`]: ordered registration and the built, shareable chain.
//! - [`LoggerMiddleware`]: built-in request/response logger.
//!
//! ## Ordering
//!
//! Layers run in registration order unless a priority is given through
//! [`Pipeline::layer_with_priority`]; layers are then stable-sorted by priority
//! (lower runs further out, default `0`), so ties keep registration order.
//!
//! ## Failure boundary
//!
//! A panic anywhere inside the chain (middleware or endpoint) is caught by the
//! [`Chain`] itself, logged, and turned into `500 Internal Server Error`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::DispatchError;
use crate::handler::{BoxFuture, BoxHandler, Handler, boxed};
use crate::{Request, Response};

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is passed to each middleware's [`Middleware::handle`] implementation.
/// Calling [`Next::run`] advances the cursor by one position and invokes the next
/// middleware, or the chain's endpoint once every layer has been entered.
///
/// Every request gets its own `Next`; only the layer list and the endpoint are
/// shared. `Next` is consumed by [`run`](Self::run), so a middleware cannot
/// continue the chain more than once.
///
/// # Examples
///
/// ```rust,no_run
/// use switchyard::handler::BoxFuture;
/// use switchyard::middleware::{Middleware, Next};
/// use switchyard::{Request, Response};
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn handle(&self, request: Request, next: Next) -> BoxFuture<Response> {
///         Box::pin(async move { next.run(request).await })
///     }
/// }
/// ```
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    endpoint: BoxHandler,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

/// A type-erased, reference-counted middleware function.
///
/// Every entry in the middleware stack is stored as a `MiddlewareHandler`.
/// The [`Arc`] wrapper makes handlers cheap to clone so that [`Next`] can
/// advance through the chain without copying closures.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use switchyard::handler::BoxFuture;
/// use switchyard::middleware::{MiddlewareHandler, Next};
/// use switchyard::{Request, Response};
///
/// let handler: MiddlewareHandler = Arc::new(|req: Request, next: Next| -> BoxFuture<Response> {
///     Box::pin(async move { next.run(req).await })
/// });
/// ```
pub type MiddlewareHandler =
    Arc<dyn Fn(Request, Next) -> BoxFuture<Response> + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |request: Request, next: Next| middleware.handle(request, next))
}

impl Next {
    /// Invokes the next middleware in the chain and returns its response.
    ///
    /// Advances the internal cursor by one, clones the handler at the current
    /// position, and awaits it. Once the layers are exhausted the endpoint
    /// handler is called instead.
    pub async fn run(mut self, request: Request) -> Response {
        if self.index < self.middlewares.len() {
            let handler = self.middlewares[self.index].clone();
            self.index += 1;
            handler(request, self).await
        } else {
            self.endpoint.call(request).await
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Request`] and a [`Next`] cursor. They may:
///
/// - **Pass through**: call `next.run(request).await` without modification.
/// - **Short-circuit**: return a [`Response`] directly without calling `next`.
/// - **Decorate**: call `next.run(request).await`, inspect the response, and
///   return a modified copy.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future so it can be awaited across
///   `.await` points in multi-threaded runtimes.
/// - Implementations **should not** hold locks on shared state across an
///   `.await` point.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    fn handle(&self, request: Request, next: Next) -> BoxFuture<Response>;
}

struct Layer {
    priority: i32,
    handler: MiddlewareHandler,
}

/// Ordered middleware registration.
///
/// # Examples
///
/// ```rust
/// use switchyard::middleware::{LoggerMiddleware, Pipeline};
/// use switchyard::{Request, Response, Router, StatusCode};
///
/// let mut router = Router::new();
/// router.get("/ping", |_req: Request| async { Response::new(StatusCode::Ok) }).unwrap();
///
/// let chain = Pipeline::new().layer(LoggerMiddleware).build(router);
/// assert_eq!(chain.len(), 1);
/// ```
#[derive(Default)]
pub struct Pipeline {
    layers: Vec<Layer>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware with the default priority `0`.
    #[must_use]
    pub fn layer(self, middleware: impl Middleware + 'static) -> Self {
        self.layer_with_priority(middleware, 0)
    }

    /// Appends a middleware with an explicit priority; lower values wrap outer.
    #[must_use]
    pub fn layer_with_priority(mut self, middleware: impl Middleware + 'static, priority: i32) -> Self {
        self.layers.push(Layer {
            priority,
            handler: from_middleware(Arc::new(middleware)),
        });
        self
    }

    /// Appends a closure middleware with the default priority `0`.
    #[must_use]
    pub fn layer_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(Request, Next) -> BoxFuture<Response> + Send + Sync + 'static,
    {
        self.layers.push(Layer {
            priority: 0,
            handler: Arc::new(f),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Freezes the registration order around `endpoint`.
    pub fn build(mut self, endpoint: impl Handler) -> Chain {
        // `sort_by_key` is stable: equal priorities keep registration order.
        self.layers.sort_by_key(|layer| layer.priority);
        Chain {
            middlewares: self.layers.into_iter().map(|layer| layer.handler).collect(),
            endpoint: boxed(endpoint),
        }
    }
}

/// A built middleware chain wrapped around an endpoint.
///
/// Cloning a `Chain` is cheap; all clones share the same layers.
#[derive(Clone)]
pub struct Chain {
    middlewares: Arc<[MiddlewareHandler]>,
    endpoint: BoxHandler,
}

impl Chain {
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Runs `request` through every layer and the endpoint.
    pub async fn dispatch(&self, request: Request) -> Response {
        self.call(request).await
    }
}

impl Handler for Chain {
    fn call(&self, request: Request) -> BoxFuture<Response> {
        let next = Next {
            middlewares: Arc::clone(&self.middlewares),
            endpoint: Arc::clone(&self.endpoint),
            index: 0,
        };
        let method = request.method().clone();
        let path = request.path().to_owned();

        Box::pin(async move {
            match AssertUnwindSafe(next.run(request)).catch_unwind().await {
                Ok(response) => response,
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    warn!(%method, %path, panic = %reason, "handler panicked");
                    DispatchError::Internal(reason).into_response()
                }
            }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Built-in middleware that logs each request's method, path, status, and duration.
///
/// Emits a single `tracing::info!` line after the downstream handler completes,
/// in the format:
///
/// ```text
/// METHOD /path - STATUS (duration)
/// ```
///
/// `LoggerMiddleware` does not short-circuit; it always delegates to the next
/// middleware and records the timing after the fact.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, request: Request, next: Next) -> BoxFuture<Response> {
        Box::pin(async move {
            let start = Instant::now();
            let method = request.method().as_str().to_string();
            let path = request.path().to_string();

            let response = next.run(request).await;

            let duration = start.elapsed();
            let status = response.status().as_u16();

            info!("{} {} - {} ({:?})", method, path, status, duration);

            response
        })
    }
}
