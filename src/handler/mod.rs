//! The uniform `Request -> Response` capability.
//!
//! Route handlers, the built middleware chain, the router itself and the
//! reverse proxy all implement [`Handler`], so any of them can sit at the end
//! of a pipeline or be mounted as a route target.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::{Request, Response};

/// A boxed, `Send` future. Every dispatch step returns one.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Type-erased, shareable handler.
///
/// Stored behind `Arc` so it can be cloned into every request's cursor and
/// shared across Tokio tasks without copying the underlying closure.
pub type BoxHandler = Arc<dyn Handler>;

/// Anything that turns a [`Request`] into a [`Response`].
///
/// Any `Fn(Request) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait automatically via the blanket
/// impl below, so plain async closures can be registered directly:
///
/// ```rust
/// use switchyard::handler::Handler;
/// use switchyard::{Request, Response, StatusCode};
///
/// let hello = |_req: Request| async { Response::new(StatusCode::Ok).body("hi") };
/// # fn assert_handler(_: &impl Handler) {}
/// assert_handler(&hello);
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Handle the request, boxing the returned future.
    fn call(&self, request: Request) -> BoxFuture<Response>;
}

impl<T, F> Handler for T
where
    T: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, request: Request) -> BoxFuture<Response> {
        Box::pin((self)(request))
    }
}

/// Erase a concrete handler into a [`BoxHandler`].
pub fn boxed(handler: impl Handler) -> BoxHandler {
    Arc::new(handler)
}
