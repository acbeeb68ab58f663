//! # switchyard
//!
//! A request-dispatch and resilience engine: a radix-tree router, an onion
//! middleware pipeline and a load-balancing reverse proxy guarded by circuit
//! breakers, sliding-window rate limiting and retry backoff.
//!
//! Everything that turns a [`Request`] into a [`Response`] implements
//! [`Handler`], so routers, middleware chains and proxies nest freely.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use switchyard::middleware::{LoggerMiddleware, Pipeline};
//! use switchyard::resilience::{RateLimitMiddleware, SlidingWindowLimiter};
//! use switchyard::{Config, Request, Response, ReverseProxy, Router, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("switchyard.toml")?;
//!     let proxy = ReverseProxy::from_config(&config)?;
//!
//!     let mut router = Router::new();
//!     router
//!         .get("/health", |_req: Request| async { Response::new(StatusCode::Ok).body("ok") })?
//!         .get("/users/:id", |req: Request| async move {
//!             let id = req.param("id").unwrap_or_default().to_owned();
//!             Response::new(StatusCode::Ok).body(id)
//!         })?
//!         .get("/api/*", proxy)?;
//!
//!     let limiter = Arc::new(SlidingWindowLimiter::new(100, std::time::Duration::from_secs(60)));
//!     let app = Pipeline::new()
//!         .layer(LoggerMiddleware)
//!         .layer(RateLimitMiddleware::new(limiter))
//!         .build(router);
//!
//!     Server::bind("127.0.0.1:8080").await?.configure(&config).run(app).await?;
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod config;
pub mod error;
pub mod handler;
pub mod http;
pub mod middleware;
pub mod proxy;
pub mod resilience;
pub mod router;
pub mod security;
pub mod server;

pub use config::Config;
pub use error::DispatchError;
pub use handler::Handler;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use middleware::{Chain, Pipeline};
pub use proxy::ReverseProxy;
pub use router::Router;
pub use server::{Server, ServerError};
