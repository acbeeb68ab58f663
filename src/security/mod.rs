//! Security-related middleware.

pub mod middleware;

pub use middleware::{CorsMiddleware, SecurityHeadersMiddleware};
