//! Dispatch error taxonomy and its mapping onto HTTP responses.
//!
//! Errors never propagate past the dispatch entry point: the router, the
//! middleware chain and the reverse proxy convert them into responses through
//! [`DispatchError::into_response`].

use serde_json::json;
use thiserror::Error;

use crate::http::{Method, Response, StatusCode};
use crate::proxy::UpstreamError;

/// Everything the dispatch engine can fail with.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no route matches {path}")]
    RouteNotFound { path: String },

    #[error("method not allowed")]
    MethodNotAllowed { allowed: Vec<Method> },

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("circuit open for backend {backend}")]
    CircuitOpen { backend: String },

    #[error("no backend available")]
    BackendUnavailable,

    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RouteNotFound { .. } => StatusCode::NotFound,
            Self::MethodNotAllowed { .. } => StatusCode::MethodNotAllowed,
            Self::RateLimited { .. } => StatusCode::TooManyRequests,
            Self::CircuitOpen { .. } | Self::BackendUnavailable => StatusCode::ServiceUnavailable,
            Self::Upstream(_) => StatusCode::BadGateway,
            Self::Internal(_) => StatusCode::InternalServerError,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            Self::MethodNotAllowed { .. } => "METHOD_NOT_ALLOWED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::BackendUnavailable => "BACKEND_UNAVAILABLE",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Build the response for this error: a JSON body plus `Allow` for 405
    /// and `Retry-After` for 429.
    pub fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Handler panics are logged where caught; callers see a generic message.
            Self::Internal(_) => status.canonical_reason().to_owned(),
            other => other.to_string(),
        };

        let mut response = Response::json(
            status,
            &json!({
                "error": {
                    "code": self.error_code(),
                    "message": message,
                    "status": status.as_u16(),
                }
            }),
        );

        match self {
            Self::MethodNotAllowed { allowed } => {
                let allow = allowed
                    .iter()
                    .map(Method::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                response.add_header("Allow", allow);
            }
            Self::RateLimited { retry_after_secs } => {
                response.add_header("Retry-After", retry_after_secs.to_string());
            }
            _ => {}
        }
        response
    }
}
