//! HTTP/1.1 transport to backends over plain TCP.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::trace;

use super::{Upstream, UpstreamError};
use crate::balancer::Backend;
use crate::handler::BoxFuture;
use crate::{Request, Response};

const DEFAULT_MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

/// One connection per request: writes the request with `Connection: close`
/// and reads the reply until the backend closes.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    timeout: Duration,
    max_response_bytes: usize,
}

impl Default for HttpUpstream {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl HttpUpstream {
    /// `timeout` bounds the whole exchange, connect included.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }

    #[must_use]
    pub fn with_max_response_bytes(mut self, limit: usize) -> Self {
        self.max_response_bytes = limit;
        self
    }
}

impl Upstream for HttpUpstream {
    fn send(&self, backend: &Backend, mut request: Request) -> BoxFuture<Result<Response, UpstreamError>> {
        let url = backend.url().clone();
        let timeout = self.timeout;
        let limit = self.max_response_bytes;

        Box::pin(async move {
            let host = url
                .host_str()
                .ok_or_else(|| UpstreamError::InvalidUrl(url.to_string()))?;
            let port = url.port_or_known_default().unwrap_or(80);
            let authority = format!("{host}:{port}");

            if !request.headers().contains("host") {
                request.headers_mut().insert("Host", authority.clone());
            }
            let method = request.method().clone();
            let wire = request.to_upstream_bytes(url.path());

            let exchange = async {
                let mut stream = TcpStream::connect(&authority)
                    .await
                    .map_err(UpstreamError::Connect)?;
                stream.write_all(&wire).await?;
                trace!(backend = %authority, bytes = wire.len(), "request written");

                let mut buf = BytesMut::with_capacity(8 * 1024);
                loop {
                    if stream.read_buf(&mut buf).await? == 0 {
                        break;
                    }
                    if buf.len() > limit {
                        return Err(UpstreamError::ResponseTooLarge { limit });
                    }
                }
                Ok(Response::parse_for(&buf, &method)?)
            };

            match time::timeout(timeout, exchange).await {
                Ok(result) => result,
                Err(_) => Err(UpstreamError::Timeout {
                    after_ms: timeout.as_millis() as u64,
                }),
            }
        })
    }
}
