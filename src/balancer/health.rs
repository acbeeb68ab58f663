//! Active health checking.
//!
//! Periodically sends `GET <path>` to every registered backend and flips its
//! `healthy` flag from the outcome. Any 2xx within the timeout counts as healthy.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use super::BackendRegistry;
use crate::config::HealthCheckConfig;
use crate::proxy::Upstream;
use crate::{Method, Request};

pub struct HealthChecker {
    registry: Arc<BackendRegistry>,
    upstream: Arc<dyn Upstream>,
    interval: Duration,
    timeout: Duration,
    path: String,
}

/// Running checker task plus its shutdown signal.
#[derive(Debug)]
pub struct HealthCheckHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HealthCheckHandle {
    /// Signal the loop to stop and wait for it to exit.
    pub async fn shutdown(self) {
        // A send error means the loop is already gone.
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "health checker task failed");
        }
    }
}

impl HealthChecker {
    pub fn new(
        registry: Arc<BackendRegistry>,
        upstream: Arc<dyn Upstream>,
        config: &HealthCheckConfig,
    ) -> Self {
        Self {
            registry,
            upstream,
            interval: Duration::from_millis(config.interval_ms.max(1)),
            timeout: Duration::from_millis(config.timeout_ms),
            path: config.path.clone(),
        }
    }

    /// Probe every backend once.
    pub async fn check_all(&self) {
        for backend in self.registry.all() {
            let request = Request::new(Method::Get, &self.path)
                .with_header("User-Agent", concat!("switchyard-health/", env!("CARGO_PKG_VERSION")));

            let healthy = match time::timeout(self.timeout, self.upstream.send(backend, request)).await {
                Ok(Ok(response)) if response.status().is_success() => true,
                Ok(Ok(response)) => {
                    debug!(backend = %backend, status = response.status().as_u16(), "health check: non-success status");
                    false
                }
                Ok(Err(e)) => {
                    debug!(backend = %backend, error = %e, "health check: upstream error");
                    false
                }
                Err(_) => {
                    debug!(backend = %backend, "health check: timed out");
                    false
                }
            };

            let was_healthy = backend.set_healthy(healthy);
            match (was_healthy, healthy) {
                (true, false) => warn!(backend = %backend, "backend marked unhealthy"),
                (false, true) => info!(backend = %backend, "backend recovered"),
                _ => {}
            }
        }
    }

    /// Run checks every interval until `shutdown` turns `true` or its sender drops.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, path = %self.path, "health checker starting");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_all().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("health checker stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) onto the current runtime.
    pub fn spawn(self) -> HealthCheckHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(rx));
        HealthCheckHandle { shutdown, task }
    }
}
