//! Configuration schema and TOML loading.
//!
//! Every section has defaults, so an empty file is a valid (if useless)
//! configuration until [`Config::validate`] demands at least one backend.
//!
//! ```toml
//! workers = 4
//! max_connections = 1024
//! timeout_ms = 30000
//! strategy = "least_connections"
//!
//! [rate_limit]
//! max_requests = 100
//! window_ms = 60000
//!
//! [[backends]]
//! url = "http://127.0.0.1:9001"
//! weight = 2
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::balancer::{Backend, BackendError, DEFAULT_MAX_CONNECTIONS, LoadBalanceStrategy};
use crate::resilience::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Tokio worker threads.
    pub workers: usize,
    /// Concurrent client connections the server accepts.
    pub max_connections: usize,
    /// Upper bound on each backend call.
    pub timeout_ms: u64,
    pub strategy: LoadBalanceStrategy,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub health_check: HealthCheckConfig,
    pub backends: Vec<BackendConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            max_connections: 1024,
            timeout_ms: 30_000,
            strategy: LoadBalanceStrategy::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            health_check: HealthCheckConfig::default(),
            backends: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: usize,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 100,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub retry_non_idempotent: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 2000,
            retry_non_idempotent: false,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            retry_non_idempotent: config.retry_non_idempotent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 10_000,
            timeout_ms: 2000,
            path: "/health".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackendConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_backend_connections")]
    pub max_connections: usize,
}

fn default_weight() -> u32 {
    1
}

fn default_backend_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

impl BackendConfig {
    pub fn build(&self) -> Result<Backend, BackendError> {
        Ok(Backend::new(&self.url)?
            .with_weight(self.weight)
            .with_max_connections(self.max_connections))
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Check value ranges and backend URLs, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.workers == 0 {
            problems.push("workers must be at least 1".to_owned());
        }
        if self.max_connections == 0 {
            problems.push("max_connections must be at least 1".to_owned());
        }
        if self.timeout_ms == 0 {
            problems.push("timeout_ms must be positive".to_owned());
        }
        if self.rate_limit.enabled && self.rate_limit.max_requests == 0 {
            problems.push("rate_limit.max_requests must be at least 1".to_owned());
        }
        if self.rate_limit.window_ms == 0 {
            problems.push("rate_limit.window_ms must be positive".to_owned());
        }
        if self.circuit_breaker.threshold == 0 {
            problems.push("circuit_breaker.threshold must be at least 1".to_owned());
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            problems.push("retry.multiplier must be >= 1.0".to_owned());
        }
        if self.health_check.enabled && self.health_check.interval_ms == 0 {
            problems.push("health_check.interval_ms must be positive".to_owned());
        }
        if self.backends.is_empty() {
            problems.push("at least one backend is required".to_owned());
        }
        for backend in &self.backends {
            if let Err(e) = backend.build() {
                problems.push(e.to_string());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        workers = 8
        max_connections = 512
        timeout_ms = 5000
        strategy = "weighted"

        [rate_limit]
        max_requests = 10
        window_ms = 1000

        [circuit_breaker]
        threshold = 3
        reset_timeout_ms = 10000

        [retry]
        max_retries = 1
        multiplier = 1.5

        [health_check]
        enabled = true
        path = "/ping"

        [[backends]]
        url = "http://127.0.0.1:9001"
        weight = 3

        [[backends]]
        url = "http://127.0.0.1:9002"
        max_connections = 10
    "#;

    #[test]
    fn parses_full_document() {
        let config = Config::from_toml_str(FULL).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.strategy, LoadBalanceStrategy::Weighted);
        assert_eq!(config.rate_limit.max_requests, 10);
        assert!(config.rate_limit.enabled);
        assert_eq!(config.circuit_breaker.threshold, 3);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.health_check.path, "/ping");
        assert_eq!(config.health_check.interval_ms, 10_000);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].weight, 3);
        assert_eq!(config.backends[1].weight, 1);
        assert_eq!(config.backends[1].max_connections, 10);
    }

    #[test]
    fn minimal_document_uses_defaults() {
        let config = Config::from_toml_str("[[backends]]\nurl = \"http://a:1\"\n").unwrap();
        assert_eq!(
            config,
            Config {
                backends: config.backends.clone(),
                ..Config::default()
            }
        );
    }

    #[test]
    fn reports_every_problem() {
        let err = Config::from_toml_str(
            r#"
            workers = 0
            [circuit_breaker]
            threshold = 0
            [[backends]]
            url = "ftp://files"
            "#,
        )
        .unwrap_err();
        let ConfigError::Invalid(msg) = err else {
            panic!("unexpected error: {err}");
        };
        assert!(msg.contains("workers"), "{msg}");
        assert!(msg.contains("threshold"), "{msg}");
        assert!(msg.contains("http scheme"), "{msg}");
    }

    #[test]
    fn empty_backends_rejected() {
        assert!(matches!(Config::from_toml_str(""), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_strategy_is_a_parse_error() {
        let err = Config::from_toml_str("strategy = \"fastest\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn retry_config_converts() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy, RetryPolicy::default());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
