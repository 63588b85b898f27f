//! Configuration types for anvilq.
//!
//! This module contains all configuration structures used throughout anvilq:
//! the worker pool and its weighted queue set, the broker backend with its
//! retry policy, and logging.

use crate::error::{AnvilError, AnvilResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Name of the queue used when a producer does not pick one.
pub const DEFAULT_QUEUE: &str = "default";

/// Main configuration for anvilq.
///
/// # Examples
///
/// ```rust
/// use anvilq::config::{AnvilConfig, QueueSpec, WorkerConfig};
///
/// // Use default configuration
/// let config = AnvilConfig::default();
///
/// // Custom configuration
/// let config = AnvilConfig {
///     workers: WorkerConfig::with_concurrency(4).with_queues(vec![
///         QueueSpec::new("critical", 6),
///         QueueSpec::new("default", 3),
///     ]),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnvilConfig {
    /// Worker pool configuration
    pub workers: WorkerConfig,

    /// Broker backend configuration
    pub broker: BrokerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Prometheus metrics configuration
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub metrics: MetricsConfig,
}

/// A named queue and its relative share of worker attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    /// Unique queue name
    pub name: String,
    /// Positive weight; a queue with weight 6 is served six times as often as one with weight 1
    pub weight: u32,
}

impl QueueSpec {
    /// Create a queue spec.
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum number of simultaneously executing tasks
    pub concurrency: usize,

    /// Queues served by the pool, with their weights
    pub queues: Vec<QueueSpec>,

    /// How long a leased task stays invisible to other workers (in seconds)
    pub lease_duration_secs: u64,

    /// Maximum time a handler may run (in seconds); capped just below the lease duration
    pub task_timeout_secs: Option<u64>,

    /// Time to wait for in-flight tasks on shutdown (in seconds)
    pub shutdown_timeout_secs: u64,

    /// First sleep after finding every queue empty (in milliseconds)
    pub idle_backoff_ms: u64,

    /// Upper bound for the idle sleep (in milliseconds)
    pub max_idle_backoff_ms: u64,

    /// Consecutive broker failures before the pool reports the broker as down
    pub broker_failure_threshold: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: vec![
                QueueSpec::new("critical", 6),
                QueueSpec::new(DEFAULT_QUEUE, 3),
                QueueSpec::new("low", 1),
            ],
            lease_duration_secs: 300,       // 5 minutes
            task_timeout_secs: Some(240),   // 4 minutes
            shutdown_timeout_secs: 30,
            idle_backoff_ms: 50,
            max_idle_backoff_ms: 1000,
            broker_failure_threshold: 5,
        }
    }
}

impl WorkerConfig {
    /// Create a new worker configuration with a specific concurrency.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Replace the queue set.
    pub fn with_queues(mut self, queues: Vec<QueueSpec>) -> Self {
        self.queues = queues;
        self
    }

    /// Set the lease duration.
    pub fn with_lease_duration(mut self, secs: u64) -> Self {
        self.lease_duration_secs = secs;
        self
    }

    /// Set the handler timeout.
    pub fn with_task_timeout(mut self, secs: u64) -> Self {
        self.task_timeout_secs = Some(secs);
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, secs: u64) -> Self {
        self.shutdown_timeout_secs = secs;
        self
    }

    /// Set the idle polling backoff bounds.
    pub fn with_idle_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.idle_backoff_ms = initial_ms;
        self.max_idle_backoff_ms = max_ms;
        self
    }

    /// Lease duration as a `Duration`.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    /// Shutdown timeout as a `Duration`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Effective handler timeout: the task timeout, capped a margin below
    /// the lease so a timed-out attempt is settled before the lease expires.
    pub fn task_timeout(&self) -> Duration {
        let lease = self.lease_duration();
        let margin = Duration::from_secs(1).min(lease / 10);
        let cap = lease.saturating_sub(margin);
        self.task_timeout_secs
            .map(|secs| Duration::from_secs(secs).min(cap))
            .unwrap_or(cap)
    }

    /// Names of the configured queues, in configuration order.
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.name.clone()).collect()
    }
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Which backend stores the queues
    pub backend: BrokerBackendConfig,

    /// Retry policy applied to failed tasks
    pub retry_policy: RetryPolicy,

    /// How long `start()` waits for the broker to answer (in seconds)
    pub startup_timeout_secs: u64,

    /// Maximum number of live tasks (0 = unlimited)
    pub max_queue_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackendConfig::InMemory,
            retry_policy: RetryPolicy::default(),
            startup_timeout_secs: 10,
            max_queue_size: 0,
        }
    }
}

impl BrokerConfig {
    /// Create configuration for the in-memory broker.
    pub fn in_memory() -> Self {
        Self {
            backend: BrokerBackendConfig::InMemory,
            ..Default::default()
        }
    }

    /// Create configuration for the Redis broker.
    #[cfg(feature = "redis-broker")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
    pub fn redis(connection_string: impl Into<String>) -> Self {
        Self {
            backend: BrokerBackendConfig::Redis(RedisConfig {
                connection_string: connection_string.into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the maximum queue size.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_queue_size = max_size;
        self
    }

    /// Startup timeout as a `Duration`.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// Broker backend-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BrokerBackendConfig {
    /// In-process broker (default); not durable across restarts
    InMemory,

    /// Redis broker
    #[cfg(feature = "redis-broker")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
    Redis(RedisConfig),
}

/// Redis broker configuration.
#[cfg(feature = "redis-broker")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    pub connection_string: String,

    /// Key prefix for every Redis key the broker touches
    pub key_prefix: String,

    /// Timeout for establishing the connection (in seconds)
    pub connect_timeout_secs: u64,
}

#[cfg(feature = "redis-broker")]
impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            connection_string: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "anvilq".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

/// Retry policy for failed tasks.
///
/// Owned by the broker; the worker pool asks it for the delay before a
/// failed task becomes visible again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts allowed when the producer does not set `max_retries`
    pub max_retries: u32,

    /// Base delay between retries (in milliseconds)
    pub base_delay_ms: u64,

    /// Maximum delay between retries (in milliseconds)
    pub max_delay_ms: u64,

    /// Backoff strategy
    pub backoff_strategy: BackoffStrategy,

    /// Whether to add up to 10% random jitter to each delay
    pub enable_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000, // 1 second
            max_delay_ms: 60000, // 1 minute
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
            enable_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy with exponential backoff.
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
            ..Default::default()
        }
    }

    /// Create a retry policy with linear backoff.
    pub fn linear(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_strategy: BackoffStrategy::Linear { increment_ms: 1000 },
            ..Default::default()
        }
    }

    /// Create a retry policy with fixed delays.
    pub fn fixed(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_strategy: BackoffStrategy::Fixed,
            enable_jitter: false,
        }
    }

    /// Dead-letter on the first failure.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Turn jitter on or off.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.enable_jitter = enabled;
        self
    }

    /// Delay before a task that has been attempted `attempts` times is retried.
    ///
    /// `attempts` counts the delivery that just failed, so the first retry
    /// waits `base_delay_ms`. Exponential backoff is
    /// `min(base * multiplier^(attempts - 1), max)`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let base = self.base_delay_ms as f64;
        let raw_ms = match &self.backoff_strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear { increment_ms } => {
                base + (*increment_ms as f64) * exponent as f64
            }
            BackoffStrategy::Exponential { multiplier } => {
                base * multiplier.powi(exponent.min(63) as i32)
            }
        };
        let capped_ms = raw_ms.min(self.max_delay_ms as f64).max(0.0) as u64;

        let delay = Duration::from_millis(capped_ms);
        if self.enable_jitter {
            crate::utils::with_jitter(delay)
        } else {
            delay
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Linear backoff (base + attempt * increment)
    Linear {
        /// Increment per attempt (in milliseconds)
        increment_ms: u64,
    },

    /// Exponential backoff (base * multiplier^attempt)
    Exponential {
        /// Multiplier for exponential growth
        multiplier: f64,
    },
}

/// Metrics and monitoring configuration.
#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Register the Prometheus tracer when the service starts
    pub enabled: bool,

    /// Prefix for every metric name
    pub namespace: String,
}

#[cfg(feature = "metrics")]
impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "anvilq".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include target module in logs
    pub include_targets: bool,

    /// Log every task lifecycle event through `tracing`
    pub task_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_targets: false,
            task_events: true,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl AnvilConfig {
    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            workers: WorkerConfig {
                concurrency: 2,
                lease_duration_secs: 60,
                task_timeout_secs: Some(30),
                ..Default::default()
            },
            broker: BrokerConfig {
                max_queue_size: 1000,
                retry_policy: RetryPolicy::exponential(3),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                include_targets: true,
                ..Default::default()
            },
            #[cfg(feature = "metrics")]
            metrics: MetricsConfig {
                enabled: false,
                ..Default::default()
            },
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        Self {
            workers: WorkerConfig {
                concurrency: num_cpus::get() * 2,
                lease_duration_secs: 600, // 10 minutes
                task_timeout_secs: Some(300),
                shutdown_timeout_secs: 60,
                ..Default::default()
            },
            broker: BrokerConfig {
                retry_policy: RetryPolicy::exponential(5),
                startup_timeout_secs: 30,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                ..Default::default()
            },
            #[cfg(feature = "metrics")]
            metrics: MetricsConfig::default(),
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            workers: WorkerConfig {
                concurrency: 1,
                lease_duration_secs: 10,
                task_timeout_secs: Some(5),
                shutdown_timeout_secs: 5,
                idle_backoff_ms: 5,
                max_idle_backoff_ms: 20,
                ..Default::default()
            },
            broker: BrokerConfig {
                max_queue_size: 1000,
                retry_policy: RetryPolicy::fixed(3, 10),
                startup_timeout_secs: 1,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_targets: true,
                ..Default::default()
            },
            #[cfg(feature = "metrics")]
            metrics: MetricsConfig {
                enabled: false,
                ..Default::default()
            },
        }
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> AnvilResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.ensure_valid()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub async fn from_json_file(path: impl AsRef<Path>) -> AnvilResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            AnvilError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Validate and fold all problems into one configuration error.
    pub fn ensure_valid(&self) -> AnvilResult<()> {
        self.validate()
            .map_err(|errors| AnvilError::config(errors.join("; ")))
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Validate worker config
        if self.workers.concurrency == 0 {
            errors.push("Concurrency must be greater than 0".to_string());
        }

        if self.workers.concurrency > 1000 {
            errors.push("Concurrency should not exceed 1000".to_string());
        }

        if self.workers.queues.is_empty() {
            errors.push("At least one queue must be configured".to_string());
        }

        let mut seen = HashSet::new();
        for queue in &self.workers.queues {
            if queue.name.is_empty() {
                errors.push("Queue names must not be empty".to_string());
            }
            if queue.weight == 0 {
                errors.push(format!("Queue '{}' must have a positive weight", queue.name));
            }
            if !seen.insert(queue.name.as_str()) {
                errors.push(format!("Queue '{}' is configured twice", queue.name));
            }
        }

        if self.workers.lease_duration_secs == 0 {
            errors.push("Lease duration must be greater than 0".to_string());
        }

        if self.workers.idle_backoff_ms == 0
            || self.workers.max_idle_backoff_ms < self.workers.idle_backoff_ms
        {
            errors.push("Idle backoff must be positive and not exceed its maximum".to_string());
        }

        // Validate retry policy
        let policy = &self.broker.retry_policy;
        if policy.base_delay_ms == 0 {
            errors.push("Retry base delay must be greater than 0".to_string());
        }

        if policy.max_delay_ms < policy.base_delay_ms {
            errors.push("Retry max delay must be greater than or equal to base delay".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AnvilConfig::default();
        assert_eq!(config.workers.concurrency, 10);
        assert_eq!(
            config.workers.queue_names(),
            vec!["critical", "default", "low"]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(AnvilConfig::development().validate().is_ok());
        assert!(AnvilConfig::production().validate().is_ok());

        let testing = AnvilConfig::testing();
        assert_eq!(testing.workers.concurrency, 1);
        assert!(matches!(testing.logging.level, LogLevel::Debug));
        assert!(testing.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AnvilConfig::default();

        config.workers.concurrency = 0;
        assert!(config.validate().is_err());
        config.workers.concurrency = 1;

        config.workers.queues = vec![QueueSpec::new("a", 1), QueueSpec::new("a", 0)];
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("positive weight")));
        assert!(errors.iter().any(|e| e.contains("configured twice")));

        config.workers.queues.clear();
        assert!(config.ensure_valid().is_err());
    }

    #[test]
    fn test_task_timeout_capped_by_lease() {
        let workers = WorkerConfig::default()
            .with_lease_duration(10)
            .with_task_timeout(60);
        assert_eq!(workers.task_timeout(), Duration::from_secs(9));

        let workers = WorkerConfig {
            task_timeout_secs: None,
            ..WorkerConfig::default().with_lease_duration(7)
        };
        assert_eq!(workers.task_timeout(), Duration::from_millis(6300));

        // Well inside the lease, the configured timeout is used as is
        let workers = WorkerConfig::default()
            .with_lease_duration(300)
            .with_task_timeout(240);
        assert_eq!(workers.task_timeout(), Duration::from_secs(240));
        let workers = WorkerConfig::default()
            .with_lease_duration(300)
            .with_task_timeout(300);
        assert_eq!(workers.task_timeout(), Duration::from_secs(299));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            ..RetryPolicy::exponential(10)
        }
        .with_jitter(false);

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_linear_and_fixed_backoff() {
        let linear = RetryPolicy::linear(3).with_jitter(false);
        assert_eq!(linear.backoff(1), Duration::from_millis(1000));
        assert_eq!(linear.backoff(3), Duration::from_millis(3000));

        let fixed = RetryPolicy::fixed(2, 250);
        assert_eq!(fixed.backoff(1), Duration::from_millis(250));
        assert_eq!(fixed.backoff(9), Duration::from_millis(250));

        assert_eq!(RetryPolicy::none().max_retries, 0);
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::fixed(3, 1000).with_jitter(true);
        for _ in 0..50 {
            let delay = policy.backoff(1);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = AnvilConfig::from_json_str(
            r#"{
                "workers": {
                    "concurrency": 4,
                    "queues": [{"name": "critical", "weight": 6}, {"name": "low", "weight": 1}]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.workers.concurrency, 4);
        assert_eq!(config.workers.queues.len(), 2);
        assert_eq!(config.workers.lease_duration_secs, 300);
        assert_eq!(config.broker.retry_policy.max_retries, 3);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        let result = AnvilConfig::from_json_str(r#"{"workers": {"concurrency": 0}}"#);
        assert!(matches!(result, Err(AnvilError::ConfigError { .. })));
    }
}
