//! The job service: lifecycle facade over the client and the worker pool.

use crate::broker::{BrokerFactory, SharedBroker};
use crate::config::AnvilConfig;
use crate::core::client::JobClient;
use crate::core::registry::{HandlerRegistry, TaskContext, TaskHandler};
use crate::core::worker::{PoolStats, ShutdownReport, WorkerPool};
use crate::error::{AnvilError, AnvilResult};
use crate::events::{CompositeTracer, LogTracer, Tracer};
use crate::task::{EnqueueOptions, TaskId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Instant, sleep, timeout_at};

#[cfg(feature = "metrics")]
use crate::metrics::AnvilMetrics;

/// Lifecycle state of a [`JobService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Built; handlers may be registered
    Created,
    /// Worker pool running
    Running,
    /// Shutting down
    Stopping,
    /// Stopped for good; the broker connection is released
    Stopped,
}

/// Owns the producer client and the worker pool.
///
/// # Examples
///
/// ```rust,no_run
/// use anvilq::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> AnvilResult<()> {
///     let mut service = JobService::new(AnvilConfig::default()).await?;
///     service.register_fn("ping", |_ctx, _payload| async { Ok(()) })?;
///
///     service.start().await?;
///     service
///         .enqueue("ping", Vec::new(), EnqueueOptions::default())
///         .await?;
///     service.stop().await?;
///     Ok(())
/// }
/// ```
pub struct JobService {
    config: AnvilConfig,
    broker: SharedBroker,
    client: JobClient,
    registry: Arc<HandlerRegistry>,
    tracers: Vec<Arc<dyn Tracer>>,
    state: RwLock<ServiceState>,
    /// Serializes start and stop
    lifecycle: Mutex<()>,
    pool: Mutex<Option<WorkerPool>>,
    last_shutdown: Mutex<Option<ShutdownReport>>,
    #[cfg(feature = "metrics")]
    metrics: Option<AnvilMetrics>,
}

impl JobService {
    /// Create a service with the broker selected by the configuration.
    pub async fn new(config: AnvilConfig) -> AnvilResult<Self> {
        config.ensure_valid()?;
        let broker = BrokerFactory::from_config(config.broker.clone()).await?;
        Self::with_broker(config, broker)
    }

    /// Create a service on top of an existing broker.
    pub fn with_broker(config: AnvilConfig, broker: SharedBroker) -> AnvilResult<Self> {
        config.ensure_valid()?;

        #[cfg(feature = "metrics")]
        let metrics = if config.metrics.enabled {
            Some(AnvilMetrics::new(&config.metrics.namespace)?)
        } else {
            None
        };

        Ok(Self {
            client: JobClient::new(Arc::clone(&broker)),
            broker,
            registry: Arc::new(HandlerRegistry::new()),
            tracers: Vec::new(),
            state: RwLock::new(ServiceState::Created),
            lifecycle: Mutex::new(()),
            pool: Mutex::new(None),
            last_shutdown: Mutex::new(None),
            #[cfg(feature = "metrics")]
            metrics,
            config,
        })
    }

    fn registry_mut(&mut self) -> AnvilResult<&mut HandlerRegistry> {
        match *self.state.get_mut() {
            ServiceState::Created => {}
            ServiceState::Stopped => return Err(AnvilError::AlreadyStopped),
            ServiceState::Running | ServiceState::Stopping => {
                return Err(AnvilError::AlreadyRunning);
            }
        }
        Arc::get_mut(&mut self.registry).ok_or(AnvilError::AlreadyRunning)
    }

    /// Register a handler. Only allowed before [`JobService::start`].
    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> AnvilResult<()> {
        self.registry_mut()?.register(task_type, handler)
    }

    /// Register an async closure over the raw payload.
    pub fn register_fn<F, Fut>(&mut self, task_type: impl Into<String>, f: F) -> AnvilResult<()>
    where
        F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AnvilResult<()>> + Send + 'static,
    {
        self.registry_mut()?.register_fn(task_type, f)
    }

    /// Register an async closure over the JSON-decoded payload.
    pub fn register_json<T, F, Fut>(
        &mut self,
        task_type: impl Into<String>,
        f: F,
    ) -> AnvilResult<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(TaskContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AnvilResult<()>> + Send + 'static,
    {
        self.registry_mut()?.register_json(task_type, f)
    }

    /// Add a tracer after the built-in ones. Only allowed before start.
    pub fn add_tracer(&mut self, tracer: Arc<dyn Tracer>) -> AnvilResult<()> {
        self.registry_mut()?;
        self.tracers.push(tracer);
        Ok(())
    }

    /// Start the worker pool.
    ///
    /// Fails with [`AnvilError::Startup`] if the broker does not answer
    /// within the startup timeout; the service then stays `Created`.
    pub async fn start(&self) -> AnvilResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        match *self.state.read().await {
            ServiceState::Created => {}
            ServiceState::Stopped => return Err(AnvilError::AlreadyStopped),
            ServiceState::Running | ServiceState::Stopping => {
                return Err(AnvilError::AlreadyRunning);
            }
        }

        self.wait_for_broker().await?;

        if self.registry.is_empty() {
            tracing::warn!("🔨 Starting job service without any registered handler");
        }

        let pool = WorkerPool::new(
            self.config.workers.clone(),
            Arc::clone(&self.broker),
            Arc::clone(&self.registry),
            self.build_tracer(),
        );
        pool.start().await?;
        *self.pool.lock().await = Some(pool);
        *self.state.write().await = ServiceState::Running;

        tracing::info!(
            "🔨 Job service started with {} workers, handlers: {:?}",
            self.config.workers.concurrency,
            self.registry.task_types()
        );
        Ok(())
    }

    /// Retry the broker health check until it answers or the startup timeout passes.
    async fn wait_for_broker(&self) -> AnvilResult<()> {
        let startup_timeout = self.config.broker.startup_timeout();
        let deadline = Instant::now() + startup_timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let error = match timeout_at(deadline, self.broker.health_check()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => AnvilError::Timeout {
                    timeout_ms: startup_timeout.as_millis() as u64,
                },
            };

            let now = Instant::now();
            if now >= deadline {
                tracing::error!(
                    "🔨 Broker unreachable after {} attempts: {}",
                    attempt,
                    error
                );
                return Err(AnvilError::startup(
                    format!("broker unreachable within {:?}", startup_timeout),
                    Some(error),
                ));
            }

            tracing::warn!("🔨 Broker health check failed (attempt {}): {}", attempt, error);
            sleep(Duration::from_millis(100).min(deadline - now)).await;
        }
    }

    fn build_tracer(&self) -> Arc<dyn Tracer> {
        let mut tracer = CompositeTracer::new();
        if self.config.logging.task_events {
            tracer.push(Arc::new(LogTracer));
        }
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            tracer.push(Arc::new(metrics.clone()));
        }
        for extra in &self.tracers {
            tracer.push(Arc::clone(extra));
        }
        Arc::new(tracer)
    }

    /// Stop the worker pool gracefully and release the broker.
    ///
    /// Calling `stop` again once stopped is a no-op.
    pub async fn stop(&self) -> AnvilResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut state = self.state.write().await;
            if *state == ServiceState::Stopped {
                return Ok(());
            }
            *state = ServiceState::Stopping;
        }

        let pool = self.pool.lock().await.take();
        if let Some(pool) = pool {
            let report = pool.shutdown().await;
            if !report.clean {
                tracing::warn!(
                    "🔨 {} tasks abandoned; they will be redelivered when their lease expires",
                    report.abandoned
                );
            }
            *self.last_shutdown.lock().await = Some(report);
        }

        let closed = self.broker.close().await;
        *self.state.write().await = ServiceState::Stopped;
        tracing::info!("🔨 Job service stopped");
        closed
    }

    /// Start, wait for Ctrl+C, then stop.
    pub async fn run_until_signal(&self) -> AnvilResult<()> {
        self.start().await?;
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("🔨 Failed to listen for the shutdown signal: {}", e);
        } else {
            tracing::info!("🔨 Shutdown signal received");
        }
        self.stop().await
    }

    /// Enqueue a task with a raw payload.
    pub async fn enqueue(
        &self,
        task_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        opts: EnqueueOptions,
    ) -> AnvilResult<TaskId> {
        self.client.enqueue(task_type, payload, opts).await
    }

    /// Enqueue a task with a JSON payload.
    pub async fn enqueue_json<T: Serialize>(
        &self,
        task_type: impl Into<String>,
        value: &T,
        opts: EnqueueOptions,
    ) -> AnvilResult<TaskId> {
        self.client.enqueue_json(task_type, value, opts).await
    }

    /// A producer handle that outlives the service's pool.
    pub fn client(&self) -> JobClient {
        self.client.clone()
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ServiceState {
        *self.state.read().await
    }

    /// Pool statistics while running.
    pub async fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.lock().await.as_ref().map(WorkerPool::stats)
    }

    /// Report of the last shutdown, once stopped.
    pub async fn shutdown_report(&self) -> Option<ShutdownReport> {
        self.last_shutdown.lock().await.clone()
    }

    /// Metrics collected by the built-in Prometheus tracer.
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub fn metrics(&self) -> Option<&AnvilMetrics> {
        self.metrics.as_ref()
    }

    /// Get the configuration used by this service.
    pub fn config(&self) -> &AnvilConfig {
        &self.config
    }
}

impl Drop for JobService {
    fn drop(&mut self) {
        if *self.state.get_mut() == ServiceState::Running {
            tracing::warn!(
                "🔨 JobService dropped while running. Call stop() explicitly for graceful shutdown."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, InMemoryBroker};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn testing_config() -> AnvilConfig {
        let mut config = AnvilConfig::testing();
        config.workers.concurrency = 2;
        config
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let mut service = JobService::new(testing_config()).await.unwrap();
        assert_eq!(service.state().await, ServiceState::Created);
        assert_ok!(service.register_fn("noop", |_ctx, _payload| async { Ok(()) }));

        assert_ok!(service.start().await);
        assert_eq!(service.state().await, ServiceState::Running);
        assert!(matches!(
            service.start().await,
            Err(AnvilError::AlreadyRunning)
        ));
        assert!(service.pool_stats().await.is_some());

        assert_ok!(service.stop().await);
        assert_eq!(service.state().await, ServiceState::Stopped);
        assert!(service.shutdown_report().await.unwrap().clean);

        // Idempotent
        assert_ok!(service.stop().await);
        assert!(matches!(
            service.start().await,
            Err(AnvilError::AlreadyStopped)
        ));
        assert!(matches!(
            service.register_fn("late", |_ctx, _payload| async { Ok(()) }),
            Err(AnvilError::AlreadyStopped)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_handler_surfaced_at_registration() {
        let mut service = JobService::new(testing_config()).await.unwrap();
        assert_ok!(service.register_fn("a", |_ctx, _payload| async { Ok(()) }));
        let err = assert_err!(service.register_fn("a", |_ctx, _payload| async { Ok(()) }));
        assert!(matches!(err, AnvilError::DuplicateHandler { .. }));
    }

    #[tokio::test]
    async fn test_startup_fails_when_broker_unreachable() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.close().await.unwrap();

        let service = JobService::with_broker(testing_config(), broker).unwrap();
        let err = assert_err!(service.start().await);
        assert!(matches!(err, AnvilError::Startup { .. }));
        assert_eq!(service.state().await, ServiceState::Created);
        assert!(service.pool_stats().await.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_without_running_pool() {
        let service = JobService::new(testing_config()).await.unwrap();
        let id = service
            .enqueue("later", b"{}".to_vec(), EnqueueOptions::queue("low"))
            .await
            .unwrap();

        let task = service.client().get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.queue, "low");
        assert_eq!(task.max_retries, Some(3));
    }

    #[tokio::test]
    async fn test_processes_tasks_until_stopped() {
        let broker: Arc<InMemoryBroker> = Arc::new(InMemoryBroker::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut service = JobService::with_broker(testing_config(), broker.clone()).unwrap();
        service
            .register_fn("count", move |_ctx, _payload| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        service.start().await.unwrap();

        for _ in 0..5 {
            service
                .enqueue("count", Vec::new(), EnqueueOptions::default())
                .await
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while broker.stats().await.unwrap().acked < 5 {
            assert!(Instant::now() < deadline, "tasks not processed in time");
            sleep(Duration::from_millis(10)).await;
        }

        service.stop().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // The broker is released on stop
        assert!(broker.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let service = JobService::new(testing_config()).await.unwrap();
        assert_ok!(service.stop().await);
        assert_eq!(service.state().await, ServiceState::Stopped);
        assert!(service.shutdown_report().await.is_none());
    }
}
