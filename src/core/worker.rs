//! Worker pool implementation for anvilq.
//!
//! The pool runs a fixed number of executors. Each executor loops: ask the
//! weighted scheduler for a queue order, lease one task from the broker,
//! run its handler on a separate task (so a panic only fails that attempt),
//! then ack, requeue or dead-letter it. A shutdown signal stops executors
//! from leasing; work already in flight is allowed to finish until the
//! shutdown timeout, after which it is abandoned and its lease left to
//! expire at the broker.

use crate::broker::{Lease, RequeueOutcome, SharedBroker};
use crate::config::WorkerConfig;
use crate::core::registry::{HandlerRegistry, TaskContext};
use crate::core::scheduler::WeightedScheduler;
use crate::error::{AnvilError, AnvilResult};
use crate::events::{TaskEvent, TaskEventKind, Tracer};
use crate::utils::calculate_backoff;
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, sleep, timeout};

/// Snapshot of the pool counters
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Executors currently running
    pub active_executors: usize,
    /// Handlers currently running
    pub in_flight: usize,
    /// Tasks acked
    pub succeeded: u64,
    /// Failed attempts that were requeued
    pub failed: u64,
    /// Tasks dead-lettered by this pool
    pub dead_lettered: u64,
    /// Broker calls that failed
    pub broker_errors: u64,
    /// Whether the broker has failed `broker_failure_threshold` times in a row
    pub broker_degraded: bool,
}

/// Outcome of [`WorkerPool::shutdown`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every executor finished before the timeout
    pub clean: bool,
    /// Handlers still running when the timeout hit; their tasks are redelivered once the lease expires
    pub abandoned: usize,
    /// Time spent waiting for executors
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct PoolCounters {
    active_executors: AtomicUsize,
    in_flight: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    broker_errors: AtomicU64,
    broker_degraded: AtomicBool,
}

/// Decrements a gauge when dropped, including when its task is aborted.
struct GaugeGuard<'a>(&'a AtomicUsize);

impl<'a> GaugeGuard<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Aborts the handler task if its executor goes away first.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Shared state of every executor
struct Shared {
    config: WorkerConfig,
    broker: SharedBroker,
    registry: Arc<HandlerRegistry>,
    tracer: Arc<dyn Tracer>,
    scheduler: Mutex<WeightedScheduler>,
    counters: PoolCounters,
}

/// Single executor loop
struct Executor {
    id: usize,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
}

impl Executor {
    async fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let _active = GaugeGuard::enter(&shared.counters.active_executors);
        tracing::info!("🔨 Executor {} starting", self.id);

        let idle_initial = Duration::from_millis(shared.config.idle_backoff_ms);
        let idle_max = Duration::from_millis(shared.config.max_idle_backoff_ms);
        let lease_duration = shared.config.lease_duration();
        let mut empty_count = 0u32;
        let mut failure_count = 0u32;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let order = shared.scheduler.lock().await.ordered_queues();
            // Shutdown may have been signalled while waiting for the scheduler
            if *self.shutdown.borrow() {
                break;
            }
            match shared.broker.lease(&order, lease_duration).await {
                Ok(Some(lease)) => {
                    empty_count = 0;
                    self.broker_recovered(&mut failure_count);
                    shared
                        .scheduler
                        .lock()
                        .await
                        .record_served(&lease.handle.queue);
                    self.process(lease).await;
                }
                Ok(None) => {
                    empty_count = empty_count.saturating_add(1);
                    self.broker_recovered(&mut failure_count);
                    let backoff = calculate_backoff(empty_count, idle_initial, idle_max);
                    tracing::trace!(
                        "🔨 Executor {} no tasks available, backing off {:?}",
                        self.id,
                        backoff
                    );
                    if !self.pause(backoff).await {
                        break;
                    }
                }
                Err(e) => {
                    failure_count = failure_count.saturating_add(1);
                    self.broker_failed(failure_count, &e);
                    let backoff = calculate_backoff(failure_count, idle_initial, idle_max);
                    if !self.pause(backoff).await {
                        break;
                    }
                }
            }
        }

        tracing::info!("🔨 Executor {} stopped", self.id);
    }

    /// Sleep for `duration` unless shutdown is signalled first.
    /// Returns `false` if the executor should stop.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = sleep(duration) => !*self.shutdown.borrow(),
            changed = self.shutdown.changed() => changed.is_ok() && !*self.shutdown.borrow(),
        }
    }

    fn broker_failed(&self, consecutive: u32, error: &AnvilError) {
        let counters = &self.shared.counters;
        counters.broker_errors.fetch_add(1, Ordering::Relaxed);

        if consecutive == self.shared.config.broker_failure_threshold {
            counters.broker_degraded.store(true, Ordering::Relaxed);
            tracing::error!(
                "🔨 Executor {}: broker failed {} times in a row: {}",
                self.id,
                consecutive,
                error
            );
        } else {
            tracing::warn!("🔨 Executor {}: lease failed: {}", self.id, error);
        }
    }

    fn broker_recovered(&self, failure_count: &mut u32) {
        if *failure_count > 0 {
            if *failure_count >= self.shared.config.broker_failure_threshold {
                tracing::info!("🔨 Executor {}: broker reachable again", self.id);
            }
            *failure_count = 0;
            self.shared
                .counters
                .broker_degraded
                .store(false, Ordering::Relaxed);
        }
    }

    /// Run the handler for one lease and settle the task with the broker.
    async fn process(&self, lease: Lease) {
        let shared = &self.shared;
        let _in_flight = GaugeGuard::enter(&shared.counters.in_flight);
        let Lease { task, handle } = lease;

        shared
            .tracer
            .record(&TaskEvent::new(TaskEventKind::Leased, &task));
        tracing::debug!(
            "🔨 Executor {} forging task {} ({}) attempt {}",
            self.id,
            task.id,
            task.task_type,
            task.attempts
        );

        let task_timeout = shared.config.task_timeout();
        let started = Instant::now();
        let ctx = TaskContext::for_task(&task, Some(started + task_timeout));
        let registry = Arc::clone(&shared.registry);
        let job = task.clone();

        let join = tokio::spawn(async move { registry.dispatch(&job, ctx).await });
        let _abort = AbortOnDrop(join.abort_handle());

        let result = match timeout(task_timeout, join).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(AnvilError::handler_msg(format!(
                "handler panicked: {join_error}"
            ))),
            Err(_) => Err(AnvilError::Timeout {
                timeout_ms: task_timeout.as_millis() as u64,
            }),
        };
        let elapsed = started.elapsed();

        match result {
            Ok(()) => match shared.broker.ack(&handle).await {
                Ok(()) => {
                    shared.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    shared.tracer.record(
                        &TaskEvent::new(TaskEventKind::Acked, &task).with_duration(elapsed),
                    );
                }
                Err(e) => self.settle_failed("ack", &task.id, &e),
            },
            Err(error) if !error.is_retryable() => {
                let message = error.to_string();
                match shared.broker.dead_letter(&handle, &message).await {
                    Ok(()) => {
                        shared.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                        shared.tracer.record(
                            &TaskEvent::new(TaskEventKind::DeadLettered, &task)
                                .with_duration(elapsed)
                                .with_error(message),
                        );
                    }
                    Err(e) => self.settle_failed("dead-letter", &task.id, &e),
                }
            }
            Err(error) => {
                let message = error.to_string();
                let backoff = shared.broker.retry_policy().backoff(task.attempts);
                match shared.broker.requeue(&handle, backoff, &message).await {
                    Ok(RequeueOutcome::Requeued) => {
                        shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("🔨 Task {} retrying in {:?}", task.id, backoff);
                        shared.tracer.record(
                            &TaskEvent::new(TaskEventKind::Requeued, &task)
                                .with_duration(elapsed)
                                .with_error(message),
                        );
                    }
                    Ok(RequeueOutcome::DeadLettered) => {
                        shared.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                        shared.tracer.record(
                            &TaskEvent::new(TaskEventKind::DeadLettered, &task)
                                .with_duration(elapsed)
                                .with_error(message),
                        );
                    }
                    Ok(RequeueOutcome::Stale) => {
                        tracing::warn!(
                            "🔨 Task {} lost its lease before it could be requeued",
                            task.id
                        );
                    }
                    Err(e) => self.settle_failed("requeue", &task.id, &e),
                }
            }
        }
    }

    /// The lease stays with the broker and expires; the task is redelivered.
    fn settle_failed(&self, operation: &str, task_id: &str, error: &AnvilError) {
        self.shared
            .counters
            .broker_errors
            .fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            "🔨 Executor {}: {} of task {} failed, lease will expire: {}",
            self.id,
            operation,
            task_id,
            error
        );
    }
}

/// Fixed-size pool of executors sharing one broker and one registry.
pub struct WorkerPool {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl WorkerPool {
    /// Create a pool; nothing runs until [`WorkerPool::start`].
    pub fn new(
        config: WorkerConfig,
        broker: SharedBroker,
        registry: Arc<HandlerRegistry>,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        let scheduler = WeightedScheduler::new(&config.queues);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                config,
                broker,
                registry,
                tracer,
                scheduler: Mutex::new(scheduler),
                counters: PoolCounters::default(),
            }),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the executors. A pool can only be started once.
    pub async fn start(&self) -> AnvilResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AnvilError::AlreadyRunning);
        }

        let concurrency = self.shared.config.concurrency;
        let mut handles = self.handles.lock().await;
        for id in 0..concurrency {
            let executor = Executor {
                id,
                shared: Arc::clone(&self.shared),
                shutdown: self.shutdown_tx.subscribe(),
            };
            handles.push(tokio::spawn(executor.run()));
        }

        tracing::info!(
            "🔨 Worker pool started: {} executors on queues {:?}",
            concurrency,
            self.shared.config.queue_names()
        );
        Ok(())
    }

    /// Stop leasing and wait for in-flight handlers, up to the shutdown timeout.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_tx.send_replace(true);

        let handles = std::mem::take(&mut *self.handles.lock().await);
        let started = Instant::now();
        if handles.is_empty() {
            return ShutdownReport {
                clean: true,
                abandoned: 0,
                elapsed: Duration::ZERO,
            };
        }

        let shutdown_timeout = self.shared.config.shutdown_timeout();
        tracing::info!(
            "🔨 Shutting down {} executors with timeout {:?}",
            handles.len(),
            shutdown_timeout
        );

        let aborts: Vec<AbortHandle> = handles.iter().map(JoinHandle::abort_handle).collect();
        let report = match timeout(shutdown_timeout, join_all(handles)).await {
            Ok(results) => {
                for (i, result) in results.into_iter().enumerate() {
                    if let Err(e) = result {
                        tracing::error!("🔨 Executor {} ended abnormally: {}", i, e);
                    }
                }
                ShutdownReport {
                    clean: true,
                    abandoned: 0,
                    elapsed: started.elapsed(),
                }
            }
            Err(_) => {
                let abandoned = self.shared.counters.in_flight.load(Ordering::SeqCst);
                for abort in aborts {
                    abort.abort();
                }
                tracing::warn!(
                    "🔨 Shutdown timed out, abandoning {} in-flight tasks",
                    abandoned
                );
                ShutdownReport {
                    clean: false,
                    abandoned,
                    elapsed: started.elapsed(),
                }
            }
        };

        tracing::info!("🔨 Worker pool shutdown complete: {:?}", report);
        report
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let counters = &self.shared.counters;
        PoolStats {
            active_executors: counters.active_executors.load(Ordering::SeqCst),
            in_flight: counters.in_flight.load(Ordering::SeqCst),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            dead_lettered: counters.dead_lettered.load(Ordering::Relaxed),
            broker_errors: counters.broker_errors.load(Ordering::Relaxed),
            broker_degraded: counters.broker_degraded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerStats, InMemoryBroker, LeaseHandle};
    use crate::config::{BrokerConfig, RetryPolicy};
    use crate::events::{ChannelTracer, CompositeTracer};
    use crate::task::{Task, TaskId, TaskState};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::future::Future;

    fn worker_config(concurrency: usize) -> WorkerConfig {
        WorkerConfig {
            concurrency,
            idle_backoff_ms: 5,
            max_idle_backoff_ms: 20,
            shutdown_timeout_secs: 5,
            ..WorkerConfig::default()
        }
    }

    fn memory_broker() -> Arc<InMemoryBroker> {
        Arc::new(InMemoryBroker::with_config(
            BrokerConfig::in_memory().with_retry_policy(RetryPolicy::fixed(3, 10)),
        ))
    }

    fn pool(
        config: WorkerConfig,
        broker: SharedBroker,
        registry: HandlerRegistry,
    ) -> WorkerPool {
        WorkerPool::new(
            config,
            broker,
            Arc::new(registry),
            Arc::new(CompositeTracer::new()),
        )
    }

    async fn wait_for<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition().await {
            assert!(Instant::now() < deadline, "condition not met in time");
            sleep(Duration::from_millis(5)).await;
        }
    }

    async fn broker_stats(broker: &Arc<InMemoryBroker>) -> BrokerStats {
        broker.stats().await.unwrap()
    }

    fn counting_registry(task_type: &str, calls: Arc<AtomicU32>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(task_type, move |_ctx, _payload| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_each_task_processed_once() {
        let broker = memory_broker();
        let calls = Arc::new(AtomicU32::new(0));
        let pool = pool(
            worker_config(4),
            broker.clone(),
            counting_registry("count", calls.clone()),
        );

        for i in 0..50 {
            let queue = ["critical", "default", "low"][i % 3];
            broker
                .enqueue(Task::new("count", Vec::new()).on_queue(queue))
                .await
                .unwrap();
        }

        pool.start().await.unwrap();
        wait_for(|| async { broker_stats(&broker).await.acked == 50 }).await;

        let report = pool.shutdown().await;
        assert!(report.clean);
        assert_eq!(calls.load(Ordering::SeqCst), 50);
        assert_eq!(pool.stats().succeeded, 50);
        assert_eq!(pool.stats().active_executors, 0);
    }

    #[tokio::test]
    async fn test_failing_task_dead_lettered_after_retries() {
        let broker = memory_broker();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("flaky", move |_ctx, _payload| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AnvilError::handler_msg("smtp unavailable"))
                }
            })
            .unwrap();

        let (tracer, mut events) = ChannelTracer::channel(64);
        let pool = WorkerPool::new(
            worker_config(1),
            broker.clone(),
            Arc::new(registry),
            Arc::new(tracer),
        );

        let id = broker
            .enqueue(Task::new("flaky", Vec::new()).with_max_retries(3))
            .await
            .unwrap();
        pool.start().await.unwrap();
        wait_for(|| async { broker_stats(&broker).await.dead == 1 }).await;
        pool.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let task = broker.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::DeadLettered);
        assert_eq!(task.attempts, 3);
        assert!(task.last_error.unwrap().contains("smtp unavailable"));

        let stats = pool.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.dead_lettered, 1);

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(
            kinds,
            vec![
                TaskEventKind::Leased,
                TaskEventKind::Requeued,
                TaskEventKind::Leased,
                TaskEventKind::Requeued,
                TaskEventKind::Leased,
                TaskEventKind::DeadLettered,
            ]
        );
    }

    #[tokio::test]
    async fn test_decode_error_inside_handler_is_retried() {
        let broker = memory_broker();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("upstream", move |_ctx, _payload| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    // A gateway answered with HTML instead of JSON
                    let status: AnvilResult<u32> =
                        serde_json::from_slice(b"<html>502</html>").map_err(AnvilError::from);
                    status.map(|_| ())
                }
            })
            .unwrap();
        let pool = pool(worker_config(1), broker.clone(), registry);

        let id = broker
            .enqueue(Task::new("upstream", Vec::new()).with_max_retries(3))
            .await
            .unwrap();
        pool.start().await.unwrap();
        wait_for(|| async { broker_stats(&broker).await.dead == 1 }).await;
        pool.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let task = broker.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.attempts, 3);
        assert_eq!(pool.stats().failed, 2);
    }

    #[tokio::test]
    async fn test_undecodable_json_payload_not_retried() {
        #[derive(serde::Deserialize)]
        struct Order {
            _id: u64,
        }

        let broker = memory_broker();
        let mut registry = HandlerRegistry::new();
        registry
            .register_json("order", |_ctx, _order: Order| async { Ok(()) })
            .unwrap();
        let pool = pool(worker_config(1), broker.clone(), registry);

        let id = broker
            .enqueue(Task::new("order", b"not json".to_vec()).with_max_retries(3))
            .await
            .unwrap();
        pool.start().await.unwrap();
        wait_for(|| async { broker_stats(&broker).await.dead == 1 }).await;
        pool.shutdown().await;

        let task = broker.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.attempts, 1);
        assert!(task.last_error.unwrap().contains("Invalid payload"));
    }

    #[tokio::test]
    async fn test_unknown_task_type_not_retried() {
        let broker = memory_broker();
        let pool = pool(worker_config(1), broker.clone(), HandlerRegistry::new());

        let id = broker
            .enqueue(Task::new("mystery", Vec::new()))
            .await
            .unwrap();
        pool.start().await.unwrap();
        wait_for(|| async { broker_stats(&broker).await.dead == 1 }).await;
        pool.shutdown().await;

        let task = broker.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.attempts, 1);
        assert!(task.last_error.unwrap().contains("mystery"));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let broker = memory_broker();
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = counting_registry("ok", calls.clone());
        registry
            .register_fn("boom", |_ctx, _payload| async {
                if true {
                    panic!("handler exploded");
                }
                Ok(())
            })
            .unwrap();
        let pool = pool(worker_config(1), broker.clone(), registry);

        broker
            .enqueue(Task::new("boom", Vec::new()).with_max_retries(1))
            .await
            .unwrap();
        broker.enqueue(Task::new("ok", Vec::new())).await.unwrap();

        pool.start().await.unwrap();
        wait_for(|| async {
            let stats = broker_stats(&broker).await;
            stats.dead == 1 && stats.acked == 1
        })
        .await;

        assert_eq!(pool.stats().active_executors, 1);
        let dead = broker.dead_letters(None).await.unwrap();
        assert!(dead[0].last_error.as_deref().unwrap().contains("panicked"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_timeout_fails_attempt() {
        let broker = memory_broker();
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("slow", |_ctx, _payload| async {
                sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .unwrap();
        let pool = pool(worker_config(1).with_task_timeout(1), broker.clone(), registry);

        broker
            .enqueue(Task::new("slow", Vec::new()).with_max_retries(1))
            .await
            .unwrap();
        pool.start().await.unwrap();
        wait_for(|| async { broker_stats(&broker).await.dead == 1 }).await;
        pool.shutdown().await;

        let dead = broker.dead_letters(None).await.unwrap();
        assert!(dead[0].last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_finishes_in_flight() {
        let broker = memory_broker();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("steady", move |_ctx, _payload| {
                let flag = flag.clone();
                async move {
                    sleep(Duration::from_millis(200)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        let pool = pool(worker_config(2), broker.clone(), registry);

        broker.enqueue(Task::new("steady", Vec::new())).await.unwrap();
        pool.start().await.unwrap();
        wait_for(|| async { pool.stats().in_flight == 1 }).await;

        let report = pool.shutdown().await;
        assert!(report.clean);
        assert_eq!(report.abandoned, 0);
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(broker_stats(&broker).await.acked, 1);
    }

    #[tokio::test]
    async fn test_shutdown_timeout_abandons_task() {
        let broker = memory_broker();
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("stuck", |_ctx, _payload| async {
                sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .unwrap();
        let pool = pool(
            worker_config(1).with_shutdown_timeout(1),
            broker.clone(),
            registry,
        );

        let id = broker.enqueue(Task::new("stuck", Vec::new())).await.unwrap();
        pool.start().await.unwrap();
        wait_for(|| async { pool.stats().in_flight == 1 }).await;

        let report = pool.shutdown().await;
        assert!(!report.clean);
        assert_eq!(report.abandoned, 1);

        // Still leased; redelivered once the lease expires
        let task = broker.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Leased);
        wait_for(|| async { pool.stats().active_executors == 0 }).await;
    }

    #[tokio::test]
    async fn test_no_leases_after_shutdown() {
        let broker = memory_broker();
        let calls = Arc::new(AtomicU32::new(0));
        let pool = pool(
            worker_config(2),
            broker.clone(),
            counting_registry("count", calls.clone()),
        );

        pool.start().await.unwrap();
        assert!(pool.shutdown().await.clean);
        assert!(pool.is_shutting_down());

        broker.enqueue(Task::new("count", Vec::new())).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(broker_stats(&broker).await.pending, 1);
        assert!(matches!(pool.start().await, Err(AnvilError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_for_scheduler_skips_lease() {
        let broker = memory_broker();
        let calls = Arc::new(AtomicU32::new(0));
        let pool = pool(
            worker_config(1),
            broker.clone(),
            counting_registry("count", calls.clone()),
        );
        broker.enqueue(Task::new("count", Vec::new())).await.unwrap();

        let scheduler = pool.shared.scheduler.lock().await;
        pool.start().await.unwrap();
        wait_for(|| async { pool.stats().active_executors == 1 }).await;
        sleep(Duration::from_millis(20)).await;

        pool.shutdown_tx.send_replace(true);
        drop(scheduler);
        assert!(pool.shutdown().await.clean);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let stats = broker_stats(&broker).await;
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.leased, 0);
    }

    /// Fails the first `failures` lease calls.
    struct FlakyBroker {
        inner: InMemoryBroker,
        failures: AtomicU32,
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn enqueue(&self, task: Task) -> AnvilResult<TaskId> {
            self.inner.enqueue(task).await
        }

        async fn lease(
            &self,
            queues: &[String],
            lease_duration: Duration,
        ) -> AnvilResult<Option<Lease>> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(AnvilError::unavailable("connection refused"));
            }
            self.inner.lease(queues, lease_duration).await
        }

        async fn ack(&self, handle: &LeaseHandle) -> AnvilResult<()> {
            self.inner.ack(handle).await
        }

        async fn requeue(
            &self,
            handle: &LeaseHandle,
            backoff: Duration,
            error: &str,
        ) -> AnvilResult<RequeueOutcome> {
            self.inner.requeue(handle, backoff, error).await
        }

        async fn dead_letter(&self, handle: &LeaseHandle, error: &str) -> AnvilResult<()> {
            self.inner.dead_letter(handle, error).await
        }

        async fn dead_letters(&self, limit: Option<usize>) -> AnvilResult<Vec<Task>> {
            self.inner.dead_letters(limit).await
        }

        async fn get_task(&self, task_id: &TaskId) -> AnvilResult<Option<Task>> {
            self.inner.get_task(task_id).await
        }

        async fn stats(&self) -> AnvilResult<BrokerStats> {
            self.inner.stats().await
        }

        async fn purge(&self) -> AnvilResult<u64> {
            self.inner.purge().await
        }

        async fn health_check(&self) -> AnvilResult<()> {
            self.inner.health_check().await
        }

        async fn close(&self) -> AnvilResult<()> {
            self.inner.close().await
        }

        fn retry_policy(&self) -> &RetryPolicy {
            self.inner.retry_policy()
        }
    }

    #[tokio::test]
    async fn test_pool_survives_broker_outage() {
        let broker = Arc::new(FlakyBroker {
            inner: InMemoryBroker::new(),
            failures: AtomicU32::new(6),
        });
        let calls = Arc::new(AtomicU32::new(0));
        let mut config = worker_config(1);
        config.broker_failure_threshold = 3;
        let pool = pool(config, broker.clone(), counting_registry("count", calls.clone()));

        broker.enqueue(Task::new("count", Vec::new())).await.unwrap();
        pool.start().await.unwrap();
        wait_for(|| async { calls.load(Ordering::SeqCst) == 1 }).await;

        let stats = pool.stats();
        assert_eq!(stats.broker_errors, 6);
        assert!(!stats.broker_degraded);
        pool.shutdown().await;
    }
}
