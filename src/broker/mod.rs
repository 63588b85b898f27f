//! Broker backends for anvilq.
//!
//! A broker is the durable store behind the queues. The worker pool only
//! relies on the contract of the [`Broker`] trait:
//! - **Enqueue**: persist a task in its queue
//! - **Lease**: atomically hide one ready task from the first non-empty
//!   queue of a priority list, for a bounded time
//! - **Ack**: remove a finished task (idempotent)
//! - **Requeue**: make a failed task visible again after a backoff, or
//!   dead-letter it once its retry budget is spent
//!
//! Leases that are neither acked nor released before their deadline are
//! returned to their queue by the broker itself.
//!
//! # Examples
//!
//! ```rust,no_run
//! use anvilq::prelude::*;
//!
//! # async fn example() -> AnvilResult<()> {
//! // In-memory broker (default)
//! let broker = InMemoryBroker::new();
//!
//! // Redis broker (requires redis-broker feature)
//! # #[cfg(feature = "redis-broker")]
//! let broker = RedisBroker::new(BrokerConfig::redis("redis://localhost:6379")).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{BrokerBackendConfig, BrokerConfig, RetryPolicy};
use crate::error::AnvilResult;
use crate::task::{Task, TaskId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub mod memory;
pub use memory::InMemoryBroker;

#[cfg(feature = "redis-broker")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
pub mod redis;

#[cfg(feature = "redis-broker")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
pub use self::redis::RedisBroker;

/// Error recorded on a task whose final lease expired unacknowledged
pub const LEASE_EXPIRED: &str = "lease expired";

/// Proof of exclusive, time-bounded ownership of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseHandle {
    /// Leased task
    pub task_id: TaskId,
    /// Queue the task was leased from
    pub queue: String,
    /// Token distinguishing this lease from later leases of the same task
    pub token: String,
    /// When the broker will consider the lease abandoned
    pub deadline: Instant,
}

/// A leased task and its handle.
#[derive(Debug, Clone)]
pub struct Lease {
    /// Snapshot of the task, `attempts` already counting this delivery
    pub task: Task,
    /// Handle used to ack or requeue
    pub handle: LeaseHandle,
}

/// What `requeue` did with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Back in its queue, visible after the backoff
    Requeued,
    /// Retry budget spent; moved to the dead-letter set
    DeadLettered,
    /// The lease was no longer held; nothing changed
    Stale,
}

/// Statistics about the broker state
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    /// Tasks waiting in a queue, including delayed ones
    pub pending: u64,
    /// Tasks currently leased
    pub leased: u64,
    /// Tasks in the dead-letter set
    pub dead: u64,
    /// Tasks acked since the broker was created (or since the store was created, for Redis)
    pub acked: u64,
    /// Pending tasks per queue
    pub per_queue: BTreeMap<String, u64>,
}

/// Trait that all broker backends must implement
#[async_trait]
pub trait Broker: Send + Sync {
    /// Persist a task in its queue.
    async fn enqueue(&self, task: Task) -> AnvilResult<TaskId>;

    /// Lease one ready task from the first non-empty queue in `queues`.
    ///
    /// Returns `None` when no task is ready. The task's `attempts` is
    /// incremented and it stays invisible for `lease_duration`.
    async fn lease(&self, queues: &[String], lease_duration: Duration)
    -> AnvilResult<Option<Lease>>;

    /// Permanently remove a leased task. Acking twice is a no-op.
    async fn ack(&self, handle: &LeaseHandle) -> AnvilResult<()>;

    /// Return a failed task to its queue after `backoff`, or dead-letter it
    /// when `attempts >= max_retries`.
    async fn requeue(
        &self,
        handle: &LeaseHandle,
        backoff: Duration,
        error: &str,
    ) -> AnvilResult<RequeueOutcome>;

    /// Move a leased task straight to the dead-letter set.
    async fn dead_letter(&self, handle: &LeaseHandle, error: &str) -> AnvilResult<()>;

    /// Inspect dead-lettered tasks, most recent first.
    async fn dead_letters(&self, limit: Option<usize>) -> AnvilResult<Vec<Task>>;

    /// Get a live or dead-lettered task by ID. Acked tasks are gone.
    async fn get_task(&self, task_id: &TaskId) -> AnvilResult<Option<Task>>;

    /// Get broker statistics
    async fn stats(&self) -> AnvilResult<BrokerStats>;

    /// Purge all tasks (dangerous operation)
    async fn purge(&self) -> AnvilResult<u64>;

    /// Check that the backing store answers
    async fn health_check(&self) -> AnvilResult<()>;

    /// Release the connection; later calls fail with `BrokerUnavailable`.
    async fn close(&self) -> AnvilResult<()>;

    /// Retry policy applied to failed tasks
    fn retry_policy(&self) -> &RetryPolicy;
}

/// Convenient type alias for a shared broker
pub type SharedBroker = Arc<dyn Broker>;

/// Factory methods for creating brokers
pub struct BrokerFactory;

impl BrokerFactory {
    /// Create an in-memory broker
    pub fn in_memory(config: BrokerConfig) -> SharedBroker {
        Arc::new(InMemoryBroker::with_config(config))
    }

    /// Create a Redis broker
    #[cfg(feature = "redis-broker")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
    pub async fn redis(config: BrokerConfig) -> AnvilResult<SharedBroker> {
        let broker = RedisBroker::new(config).await?;
        Ok(Arc::new(broker))
    }

    /// Create whichever broker the configuration selects
    pub async fn from_config(config: BrokerConfig) -> AnvilResult<SharedBroker> {
        match &config.backend {
            BrokerBackendConfig::InMemory => Ok(Self::in_memory(config)),
            #[cfg(feature = "redis-broker")]
            BrokerBackendConfig::Redis(_) => Self::redis(config).await,
        }
    }
}
