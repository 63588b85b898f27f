//! Producer side of anvilq.
//!
//! A [`JobClient`] only needs a broker, so processes that enqueue work but
//! never run a worker pool can use it on its own.

use crate::broker::{BrokerStats, SharedBroker};
use crate::error::AnvilResult;
use crate::task::{EnqueueOptions, Task, TaskId};
use serde::Serialize;

/// Cloneable handle for enqueueing and inspecting tasks.
#[derive(Clone)]
pub struct JobClient {
    broker: SharedBroker,
}

impl std::fmt::Debug for JobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobClient").finish_non_exhaustive()
    }
}

impl JobClient {
    /// Create a client on top of `broker`.
    pub fn new(broker: SharedBroker) -> Self {
        Self { broker }
    }

    /// Enqueue a task with a raw payload.
    pub async fn enqueue(
        &self,
        task_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        opts: EnqueueOptions,
    ) -> AnvilResult<TaskId> {
        self.enqueue_task(Task::new(task_type, payload), opts).await
    }

    /// Enqueue a task whose payload is `value` encoded as JSON.
    pub async fn enqueue_json<T: Serialize>(
        &self,
        task_type: impl Into<String>,
        value: &T,
        opts: EnqueueOptions,
    ) -> AnvilResult<TaskId> {
        self.enqueue_task(Task::json(task_type, value)?, opts).await
    }

    /// Enqueue a prepared task, applying `opts` on top of it.
    ///
    /// A retry budget in `opts` wins over the task's own. When neither sets
    /// one, the broker's retry policy decides.
    pub async fn enqueue_task(&self, mut task: Task, opts: EnqueueOptions) -> AnvilResult<TaskId> {
        if let Some(max_retries) = opts.max_retries {
            task = task.with_max_retries(max_retries);
        }
        if let Some(queue) = opts.queue {
            task = task.on_queue(queue);
        }
        if let Some(delay) = opts.delay {
            task = task.with_delay(delay);
        }

        let task_type = task.task_type.clone();
        let queue = task.queue.clone();
        let task_id = self.broker.enqueue(task).await?;

        tracing::debug!(
            "🔨 Task enqueued: {} (type: {}, queue: {})",
            task_id,
            task_type,
            queue
        );
        Ok(task_id)
    }

    /// Inspect dead-lettered tasks, most recent first.
    pub async fn dead_letters(&self, limit: Option<usize>) -> AnvilResult<Vec<Task>> {
        self.broker.dead_letters(limit).await
    }

    /// Get a task by ID.
    pub async fn get_task(&self, task_id: &TaskId) -> AnvilResult<Option<Task>> {
        self.broker.get_task(task_id).await
    }

    /// Get broker statistics.
    pub async fn stats(&self) -> AnvilResult<BrokerStats> {
        self.broker.stats().await
    }

    /// The broker behind this client.
    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }
}
