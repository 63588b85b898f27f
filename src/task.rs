//! Task definition and producer options.

use crate::config::DEFAULT_QUEUE;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Unique identifier for a task
pub type TaskId = String;

/// Broker-side state of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in its queue (possibly not visible until `available_at`)
    Pending,
    /// Held by exactly one worker under a lease
    Leased,
    /// Exhausted its retries or failed permanently
    DeadLettered,
}

/// A unit of work: a type tag, an opaque payload and a destination queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,
    /// Tag identifying the handler to invoke
    pub task_type: String,
    /// Handler-specific payload
    pub payload: Vec<u8>,
    /// Destination queue
    pub queue: String,
    /// Delivery attempts so far, incremented by the broker on every lease
    pub attempts: u32,
    /// Attempts allowed before the task is dead-lettered; when unset the
    /// broker applies its retry policy on enqueue
    pub max_retries: Option<u32>,
    /// Current broker-side state
    pub state: TaskState,
    /// Error recorded by the last failed attempt
    pub last_error: Option<String>,
    /// When the task was created
    pub created_at: SystemTime,
    /// Earliest time the task may be leased (delayed enqueue or retry backoff)
    pub available_at: Option<SystemTime>,
}

impl Task {
    /// Create a task for the default queue. Its retry budget is left to the broker.
    pub fn new(task_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            payload: payload.into(),
            queue: DEFAULT_QUEUE.to_string(),
            attempts: 0,
            max_retries: None,
            state: TaskState::Pending,
            last_error: None,
            created_at: SystemTime::now(),
            available_at: None,
        }
    }

    /// Create a task whose payload is `value` encoded as JSON.
    pub fn json<T: Serialize>(
        task_type: impl Into<String>,
        value: &T,
    ) -> crate::error::AnvilResult<Self> {
        Ok(Self::new(task_type, serde_json::to_vec(value)?))
    }

    /// Route the task to `queue`.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Keep the task invisible for `delay` after enqueueing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.available_at = Some(SystemTime::now() + delay);
        self
    }

    /// Attempts allowed, falling back to the default retry policy when unset.
    pub fn retry_budget(&self) -> u32 {
        self.max_retries
            .unwrap_or_else(|| crate::config::RetryPolicy::default().max_retries)
    }

    /// Whether another failure would exhaust the retry budget.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.retry_budget()
    }

    /// Decode the payload as JSON.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> crate::error::AnvilResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Time left until the task becomes visible, if it is delayed.
    pub(crate) fn remaining_delay(&self) -> Option<Duration> {
        self.available_at
            .and_then(|at| at.duration_since(SystemTime::now()).ok())
            .filter(|d| !d.is_zero())
    }
}

/// Options accepted by the producer API.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Destination queue (defaults to `"default"`)
    pub queue: Option<String>,
    /// Retry budget (defaults to the broker's retry policy)
    pub max_retries: Option<u32>,
    /// Delay before the task becomes visible
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    /// Options targeting `queue`.
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..Default::default()
        }
    }

    /// Set the retry budget.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the visibility delay.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("welcome", b"{}".to_vec());
        assert_eq!(task.queue, "default");
        assert_eq!(task.attempts, 0);
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.available_at.is_none());
        assert!(task.max_retries.is_none());
        assert!(!task.id.is_empty());
    }

    #[test]
    fn test_json_payload_decodes() {
        let task = Task::json("welcome", &json!({"to": "a@x.com"})).unwrap();
        let value: serde_json::Value = task.decode().unwrap();
        assert_eq!(value["to"], "a@x.com");
    }

    #[test]
    fn test_delay_sets_available_at() {
        let task = Task::new("t", Vec::new()).with_delay(Duration::from_secs(60));
        let remaining = task.remaining_delay().unwrap();
        assert!(remaining > Duration::from_secs(50));
    }

    #[test]
    fn test_final_attempt() {
        let mut task = Task::new("t", Vec::new()).with_max_retries(2);
        task.attempts = 1;
        assert!(!task.is_final_attempt());
        task.attempts = 2;
        assert!(task.is_final_attempt());
    }
}
