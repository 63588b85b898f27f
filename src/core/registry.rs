//! Handler registry for anvilq.
//!
//! Maps task type tags to the handlers that process them. The registry is
//! filled before the job service starts and is read-only afterwards, so
//! workers share it behind an `Arc` without locking.
//!
//! # Examples
//!
//! ```rust
//! use anvilq::prelude::*;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Resize {
//!     width: u32,
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry
//!     .register_json("resize", |_ctx, job: Resize| async move {
//!         tracing::info!("resizing to {}", job.width);
//!         Ok(())
//!     })
//!     .unwrap();
//! assert!(registry.is_registered("resize"));
//! ```

use crate::error::{AnvilError, AnvilResult};
use crate::task::{Task, TaskId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// What a handler knows about the delivery it is processing.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Task identifier
    pub task_id: TaskId,
    /// Task type tag
    pub task_type: String,
    /// Queue the task was leased from
    pub queue: String,
    /// Delivery attempt, starting at 1
    pub attempts: u32,
    /// Attempts allowed before the task is dead-lettered
    pub max_retries: u32,
    /// When the worker will give up on this attempt
    pub deadline: Option<Instant>,
}

impl TaskContext {
    /// Build the context for a leased task.
    pub fn for_task(task: &Task, deadline: Option<Instant>) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            queue: task.queue.clone(),
            attempts: task.attempts,
            max_retries: task.retry_budget(),
            deadline,
        }
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether a failure now would dead-letter the task.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_retries
    }
}

/// Processes tasks of one type.
///
/// Returning an error fails the attempt; the worker pool then retries the
/// task or dead-letters it according to the retry policy.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Process one delivery of a task.
    async fn handle(&self, ctx: TaskContext, payload: Vec<u8>) -> AnvilResult<()>;
}

/// Adapter turning an async closure over raw bytes into a handler.
struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for HandlerFn<F>
where
    F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = AnvilResult<()>> + Send,
{
    async fn handle(&self, ctx: TaskContext, payload: Vec<u8>) -> AnvilResult<()> {
        (self.f)(ctx, payload).await
    }
}

/// Adapter decoding a JSON payload before calling the closure.
struct JsonHandler<T, F> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> TaskHandler for JsonHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(TaskContext, T) -> Fut + Send + Sync,
    Fut: Future<Output = AnvilResult<()>> + Send,
{
    async fn handle(&self, ctx: TaskContext, payload: Vec<u8>) -> AnvilResult<()> {
        let value: T =
            serde_json::from_slice(&payload).map_err(|source| AnvilError::InvalidPayload {
                task_type: ctx.task_type.clone(),
                source,
            })?;
        (self.f)(ctx, value).await
    }
}

/// Registry of task handlers keyed by task type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `task_type`.
    ///
    /// Fails with [`AnvilError::DuplicateHandler`] if the type already has
    /// a handler.
    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> AnvilResult<()> {
        let task_type = task_type.into();
        if task_type.is_empty() {
            return Err(AnvilError::config("task type must not be empty"));
        }
        if self.handlers.contains_key(&task_type) {
            return Err(AnvilError::DuplicateHandler { task_type });
        }

        tracing::debug!("Registering handler for task type: {}", task_type);
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    /// Register an async closure that receives the raw payload.
    pub fn register_fn<F, Fut>(&mut self, task_type: impl Into<String>, f: F) -> AnvilResult<()>
    where
        F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AnvilResult<()>> + Send + 'static,
    {
        self.register(task_type, Arc::new(HandlerFn { f }))
    }

    /// Register an async closure that receives the payload decoded as JSON.
    ///
    /// Payloads that fail to decode are reported as
    /// [`AnvilError::InvalidPayload`] and are never retried.
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
        self.register(
            task_type,
            Arc::new(JsonHandler {
                f,
                _payload: PhantomData,
            }),
        )
    }

    /// Look up the handler for `task_type`.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Run the handler registered for `task`'s type.
    pub async fn dispatch(&self, task: &Task, ctx: TaskContext) -> AnvilResult<()> {
        let handler = self
            .get(&task.task_type)
            .ok_or_else(|| AnvilError::UnknownTaskType {
                task_type: task.task_type.clone(),
            })?;

        tracing::debug!("Executing task {} of type {}", task.id, task.task_type);
        handler.handle(ctx, task.payload.clone()).await
    }

    /// Check if a task type is registered.
    pub fn is_registered(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Get all registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Deserialize)]
    struct Greeting {
        name: String,
    }

    fn ctx(task: &Task) -> TaskContext {
        TaskContext::for_task(task, None)
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("ping", move |_ctx, _payload| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        let task = Task::new("ping", Vec::new());
        registry.dispatch(&task, ctx(&task)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.task_types(), vec!["ping"]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("ping", |_ctx, _payload| async { Ok(()) })
            .unwrap();

        let err = registry
            .register_fn("ping", |_ctx, _payload| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, AnvilError::DuplicateHandler { task_type } if task_type == "ping"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_task_type() {
        let registry = HandlerRegistry::new();
        let task = Task::new("missing", Vec::new());

        let err = registry.dispatch(&task, ctx(&task)).await.unwrap_err();
        assert!(matches!(err, AnvilError::UnknownTaskType { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_json_handler_decodes_payload() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_json("greet", |ctx, greeting: Greeting| async move {
                assert_eq!(ctx.attempts, 1);
                if greeting.name == "Ada" {
                    Ok(())
                } else {
                    Err(AnvilError::handler_msg("wrong name"))
                }
            })
            .unwrap();

        let mut task = Task::new("greet", br#"{"name":"Ada"}"#.to_vec());
        task.attempts = 1;
        registry.dispatch(&task, ctx(&task)).await.unwrap();

        let mut bad = Task::new("greet", b"not json".to_vec());
        bad.attempts = 1;
        let err = registry.dispatch(&bad, ctx(&bad)).await.unwrap_err();
        assert!(matches!(err, AnvilError::InvalidPayload { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_context_final_attempt() {
        let mut task = Task::new("t", Vec::new()).with_max_retries(2);
        task.attempts = 2;
        let ctx = TaskContext::for_task(&task, Some(Instant::now() + Duration::from_secs(5)));
        assert!(ctx.is_final_attempt());
        assert!(ctx.remaining().unwrap() <= Duration::from_secs(5));
    }
}
