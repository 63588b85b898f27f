//! Task lifecycle events and the tracers that receive them.
//!
//! The worker pool reports every lease, ack, requeue and dead-letter as a
//! [`TaskEvent`]. Events are handed to a [`Tracer`]; implementations must
//! return quickly and never wait on I/O, since they run inline on the
//! executor that produced the event.

use crate::task::{Task, TaskId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// What happened to a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEventKind {
    /// A worker took a lease on the task
    Leased,
    /// The handler succeeded and the task was removed
    Acked,
    /// The handler failed and the task will be retried
    Requeued,
    /// The task will never run again
    DeadLettered,
}

impl TaskEventKind {
    /// Stable lowercase name, used as a log field and metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Leased => "leased",
            Self::Acked => "acked",
            Self::Requeued => "requeued",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// One structured lifecycle event.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    /// Event kind
    pub kind: TaskEventKind,
    /// Task identifier
    pub task_id: TaskId,
    /// Task type tag
    pub task_type: String,
    /// Queue the task was leased from
    pub queue: String,
    /// Attempts so far, including the current one
    pub attempts: u32,
    /// Handler duration; zero for `Leased`
    pub duration_ms: u64,
    /// Error message for failed attempts
    pub error: Option<String>,
}

impl TaskEvent {
    /// Build an event for `task`.
    pub fn new(kind: TaskEventKind, task: &Task) -> Self {
        Self {
            kind,
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            queue: task.queue.clone(),
            attempts: task.attempts,
            duration_ms: 0,
            error: None,
        }
    }

    /// Attach the handler duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    /// Attach an error message.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Receives task lifecycle events. Must not block.
pub trait Tracer: Send + Sync {
    /// Record one event.
    fn record(&self, event: &TaskEvent);
}

/// Forwards every event to an ordered list of tracers.
#[derive(Clone, Default)]
pub struct CompositeTracer {
    tracers: Vec<Arc<dyn Tracer>>,
}

impl CompositeTracer {
    /// Create an empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tracer; tracers are called in insertion order.
    pub fn push(&mut self, tracer: Arc<dyn Tracer>) {
        self.tracers.push(tracer);
    }

    /// Builder-style `push`.
    pub fn with(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.push(tracer);
        self
    }

    /// Number of tracers.
    pub fn len(&self) -> usize {
        self.tracers.len()
    }

    /// Whether no tracer is registered.
    pub fn is_empty(&self) -> bool {
        self.tracers.is_empty()
    }
}

impl Tracer for CompositeTracer {
    fn record(&self, event: &TaskEvent) {
        for tracer in &self.tracers {
            tracer.record(event);
        }
    }
}

/// Writes events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn record(&self, event: &TaskEvent) {
        let kind = event.kind.as_str();
        let error = event.error.as_deref().unwrap_or("");
        match event.kind {
            TaskEventKind::Leased => tracing::debug!(
                target: "anvilq::events",
                event = kind,
                task_id = %event.task_id,
                task_type = %event.task_type,
                queue = %event.queue,
                attempts = event.attempts,
                "task leased"
            ),
            TaskEventKind::Acked => tracing::info!(
                target: "anvilq::events",
                event = kind,
                task_id = %event.task_id,
                task_type = %event.task_type,
                queue = %event.queue,
                attempts = event.attempts,
                duration_ms = event.duration_ms,
                "task acked"
            ),
            TaskEventKind::Requeued => tracing::warn!(
                target: "anvilq::events",
                event = kind,
                task_id = %event.task_id,
                task_type = %event.task_type,
                queue = %event.queue,
                attempts = event.attempts,
                duration_ms = event.duration_ms,
                error,
                "task requeued"
            ),
            TaskEventKind::DeadLettered => tracing::error!(
                target: "anvilq::events",
                event = kind,
                task_id = %event.task_id,
                task_type = %event.task_type,
                queue = %event.queue,
                attempts = event.attempts,
                duration_ms = event.duration_ms,
                error,
                "task dead-lettered"
            ),
        }
    }
}

/// Sends events into a bounded channel, dropping them when it is full.
#[derive(Debug)]
pub struct ChannelTracer {
    tx: mpsc::Sender<TaskEvent>,
    dropped: AtomicU64,
}

impl ChannelTracer {
    /// Create a tracer and the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TaskEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events dropped because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Tracer for ChannelTracer {
    fn record(&self, event: &TaskEvent) {
        if self.tx.try_send(event.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
