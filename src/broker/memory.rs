//! In-memory broker implementation for anvilq.
//!
//! All state lives behind a single async lock so that leasing, acking and
//! requeueing are atomic with respect to each other. Nothing survives a
//! restart; use it for development, tests and single-process deployments.

use super::{Broker, BrokerStats, LEASE_EXPIRED, Lease, LeaseHandle, RequeueOutcome};
use crate::config::{BrokerConfig, RetryPolicy};
use crate::error::{AnvilError, AnvilResult};
use crate::task::{Task, TaskId, TaskState};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug)]
struct LeaseRecord {
    token: String,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Every live or dead-lettered task, indexed by ID
    tasks: HashMap<TaskId, Task>,
    /// Pending task IDs per queue, in FIFO order
    queues: HashMap<String, VecDeque<TaskId>>,
    /// Earliest visibility for delayed or backed-off tasks
    not_before: HashMap<TaskId, Instant>,
    /// Outstanding leases
    leases: HashMap<TaskId, LeaseRecord>,
    /// Dead-lettered task IDs, oldest first
    dead: Vec<TaskId>,
    acked: u64,
}

impl MemoryState {
    /// Return abandoned leases to the back of their queue, or dead-letter
    /// them when the abandoned delivery was their last allowed attempt.
    fn reclaim_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<TaskId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for task_id in &expired {
            self.leases.remove(task_id);
            let exhausted = match self.tasks.get(task_id) {
                Some(task) => task.is_final_attempt(),
                None => continue,
            };
            if exhausted {
                tracing::warn!("Task {} exhausted its retries with an expired lease", task_id);
                self.bury(task_id, LEASE_EXPIRED);
            } else if let Some(task) = self.tasks.get_mut(task_id) {
                task.state = TaskState::Pending;
                self.queues
                    .entry(task.queue.clone())
                    .or_default()
                    .push_back(task_id.clone());
            }
        }

        if !expired.is_empty() {
            tracing::debug!("Reclaimed {} expired leases", expired.len());
        }
        expired.len()
    }

    /// Remove and return the first visible task ID of `queue`.
    fn pop_ready(&mut self, queue: &str, now: Instant) -> Option<TaskId> {
        let pending = self.queues.get_mut(queue)?;
        let not_before = &self.not_before;
        let position = pending
            .iter()
            .position(|id| not_before.get(id).is_none_or(|at| *at <= now))?;
        let task_id = pending.remove(position)?;
        self.not_before.remove(&task_id);
        Some(task_id)
    }

    /// Whether `handle` still owns its task.
    fn holds(&self, handle: &LeaseHandle) -> bool {
        self.leases
            .get(&handle.task_id)
            .is_some_and(|lease| lease.token == handle.token)
    }

    fn bury(&mut self, task_id: &TaskId, error: &str) {
        self.not_before.remove(task_id);
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.state = TaskState::DeadLettered;
            task.last_error = Some(error.to_string());
            task.available_at = None;
            self.dead.push(task_id.clone());
        }
    }
}

/// In-memory broker backend
#[derive(Debug)]
pub struct InMemoryBroker {
    state: RwLock<MemoryState>,
    config: BrokerConfig,
    closed: AtomicBool,
}

impl InMemoryBroker {
    /// Create a broker with the default configuration
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::in_memory())
    }

    /// Create a broker with a custom configuration
    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            config,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> AnvilResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(AnvilError::unavailable("in-memory broker is closed"))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, mut task: Task) -> AnvilResult<TaskId> {
        self.ensure_open()?;
        let mut state = self.state.write().await;

        if state.tasks.contains_key(&task.id) {
            return Err(AnvilError::broker(format!(
                "task '{}' already exists",
                task.id
            )));
        }

        let max = self.config.max_queue_size;
        let queued = state.queues.get(&task.queue).map_or(0, VecDeque::len);
        if max > 0 && queued >= max {
            return Err(AnvilError::broker(format!(
                "queue '{}' is full ({} tasks)",
                task.queue, max
            )));
        }

        task.state = TaskState::Pending;
        task.max_retries
            .get_or_insert(self.config.retry_policy.max_retries);
        let task_id = task.id.clone();
        if let Some(delay) = task.remaining_delay() {
            state
                .not_before
                .insert(task_id.clone(), Instant::now() + delay);
        }
        state
            .queues
            .entry(task.queue.clone())
            .or_default()
            .push_back(task_id.clone());

        tracing::debug!("Enqueued task {} ({}) on '{}'", task_id, task.task_type, task.queue);
        state.tasks.insert(task_id.clone(), task);
        Ok(task_id)
    }

    async fn lease(
        &self,
        queues: &[String],
        lease_duration: Duration,
    ) -> AnvilResult<Option<Lease>> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut state = self.state.write().await;
        state.reclaim_expired(now);

        for queue in queues {
            let Some(task_id) = state.pop_ready(queue, now) else {
                continue;
            };
            let Some(task) = state.tasks.get_mut(&task_id) else {
                continue;
            };

            task.attempts += 1;
            task.state = TaskState::Leased;
            task.available_at = None;
            let snapshot = task.clone();

            let handle = LeaseHandle {
                task_id: task_id.clone(),
                queue: queue.clone(),
                token: uuid::Uuid::new_v4().to_string(),
                deadline: now + lease_duration,
            };
            state.leases.insert(
                task_id,
                LeaseRecord {
                    token: handle.token.clone(),
                    deadline: handle.deadline,
                },
            );

            return Ok(Some(Lease {
                task: snapshot,
                handle,
            }));
        }

        Ok(None)
    }

    async fn ack(&self, handle: &LeaseHandle) -> AnvilResult<()> {
        self.ensure_open()?;
        let mut state = self.state.write().await;

        if !state.holds(handle) {
            tracing::debug!("Ignoring ack for task {} without a live lease", handle.task_id);
            return Ok(());
        }

        state.leases.remove(&handle.task_id);
        state.tasks.remove(&handle.task_id);
        state.acked += 1;
        Ok(())
    }

    async fn requeue(
        &self,
        handle: &LeaseHandle,
        backoff: Duration,
        error: &str,
    ) -> AnvilResult<RequeueOutcome> {
        self.ensure_open()?;
        let mut state = self.state.write().await;

        if !state.holds(handle) {
            return Ok(RequeueOutcome::Stale);
        }
        state.leases.remove(&handle.task_id);

        let exhausted = state
            .tasks
            .get(&handle.task_id)
            .is_some_and(Task::is_final_attempt);
        if exhausted {
            state.bury(&handle.task_id, error);
            return Ok(RequeueOutcome::DeadLettered);
        }

        let Some(task) = state.tasks.get_mut(&handle.task_id) else {
            return Ok(RequeueOutcome::Stale);
        };
        task.state = TaskState::Pending;
        task.last_error = Some(error.to_string());
        task.available_at = Some(SystemTime::now() + backoff);
        let queue = task.queue.clone();

        state
            .not_before
            .insert(handle.task_id.clone(), Instant::now() + backoff);
        state
            .queues
            .entry(queue)
            .or_default()
            .push_back(handle.task_id.clone());
        Ok(RequeueOutcome::Requeued)
    }

    async fn dead_letter(&self, handle: &LeaseHandle, error: &str) -> AnvilResult<()> {
        self.ensure_open()?;
        let mut state = self.state.write().await;

        if state.holds(handle) {
            state.leases.remove(&handle.task_id);
            state.bury(&handle.task_id, error);
        }
        Ok(())
    }

    async fn dead_letters(&self, limit: Option<usize>) -> AnvilResult<Vec<Task>> {
        self.ensure_open()?;
        let state = self.state.read().await;
        Ok(state
            .dead
            .iter()
            .rev()
            .filter_map(|id| state.tasks.get(id).cloned())
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn get_task(&self, task_id: &TaskId) -> AnvilResult<Option<Task>> {
        self.ensure_open()?;
        let state = self.state.read().await;
        Ok(state.tasks.get(task_id).cloned())
    }

    async fn stats(&self) -> AnvilResult<BrokerStats> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        state.reclaim_expired(Instant::now());

        let per_queue = state
            .queues
            .iter()
            .map(|(name, ids)| (name.clone(), ids.len() as u64))
            .collect::<std::collections::BTreeMap<_, _>>();

        Ok(BrokerStats {
            pending: per_queue.values().sum(),
            leased: state.leases.len() as u64,
            dead: state.dead.len() as u64,
            acked: state.acked,
            per_queue,
        })
    }

    async fn purge(&self) -> AnvilResult<u64> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        let removed = state.tasks.len() as u64;
        let acked = state.acked;
        *state = MemoryState {
            acked,
            ..MemoryState::default()
        };
        tracing::warn!("Purged {} tasks from the in-memory broker", removed);
        Ok(removed)
    }

    async fn health_check(&self) -> AnvilResult<()> {
        self.ensure_open()
    }

    async fn close(&self) -> AnvilResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry_policy
    }
}
