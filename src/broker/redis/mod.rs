//! Redis broker implementation for anvilq.
//!
//! Tasks survive process restarts and can be shared by any number of worker
//! processes. Every state transition runs as a Lua script so that leasing,
//! acking and requeueing stay atomic across processes.
//!
//! # Key layout
//!
//! | Key | Type | Content |
//! |-----|------|---------|
//! | `{prefix}:task:{id}` | hash | `body` (task JSON), `queue`, `attempts`, `max_retries`, `state`, `token`, `last_error`, `available_at` |
//! | `{prefix}:queue:{name}` | list | ready task IDs, oldest on the right |
//! | `{prefix}:scheduled` | zset | delayed and backed-off task IDs, scored by ready time (ms) |
//! | `{prefix}:leased` | zset | leased task IDs, scored by lease deadline (ms) |
//! | `{prefix}:dead` | zset | dead-lettered task IDs, scored by burial time (ms) |
//! | `{prefix}:queues` | set | every queue name ever used |
//! | `{prefix}:stats` | hash | `acked` counter |

use super::{Broker, BrokerStats, Lease, LeaseHandle, RequeueOutcome};
use crate::config::{BrokerBackendConfig, BrokerConfig, RedisConfig, RetryPolicy};
use crate::error::{AnvilError, AnvilResult};
use crate::task::{Task, TaskId, TaskState};
use async_trait::async_trait;

use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

/// Redis broker backend
pub struct RedisBroker {
    /// Redis connection manager
    conn: ConnectionManager,
    /// Redis configuration
    redis_config: RedisConfig,
    /// Broker configuration
    config: BrokerConfig,
    /// Pre-compiled Lua scripts for atomic operations
    scripts: RedisScripts,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("redis_config", &self.redis_config)
            .field("config", &self.config)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Pre-compiled Lua scripts for atomic Redis operations
#[derive(Debug)]
struct RedisScripts {
    /// Insert a task, respecting the queue size limit
    enqueue: Script,
    /// Promote due tasks, reclaim or bury expired leases, then lease one task
    lease: Script,
    /// Delete a task if the caller still holds its lease
    ack: Script,
    /// Requeue or dead-letter a task if the caller still holds its lease
    release: Script,
}

impl RedisScripts {
    fn new() -> Self {
        Self {
            enqueue: Script::new(include_str!("scripts/enqueue.lua")),
            lease: Script::new(include_str!("scripts/lease.lua")),
            ack: Script::new(include_str!("scripts/ack.lua")),
            release: Script::new(include_str!("scripts/release.lua")),
        }
    }
}

impl RedisBroker {
    /// Connect to Redis using the broker configuration
    pub async fn new(config: BrokerConfig) -> AnvilResult<Self> {
        let redis_config = match &config.backend {
            BrokerBackendConfig::Redis(redis_config) => redis_config.clone(),
            _ => {
                return Err(AnvilError::config(
                    "Redis configuration not found in broker config",
                ));
            }
        };

        let client = Client::open(redis_config.connection_string.as_str())?;

        debug!(
            "🔧 Configuring Redis broker with prefix: {}",
            redis_config.key_prefix
        );

        let connect_timeout = Duration::from_secs(redis_config.connect_timeout_secs);
        let conn = timeout(connect_timeout, client.get_connection_manager())
            .await
            .map_err(|e| AnvilError::broker_unavailable("Timed out connecting to Redis", e))??;

        info!("✅ Connected to Redis");

        Ok(Self {
            conn,
            redis_config,
            config,
            scripts: RedisScripts::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> AnvilResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(AnvilError::unavailable("Redis broker is closed"))
        } else {
            Ok(())
        }
    }

    fn prefix(&self) -> &str {
        &self.redis_config.key_prefix
    }

    /// Get Redis key for a task hash
    fn task_key(&self, task_id: &str) -> String {
        format!("{}:task:{}", self.prefix(), task_id)
    }

    /// Get Redis key for a queue list
    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix(), queue)
    }

    fn scheduled_key(&self) -> String {
        format!("{}:scheduled", self.prefix())
    }

    fn leased_key(&self) -> String {
        format!("{}:leased", self.prefix())
    }

    fn dead_key(&self) -> String {
        format!("{}:dead", self.prefix())
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.prefix())
    }

    fn stats_key(&self) -> String {
        format!("{}:stats", self.prefix())
    }

    /// Convert SystemTime to Unix timestamp in milliseconds
    fn timestamp_ms(time: SystemTime) -> u64 {
        time.duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Rebuild a task from its hash fields
    fn decode_task(fields: HashMap<String, String>) -> AnvilResult<Task> {
        let body = fields
            .get("body")
            .ok_or_else(|| AnvilError::broker("task record has no body"))?;
        let mut task: Task = serde_json::from_str(body)?;

        if let Some(queue) = fields.get("queue") {
            task.queue = queue.clone();
        }
        task.attempts = parse_field(&fields, "attempts")?.unwrap_or(task.attempts);
        if let Some(max_retries) = parse_field(&fields, "max_retries")? {
            task.max_retries = Some(max_retries);
        }
        task.state = match fields.get("state").map(String::as_str) {
            Some("Leased") => TaskState::Leased,
            Some("DeadLettered") => TaskState::DeadLettered,
            _ => TaskState::Pending,
        };
        task.last_error = fields.get("last_error").filter(|e| !e.is_empty()).cloned();
        task.available_at = parse_field::<u64>(&fields, "available_at")?
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms));
        Ok(task)
    }

    /// Run the release script for a requeue or a direct dead-letter
    async fn release(
        &self,
        handle: &LeaseHandle,
        backoff: Duration,
        error: &str,
        force_dead: bool,
    ) -> AnvilResult<String> {
        let mut conn = self.conn.clone();
        let now = SystemTime::now();

        let outcome: String = self
            .scripts
            .release
            .key(self.leased_key())
            .key(self.scheduled_key())
            .key(self.dead_key())
            .arg(self.prefix())
            .arg(&handle.task_id)
            .arg(&handle.token)
            .arg(Self::timestamp_ms(now))
            .arg(Self::timestamp_ms(now + backoff))
            .arg(error)
            .arg(if force_dead { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        Ok(outcome)
    }

    async fn load_tasks(&self, task_ids: &[String]) -> AnvilResult<Vec<Task>> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for task_id in task_ids {
            pipe.hgetall(self.task_key(task_id));
        }
        let records: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        records
            .into_iter()
            .filter(|fields| !fields.is_empty())
            .map(Self::decode_task)
            .collect()
    }
}

fn parse_field<T: std::str::FromStr>(
    fields: &HashMap<String, String>,
    name: &str,
) -> AnvilResult<Option<T>> {
    match fields.get(name).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| AnvilError::broker(format!("invalid task field '{name}': {value}"))),
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, mut task: Task) -> AnvilResult<TaskId> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let max_retries = *task
            .max_retries
            .get_or_insert(self.config.retry_policy.max_retries);

        let ready_at = task
            .remaining_delay()
            .map(|delay| Self::timestamp_ms(SystemTime::now() + delay))
            .unwrap_or(0);
        let body = serde_json::to_string(&task)?;

        let outcome: String = self
            .scripts
            .enqueue
            .key(self.queue_key(&task.queue))
            .key(self.scheduled_key())
            .key(self.queues_key())
            .arg(self.prefix())
            .arg(&task.id)
            .arg(body)
            .arg(&task.queue)
            .arg(max_retries)
            .arg(ready_at)
            .arg(self.config.max_queue_size)
            .arg(task.attempts)
            .invoke_async(&mut conn)
            .await?;

        match outcome.as_str() {
            "ok" => {
                debug!("Enqueued task {} ({}) on '{}'", task.id, task.task_type, task.queue);
                Ok(task.id)
            }
            "exists" => Err(AnvilError::broker(format!("task '{}' already exists", task.id))),
            "full" => Err(AnvilError::broker(format!(
                "queue '{}' is full ({} tasks)",
                task.queue, self.config.max_queue_size
            ))),
            other => Err(AnvilError::broker(format!(
                "unexpected enqueue script reply: {other}"
            ))),
        }
    }

    async fn lease(
        &self,
        queues: &[String],
        lease_duration: Duration,
    ) -> AnvilResult<Option<Lease>> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();

        let now = SystemTime::now();
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + lease_duration;

        let mut invocation = self.scripts.lease.prepare_invoke();
        invocation
            .key(self.scheduled_key())
            .key(self.leased_key())
            .key(self.dead_key());
        for queue in queues {
            invocation.key(self.queue_key(queue));
        }
        invocation
            .arg(self.prefix())
            .arg(Self::timestamp_ms(now))
            .arg(Self::timestamp_ms(now + lease_duration))
            .arg(&token);

        let fields: Option<HashMap<String, String>> = invocation.invoke_async(&mut conn).await?;
        let Some(fields) = fields.filter(|f| !f.is_empty()) else {
            return Ok(None);
        };

        let task = Self::decode_task(fields)?;
        let handle = LeaseHandle {
            task_id: task.id.clone(),
            queue: task.queue.clone(),
            token,
            deadline,
        };
        Ok(Some(Lease { task, handle }))
    }

    async fn ack(&self, handle: &LeaseHandle) -> AnvilResult<()> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();

        let removed: i32 = self
            .scripts
            .ack
            .key(self.leased_key())
            .key(self.stats_key())
            .arg(self.prefix())
            .arg(&handle.task_id)
            .arg(&handle.token)
            .invoke_async(&mut conn)
            .await?;

        if removed == 0 {
            debug!("Ignoring ack for task {} without a live lease", handle.task_id);
        }
        Ok(())
    }

    async fn requeue(
        &self,
        handle: &LeaseHandle,
        backoff: Duration,
        error: &str,
    ) -> AnvilResult<RequeueOutcome> {
        self.ensure_open()?;
        match self.release(handle, backoff, error, false).await?.as_str() {
            "requeued" => Ok(RequeueOutcome::Requeued),
            "dead" => Ok(RequeueOutcome::DeadLettered),
            _ => Ok(RequeueOutcome::Stale),
        }
    }

    async fn dead_letter(&self, handle: &LeaseHandle, error: &str) -> AnvilResult<()> {
        self.ensure_open()?;
        self.release(handle, Duration::ZERO, error, true).await?;
        Ok(())
    }

    async fn dead_letters(&self, limit: Option<usize>) -> AnvilResult<Vec<Task>> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();

        let stop = limit.map(|l| l as isize - 1).unwrap_or(-1);
        if stop < -1 || limit == Some(0) {
            return Ok(Vec::new());
        }
        let task_ids: Vec<String> = conn.zrevrange(self.dead_key(), 0, stop).await?;
        self.load_tasks(&task_ids).await
    }

    async fn get_task(&self, task_id: &TaskId) -> AnvilResult<Option<Task>> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();

        let fields: HashMap<String, String> = conn.hgetall(self.task_key(task_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Self::decode_task(fields).map(Some)
    }

    async fn stats(&self) -> AnvilResult<BrokerStats> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();

        let mut queue_names: Vec<String> = conn.smembers(self.queues_key()).await?;
        queue_names.sort();

        let mut pipe = redis::pipe();
        pipe.zcard(self.scheduled_key())
            .zcard(self.leased_key())
            .zcard(self.dead_key())
            .hget(self.stats_key(), "acked");
        let (scheduled, leased, dead, acked): (u64, u64, u64, Option<u64>) =
            pipe.query_async(&mut conn).await?;

        let mut per_queue = BTreeMap::new();
        if !queue_names.is_empty() {
            let mut pipe = redis::pipe();
            for name in &queue_names {
                pipe.llen(self.queue_key(name));
            }
            let lengths: Vec<u64> = pipe.query_async(&mut conn).await?;
            per_queue.extend(queue_names.into_iter().zip(lengths));
        }

        Ok(BrokerStats {
            pending: per_queue.values().sum::<u64>() + scheduled,
            leased,
            dead,
            acked: acked.unwrap_or(0),
            per_queue,
        })
    }

    async fn purge(&self) -> AnvilResult<u64> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();

        let pattern = format!("{}:*", self.prefix());
        let task_prefix = format!("{}:task:", self.prefix());
        let stats_key = self.stats_key();
        let mut cursor: u64 = 0;
        let mut removed = 0u64;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;

            let keys: Vec<String> = keys.into_iter().filter(|k| *k != stats_key).collect();
            removed += keys.iter().filter(|k| k.starts_with(&task_prefix)).count() as u64;
            if !keys.is_empty() {
                let _: () = conn.del(keys).await?;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        warn!("Purged {} tasks under prefix '{}'", removed, self.prefix());
        Ok(removed)
    }

    async fn health_check(&self) -> AnvilResult<()> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> AnvilResult<()> {
        self.closed.store(true, Ordering::Release);
        debug!("Redis broker closed");
        Ok(())
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry_policy
    }
}
