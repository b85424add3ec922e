//! Redis-backed task broker (durable, at-least-once delivery).
//!
//! ## Key Layout
//!
//! Per queue `q` under namespace `ns`:
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `ns:q:pending` | list | task ids ready to claim (`LPUSH` in, `RPOP` out) |
//! | `ns:q:scheduled` | zset | task ids scored by `process_at` (ms) |
//! | `ns:q:active` | zset | claimed task ids scored by lease deadline (ms) |
//! | `ns:q:leases` | hash | task id → lease token |
//! | `ns:q:archived` | zset | dead-lettered task ids scored by archive time (ms), trimmed per [`ArchiveRetention`] |
//! | `ns:task:{id}` | string | JSON `TaskMessage` |
//!
//! Every state transition runs as one Lua script, so a claim (promote due,
//! reclaim expired, pop, lease) is atomic with respect to other workers.
//! Scripts touch `ns:task:{id}` keys derived from ids read inside the
//! script; the namespace must therefore live on a single Redis node.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::broker::{BrokerError, BrokerResult, TaskBroker, lease_deadline};
use super::types::{
    ArchiveRetention, ArchivedTask, Lease, QueueStats, TaskId, TaskInfo, TaskMessage,
};

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "ledgerline";

const ENQUEUE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('SET', KEYS[1], ARGV[1])
if tonumber(ARGV[3]) <= tonumber(ARGV[4]) then
  redis.call('LPUSH', KEYS[2], ARGV[2])
else
  redis.call('ZADD', KEYS[3], ARGV[3], ARGV[2])
end
return 1
";

// Drops archive entries older than the cutoff, then the oldest beyond max size.
const TRIM_ARCHIVE_FN: &str = r"
local function trim_archive(archived, cutoff, max_size, prefix)
  local dropped = redis.call('ZRANGEBYSCORE', archived, '-inf', '(' .. cutoff)
  local excess = redis.call('ZCARD', archived) - #dropped - tonumber(max_size)
  if excess > 0 then
    local oldest = redis.call('ZRANGE', archived, #dropped, #dropped + excess - 1)
    for _, id in ipairs(oldest) do table.insert(dropped, id) end
  end
  for _, id in ipairs(dropped) do
    redis.call('ZREM', archived, id)
    redis.call('DEL', prefix .. id)
  end
  return #dropped
end
";

// KEYS: archived
// ARGV: cutoff_ms, max size, task key prefix
const TRIM_ARCHIVE_SCRIPT: &str = r"
return trim_archive(KEYS[1], ARGV[1], ARGV[2], ARGV[3])
";

// KEYS: pending, scheduled, active, leases, archived
// ARGV: now_ms, lease grace_ms, token, task key prefix, now (rfc3339),
//       archive cutoff_ms, archive max size
const CLAIM_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local archived_any = false
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('LPUSH', KEYS[1], id)
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[3], id)
  redis.call('HDEL', KEYS[4], id)
  local key = ARGV[4] .. id
  local raw = redis.call('GET', key)
  if raw then
    local msg = cjson.decode(raw)
    msg['retried'] = msg['retried'] + 1
    msg['last_error'] = 'lease expired'
    msg['last_failed_at'] = ARGV[5]
    redis.call('SET', key, cjson.encode(msg))
    if msg['retried'] >= msg['max_retry'] then
      redis.call('ZADD', KEYS[5], now, id)
      archived_any = true
    else
      redis.call('LPUSH', KEYS[1], id)
    end
  end
end
if archived_any then
  trim_archive(KEYS[5], ARGV[6], ARGV[7], ARGV[4])
end
local id = redis.call('RPOP', KEYS[1])
if not id then return false end
local raw = redis.call('GET', ARGV[4] .. id)
if not raw then return false end
local timeout = cjson.decode(raw)['timeout']
local timeout_ms = timeout['secs'] * 1000 + math.floor(timeout['nanos'] / 1000000)
redis.call('ZADD', KEYS[3], now + timeout_ms + tonumber(ARGV[2]), id)
redis.call('HSET', KEYS[4], id, ARGV[3])
return raw
";

// KEYS: active, leases, task
// ARGV: id, token
const COMPLETE_SCRIPT: &str = r"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then return 0 end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('DEL', KEYS[3])
return 1
";

// Retry and archive: leave the active set for a scored set.
// KEYS: active, leases, task, destination zset
// ARGV: id, token, message json, score
const MOVE_LEASED_SCRIPT: &str = r"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then return 0 end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('SET', KEYS[3], ARGV[3])
redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
return 1
";

// KEYS: active, leases, pending
// ARGV: id, token
const RELEASE_SCRIPT: &str = r"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then return 0 end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('RPUSH', KEYS[3], ARGV[1])
return 1
";

// KEYS: archived, pending, task
// ARGV: id, message json
const REQUEUE_SCRIPT: &str = r"
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then return 0 end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('SET', KEYS[3], ARGV[2])
redis.call('LPUSH', KEYS[2], ARGV[1])
return 1
";

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        BrokerError::Backend(err.to_string())
    }
}

#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    namespace: String,
    retention: ArchiveRetention,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("namespace", &self.namespace)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Connect to `redis_url` (e.g. "redis://localhost:6379").
    pub async fn connect(
        redis_url: impl AsRef<str>,
        namespace: impl Into<String>,
    ) -> BrokerResult<Self> {
        let client = redis::Client::open(redis_url.as_ref())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            namespace: namespace.into(),
            retention: ArchiveRetention::default(),
        })
    }

    pub fn with_retention(mut self, retention: ArchiveRetention) -> Self {
        self.retention = retention;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn queue_key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{}:{}", self.namespace, queue, suffix)
    }

    fn task_prefix(&self) -> String {
        format!("{}:task:", self.namespace)
    }

    fn task_key(&self, id: TaskId) -> String {
        format!("{}{}", self.task_prefix(), id)
    }

    async fn trim_archive(&self, queue: &str, now: DateTime<Utc>) -> BrokerResult<usize> {
        let dropped: usize = redis::Script::new(&format!("{TRIM_ARCHIVE_FN}{TRIM_ARCHIVE_SCRIPT}"))
            .key(self.queue_key(queue, "archived"))
            .arg(self.retention.cutoff(now).timestamp_millis())
            .arg(self.retention.max_size)
            .arg(self.task_prefix())
            .invoke_async(&mut self.conn.clone())
            .await?;
        if dropped > 0 {
            debug!(queue, dropped, "trimmed archived tasks");
        }
        Ok(dropped)
    }

    async fn move_leased(
        &self,
        lease: &Lease,
        message: &TaskMessage,
        destination: &str,
        score: i64,
    ) -> BrokerResult<()> {
        let queue = &lease.message.queue;
        let moved: i64 = redis::Script::new(MOVE_LEASED_SCRIPT)
            .key(self.queue_key(queue, "active"))
            .key(self.queue_key(queue, "leases"))
            .key(self.task_key(lease.message.id))
            .key(self.queue_key(queue, destination))
            .arg(lease.message.id.to_string())
            .arg(lease.token.to_string())
            .arg(serde_json::to_string(message)?)
            .arg(score)
            .invoke_async(&mut self.conn.clone())
            .await?;
        lease_held(moved, lease)
    }
}

fn lease_held(result: i64, lease: &Lease) -> BrokerResult<()> {
    if result == 1 {
        Ok(())
    } else {
        Err(BrokerError::LeaseLost(lease.message.id))
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl TaskBroker for RedisBroker {
    #[instrument(skip(self, message), fields(task_id = %message.id, queue = %message.queue), err)]
    async fn enqueue(&self, message: TaskMessage) -> BrokerResult<TaskInfo> {
        let now = Utc::now();
        let stored: i64 = redis::Script::new(ENQUEUE_SCRIPT)
            .key(self.task_key(message.id))
            .key(self.queue_key(&message.queue, "pending"))
            .key(self.queue_key(&message.queue, "scheduled"))
            .arg(serde_json::to_string(&message)?)
            .arg(message.id.to_string())
            .arg(message.process_at.timestamp_millis())
            .arg(now.timestamp_millis())
            .invoke_async(&mut self.conn.clone())
            .await?;
        if stored == 0 {
            return Err(BrokerError::Backend(format!(
                "task {} already exists",
                message.id
            )));
        }
        Ok(TaskInfo::from_message(&message, now))
    }

    async fn claim(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> BrokerResult<Option<Lease>> {
        let token = Uuid::new_v4();
        let raw: Option<String> = redis::Script::new(&format!("{TRIM_ARCHIVE_FN}{CLAIM_SCRIPT}"))
            .key(self.queue_key(queue, "pending"))
            .key(self.queue_key(queue, "scheduled"))
            .key(self.queue_key(queue, "active"))
            .key(self.queue_key(queue, "leases"))
            .key(self.queue_key(queue, "archived"))
            .arg(now.timestamp_millis())
            .arg(grace.as_millis() as u64)
            .arg(token.to_string())
            .arg(self.task_prefix())
            .arg(rfc3339(now))
            .arg(self.retention.cutoff(now).timestamp_millis())
            .arg(self.retention.max_size)
            .invoke_async(&mut self.conn.clone())
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let message: TaskMessage = serde_json::from_str(&raw)?;
        let expires_at = lease_deadline(&message, now, grace);
        debug!(task_id = %message.id, queue, %expires_at, "claimed task");
        Ok(Some(Lease {
            message,
            token,
            expires_at,
        }))
    }

    async fn complete(&self, lease: &Lease) -> BrokerResult<()> {
        let queue = &lease.message.queue;
        let done: i64 = redis::Script::new(COMPLETE_SCRIPT)
            .key(self.queue_key(queue, "active"))
            .key(self.queue_key(queue, "leases"))
            .key(self.task_key(lease.message.id))
            .arg(lease.message.id.to_string())
            .arg(lease.token.to_string())
            .invoke_async(&mut self.conn.clone())
            .await?;
        lease_held(done, lease)
    }

    async fn retry(
        &self,
        lease: &Lease,
        error: &str,
        now: DateTime<Utc>,
        process_at: DateTime<Utc>,
    ) -> BrokerResult<TaskMessage> {
        let mut message = lease.message.clone();
        message.record_failure(error, now);
        message.process_at = process_at;
        self.move_leased(lease, &message, "scheduled", process_at.timestamp_millis())
            .await?;
        Ok(message)
    }

    async fn archive(
        &self,
        lease: &Lease,
        error: &str,
        now: DateTime<Utc>,
    ) -> BrokerResult<ArchivedTask> {
        let mut message = lease.message.clone();
        message.record_failure(error, now);
        self.move_leased(lease, &message, "archived", now.timestamp_millis())
            .await?;
        self.trim_archive(&lease.message.queue, now).await?;
        Ok(ArchivedTask {
            reason: error.to_string(),
            message,
            archived_at: now,
        })
    }

    async fn release(&self, lease: &Lease) -> BrokerResult<()> {
        let queue = &lease.message.queue;
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.queue_key(queue, "active"))
            .key(self.queue_key(queue, "leases"))
            .key(self.queue_key(queue, "pending"))
            .arg(lease.message.id.to_string())
            .arg(lease.token.to_string())
            .invoke_async(&mut self.conn.clone())
            .await?;
        lease_held(released, lease)
    }

    async fn list_archived(&self, queue: &str, limit: usize) -> BrokerResult<Vec<ArchivedTask>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let entries: Vec<(String, f64)> = conn
            .zrevrange_withscores(self.queue_key(queue, "archived"), 0, limit as isize - 1)
            .await?;

        let mut archived = Vec::with_capacity(entries.len());
        for (id, score) in entries {
            let raw: Option<String> = conn.get(format!("{}{}", self.task_prefix(), id)).await?;
            let Some(raw) = raw else {
                continue;
            };
            let message: TaskMessage = serde_json::from_str(&raw)?;
            archived.push(ArchivedTask {
                reason: message.last_error.clone().unwrap_or_default(),
                archived_at: DateTime::from_timestamp_millis(score as i64).unwrap_or_default(),
                message,
            });
        }
        Ok(archived)
    }

    async fn requeue_archived(
        &self,
        queue: &str,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> BrokerResult<TaskInfo> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.task_key(id)).await?;
        let mut message: TaskMessage =
            serde_json::from_str(&raw.ok_or(BrokerError::NotFound(id))?)?;
        message.retried = 0;
        message.process_at = now;

        let requeued: i64 = redis::Script::new(REQUEUE_SCRIPT)
            .key(self.queue_key(queue, "archived"))
            .key(self.queue_key(queue, "pending"))
            .key(self.task_key(id))
            .arg(id.to_string())
            .arg(serde_json::to_string(&message)?)
            .invoke_async(&mut conn)
            .await?;
        if requeued == 0 {
            return Err(BrokerError::NotFound(id));
        }
        Ok(TaskInfo::from_message(&message, now))
    }

    async fn stats(&self, queue: &str) -> BrokerResult<QueueStats> {
        let (pending, scheduled, active, archived): (usize, usize, usize, usize) = redis::pipe()
            .cmd("LLEN")
            .arg(self.queue_key(queue, "pending"))
            .cmd("ZCARD")
            .arg(self.queue_key(queue, "scheduled"))
            .cmd("ZCARD")
            .arg(self.queue_key(queue, "active"))
            .cmd("ZCARD")
            .arg(self.queue_key(queue, "archived"))
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(QueueStats {
            queue: queue.to_string(),
            pending,
            scheduled,
            active,
            archived,
        })
    }
}
