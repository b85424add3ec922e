//! Core task types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue for user-facing work (verification emails).
pub const QUEUE_CRITICAL: &str = "critical";
pub const QUEUE_DEFAULT: &str = "default";

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A unit of background work: a type name for routing plus opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub type_name: String,
    pub payload: Vec<u8>,
}

impl Task {
    pub fn new(type_name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            type_name: type_name.into(),
            payload,
        }
    }

    /// Task whose payload is `payload` encoded as JSON.
    pub fn json<T: Serialize>(
        type_name: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(type_name, serde_json::to_vec(payload)?))
    }
}

/// Per-enqueue options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    pub queue: String,
    /// Total attempts before the task is archived.
    pub max_retry: u32,
    pub process_at: Option<DateTime<Utc>>,
    pub process_in: Option<Duration>,
    /// Upper bound on a single attempt.
    pub timeout: Duration,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            queue: QUEUE_DEFAULT.to_string(),
            max_retry: 25,
            process_at: None,
            process_in: None,
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl TaskOptions {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Run no earlier than `at`. Overrides any `process_in`.
    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self.process_in = None;
        self
    }

    /// Run no earlier than `delay` after enqueue. Overrides any `process_at`.
    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_in = Some(delay);
        self.process_at = None;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Earliest processing time for a task enqueued at `now`.
    pub fn resolve_process_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match (self.process_at, self.process_in) {
            (Some(at), _) => at,
            (None, Some(delay)) => now + chrono::Duration::from_std(delay).unwrap_or_default(),
            (None, None) => now,
        }
    }
}

/// Durable job record, as stored by a broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: TaskId,
    pub type_name: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub queue: String,
    pub max_retry: u32,
    /// Failed attempts so far.
    pub retried: u32,
    pub timeout: Duration,
    pub enqueued_at: DateTime<Utc>,
    pub process_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub last_failed_at: Option<DateTime<Utc>>,
}

impl TaskMessage {
    pub fn new(task: Task, options: &TaskOptions, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            type_name: task.type_name,
            payload: task.payload,
            queue: options.queue.clone(),
            max_retry: options.max_retry,
            retried: 0,
            timeout: options.timeout,
            enqueued_at: now,
            process_at: options.resolve_process_at(now),
            last_error: None,
            last_failed_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.process_at <= now
    }

    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Record one failed attempt.
    pub fn record_failure(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.retried += 1;
        self.last_error = Some(error.into());
        self.last_failed_at = Some(now);
    }

    /// Whether the failed-attempt count has reached `max_retry`.
    pub fn is_exhausted(&self) -> bool {
        self.retried >= self.max_retry
    }
}

/// Where a task currently lives in its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Ready to be claimed.
    Pending,
    /// Waiting for `process_at` (first run or retry backoff).
    Scheduled,
    /// Claimed under a lease.
    Active,
    /// Dead-lettered.
    Archived,
}

/// Returned by enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub queue: String,
    pub type_name: String,
    pub state: TaskState,
    pub max_retry: u32,
    pub process_at: DateTime<Utc>,
}

impl TaskInfo {
    pub fn from_message(message: &TaskMessage, now: DateTime<Utc>) -> Self {
        Self {
            id: message.id,
            queue: message.queue.clone(),
            type_name: message.type_name.clone(),
            state: if message.is_due(now) {
                TaskState::Pending
            } else {
                TaskState::Scheduled
            },
            max_retry: message.max_retry,
            process_at: message.process_at,
        }
    }
}

/// Entry in the archive (dead-letter) set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedTask {
    pub message: TaskMessage,
    pub archived_at: DateTime<Utc>,
    pub reason: String,
}

/// How long archived tasks are kept, applied whenever a task is archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveRetention {
    pub max_age: chrono::Duration,
    /// Per queue; the oldest entries go first.
    pub max_size: usize,
}

impl Default for ArchiveRetention {
    fn default() -> Self {
        Self {
            max_age: chrono::Duration::days(90),
            max_size: 10_000,
        }
    }
}

impl ArchiveRetention {
    /// Entries archived before this are dropped.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.max_age
    }
}

/// Per-queue counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: String,
    pub pending: usize,
    pub scheduled: usize,
    pub active: usize,
    pub archived: usize,
}

/// Exclusive claim on a task until `expires_at`.
///
/// Only the holder of `token` can complete, retry, archive or release the
/// task. Once the lease expires another worker may reclaim it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub message: TaskMessage,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Exponential retry backoff: `base_delay * 2^(n-1)` capped at `max_delay`,
/// spread by a random `±jitter` fraction so tasks that fail together do not
/// retry together. Attempt limits live on each task (`max_retry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay, 0.0-1.0.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10 * 60),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Same delay before every retry, no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    /// Delay before the next attempt, given `attempt` failures so far.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
        let delay_ms = (self.base_delay.as_millis() as f64 * exp).min(max_ms);

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(-1.0_f64..=1.0) * jitter_range
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64)
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn jitter_spreads_tasks_failing_at_the_same_attempt() {
        let policy = RetryPolicy::default();
        let delays: HashSet<Duration> = (0..1000).map(|_| policy.delay_for_attempt(3)).collect();

        assert!(delays.len() > 1, "every retry got the same delay");
        for delay in &delays {
            assert!(*delay >= Duration::from_millis(3600));
            assert!(*delay <= Duration::from_millis(4400));
        }
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.5,
        };
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 1..100 {
            let delay = policy.delay_with(attempt, &mut rng);
            assert!(delay <= Duration::from_secs(60));
            assert!(delay >= Duration::from_millis(500));
        }
    }

    #[test]
    fn options_default_and_resolve_schedule() {
        let now = Utc::now();
        let options = TaskOptions::default();
        assert_eq!(options.queue, QUEUE_DEFAULT);
        assert_eq!(options.max_retry, 25);
        assert_eq!(options.timeout, Duration::from_secs(1800));
        assert_eq!(options.resolve_process_at(now), now);

        let delayed = TaskOptions::default().process_in(Duration::from_secs(10));
        assert_eq!(
            delayed.resolve_process_at(now),
            now + chrono::Duration::seconds(10)
        );

        let at = now + chrono::Duration::minutes(5);
        let pinned = delayed.process_at(at);
        assert_eq!(pinned.process_in, None);
        assert_eq!(pinned.resolve_process_at(now), at);
    }

    #[test]
    fn message_payload_is_base64_on_the_wire() {
        let task = Task::json("task:test", &serde_json::json!({"username": "alice"})).unwrap();
        let message = TaskMessage::new(task, &TaskOptions::default(), Utc::now());

        let wire = serde_json::to_value(&message).unwrap();
        assert!(wire["payload"].is_string());

        let decoded: TaskMessage = serde_json::from_value(wire).unwrap();
        let payload: serde_json::Value = decoded.decode_json().unwrap();
        assert_eq!(payload["username"], "alice");
    }

    #[test]
    fn failures_exhaust_after_max_retry() {
        let now = Utc::now();
        let mut message = TaskMessage::new(
            Task::new("task:test", Vec::new()),
            &TaskOptions::default().max_retry(2),
            now,
        );
        message.record_failure("first", now);
        assert!(!message.is_exhausted());
        message.record_failure("second", now);
        assert!(message.is_exhausted());
        assert_eq!(message.last_error.as_deref(), Some("second"));
    }
}
