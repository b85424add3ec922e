//! Task broker abstraction and the in-memory implementation.
//!
//! ## Task Lifecycle
//!
//! ```text
//! enqueue ──► scheduled ──(process_at reached)──► pending
//!   │                                               │
//!   └──────────(due now)────────────────────────────┤
//!                                                   ▼ claim
//!                     ┌──────── retry ◄──────── active (leased) ──── complete ──► gone
//!                     ▼                           │     │
//!                 scheduled               archive │     │ release / lease expiry
//!                                                 ▼     ▼
//!                                            archived  pending
//! ```
//!
//! Every transition out of `active` presents the lease token handed out by
//! `claim`. A worker whose lease expired and was reclaimed gets
//! [`BrokerError::LeaseLost`] instead of overwriting the new owner's state.
//! Reclaiming an expired lease counts as one failed attempt.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::types::{
    ArchiveRetention, ArchivedTask, Lease, QueueStats, TaskId, TaskInfo, TaskMessage,
};

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Task broker error.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker backend error: {0}")]
    Backend(String),
    #[error("task serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("lease on task {0} was lost")]
    LeaseLost(TaskId),
    #[error("task not found: {0}")]
    NotFound(TaskId),
}

/// Durable queue storage shared by distributors and processors.
#[async_trait]
pub trait TaskBroker: Send + Sync + 'static {
    /// Store a new task as pending or scheduled depending on `process_at`.
    async fn enqueue(&self, message: TaskMessage) -> BrokerResult<TaskInfo>;

    /// Atomically promote due tasks, reclaim expired leases and lease the
    /// oldest pending task of `queue`.
    ///
    /// The lease runs until `now + task timeout + grace`.
    async fn claim(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> BrokerResult<Option<Lease>>;

    /// Remove a successfully processed task.
    async fn complete(&self, lease: &Lease) -> BrokerResult<()>;

    /// Record a failed attempt and reschedule the task at `process_at`.
    async fn retry(
        &self,
        lease: &Lease,
        error: &str,
        now: DateTime<Utc>,
        process_at: DateTime<Utc>,
    ) -> BrokerResult<TaskMessage>;

    /// Record a failed attempt and move the task to the archive.
    async fn archive(
        &self,
        lease: &Lease,
        error: &str,
        now: DateTime<Utc>,
    ) -> BrokerResult<ArchivedTask>;

    /// Give the task back to the head of its pending list without counting an attempt.
    async fn release(&self, lease: &Lease) -> BrokerResult<()>;

    /// Archived tasks of `queue`, most recently archived first.
    async fn list_archived(&self, queue: &str, limit: usize) -> BrokerResult<Vec<ArchivedTask>>;

    /// Move an archived task back to pending with a fresh attempt budget.
    async fn requeue_archived(
        &self,
        queue: &str,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> BrokerResult<TaskInfo>;

    async fn stats(&self, queue: &str) -> BrokerResult<QueueStats>;
}

/// When a lease taken at `now` on `message` expires.
pub fn lease_deadline(message: &TaskMessage, now: DateTime<Utc>, grace: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(message.timeout + grace).unwrap_or_default()
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<TaskId>,
    scheduled: BTreeSet<(DateTime<Utc>, TaskId)>,
    /// Lease token and deadline per claimed task.
    active: HashMap<TaskId, (Uuid, DateTime<Utc>)>,
    archived: Vec<ArchivedTask>,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, TaskMessage>,
    queues: HashMap<String, QueueState>,
    retention: ArchiveRetention,
    reject_enqueues: usize,
}

impl Inner {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    fn check_lease(&self, lease: &Lease) -> BrokerResult<()> {
        let id = lease.message.id;
        match self
            .queues
            .get(&lease.message.queue)
            .and_then(|q| q.active.get(&id))
        {
            Some((token, _)) if *token == lease.token => Ok(()),
            _ => Err(BrokerError::LeaseLost(id)),
        }
    }

    fn take_active(&mut self, lease: &Lease) -> BrokerResult<TaskMessage> {
        self.check_lease(lease)?;
        let id = lease.message.id;
        self.queue(&lease.message.queue).active.remove(&id);
        self.tasks.get(&id).cloned().ok_or(BrokerError::NotFound(id))
    }

    fn archive_message(&mut self, message: TaskMessage, now: DateTime<Utc>) -> ArchivedTask {
        self.tasks.remove(&message.id);
        let archived = ArchivedTask {
            reason: message.last_error.clone().unwrap_or_default(),
            message,
            archived_at: now,
        };
        let retention = self.retention;
        let queue = self.queue(&archived.message.queue);
        queue.archived.push(archived.clone());

        let cutoff = retention.cutoff(now);
        queue.archived.retain(|a| a.archived_at >= cutoff);
        let excess = queue.archived.len().saturating_sub(retention.max_size);
        queue.archived = queue.archived.split_off(excess);
        archived
    }
}

/// In-memory broker for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    inner: Mutex<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: ArchiveRetention) -> Self {
        let broker = Self::default();
        broker.lock().retention = retention;
        broker
    }

    /// Fail the next `n` enqueue calls with a backend error.
    pub fn reject_next_enqueues(&self, n: usize) {
        self.lock().reject_enqueues = n;
    }

    /// Snapshot of a stored (non-archived) task.
    pub fn task(&self, id: TaskId) -> Option<TaskMessage> {
        self.lock().tasks.get(&id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TaskBroker for InMemoryBroker {
    async fn enqueue(&self, message: TaskMessage) -> BrokerResult<TaskInfo> {
        let mut inner = self.lock();
        if inner.reject_enqueues > 0 {
            inner.reject_enqueues -= 1;
            return Err(BrokerError::Backend("enqueue rejected".into()));
        }

        let now = Utc::now();
        let info = TaskInfo::from_message(&message, now);
        let queue = inner.queue(&message.queue);
        if message.is_due(now) {
            queue.pending.push_back(message.id);
        } else {
            queue.scheduled.insert((message.process_at, message.id));
        }
        inner.tasks.insert(message.id, message);
        Ok(info)
    }

    async fn claim(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> BrokerResult<Option<Lease>> {
        let mut inner = self.lock();
        let inner = &mut *inner;

        let queue = inner.queue(queue_name);
        while let Some(&(at, id)) = queue.scheduled.first() {
            if at > now {
                break;
            }
            queue.scheduled.remove(&(at, id));
            queue.pending.push_back(id);
        }

        let expired: Vec<TaskId> = queue
            .active
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            inner.queue(queue_name).active.remove(&id);
            let Some(message) = inner.tasks.get_mut(&id) else {
                continue;
            };
            message.record_failure("lease expired", now);
            if message.is_exhausted() {
                let message = message.clone();
                inner.archive_message(message, now);
            } else {
                inner.queue(queue_name).pending.push_back(id);
            }
        }

        let Some(id) = inner.queue(queue_name).pending.pop_front() else {
            return Ok(None);
        };
        let message = inner.tasks.get(&id).cloned().ok_or(BrokerError::NotFound(id))?;
        let token = Uuid::new_v4();
        let expires_at = lease_deadline(&message, now, grace);
        inner
            .queue(queue_name)
            .active
            .insert(id, (token, expires_at));

        Ok(Some(Lease {
            message,
            token,
            expires_at,
        }))
    }

    async fn complete(&self, lease: &Lease) -> BrokerResult<()> {
        let mut inner = self.lock();
        let message = inner.take_active(lease)?;
        inner.tasks.remove(&message.id);
        Ok(())
    }

    async fn retry(
        &self,
        lease: &Lease,
        error: &str,
        now: DateTime<Utc>,
        process_at: DateTime<Utc>,
    ) -> BrokerResult<TaskMessage> {
        let mut inner = self.lock();
        let mut message = inner.take_active(lease)?;
        message.record_failure(error, now);
        message.process_at = process_at;
        inner
            .queue(&message.queue)
            .scheduled
            .insert((process_at, message.id));
        inner.tasks.insert(message.id, message.clone());
        Ok(message)
    }

    async fn archive(
        &self,
        lease: &Lease,
        error: &str,
        now: DateTime<Utc>,
    ) -> BrokerResult<ArchivedTask> {
        let mut inner = self.lock();
        let mut message = inner.take_active(lease)?;
        message.record_failure(error, now);
        Ok(inner.archive_message(message, now))
    }

    async fn release(&self, lease: &Lease) -> BrokerResult<()> {
        let mut inner = self.lock();
        let message = inner.take_active(lease)?;
        inner.queue(&message.queue).pending.push_front(message.id);
        Ok(())
    }

    async fn list_archived(&self, queue: &str, limit: usize) -> BrokerResult<Vec<ArchivedTask>> {
        let inner = self.lock();
        Ok(inner
            .queues
            .get(queue)
            .map(|q| q.archived.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn requeue_archived(
        &self,
        queue_name: &str,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> BrokerResult<TaskInfo> {
        let mut inner = self.lock();
        let queue = inner.queue(queue_name);
        let position = queue
            .archived
            .iter()
            .position(|a| a.message.id == id)
            .ok_or(BrokerError::NotFound(id))?;
        let mut message = queue.archived.remove(position).message;
        message.retried = 0;
        message.process_at = now;
        queue.pending.push_back(id);

        let info = TaskInfo::from_message(&message, now);
        inner.tasks.insert(id, message);
        Ok(info)
    }

    async fn stats(&self, queue: &str) -> BrokerResult<QueueStats> {
        let inner = self.lock();
        let stats = inner
            .queues
            .get(queue)
            .map(|q| QueueStats {
                queue: queue.to_string(),
                pending: q.pending.len(),
                scheduled: q.scheduled.len(),
                active: q.active.len(),
                archived: q.archived.len(),
            })
            .unwrap_or_else(|| QueueStats {
                queue: queue.to_string(),
                ..Default::default()
            });
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{Task, TaskOptions, TaskState};

    const GRACE: Duration = Duration::from_secs(5);

    /// Leases on these tasks expire 15s after the claim.
    fn message(options: TaskOptions) -> TaskMessage {
        let options = options.timeout(Duration::from_secs(10));
        TaskMessage::new(Task::new("task:test", b"{}".to_vec()), &options, Utc::now())
    }

    #[tokio::test]
    async fn claims_in_fifo_order() {
        let broker = InMemoryBroker::new();
        let first = message(TaskOptions::default());
        let second = message(TaskOptions::default());
        broker.enqueue(first.clone()).await.unwrap();
        broker.enqueue(second.clone()).await.unwrap();

        let now = Utc::now();
        let a = broker.claim("default", now, GRACE).await.unwrap().unwrap();
        let b = broker.claim("default", now, GRACE).await.unwrap().unwrap();
        assert_eq!(a.message.id, first.id);
        assert_eq!(b.message.id, second.id);
        assert!(broker.claim("default", now, GRACE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scheduled_tasks_wait_until_due() {
        let broker = InMemoryBroker::new();
        let delayed = message(TaskOptions::default().process_in(Duration::from_secs(10)));
        let info = broker.enqueue(delayed.clone()).await.unwrap();
        assert_eq!(info.state, TaskState::Scheduled);

        let now = Utc::now();
        assert!(broker.claim("default", now, GRACE).await.unwrap().is_none());

        let later = now + chrono::Duration::seconds(11);
        let lease = broker.claim("default", later, GRACE).await.unwrap().unwrap();
        assert_eq!(lease.message.id, delayed.id);
    }

    #[tokio::test]
    async fn retry_reschedules_and_counts_the_attempt() {
        let broker = InMemoryBroker::new();
        broker.enqueue(message(TaskOptions::default())).await.unwrap();

        let now = Utc::now();
        let lease = broker.claim("default", now, GRACE).await.unwrap().unwrap();
        let at = now + chrono::Duration::seconds(5);
        let retried = broker.retry(&lease, "boom", now, at).await.unwrap();
        assert_eq!(retried.retried, 1);
        assert_eq!(retried.last_error.as_deref(), Some("boom"));

        let stats = broker.stats("default").await.unwrap();
        assert_eq!((stats.pending, stats.scheduled, stats.active), (0, 1, 0));

        let again = broker.claim("default", at, GRACE).await.unwrap().unwrap();
        assert_eq!(again.message.retried, 1);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_and_stale_holder_loses_it() {
        let broker = InMemoryBroker::new();
        broker.enqueue(message(TaskOptions::default())).await.unwrap();

        let now = Utc::now();
        let stale = broker.claim("default", now, GRACE).await.unwrap().unwrap();
        assert_eq!(stale.expires_at, now + chrono::Duration::seconds(15));
        let later = now + chrono::Duration::seconds(16);
        let fresh = broker.claim("default", later, GRACE).await.unwrap().unwrap();
        assert_eq!(fresh.message.id, stale.message.id);
        assert_eq!(fresh.message.retried, 1);
        assert_ne!(fresh.token, stale.token);

        assert!(matches!(
            broker.complete(&stale).await,
            Err(BrokerError::LeaseLost(_))
        ));
        broker.complete(&fresh).await.unwrap();
        assert!(broker.task(fresh.message.id).is_none());
    }

    #[tokio::test]
    async fn archive_and_requeue() {
        let broker = InMemoryBroker::new();
        let msg = message(TaskOptions::default().queue("critical"));
        broker.enqueue(msg.clone()).await.unwrap();

        let now = Utc::now();
        let lease = broker.claim("critical", now, GRACE).await.unwrap().unwrap();
        let archived = broker.archive(&lease, "user not found", now).await.unwrap();
        assert_eq!(archived.reason, "user not found");

        let listed = broker.list_archived("critical", 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].message.id, msg.id);

        let info = broker.requeue_archived("critical", msg.id, now).await.unwrap();
        assert_eq!(info.state, TaskState::Pending);
        assert!(broker.list_archived("critical", 10).await.unwrap().is_empty());

        let lease = broker.claim("critical", now, GRACE).await.unwrap().unwrap();
        assert_eq!(lease.message.retried, 0);
        assert!(matches!(
            broker.requeue_archived("critical", msg.id, now).await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn archive_keeps_only_recent_entries() {
        let broker = InMemoryBroker::with_retention(ArchiveRetention {
            max_age: chrono::Duration::days(1),
            max_size: 2,
        });
        let start = Utc::now();

        let mut ids = Vec::new();
        for hours in [0, 1, 2] {
            let msg = message(TaskOptions::default());
            ids.push(msg.id);
            broker.enqueue(msg).await.unwrap();
            let at = start + chrono::Duration::hours(hours);
            let lease = broker.claim("default", at, GRACE).await.unwrap().unwrap();
            broker.archive(&lease, "boom", at).await.unwrap();
        }
        let listed: Vec<TaskId> = broker
            .list_archived("default", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.message.id)
            .collect();
        assert_eq!(listed, vec![ids[2], ids[1]]);

        let msg = message(TaskOptions::default());
        broker.enqueue(msg.clone()).await.unwrap();
        let later = start + chrono::Duration::days(2);
        let lease = broker.claim("default", later, GRACE).await.unwrap().unwrap();
        broker.archive(&lease, "boom", later).await.unwrap();

        let listed = broker.list_archived("default", 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].message.id, msg.id);
        assert_eq!(broker.stats("default").await.unwrap().archived, 1);
    }

    #[tokio::test]
    async fn release_returns_task_to_the_head() {
        let broker = InMemoryBroker::new();
        let first = message(TaskOptions::default());
        let second = message(TaskOptions::default());
        broker.enqueue(first.clone()).await.unwrap();
        broker.enqueue(second).await.unwrap();

        let now = Utc::now();
        let lease = broker.claim("default", now, GRACE).await.unwrap().unwrap();
        broker.release(&lease).await.unwrap();

        let again = broker.claim("default", now, GRACE).await.unwrap().unwrap();
        assert_eq!(again.message.id, first.id);
        assert_eq!(again.message.retried, 0);
    }

    #[tokio::test]
    async fn rejected_enqueue_stores_nothing() {
        let broker = InMemoryBroker::new();
        broker.reject_next_enqueues(1);
        assert!(broker.enqueue(message(TaskOptions::default())).await.is_err());
        assert_eq!(broker.stats("default").await.unwrap().pending, 0);
        broker.enqueue(message(TaskOptions::default())).await.unwrap();
    }
}
