//! Consumer side of the task queue.
//!
//! A [`TaskProcessor`] runs `concurrency` tokio workers. Each worker loops:
//!
//! 1. Order the configured queues by weighted random sampling
//!    ([`weighted_order`]) and claim the first due task in that order.
//! 2. Dispatch on the task type to a registered [`TaskHandler`], bounded by
//!    the task's own timeout.
//! 3. Report the outcome to the broker: complete, retry with backoff, or
//!    archive.
//!
//! ## Failure handling
//!
//! | Handler result | Attempt `n` < `max_retry` | Attempt `n` ≥ `max_retry` |
//! |----------------|---------------------------|---------------------------|
//! | `Ok(())` | completed | completed |
//! | terminal error | archived | archived |
//! | other error, timeout, panic | retried after `backoff(n)` | archived |
//!
//! On shutdown workers stop claiming. In-flight tasks get `shutdown_timeout`
//! to finish; whatever is still running after that is aborted and its lease
//! released back to the head of the pending list.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::broker::{BrokerError, BrokerResult, TaskBroker};
use super::types::{Lease, QUEUE_CRITICAL, QUEUE_DEFAULT, RetryPolicy, TaskId, TaskMessage};
use crate::mail::MailError;
use crate::store::StoreError;

/// Handler failure.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Do not retry; archive the task right away.
    #[error("{0} (skip retry)")]
    SkipRetry(String),

    #[error("{0}")]
    Failed(String),

    #[error("no handler registered for task type {0}")]
    UnknownType(String),

    #[error("invalid task payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("task handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Whether retrying can never help.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskError::SkipRetry(_) | TaskError::Payload(_))
    }
}

/// Processes one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn process_task(&self, message: &TaskMessage) -> Result<(), TaskError>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    async fn process_task(&self, message: &TaskMessage) -> Result<(), TaskError> {
        (self.0)(message.clone()).await
    }
}

/// Task processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Name for logging
    pub name: String,
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Queue names with their relative weights
    pub queues: Vec<(String, u32)>,
    /// Sleep between claims when every queue is empty
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Added to the task timeout to form the lease duration
    pub lease_grace: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: "task-processor".to_string(),
            concurrency: 10,
            queues: vec![
                (QUEUE_CRITICAL.to_string(), 10),
                (QUEUE_DEFAULT.to_string(), 5),
            ],
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            lease_grace: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(8),
        }
    }
}

impl ProcessorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_queues<I, Q>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = (Q, u32)>,
        Q: Into<String>,
    {
        self.queues = queues.into_iter().map(|(q, w)| (q.into(), w)).collect();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lease_grace(mut self, grace: Duration) -> Self {
        self.lease_grace = grace;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Processor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ProcessorStats {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_retried: u64,
    pub tasks_archived: u64,
    pub current_running: usize,
}

/// What happened to a claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Retried { attempt: u32, delay: Duration },
    Archived { reason: String },
}

/// Queue names in the order a worker should try them.
///
/// Each queue draws the key `u^(1/weight)` for a uniform `u` and queues are
/// sorted by descending key, so queue `i` comes first with probability
/// `weight_i / Σ weight`. Zero-weight queues are never polled.
pub fn weighted_order<'q, R: Rng + ?Sized>(
    queues: &'q [(String, u32)],
    rng: &mut R,
) -> Vec<&'q str> {
    let mut keyed: Vec<(f64, &str)> = queues
        .iter()
        .filter(|(_, weight)| *weight > 0)
        .map(|(name, weight)| {
            let u: f64 = rng.gen_range(f64::EPSILON..1.0);
            (u.powf(1.0 / f64::from(*weight)), name.as_str())
        })
        .collect();
    keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
    keyed.into_iter().map(|(_, name)| name).collect()
}

/// Pulls tasks from a [`TaskBroker`] and runs them.
pub struct TaskProcessor<B: ?Sized> {
    broker: Arc<B>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    config: ProcessorConfig,
    stats: Arc<Mutex<ProcessorStats>>,
    in_flight: Mutex<HashMap<TaskId, Lease>>,
}

impl<B: ?Sized> std::fmt::Debug for TaskProcessor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskProcessor")
            .field("config", &self.config)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<B: TaskBroker + ?Sized> TaskProcessor<B> {
    pub fn new(broker: Arc<B>, config: ProcessorConfig) -> Self {
        Self {
            broker,
            handlers: HashMap::new(),
            config,
            stats: Arc::new(Mutex::new(ProcessorStats::default())),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler for a task type.
    ///
    /// `pattern` is either an exact type name, a prefix ending in `*`
    /// (`"task:*"`), or `"*"` for everything else.
    pub fn register_handler(
        &mut self,
        pattern: impl Into<String>,
        handler: impl TaskHandler + 'static,
    ) {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn stats(&self) -> ProcessorStats {
        lock(&self.stats).clone()
    }

    /// Exact match first, then the longest matching `prefix*` pattern.
    fn handler_for(&self, type_name: &str) -> Option<&Arc<dyn TaskHandler>> {
        if let Some(handler) = self.handlers.get(type_name) {
            return Some(handler);
        }
        self.handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix('*')?;
                type_name.starts_with(prefix).then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler)
    }

    /// Claim and run at most one task. `Ok(None)` means every queue was empty.
    pub async fn process_next(&self) -> BrokerResult<Option<Outcome>> {
        let Some(lease) = self.claim_next().await? else {
            return Ok(None);
        };
        let id = lease.message.id;
        debug!(
            processor = %self.config.name,
            task_id = %id,
            type_name = %lease.message.type_name,
            queue = %lease.message.queue,
            retried = lease.message.retried,
            "claimed task"
        );

        self.track(&lease);
        let result = self.execute(&lease.message).await;
        let outcome = self.finish(&lease, result).await;
        self.untrack(id);

        let outcome = outcome?;
        self.record(&outcome);
        Ok(Some(outcome))
    }

    async fn claim_next(&self) -> BrokerResult<Option<Lease>> {
        let order = weighted_order(&self.config.queues, &mut rand::thread_rng());
        for queue in order {
            if let Some(lease) = self
                .broker
                .claim(queue, Utc::now(), self.config.lease_grace)
                .await?
            {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    async fn execute(&self, message: &TaskMessage) -> Result<(), TaskError> {
        let Some(handler) = self.handler_for(&message.type_name) else {
            warn!(task_id = %message.id, type_name = %message.type_name, "no handler for task");
            return Err(TaskError::UnknownType(message.type_name.clone()));
        };

        let run = AssertUnwindSafe(handler.process_task(message)).catch_unwind();
        match tokio::time::timeout(message.timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(TaskError::Timeout(message.timeout)),
        }
    }

    async fn finish(&self, lease: &Lease, result: Result<(), TaskError>) -> BrokerResult<Outcome> {
        let message = &lease.message;
        let err = match result {
            Ok(()) => {
                self.broker.complete(lease).await?;
                debug!(task_id = %message.id, "task completed");
                return Ok(Outcome::Completed);
            }
            Err(err) => err,
        };

        let now = Utc::now();
        let attempt = message.retried + 1;
        let reason = err.to_string();

        if err.is_terminal() || attempt >= message.max_retry {
            self.broker.archive(lease, &reason, now).await?;
            warn!(
                task_id = %message.id,
                type_name = %message.type_name,
                attempt,
                max_retry = message.max_retry,
                error = %reason,
                "task archived"
            );
            return Ok(Outcome::Archived { reason });
        }

        let delay = self.config.retry.delay_for_attempt(attempt);
        let process_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
        self.broker.retry(lease, &reason, now, process_at).await?;
        info!(
            task_id = %message.id,
            type_name = %message.type_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "task failed, retry scheduled"
        );
        Ok(Outcome::Retried { attempt, delay })
    }

    fn track(&self, lease: &Lease) {
        lock(&self.in_flight).insert(lease.message.id, lease.clone());
        lock(&self.stats).current_running += 1;
    }

    fn untrack(&self, id: TaskId) {
        lock(&self.in_flight).remove(&id);
        let mut stats = lock(&self.stats);
        stats.current_running = stats.current_running.saturating_sub(1);
    }

    fn record(&self, outcome: &Outcome) {
        let mut stats = lock(&self.stats);
        stats.tasks_processed += 1;
        match outcome {
            Outcome::Completed => stats.tasks_succeeded += 1,
            Outcome::Retried { .. } => stats.tasks_retried += 1,
            Outcome::Archived { .. } => stats.tasks_archived += 1,
        }
    }

    /// Hand leases of aborted tasks back to their queues.
    async fn release_in_flight(&self) {
        let leases: Vec<Lease> = {
            let mut in_flight = lock(&self.in_flight);
            let mut stats = lock(&self.stats);
            stats.current_running = 0;
            in_flight.drain().map(|(_, lease)| lease).collect()
        };
        for lease in leases {
            match self.broker.release(&lease).await {
                Ok(()) => info!(task_id = %lease.message.id, "released in-flight task"),
                Err(err) => warn!(task_id = %lease.message.id, error = %err, "failed to release task"),
            }
        }
    }

    async fn run_worker(&self, worker: usize, mut stop: watch::Receiver<bool>) {
        loop {
            let stopping = *stop.borrow();
            if stopping {
                break;
            }
            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => {
                    error!(processor = %self.config.name, worker, error = %err, "task processing failed");
                }
            }
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        debug!(processor = %self.config.name, worker, "worker stopped");
    }

    /// Run until `shutdown` resolves, then drain and return final statistics.
    pub async fn start<F>(self, shutdown: F) -> ProcessorStats
    where
        F: Future<Output = ()> + Send,
    {
        let processor = Arc::new(self);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut workers = JoinSet::new();
        for worker in 0..processor.config.concurrency.max(1) {
            let processor = Arc::clone(&processor);
            let stop = stop_rx.clone();
            workers.spawn(async move { processor.run_worker(worker, stop).await });
        }
        info!(
            processor = %processor.config.name,
            concurrency = processor.config.concurrency,
            queues = ?processor.config.queues,
            "task processor started"
        );

        shutdown.await;
        info!(processor = %processor.config.name, "task processor shutting down");
        let _ = stop_tx.send(true);

        let drained = tokio::time::timeout(processor.config.shutdown_timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                processor = %processor.config.name,
                timeout_ms = processor.config.shutdown_timeout.as_millis() as u64,
                "in-flight tasks did not finish in time, aborting"
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
            processor.release_in_flight().await;
        }

        let stats = processor.stats();
        info!(
            processor = %processor.config.name,
            processed = stats.tasks_processed,
            "task processor stopped"
        );
        stats
    }

    /// Start on the current runtime. Dropping the handle also shuts down.
    pub fn spawn(self) -> ProcessorHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let stats = Arc::clone(&self.stats);
        let join = tokio::spawn(self.start(async move {
            let _ = shutdown_rx.await;
        }));
        ProcessorHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

/// Handle to control a spawned processor.
#[derive(Debug)]
pub struct ProcessorHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<ProcessorStats>,
    stats: Arc<Mutex<ProcessorStats>>,
}

impl ProcessorHandle {
    pub fn stats(&self) -> ProcessorStats {
        lock(&self.stats).clone()
    }

    /// Request graceful shutdown and wait for it.
    pub async fn shutdown(self) -> ProcessorStats {
        let _ = self.shutdown.send(());
        match self.join.await {
            Ok(stats) => stats,
            Err(err) => {
                error!(error = %err, "task processor exited abnormally");
                lock(&self.stats).clone()
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
