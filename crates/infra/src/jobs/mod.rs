//! Background task queue with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Tasks are typed by name and carry an opaque payload
//! - Delivery is at-least-once; handlers must tolerate repeats
//! - Exponential backoff between attempts, archive after `max_retry`
//! - Weighted queues so urgent work is drained first without starving the rest
//!
//! ## Components
//!
//! - `TaskBroker`: durable queue storage (Redis or in-memory)
//! - `TaskDistributor`: producer API used by request handlers and workflows
//! - `TaskProcessor`: worker pool that leases, runs and settles tasks
//! - `SendVerifyEmailHandler`: the verification email task

pub mod broker;
pub mod distributor;
pub mod processor;
#[cfg(feature = "redis")]
pub mod redis;
pub mod types;
pub mod verify_email;

pub use broker::{BrokerError, BrokerResult, InMemoryBroker, TaskBroker};
pub use distributor::TaskDistributor;
pub use processor::{
    Outcome, ProcessorConfig, ProcessorHandle, ProcessorStats, TaskError, TaskHandler,
    TaskProcessor, handler_fn, weighted_order,
};
#[cfg(feature = "redis")]
pub use redis::RedisBroker;
pub use types::{
    ArchiveRetention, ArchivedTask, Lease, QUEUE_CRITICAL, QUEUE_DEFAULT, QueueStats, RetryPolicy,
    Task, TaskId, TaskInfo, TaskMessage, TaskOptions, TaskState,
};
pub use verify_email::{
    PayloadSendVerifyEmail, SendVerifyEmailHandler, TASK_SEND_VERIFY_EMAIL, verify_email_options,
};
