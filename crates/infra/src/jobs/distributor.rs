//! Producer side of the task queue.

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::{info, instrument};

use ledgerline_core::User;

use super::broker::{BrokerResult, TaskBroker};
use super::types::{Task, TaskInfo, TaskMessage, TaskOptions};
use super::verify_email::{PayloadSendVerifyEmail, TASK_SEND_VERIFY_EMAIL};

/// Writes tasks to a broker. Enqueue is independent of any database
/// transaction the caller may have open.
#[derive(Debug)]
pub struct TaskDistributor<B: ?Sized> {
    broker: Arc<B>,
}

impl<B: ?Sized> Clone for TaskDistributor<B> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
        }
    }
}

impl<B: TaskBroker + ?Sized> TaskDistributor<B> {
    pub fn new(broker: Arc<B>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    #[instrument(skip(self, task), fields(type_name = %task.type_name, queue = %options.queue), err)]
    pub async fn enqueue(&self, task: Task, options: TaskOptions) -> BrokerResult<TaskInfo> {
        let message = TaskMessage::new(task, &options, Utc::now());
        let info = self.broker.enqueue(message).await?;
        info!(
            task_id = %info.id,
            type_name = %info.type_name,
            queue = %info.queue,
            max_retry = info.max_retry,
            process_at = %info.process_at,
            "enqueued task"
        );
        Ok(info)
    }

    /// Enqueue a verification email for `payload.username`.
    pub async fn distribute_send_verify_email(
        &self,
        payload: &PayloadSendVerifyEmail,
        options: TaskOptions,
    ) -> BrokerResult<TaskInfo> {
        let task = Task::json(TASK_SEND_VERIFY_EMAIL, payload)?;
        self.enqueue(task, options).await
    }

    /// After-create hook for `UserWorkflow::create_user_tx` that enqueues the
    /// verification email of the new user.
    ///
    /// A broker failure fails the hook, which rolls the user back.
    pub fn send_verify_email_hook(
        &self,
        options: TaskOptions,
    ) -> impl FnOnce(User) -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static
    where
        B: 'static,
    {
        let distributor = self.clone();
        move |user: User| -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(async move {
                let payload = PayloadSendVerifyEmail {
                    username: user.username,
                };
                distributor
                    .distribute_send_verify_email(&payload, options)
                    .await?;
                Ok(())
            })
        }
    }
}
