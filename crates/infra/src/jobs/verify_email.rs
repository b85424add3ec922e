//! The `task:send_verify_email` task.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use ledgerline_core::{NewVerifyEmail, User, VerifyEmail};

use super::processor::{TaskError, TaskHandler};
use super::types::{QUEUE_CRITICAL, TaskMessage, TaskOptions};
use crate::mail::{EmailMessage, EmailSender};
use crate::store::{Coordinator, Queries, Store};
use crate::users::random_secret_code;

pub const TASK_SEND_VERIFY_EMAIL: &str = "task:send_verify_email";

/// Options registration uses for the verification email task.
pub fn verify_email_options() -> TaskOptions {
    TaskOptions::default()
        .queue(QUEUE_CRITICAL)
        .max_retry(10)
        .process_in(std::time::Duration::from_secs(10))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub username: String,
}

/// Issues a verification code for a user and mails them the link.
pub struct SendVerifyEmailHandler<S> {
    coordinator: Coordinator<S>,
    mailer: Arc<dyn EmailSender>,
    base_url: String,
    code_ttl: Duration,
}

impl<S> SendVerifyEmailHandler<S> {
    pub fn new(
        coordinator: Coordinator<S>,
        mailer: Arc<dyn EmailSender>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            mailer,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            code_ttl: Duration::minutes(15),
        }
    }

    pub fn with_code_ttl(mut self, ttl: Duration) -> Self {
        self.code_ttl = ttl;
        self
    }

    fn verify_url(&self, code: &VerifyEmail) -> String {
        format!(
            "{}/v1/verify_email?email_id={}&secret_code={}",
            self.base_url, code.id, code.secret_code
        )
    }
}

impl<S: Store> SendVerifyEmailHandler<S> {
    /// Current unused code for `user`, or a freshly issued one.
    ///
    /// A retried task reuses the code it created on an earlier attempt.
    async fn code_for(&self, user: &User) -> Result<VerifyEmail, TaskError> {
        let now = Utc::now();
        let username = user.username.clone();
        let email = user.email.clone();
        let expires_at = now + self.code_ttl;

        let code = self
            .coordinator
            .run_atomic(move |tx| {
                Box::pin(async move {
                    if let Some(code) = tx.latest_active_verify_email(&username, now).await? {
                        if code.email == email {
                            return Ok(code);
                        }
                    }
                    tx.create_verify_email(NewVerifyEmail {
                        username,
                        email,
                        secret_code: random_secret_code(),
                        expires_at,
                    })
                    .await
                })
            })
            .await?;
        Ok(code)
    }
}

#[async_trait]
impl<S: Store> TaskHandler for SendVerifyEmailHandler<S> {
    #[instrument(skip_all, fields(task_id = %message.id), err)]
    async fn process_task(&self, message: &TaskMessage) -> Result<(), TaskError> {
        let payload: PayloadSendVerifyEmail = message.decode_json()?;

        let lookup = self.coordinator.store().acquire().await?.get_user(&payload.username).await;
        let user = match lookup {
            Err(err) if err.is_not_found() => {
                return Err(TaskError::SkipRetry(format!(
                    "user {} does not exist",
                    payload.username
                )));
            }
            other => other?,
        };
        if user.is_email_verified {
            info!(username = %user.username, "email already verified, nothing to send");
            return Ok(());
        }

        let code = self.code_for(&user).await?;
        let content = format!(
            "Hello {},<br/>\
             Thank you for registering with us!<br/>\
             Please <a href=\"{}\">click here</a> to verify your email address.<br/>",
            user.full_name,
            self.verify_url(&code)
        );
        self.mailer
            .send_email(EmailMessage {
                subject: "Welcome to Ledgerline".into(),
                content,
                to: vec![user.email.clone()],
                ..Default::default()
            })
            .await?;

        info!(username = %user.username, email = %user.email, "sent verify email");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ledgerline_core::{NewUser, UserUpdate};

    use super::*;
    use crate::jobs::types::Task;
    use crate::mail::InMemoryOutbox;
    use crate::store::InMemoryStore;

    type Handler = SendVerifyEmailHandler<InMemoryStore>;

    async fn seeded() -> (InMemoryStore, Arc<InMemoryOutbox>, Handler) {
        let store = InMemoryStore::new();
        store
            .acquire()
            .await
            .unwrap()
            .create_user(NewUser {
                username: "alice".into(),
                hashed_password: "hash".into(),
                full_name: "Alice Doe".into(),
                email: "alice@example.com".into(),
            })
            .await
            .unwrap();
        let outbox = Arc::new(InMemoryOutbox::new());
        let handler = SendVerifyEmailHandler::new(
            Coordinator::new(store.clone()),
            outbox.clone(),
            "http://localhost:8080/",
        );
        (store, outbox, handler)
    }

    fn message(username: &str) -> TaskMessage {
        let task = Task::json(
            TASK_SEND_VERIFY_EMAIL,
            &PayloadSendVerifyEmail {
                username: username.into(),
            },
        )
        .unwrap();
        TaskMessage::new(task, &TaskOptions::default(), Utc::now())
    }

    #[tokio::test]
    async fn sends_a_link_with_the_issued_code() {
        let (store, outbox, handler) = seeded().await;
        handler.process_task(&message("alice")).await.unwrap();

        let code = store
            .acquire()
            .await
            .unwrap()
            .latest_active_verify_email("alice", Utc::now())
            .await
            .unwrap()
            .unwrap();
        let sent = outbox.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["alice@example.com".to_string()]);
        assert!(sent[0].content.contains(&format!(
            "http://localhost:8080/v1/verify_email?email_id={}&secret_code={}",
            code.id, code.secret_code
        )));
    }

    #[tokio::test]
    async fn retry_after_send_failure_reuses_the_code() {
        let (store, outbox, handler) = seeded().await;
        outbox.fail_next(1);

        let err = handler.process_task(&message("alice")).await.unwrap_err();
        assert!(matches!(err, TaskError::Mail(_)));
        assert!(!err.is_terminal());
        handler.process_task(&message("alice")).await.unwrap();

        let code = store
            .acquire()
            .await
            .unwrap()
            .latest_active_verify_email("alice", Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code.id.get(), 1);
        assert_eq!(outbox.sent().len(), 1);
    }

    #[tokio::test]
    async fn unknown_user_skips_retry() {
        let (_, outbox, handler) = seeded().await;
        let err = handler.process_task(&message("nobody")).await.unwrap_err();
        assert!(matches!(err, TaskError::SkipRetry(_)));
        assert!(outbox.sent().is_empty());
    }

    #[tokio::test]
    async fn verified_user_gets_nothing() {
        let (store, outbox, handler) = seeded().await;
        store
            .acquire()
            .await
            .unwrap()
            .update_user("alice", UserUpdate::mark_email_verified())
            .await
            .unwrap();

        handler.process_task(&message("alice")).await.unwrap();
        assert!(outbox.sent().is_empty());
    }

    #[tokio::test]
    async fn malformed_payload_is_terminal() {
        let (_, _, handler) = seeded().await;
        let bad = TaskMessage::new(
            Task::new(TASK_SEND_VERIFY_EMAIL, b"not json".to_vec()),
            &TaskOptions::default(),
            Utc::now(),
        );
        let err = handler.process_task(&bad).await.unwrap_err();
        assert!(err.is_terminal());
    }
}
