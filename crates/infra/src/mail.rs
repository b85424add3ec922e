//! Outbound email.
//!
//! Delivery goes through [`EmailSender`]; the crate ships a tracing-backed
//! sender for development and an in-memory outbox for tests.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EmailMessage {
    pub subject: String,
    /// HTML body.
    pub content: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub attach_files: Vec<PathBuf>,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("email has no recipients")]
    NoRecipients,

    #[error("failed to attach {path}: {source}")]
    Attachment {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("mail transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, message: EmailMessage) -> Result<(), MailError>;
}

/// Writes each email to the log instead of delivering it.
#[derive(Debug, Clone)]
pub struct LogSender {
    from_name: String,
    from_address: String,
}

impl LogSender {
    pub fn new(from_name: impl Into<String>, from_address: impl Into<String>) -> Self {
        Self {
            from_name: from_name.into(),
            from_address: from_address.into(),
        }
    }
}

#[async_trait]
impl EmailSender for LogSender {
    async fn send_email(&self, message: EmailMessage) -> Result<(), MailError> {
        if message.to.is_empty() {
            return Err(MailError::NoRecipients);
        }
        for path in &message.attach_files {
            tokio::fs::metadata(path)
                .await
                .map_err(|source| MailError::Attachment {
                    path: path.clone(),
                    source,
                })?;
        }

        info!(
            from = %format!("{} <{}>", self.from_name, self.from_address),
            to = ?message.to,
            cc = ?message.cc,
            bcc = ?message.bcc,
            subject = %message.subject,
            attachments = message.attach_files.len(),
            content = %message.content,
            "email sent"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct OutboxState {
    sent: Vec<EmailMessage>,
    failures_left: usize,
}

/// Records sent messages; can be told to fail.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    state: Mutex<OutboxState>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.lock().failures_left = n;
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.lock().sent.clone()
    }

    fn lock(&self) -> MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EmailSender for InMemoryOutbox {
    async fn send_email(&self, message: EmailMessage) -> Result<(), MailError> {
        if message.to.is_empty() {
            return Err(MailError::NoRecipients);
        }
        let mut state = self.lock();
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(MailError::Transport("connection refused".into()));
        }
        state.sent.push(message);
        Ok(())
    }
}
