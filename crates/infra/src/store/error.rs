use std::time::Duration;

use thiserror::Error;

use ledgerline_core::{DomainError, ErrorKind};

pub type StoreResult<T> = Result<T, StoreError>;

/// Ledger store operation error.
///
/// Infrastructure failures (driver, constraint, deadline) live next to the
/// domain errors raised by work running inside a transaction, so a
/// transaction body can use `?` on both.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("unique violation: {0}")]
    UniqueViolation(String),

    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("check violation: {0}")]
    CheckViolation(String),

    /// Serialization failure or deadlock; the whole transaction can be retried.
    #[error("transaction aborted by a concurrent update: {0}")]
    Serialization(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },

    #[error("transaction exceeded its deadline of {0:?}")]
    Timeout(Duration),

    /// The work failed and the rollback failed as well.
    #[error("rollback failed: {rollback} (original error: {source})")]
    Rollback {
        source: Box<StoreError>,
        rollback: Box<StoreError>,
    },

    /// The caller-supplied after-create hook failed; the insert was rolled back.
    #[error("after-create hook failed: {0}")]
    Hook(anyhow::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str) -> Self {
        Self::NotFound { entity }
    }

    pub fn database(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Database {
            operation,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::UniqueViolation(_)
            | StoreError::ForeignKeyViolation(_)
            | StoreError::Serialization(_) => ErrorKind::Conflict,
            StoreError::CheckViolation(_) => ErrorKind::Invalid,
            StoreError::Domain(err) => err.kind(),
            StoreError::Database { .. }
            | StoreError::Timeout(_)
            | StoreError::Rollback { .. }
            | StoreError::Hook(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }

    /// Whether running the same unit of work again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Serialization(_))
    }
}

impl From<StoreError> for DomainError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Domain(inner) => inner,
            StoreError::NotFound { entity } => DomainError::not_found(entity),
            StoreError::UniqueViolation(msg)
            | StoreError::ForeignKeyViolation(msg)
            | StoreError::Serialization(msg) => DomainError::conflict(msg),
            StoreError::CheckViolation(msg) => DomainError::invariant(msg),
            other => DomainError::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_violations_are_conflicts() {
        let err = StoreError::UniqueViolation("users_pkey".into());
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(matches!(DomainError::from(err), DomainError::Conflict(_)));
    }

    #[test]
    fn serialization_failures_are_retryable_conflicts() {
        let err = StoreError::Serialization("deadlock detected".into());
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.is_retryable());
        assert!(!StoreError::UniqueViolation("users_pkey".into()).is_retryable());
        assert!(matches!(DomainError::from(err), DomainError::Conflict(_)));
    }

    #[test]
    fn domain_errors_keep_their_kind() {
        let err = StoreError::from(DomainError::conflict("currency mismatch"));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(
            DomainError::from(err),
            DomainError::conflict("currency mismatch")
        );
    }

    #[test]
    fn rollback_failure_mentions_both_errors() {
        let err = StoreError::Rollback {
            source: Box::new(StoreError::not_found("account")),
            rollback: Box::new(StoreError::database("rollback", "connection reset")),
        };
        let msg = err.to_string();
        assert!(msg.contains("account not found"));
        assert!(msg.contains("connection reset"));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
