//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Coarse classification of every failure the ledger can report.
///
/// Callers at the service boundary (HTTP/RPC handlers, the worker) branch on
/// the kind; the concrete error carries the detail.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A referenced account, user, email or session is missing.
    NotFound,
    /// Unique-constraint violation, currency mismatch, already-used code.
    Conflict,
    /// Token or session invalid, expired or mismatched.
    Unauthorized,
    /// Malformed request fields or a rejected business precondition.
    Invalid,
    /// Store or queue transport failure.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Internal => "internal",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, conflicts). Infrastructure errors are mapped into it at the
/// boundary (see `ledgerline_infra::store::StoreError`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A request field failed validation.
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// A domain precondition was violated (e.g. insufficient funds).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found.
    #[error("{0} not found")]
    NotFound(String),

    /// A conflict occurred (unique violation, currency mismatch, reuse).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Authorization failure at the domain boundary.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Infrastructure failure surfaced through the domain boundary.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DomainError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound(entity.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Validation { .. }
            | DomainError::InvariantViolation(_)
            | DomainError::InvalidId(_) => ErrorKind::Invalid,
            DomainError::NotFound(_) => ErrorKind::NotFound,
            DomainError::Conflict(_) => ErrorKind::Conflict,
            DomainError::Unauthorized(_) => ErrorKind::Unauthorized,
            DomainError::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_cover_the_taxonomy() {
        assert_eq!(
            DomainError::validation("amount", "must be positive").kind(),
            ErrorKind::Invalid
        );
        assert_eq!(DomainError::invariant("insufficient funds").kind(), ErrorKind::Invalid);
        assert_eq!(DomainError::not_found("account").kind(), ErrorKind::NotFound);
        assert_eq!(DomainError::conflict("currency mismatch").kind(), ErrorKind::Conflict);
        assert_eq!(DomainError::unauthorized("session blocked").kind(), ErrorKind::Unauthorized);
        assert_eq!(DomainError::internal("pool closed").kind(), ErrorKind::Internal);
    }

    #[test]
    fn validation_message_names_the_field() {
        let err = DomainError::validation("username", "too short");
        assert_eq!(err.to_string(), "invalid username: too short");
    }
}
