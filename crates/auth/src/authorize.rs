use thiserror::Error;

use ledgerline_core::DomainError;

use crate::{Payload, Role};

/// Authentication/authorization failure. Always `Unauthorized` at the boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("permission denied for role '{0}'")]
    Forbidden(String),

    #[error("blocked session")]
    SessionBlocked,

    #[error("incorrect session user")]
    UsernameMismatch,

    #[error("mismatched session token")]
    TokenMismatch,

    #[error("expired session")]
    SessionExpired,
}

impl From<AuthError> for DomainError {
    fn from(err: AuthError) -> Self {
        DomainError::unauthorized(err.to_string())
    }
}

/// Role gate for an operation.
///
/// - No IO
/// - No panics
pub fn authorize(payload: &Payload, accessible_roles: &[Role]) -> Result<(), AuthError> {
    if accessible_roles.contains(&payload.role) {
        Ok(())
    } else {
        Err(AuthError::Forbidden(payload.role.to_string()))
    }
}
