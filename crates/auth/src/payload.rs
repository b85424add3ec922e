use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use ledgerline_core::DomainError;

use crate::Role;

/// Verified token contents (transport-agnostic).
///
/// Timestamps are truncated to whole seconds so a payload survives a trip
/// through a JWT unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Unique token id. For refresh tokens this is also the session id.
    pub id: Uuid,
    pub username: String,
    pub role: Role,
    pub issued_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is invalid")]
    Invalid,

    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (issued_at is in the future)")]
    NotYetValid,

    #[error("invalid token time window (expired_at <= issued_at)")]
    InvalidTimeWindow,

    #[error("invalid key size: must be at least {min} characters")]
    KeyTooShort { min: usize },

    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl From<TokenError> for DomainError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::KeyTooShort { .. } | TokenError::Signing(_) => {
                DomainError::internal(err.to_string())
            }
            _ => DomainError::unauthorized(err.to_string()),
        }
    }
}

impl Payload {
    pub fn new(username: impl Into<String>, role: Role, duration: Duration) -> Self {
        let issued_at = Utc::now().trunc_subsecs(0);
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            role,
            issued_at,
            expired_at: issued_at + duration,
        }
    }

    /// Deterministically validate the payload's time window against `now`.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), TokenError> {
        if self.expired_at <= self.issued_at {
            return Err(TokenError::InvalidTimeWindow);
        }
        if now < self.issued_at {
            return Err(TokenError::NotYetValid);
        }
        if now >= self.expired_at {
            return Err(TokenError::Expired);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_payload_is_valid() {
        let p = Payload::new("alice", Role::DEPOSITOR, Duration::minutes(15));
        assert_eq!(p.validate(p.issued_at), Ok(()));
        assert_eq!(p.issued_at.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn expiry_is_exclusive() {
        let p = Payload::new("alice", Role::DEPOSITOR, Duration::minutes(1));
        assert_eq!(p.validate(p.expired_at), Err(TokenError::Expired));
        assert_eq!(
            p.validate(p.issued_at - Duration::seconds(5)),
            Err(TokenError::NotYetValid)
        );
    }

    #[test]
    fn negative_duration_is_an_invalid_window() {
        let p = Payload::new("alice", Role::BANKER, Duration::minutes(-1));
        assert_eq!(p.validate(Utc::now()), Err(TokenError::InvalidTimeWindow));
    }
}
