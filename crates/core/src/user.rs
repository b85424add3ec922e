//! Users, email verification records and login sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::id::{SessionId, VerifyEmailId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
    pub is_email_verified: bool,
    pub password_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
}

/// Partial update of a user row; `None` leaves the column unchanged.
///
/// Setting `hashed_password` also moves `password_changed_at` to now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserUpdate {
    pub hashed_password: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub is_email_verified: Option<bool>,
}

impl UserUpdate {
    pub fn mark_email_verified() -> Self {
        Self {
            is_email_verified: Some(true),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hashed_password.is_none()
            && self.full_name.is_none()
            && self.email.is_none()
            && self.is_email_verified.is_none()
    }
}

/// One issued email verification code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmail {
    pub id: VerifyEmailId,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub secret_code: String,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl VerifyEmail {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Unused and not yet expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_used && !self.is_expired(now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVerifyEmail {
    pub username: String,
    pub email: String,
    pub secret_code: String,
    pub expires_at: DateTime<Utc>,
}

/// A refresh-token session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub username: String,
    #[serde(skip_serializing)]
    pub refresh_token: String,
    pub user_agent: String,
    pub client_ip: String,
    pub is_blocked: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub id: SessionId,
    pub username: String,
    pub refresh_token: String,
    pub user_agent: String,
    pub client_ip: String,
    pub is_blocked: bool,
    pub expires_at: DateTime<Utc>,
}

impl Entity for VerifyEmail {
    type Id = VerifyEmailId;

    fn id(&self) -> VerifyEmailId {
        self.id
    }
}

impl Entity for Session {
    type Id = SessionId;

    fn id(&self) -> SessionId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn code(is_used: bool, expires_in: Duration) -> VerifyEmail {
        let now = Utc::now();
        VerifyEmail {
            id: VerifyEmailId::new(1),
            username: "alice".into(),
            email: "alice@example.com".into(),
            secret_code: "a".repeat(32),
            is_used,
            created_at: now,
            expires_at: now + expires_in,
        }
    }

    #[test]
    fn activity_requires_unused_and_unexpired() {
        let now = Utc::now();
        assert!(code(false, Duration::minutes(15)).is_active(now));
        assert!(!code(true, Duration::minutes(15)).is_active(now));
        assert!(!code(false, Duration::minutes(-1)).is_active(now));
    }

    #[test]
    fn user_serialization_omits_password_hash() {
        let now = Utc::now();
        let user = User {
            username: "alice".into(),
            hashed_password: "secret-hash".into(),
            full_name: "Alice Doe".into(),
            email: "alice@example.com".into(),
            is_email_verified: false,
            password_changed_at: now,
            created_at: now,
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret-hash"));
    }
}
