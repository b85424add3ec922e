use chrono::{DateTime, Utc};

use ledgerline_core::Session;

use crate::{AuthError, Payload};

/// Check that a refresh token may renew its session.
///
/// `refresh_payload` must already be verified by a [`crate::TokenMaker`];
/// `session` is the row whose id equals `refresh_payload.id`.
pub fn validate_session_renewal(
    session: &Session,
    refresh_payload: &Payload,
    refresh_token: &str,
    now: DateTime<Utc>,
) -> Result<(), AuthError> {
    if session.is_blocked {
        return Err(AuthError::SessionBlocked);
    }
    if session.username != refresh_payload.username {
        return Err(AuthError::UsernameMismatch);
    }
    if session.refresh_token != refresh_token {
        return Err(AuthError::TokenMismatch);
    }
    if now >= session.expires_at {
        return Err(AuthError::SessionExpired);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;
    use chrono::Duration;
    use ledgerline_core::SessionId;

    fn fixture() -> (Session, Payload) {
        let payload = Payload::new("alice", Role::DEPOSITOR, Duration::hours(1));
        let session = Session {
            id: SessionId::from_uuid(payload.id),
            username: "alice".into(),
            refresh_token: "refresh-token".into(),
            user_agent: "test".into(),
            client_ip: "127.0.0.1".into(),
            is_blocked: false,
            expires_at: payload.expired_at,
            created_at: payload.issued_at,
        };
        (session, payload)
    }

    #[test]
    fn healthy_session_renews() {
        let (session, payload) = fixture();
        assert_eq!(
            validate_session_renewal(&session, &payload, "refresh-token", Utc::now()),
            Ok(())
        );
    }

    #[test]
    fn each_check_has_its_own_error() {
        let now = Utc::now();

        let (mut s, p) = fixture();
        s.is_blocked = true;
        assert_eq!(
            validate_session_renewal(&s, &p, "refresh-token", now),
            Err(AuthError::SessionBlocked)
        );

        let (mut s, p) = fixture();
        s.username = "mallory".into();
        assert_eq!(
            validate_session_renewal(&s, &p, "refresh-token", now),
            Err(AuthError::UsernameMismatch)
        );

        let (s, p) = fixture();
        assert_eq!(
            validate_session_renewal(&s, &p, "other-token", now),
            Err(AuthError::TokenMismatch)
        );

        let (s, p) = fixture();
        assert_eq!(
            validate_session_renewal(&s, &p, "refresh-token", s.expires_at + Duration::seconds(1)),
            Err(AuthError::SessionExpired)
        );
    }
}
