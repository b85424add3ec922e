//! Login, token renewal and bearer authentication.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument};

use ledgerline_auth::{
    Payload, Role, TokenMaker, authorize, check_password, validate_session_renewal,
};
use ledgerline_core::{DomainError, NewSession, SessionId, User};

use crate::store::{Queries, Store, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginParams {
    pub username: String,
    pub password: String,
    pub user_agent: String,
    pub client_ip: String,
}

#[derive(Debug, Clone)]
pub struct LoginResult {
    pub user: User,
    pub session_id: SessionId,
    pub access_token: String,
    pub access_payload: Payload,
    pub refresh_token: String,
    pub refresh_payload: Payload,
}

#[derive(Debug, Clone)]
pub struct RenewResult {
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
}

/// Issues access/refresh token pairs backed by session rows.
#[derive(Clone)]
pub struct SessionService<S> {
    store: S,
    tokens: Arc<dyn TokenMaker>,
    access_token_duration: Duration,
    refresh_token_duration: Duration,
}

impl<S> std::fmt::Debug for SessionService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionService")
            .field("access_token_duration", &self.access_token_duration)
            .field("refresh_token_duration", &self.refresh_token_duration)
            .finish_non_exhaustive()
    }
}

impl<S: Store> SessionService<S> {
    pub fn new(
        store: S,
        tokens: Arc<dyn TokenMaker>,
        access_token_duration: Duration,
        refresh_token_duration: Duration,
    ) -> Self {
        Self {
            store,
            tokens,
            access_token_duration,
            refresh_token_duration,
        }
    }

    #[instrument(skip(self, params), fields(username = %params.username), err)]
    pub async fn login(&self, params: LoginParams) -> StoreResult<LoginResult> {
        let user = self.store.acquire().await?.get_user(&params.username).await?;

        let password = params.password;
        let hashed = user.hashed_password.clone();
        tokio::task::spawn_blocking(move || check_password(&password, &hashed))
            .await
            .map_err(|e| DomainError::internal(format!("password check task failed: {e}")))?
            .map_err(DomainError::from)?;

        let role = Role::default();
        let (access_token, access_payload) = self
            .tokens
            .create_token(&user.username, &role, self.access_token_duration)
            .map_err(DomainError::from)?;
        let (refresh_token, refresh_payload) = self
            .tokens
            .create_token(&user.username, &role, self.refresh_token_duration)
            .map_err(DomainError::from)?;

        let session = self
            .store
            .acquire()
            .await?
            .create_session(NewSession {
                id: SessionId::from_uuid(refresh_payload.id),
                username: user.username.clone(),
                refresh_token: refresh_token.clone(),
                user_agent: params.user_agent,
                client_ip: params.client_ip,
                is_blocked: false,
                expires_at: refresh_payload.expired_at,
            })
            .await?;

        info!(session_id = %session.id, "user logged in");
        Ok(LoginResult {
            user,
            session_id: session.id,
            access_token,
            access_payload,
            refresh_token,
            refresh_payload,
        })
    }

    /// Exchange a refresh token for a new access token.
    #[instrument(skip_all, err)]
    pub async fn renew_access_token(&self, refresh_token: &str) -> StoreResult<RenewResult> {
        let refresh_payload = self
            .tokens
            .verify_token(refresh_token)
            .map_err(DomainError::from)?;

        let session = match self
            .store
            .acquire()
            .await?
            .get_session(SessionId::from_uuid(refresh_payload.id))
            .await
        {
            Err(err) if err.is_not_found() => {
                return Err(DomainError::unauthorized("unknown session").into());
            }
            other => other?,
        };
        validate_session_renewal(&session, &refresh_payload, refresh_token, Utc::now())
            .map_err(DomainError::from)?;

        let (access_token, access_payload) = self
            .tokens
            .create_token(
                &refresh_payload.username,
                &refresh_payload.role,
                self.access_token_duration,
            )
            .map_err(DomainError::from)?;
        Ok(RenewResult {
            access_token,
            access_token_expires_at: access_payload.expired_at,
        })
    }

    /// Verify an `Authorization: Bearer <token>` header value and gate it on `roles`.
    pub fn authenticate(
        &self,
        authorization: &str,
        roles: &[Role],
    ) -> Result<Payload, DomainError> {
        let mut fields = authorization.split_whitespace();
        let token = match (fields.next(), fields.next(), fields.next()) {
            (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => token,
            (Some(_), Some(_), None) => {
                return Err(DomainError::unauthorized(
                    "authorization token must be a bearer token",
                ));
            }
            _ => return Err(DomainError::unauthorized("authorization token is not valid")),
        };

        let payload = self.tokens.verify_token(token)?;
        authorize(&payload, roles)?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use ledgerline_auth::JwtMaker;
    use ledgerline_core::{ErrorKind, NewUser};

    use super::*;
    use crate::store::InMemoryStore;

    const SECRET: &str = "0123456789abcdefghijklmnopqrstuv";

    async fn service() -> SessionService<InMemoryStore> {
        let store = InMemoryStore::new();
        store
            .acquire()
            .await
            .unwrap()
            .create_user(NewUser {
                username: "alice".into(),
                hashed_password: ledgerline_auth::hash_password("secret123").unwrap(),
                full_name: "Alice Doe".into(),
                email: "alice@example.com".into(),
            })
            .await
            .unwrap();
        SessionService::new(
            store,
            Arc::new(JwtMaker::new(SECRET).unwrap()),
            Duration::minutes(15),
            Duration::hours(24),
        )
    }

    fn login_params(password: &str) -> LoginParams {
        LoginParams {
            username: "alice".into(),
            password: password.into(),
            user_agent: "tests".into(),
            client_ip: "127.0.0.1".into(),
        }
    }

    #[tokio::test]
    async fn login_then_renew() {
        let service = service().await;
        let login = service.login(login_params("secret123")).await.unwrap();
        assert_eq!(login.session_id.as_uuid(), &login.refresh_payload.id);

        let renewed = service.renew_access_token(&login.refresh_token).await.unwrap();
        let payload = service
            .authenticate(&format!("Bearer {}", renewed.access_token), &[Role::DEPOSITOR])
            .unwrap();
        assert_eq!(payload.username, "alice");
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let service = service().await;
        let err = service.login(login_params("not-it-1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn access_token_cannot_renew() {
        let service = service().await;
        let login = service.login(login_params("secret123")).await.unwrap();

        let err = service
            .renew_access_token(&login.access_token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn authenticate_checks_scheme_and_role() {
        let service = service().await;
        let login = service.login(login_params("secret123")).await.unwrap();

        let basic = format!("Basic {}", login.access_token);
        assert_eq!(
            service.authenticate(&basic, &[Role::DEPOSITOR]).unwrap_err().kind(),
            ErrorKind::Unauthorized
        );
        let bearer = format!("Bearer {}", login.access_token);
        assert_eq!(
            service.authenticate(&bearer, &[Role::BANKER]).unwrap_err().kind(),
            ErrorKind::Unauthorized
        );
        assert!(service.authenticate("Bearer", &[Role::DEPOSITOR]).is_err());
    }
}
