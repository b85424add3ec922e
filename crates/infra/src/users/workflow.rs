//! Multi-step user workflows that must commit or fail as a whole.

use std::future::Future;

use chrono::Utc;
use rand::Rng;
use tracing::{info, instrument};

use ledgerline_core::validation::{
    SECRET_CODE_LENGTH, validate_email, validate_email_id, validate_full_name, validate_password,
    validate_secret_code, validate_username,
};
use ledgerline_core::{DomainError, NewUser, User, UserUpdate, VerifyEmail, VerifyEmailId};

use crate::store::{Coordinator, Queries, Store, StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserParams {
    pub username: String,
    /// Plain text; hashed before it reaches the store.
    pub password: String,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyEmailTxParams<'a> {
    pub email_id: VerifyEmailId,
    pub secret_code: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyEmailTxResult {
    pub user: User,
    pub verify_email: VerifyEmail,
}

/// User registration and email verification.
#[derive(Debug, Clone)]
pub struct UserWorkflow<S> {
    coordinator: Coordinator<S>,
}

impl<S: Store> UserWorkflow<S> {
    pub fn new(coordinator: Coordinator<S>) -> Self {
        Self { coordinator }
    }

    /// Insert a user and run `after_create` on the persisted row before
    /// commit.
    ///
    /// A failing hook rolls the insert back and surfaces as
    /// [`StoreError::Hook`], so the hook never observes a user that does not
    /// end up committed. The hook typically enqueues the verification email.
    #[instrument(skip(self, params, after_create), fields(username = %params.username), err)]
    pub async fn create_user_tx<F, Fut>(
        &self,
        params: CreateUserParams,
        after_create: F,
    ) -> StoreResult<User>
    where
        F: FnOnce(User) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        validate_username(&params.username)?;
        validate_password(&params.password)?;
        validate_full_name(&params.full_name)?;
        validate_email(&params.email)?;

        let password = params.password;
        let hashed_password =
            tokio::task::spawn_blocking(move || ledgerline_auth::hash_password(&password))
                .await
                .map_err(|e| DomainError::internal(format!("password hashing task failed: {e}")))?
                .map_err(DomainError::from)?;

        let new_user = NewUser {
            username: params.username,
            hashed_password,
            full_name: params.full_name,
            email: params.email,
        };

        let user = self
            .coordinator
            .run_atomic(move |tx| Box::pin(insert_user(tx, new_user, after_create)))
            .await?;

        info!(username = %user.username, "user created");
        Ok(user)
    }

    /// Consume a verification code and mark its user's email verified.
    #[instrument(skip(self, params), fields(email_id = %params.email_id), err)]
    pub async fn verify_email_tx(
        &self,
        params: VerifyEmailTxParams<'_>,
    ) -> StoreResult<VerifyEmailTxResult> {
        validate_email_id(params.email_id)?;
        validate_secret_code(params.secret_code)?;

        let email_id = params.email_id;
        let secret_code = params.secret_code.to_string();
        self.coordinator
            .run_atomic(move |tx| Box::pin(consume_code(tx, email_id, secret_code)))
            .await
    }
}

async fn insert_user<Q, F, Fut>(tx: &mut Q, new_user: NewUser, after_create: F) -> StoreResult<User>
where
    Q: Queries + ?Sized,
    F: FnOnce(User) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let user = match tx.create_user(new_user).await {
        Err(StoreError::UniqueViolation(constraint)) => {
            return Err(DomainError::conflict(format!(
                "username or email already registered ({constraint})"
            ))
            .into());
        }
        other => other?,
    };
    after_create(user.clone()).await.map_err(StoreError::Hook)?;
    Ok(user)
}

async fn consume_code<Q: Queries + ?Sized>(
    tx: &mut Q,
    email_id: VerifyEmailId,
    secret_code: String,
) -> StoreResult<VerifyEmailTxResult> {
    let pending = tx.get_verify_email_for_update(email_id).await?;
    if pending.secret_code != secret_code {
        return Err(DomainError::validation("secret_code", "does not match").into());
    }
    if pending.is_used {
        return Err(DomainError::conflict("verify email already used").into());
    }
    if pending.is_expired(Utc::now()) {
        return Err(DomainError::validation("secret_code", "has expired").into());
    }

    let verify_email = tx.mark_verify_email_used(email_id).await?;
    let user = tx
        .update_user(&verify_email.username, UserUpdate::mark_email_verified())
        .await?;
    Ok(VerifyEmailTxResult { user, verify_email })
}

/// Random verification secret of [`SECRET_CODE_LENGTH`] lowercase letters.
pub fn random_secret_code() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..SECRET_CODE_LENGTH)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use ledgerline_core::{ErrorKind, NewVerifyEmail};

    use super::*;
    use crate::store::InMemoryStore;

    fn params() -> CreateUserParams {
        CreateUserParams {
            username: "alice".into(),
            password: "secret123".into(),
            full_name: "Alice Doe".into(),
            email: "alice@example.com".into(),
        }
    }

    fn workflow() -> (InMemoryStore, UserWorkflow<InMemoryStore>) {
        let store = InMemoryStore::new();
        (store.clone(), UserWorkflow::new(Coordinator::new(store)))
    }

    async fn issue_code(store: &InMemoryStore, expires_in: Duration) -> VerifyEmail {
        store
            .acquire()
            .await
            .unwrap()
            .create_verify_email(NewVerifyEmail {
                username: "alice".into(),
                email: "alice@example.com".into(),
                secret_code: random_secret_code(),
                expires_at: Utc::now() + expires_in,
            })
            .await
            .unwrap()
    }

    #[test]
    fn secret_codes_are_valid() {
        let code = random_secret_code();
        assert_eq!(code.len(), SECRET_CODE_LENGTH);
        assert!(validate_secret_code(&code).is_ok());
        assert_ne!(code, random_secret_code());
    }

    #[tokio::test]
    async fn create_user_hashes_the_password_and_runs_the_hook() {
        let (store, workflow) = workflow();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();

        let user = workflow
            .create_user_tx(params(), move |user| async move {
                let _ = seen_tx.send(user.username);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(seen_rx.await.unwrap(), "alice");
        assert!(ledgerline_auth::check_password("secret123", &user.hashed_password).is_ok());
        let stored = store.acquire().await.unwrap().get_user("alice").await.unwrap();
        assert!(!stored.is_email_verified);
    }

    #[tokio::test]
    async fn failing_hook_rolls_back_the_user() {
        let (store, workflow) = workflow();

        let err = workflow
            .create_user_tx(params(), |_| async { Err(anyhow::anyhow!("queue unavailable")) })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Hook(_)));
        assert_eq!(err.kind(), ErrorKind::Internal);
        let lookup = store.acquire().await.unwrap().get_user("alice").await;
        assert!(lookup.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn duplicate_username_is_a_conflict() {
        let (_, workflow) = workflow();
        workflow.create_user_tx(params(), |_| async { Ok(()) }).await.unwrap();

        let err = workflow
            .create_user_tx(params(), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn invalid_fields_are_rejected_before_any_write() {
        let (_, workflow) = workflow();
        let mut bad = params();
        bad.email = "not-an-email".into();

        let err = workflow
            .create_user_tx(bad, |_| async { Err(anyhow::anyhow!("hook must not run")) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn verify_email_succeeds_once() {
        let (store, workflow) = workflow();
        workflow.create_user_tx(params(), |_| async { Ok(()) }).await.unwrap();
        let code = issue_code(&store, Duration::minutes(15)).await;

        let verify = VerifyEmailTxParams {
            email_id: code.id,
            secret_code: &code.secret_code,
        };
        let result = workflow.verify_email_tx(verify).await.unwrap();
        assert!(result.user.is_email_verified);
        assert!(result.verify_email.is_used);

        let err = workflow.verify_email_tx(verify).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("already used"));

        let user = store.acquire().await.unwrap().get_user("alice").await.unwrap();
        assert!(user.is_email_verified);
    }

    #[tokio::test]
    async fn wrong_or_expired_codes_change_nothing() {
        let (store, workflow) = workflow();
        workflow.create_user_tx(params(), |_| async { Ok(()) }).await.unwrap();
        let expired = issue_code(&store, Duration::minutes(-1)).await;
        let active = issue_code(&store, Duration::minutes(15)).await;

        let wrong = "a".repeat(SECRET_CODE_LENGTH);
        let err = workflow
            .verify_email_tx(VerifyEmailTxParams {
                email_id: active.id,
                secret_code: &wrong,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);

        let err = workflow
            .verify_email_tx(VerifyEmailTxParams {
                email_id: expired.id,
                secret_code: &expired.secret_code,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);

        let err = workflow
            .verify_email_tx(VerifyEmailTxParams {
                email_id: VerifyEmailId::new(999),
                secret_code: &active.secret_code,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let mut conn = store.acquire().await.unwrap();
        assert!(!conn.get_user("alice").await.unwrap().is_email_verified);
        assert!(!conn.get_verify_email(active.id).await.unwrap().is_used);
    }
}
