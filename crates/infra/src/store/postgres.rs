//! Postgres-backed ledger store.
//!
//! The same query code serves pooled connections and open transactions:
//! [`PgQueries`] is generic over anything that dereferences to a
//! `PgConnection`.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | RowNotFound | N/A | `NotFound` | `fetch_one` matched no row |
//! | Database (unique violation) | `23505` | `UniqueViolation` | Duplicate username/email, second account in the same currency |
//! | Database (foreign key violation) | `23503` | `ForeignKeyViolation` | Account for an unknown owner, deleting an account with entries |
//! | Database (check constraint violation) | `23514` | `CheckViolation` | Zero entry, non-positive transfer |
//! | Database (serialization failure, deadlock) | `40001`, `40P01` | `Serialization` | Concurrent update aborted the transaction |
//! | Database (other) | Any other | `Database` | Overflow, syntax |
//! | PoolClosed / PoolTimedOut | N/A | `Database` | Pool shut down or exhausted |
//! | Other | N/A | `Database` | Network errors, decode failures |
//!
//! ## Locking
//!
//! `get_account_for_update` uses `FOR NO KEY UPDATE`: it blocks concurrent
//! balance updates on the row but not inserts of entries/transfers that
//! reference it through a foreign key.

use std::ops::DerefMut;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row};
use tracing::instrument;

use ledgerline_core::{
    Account, AccountId, DomainError, Entry, EntryId, NewAccount, NewEntry, NewSession,
    NewTransfer, NewUser, NewVerifyEmail, Page, Session, SessionId, Transfer, TransferId, User,
    UserUpdate, VerifyEmail, VerifyEmailId,
};

use super::error::{StoreError, StoreResult};
use super::r#trait::{Queries, Store, TxHandle};

/// Postgres [`Store`] over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    type Conn = PgQueries<PoolConnection<Postgres>>;
    type Tx = PgQueries<sqlx::Transaction<'static, Postgres>>;

    async fn acquire(&self) -> StoreResult<Self::Conn> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", "connection", e))?;
        Ok(PgQueries { conn })
    }

    async fn begin(&self) -> StoreResult<Self::Tx> {
        let conn = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", "transaction", e))?;
        Ok(PgQueries { conn })
    }
}

/// Ledger queries bound to one connection or transaction.
#[derive(Debug)]
pub struct PgQueries<C> {
    conn: C,
}

#[async_trait]
impl TxHandle for PgQueries<sqlx::Transaction<'static, Postgres>> {
    async fn commit(self) -> StoreResult<()> {
        self.conn
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", "transaction", e))
    }

    async fn rollback(self) -> StoreResult<()> {
        self.conn
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", "transaction", e))
    }
}

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";
const USER_COLUMNS: &str = "username, hashed_password, full_name, email, is_email_verified, password_changed_at, created_at";
const VERIFY_EMAIL_COLUMNS: &str = "id, username, email, secret_code, is_used, created_at, expires_at";
const SESSION_COLUMNS: &str = "id, username, refresh_token, user_agent, client_ip, is_blocked, expires_at, created_at";

#[async_trait]
impl<C> Queries for PgQueries<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    #[instrument(skip(self), fields(owner = %params.owner, currency = %params.currency), err)]
    async fn create_account(&mut self, params: NewAccount) -> StoreResult<Account> {
        sqlx::query_as::<_, AccountRow>(&format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, 0, $2) RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(&params.owner)
        .bind(params.currency.as_str())
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("create_account", "account", e))
    }

    async fn get_account(&mut self, id: AccountId) -> StoreResult<Account> {
        sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1"
        ))
        .bind(id.get())
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("get_account", "account", e))
    }

    #[instrument(skip(self), fields(account_id = %id), err)]
    async fn get_account_for_update(&mut self, id: AccountId) -> StoreResult<Account> {
        sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1 FOR NO KEY UPDATE"
        ))
        .bind(id.get())
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("get_account_for_update", "account", e))
    }

    async fn list_accounts(&mut self, owner: &str, page: Page) -> StoreResult<Vec<Account>> {
        sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = $1 ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(owner)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&mut *self.conn)
        .await
        .map(|rows| rows.into_iter().map(Into::into).collect())
        .map_err(|e| map_sqlx_error("list_accounts", "account", e))
    }

    #[instrument(skip(self), fields(account_id = %id, amount), err)]
    async fn add_account_balance(&mut self, id: AccountId, amount: i64) -> StoreResult<Account> {
        sqlx::query_as::<_, AccountRow>(&format!(
            "UPDATE accounts SET balance = balance + $2 WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(id.get())
        .bind(amount)
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("add_account_balance", "account", e))
    }

    async fn delete_account(&mut self, id: AccountId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id.get())
            .execute(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("delete_account", "account", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("account"));
        }
        Ok(())
    }

    async fn create_entry(&mut self, params: NewEntry) -> StoreResult<Entry> {
        sqlx::query_as::<_, EntryRow>(&format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(params.account_id.get())
        .bind(params.amount)
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("create_entry", "entry", e))
    }

    async fn get_entry(&mut self, id: EntryId) -> StoreResult<Entry> {
        sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1 LIMIT 1"
        ))
        .bind(id.get())
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("get_entry", "entry", e))
    }

    async fn list_entries(&mut self, account_id: AccountId, page: Page) -> StoreResult<Vec<Entry>> {
        sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(account_id.get())
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&mut *self.conn)
        .await
        .map(|rows| rows.into_iter().map(Into::into).collect())
        .map_err(|e| map_sqlx_error("list_entries", "entry", e))
    }

    async fn create_transfer(&mut self, params: NewTransfer) -> StoreResult<Transfer> {
        sqlx::query_as::<_, TransferRow>(&format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) RETURNING {TRANSFER_COLUMNS}"
        ))
        .bind(params.from_account_id.get())
        .bind(params.to_account_id.get())
        .bind(params.amount)
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("create_transfer", "transfer", e))
    }

    async fn get_transfer(&mut self, id: TransferId) -> StoreResult<Transfer> {
        sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1 LIMIT 1"
        ))
        .bind(id.get())
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("get_transfer", "transfer", e))
    }

    async fn list_transfers(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> StoreResult<Vec<Transfer>> {
        sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers \
             WHERE from_account_id = $1 OR to_account_id = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(account_id.get())
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&mut *self.conn)
        .await
        .map(|rows| rows.into_iter().map(Into::into).collect())
        .map_err(|e| map_sqlx_error("list_transfers", "transfer", e))
    }

    #[instrument(skip(self, params), fields(username = %params.username), err)]
    async fn create_user(&mut self, params: NewUser) -> StoreResult<User> {
        sqlx::query_as::<_, UserRow>(&format!(
            "INSERT INTO users (username, hashed_password, full_name, email) VALUES ($1, $2, $3, $4) RETURNING {USER_COLUMNS}"
        ))
        .bind(&params.username)
        .bind(&params.hashed_password)
        .bind(&params.full_name)
        .bind(&params.email)
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("create_user", "user", e))
    }

    async fn get_user(&mut self, username: &str) -> StoreResult<User> {
        sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1 LIMIT 1"
        ))
        .bind(username)
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("get_user", "user", e))
    }

    #[instrument(skip(self, update), err)]
    async fn update_user(&mut self, username: &str, update: UserUpdate) -> StoreResult<User> {
        let password_changed = update.hashed_password.is_some();
        sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET \
                 hashed_password = COALESCE($2, hashed_password), \
                 password_changed_at = CASE WHEN $3 THEN now() ELSE password_changed_at END, \
                 full_name = COALESCE($4, full_name), \
                 email = COALESCE($5, email), \
                 is_email_verified = COALESCE($6, is_email_verified) \
             WHERE username = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(username)
        .bind(update.hashed_password)
        .bind(password_changed)
        .bind(update.full_name)
        .bind(update.email)
        .bind(update.is_email_verified)
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("update_user", "user", e))
    }

    async fn create_verify_email(&mut self, params: NewVerifyEmail) -> StoreResult<VerifyEmail> {
        sqlx::query_as::<_, VerifyEmailRow>(&format!(
            "INSERT INTO verify_emails (username, email, secret_code, expires_at) VALUES ($1, $2, $3, $4) RETURNING {VERIFY_EMAIL_COLUMNS}"
        ))
        .bind(&params.username)
        .bind(&params.email)
        .bind(&params.secret_code)
        .bind(params.expires_at)
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("create_verify_email", "verify email", e))
    }

    async fn get_verify_email(&mut self, id: VerifyEmailId) -> StoreResult<VerifyEmail> {
        sqlx::query_as::<_, VerifyEmailRow>(&format!(
            "SELECT {VERIFY_EMAIL_COLUMNS} FROM verify_emails WHERE id = $1 LIMIT 1"
        ))
        .bind(id.get())
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("get_verify_email", "verify email", e))
    }

    async fn get_verify_email_for_update(
        &mut self,
        id: VerifyEmailId,
    ) -> StoreResult<VerifyEmail> {
        sqlx::query_as::<_, VerifyEmailRow>(&format!(
            "SELECT {VERIFY_EMAIL_COLUMNS} FROM verify_emails WHERE id = $1 LIMIT 1 FOR UPDATE"
        ))
        .bind(id.get())
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("get_verify_email_for_update", "verify email", e))
    }

    async fn latest_active_verify_email(
        &mut self,
        username: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<VerifyEmail>> {
        sqlx::query_as::<_, VerifyEmailRow>(&format!(
            "SELECT {VERIFY_EMAIL_COLUMNS} FROM verify_emails \
             WHERE username = $1 AND is_used = FALSE AND expires_at > $2 \
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(username)
        .bind(now)
        .fetch_optional(&mut *self.conn)
        .await
        .map(|row| row.map(Into::into))
        .map_err(|e| map_sqlx_error("latest_active_verify_email", "verify email", e))
    }

    async fn mark_verify_email_used(&mut self, id: VerifyEmailId) -> StoreResult<VerifyEmail> {
        sqlx::query_as::<_, VerifyEmailRow>(&format!(
            "UPDATE verify_emails SET is_used = TRUE WHERE id = $1 RETURNING {VERIFY_EMAIL_COLUMNS}"
        ))
        .bind(id.get())
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("mark_verify_email_used", "verify email", e))
    }

    async fn create_session(&mut self, params: NewSession) -> StoreResult<Session> {
        sqlx::query_as::<_, SessionRow>(&format!(
            "INSERT INTO sessions (id, username, refresh_token, user_agent, client_ip, is_blocked, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {SESSION_COLUMNS}"
        ))
        .bind(params.id.as_uuid())
        .bind(&params.username)
        .bind(&params.refresh_token)
        .bind(&params.user_agent)
        .bind(&params.client_ip)
        .bind(params.is_blocked)
        .bind(params.expires_at)
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("create_session", "session", e))
    }

    async fn get_session(&mut self, id: SessionId) -> StoreResult<Session> {
        sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1 LIMIT 1"
        ))
        .bind(id.as_uuid())
        .fetch_one(&mut *self.conn)
        .await
        .map(Into::into)
        .map_err(|e| map_sqlx_error("get_session", "session", e))
    }
}

/// Map SQLx errors to `StoreError`.
///
/// `entity` names the row a `RowNotFound` refers to.
fn map_sqlx_error(operation: &'static str, entity: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::not_found(entity),
        sqlx::Error::Database(db_err) => {
            let code = db_err.code();
            map_sqlstate(operation, code.as_deref(), db_err.constraint(), db_err.message())
        }
        sqlx::Error::PoolClosed => StoreError::database(operation, "connection pool closed"),
        sqlx::Error::PoolTimedOut => {
            StoreError::database(operation, "timed out acquiring a connection")
        }
        other => StoreError::database(operation, other.to_string()),
    }
}

fn map_sqlstate(
    operation: &'static str,
    code: Option<&str>,
    constraint: Option<&str>,
    message: &str,
) -> StoreError {
    let constraint = || constraint.unwrap_or(message).to_string();
    match code {
        Some("23505") => StoreError::UniqueViolation(constraint()),
        Some("23503") => StoreError::ForeignKeyViolation(constraint()),
        Some("23514") => StoreError::CheckViolation(constraint()),
        Some("40001" | "40P01") => StoreError::Serialization(message.to_string()),
        _ => StoreError::database(operation, message),
    }
}

fn decode_error(err: DomainError) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(err))
}

// SQLx row types

#[derive(Debug)]
struct AccountRow(Account);

impl<'r> FromRow<'r, PgRow> for AccountRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let currency: String = row.try_get("currency")?;
        Ok(AccountRow(Account {
            id: AccountId::new(row.try_get("id")?),
            owner: row.try_get("owner")?,
            balance: row.try_get("balance")?,
            currency: currency.parse().map_err(decode_error)?,
            created_at: row.try_get("created_at")?,
        }))
    }
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        row.0
    }
}

#[derive(Debug)]
struct EntryRow(Entry);

impl<'r> FromRow<'r, PgRow> for EntryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EntryRow(Entry {
            id: EntryId::new(row.try_get("id")?),
            account_id: AccountId::new(row.try_get("account_id")?),
            amount: row.try_get("amount")?,
            created_at: row.try_get("created_at")?,
        }))
    }
}

impl From<EntryRow> for Entry {
    fn from(row: EntryRow) -> Self {
        row.0
    }
}

#[derive(Debug)]
struct TransferRow(Transfer);

impl<'r> FromRow<'r, PgRow> for TransferRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TransferRow(Transfer {
            id: TransferId::new(row.try_get("id")?),
            from_account_id: AccountId::new(row.try_get("from_account_id")?),
            to_account_id: AccountId::new(row.try_get("to_account_id")?),
            amount: row.try_get("amount")?,
            created_at: row.try_get("created_at")?,
        }))
    }
}

impl From<TransferRow> for Transfer {
    fn from(row: TransferRow) -> Self {
        row.0
    }
}

#[derive(Debug)]
struct UserRow(User);

impl<'r> FromRow<'r, PgRow> for UserRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(UserRow(User {
            username: row.try_get("username")?,
            hashed_password: row.try_get("hashed_password")?,
            full_name: row.try_get("full_name")?,
            email: row.try_get("email")?,
            is_email_verified: row.try_get("is_email_verified")?,
            password_changed_at: row.try_get("password_changed_at")?,
            created_at: row.try_get("created_at")?,
        }))
    }
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        row.0
    }
}

#[derive(Debug)]
struct VerifyEmailRow(VerifyEmail);

impl<'r> FromRow<'r, PgRow> for VerifyEmailRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(VerifyEmailRow(VerifyEmail {
            id: VerifyEmailId::new(row.try_get("id")?),
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            secret_code: row.try_get("secret_code")?,
            is_used: row.try_get("is_used")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        }))
    }
}

impl From<VerifyEmailRow> for VerifyEmail {
    fn from(row: VerifyEmailRow) -> Self {
        row.0
    }
}

#[derive(Debug)]
struct SessionRow(Session);

impl<'r> FromRow<'r, PgRow> for SessionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(SessionRow(Session {
            id: SessionId::from_uuid(row.try_get("id")?),
            username: row.try_get("username")?,
            refresh_token: row.try_get("refresh_token")?,
            user_agent: row.try_get("user_agent")?,
            client_ip: row.try_get("client_ip")?,
            is_blocked: row.try_get("is_blocked")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        }))
    }
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        row.0
    }
}

#[cfg(test)]
mod tests {
    use ledgerline_core::ErrorKind;

    use super::*;

    #[test]
    fn sqlstates_map_to_store_errors() {
        let map = |code: &str| map_sqlstate("op", Some(code), Some("users_pkey"), "boom");

        assert!(matches!(map("23505"), StoreError::UniqueViolation(c) if c == "users_pkey"));
        assert!(matches!(map("23503"), StoreError::ForeignKeyViolation(_)));
        assert!(matches!(map("23514"), StoreError::CheckViolation(_)));
        assert!(map("40001").is_retryable());
        assert!(map("40P01").is_retryable());
        assert_eq!(map("40P01").kind(), ErrorKind::Conflict);
        assert!(matches!(map("22003"), StoreError::Database { operation: "op", .. }));
    }

    #[test]
    fn constraint_name_falls_back_to_the_message() {
        let err = map_sqlstate("op", Some("23505"), None, "duplicate key value");
        assert!(matches!(err, StoreError::UniqueViolation(m) if m == "duplicate key value"));
    }
}
