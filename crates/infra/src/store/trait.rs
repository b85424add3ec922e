use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ledgerline_core::{
    Account, AccountId, Entry, EntryId, NewAccount, NewEntry, NewSession, NewTransfer, NewUser,
    NewVerifyEmail, Page, Session, SessionId, Transfer, TransferId, User, UserUpdate,
    VerifyEmail, VerifyEmailId,
};

use super::error::StoreResult;

/// Single-row CRUD primitives over the ledger tables.
///
/// Implemented both by plain connections (autocommit) and by transaction
/// handles, so the same code reads and writes inside or outside
/// [`Coordinator::run_atomic`](super::Coordinator::run_atomic).
///
/// ## Locking
///
/// The `*_for_update` reads take a row lock held until the surrounding
/// transaction ends. Outside a transaction they behave like plain reads.
#[async_trait]
pub trait Queries: Send {
    // accounts

    /// Insert an account with a zero balance.
    async fn create_account(&mut self, params: NewAccount) -> StoreResult<Account>;

    async fn get_account(&mut self, id: AccountId) -> StoreResult<Account>;

    async fn get_account_for_update(&mut self, id: AccountId) -> StoreResult<Account>;

    async fn list_accounts(&mut self, owner: &str, page: Page) -> StoreResult<Vec<Account>>;

    /// Apply a signed delta to an account balance, returning the new row.
    async fn add_account_balance(&mut self, id: AccountId, amount: i64) -> StoreResult<Account>;

    async fn delete_account(&mut self, id: AccountId) -> StoreResult<()>;

    // entries

    async fn create_entry(&mut self, params: NewEntry) -> StoreResult<Entry>;

    async fn get_entry(&mut self, id: EntryId) -> StoreResult<Entry>;

    async fn list_entries(&mut self, account_id: AccountId, page: Page) -> StoreResult<Vec<Entry>>;

    // transfers

    async fn create_transfer(&mut self, params: NewTransfer) -> StoreResult<Transfer>;

    async fn get_transfer(&mut self, id: TransferId) -> StoreResult<Transfer>;

    /// Transfers where the account is either side, oldest first.
    async fn list_transfers(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> StoreResult<Vec<Transfer>>;

    // users

    async fn create_user(&mut self, params: NewUser) -> StoreResult<User>;

    async fn get_user(&mut self, username: &str) -> StoreResult<User>;

    async fn update_user(&mut self, username: &str, update: UserUpdate) -> StoreResult<User>;

    // verify emails

    async fn create_verify_email(&mut self, params: NewVerifyEmail) -> StoreResult<VerifyEmail>;

    async fn get_verify_email(&mut self, id: VerifyEmailId) -> StoreResult<VerifyEmail>;

    async fn get_verify_email_for_update(&mut self, id: VerifyEmailId)
    -> StoreResult<VerifyEmail>;

    /// Newest unused, unexpired code issued to `username`, if any.
    async fn latest_active_verify_email(
        &mut self,
        username: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<VerifyEmail>>;

    async fn mark_verify_email_used(&mut self, id: VerifyEmailId) -> StoreResult<VerifyEmail>;

    // sessions

    async fn create_session(&mut self, params: NewSession) -> StoreResult<Session>;

    async fn get_session(&mut self, id: SessionId) -> StoreResult<Session>;
}

/// An open database transaction.
///
/// Dropping a handle without calling [`TxHandle::commit`] rolls it back.
/// The handle deliberately has no way to open another transaction, so
/// nesting cannot be expressed.
#[async_trait]
pub trait TxHandle: Queries + Send + 'static {
    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

/// Entry point to a ledger store backend.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// Autocommit connection.
    type Conn: Queries + Send + 'static;

    /// Transaction handle.
    type Tx: TxHandle;

    async fn acquire(&self) -> StoreResult<Self::Conn>;

    async fn begin(&self) -> StoreResult<Self::Tx>;
}
