//! In-memory ledger store for tests/dev.
//!
//! A handle (connection or transaction) owns the single table lock for its
//! whole lifetime, so transactions are fully serialized. A transaction keeps
//! a snapshot of the tables taken at `begin`; rollback (explicit or on drop)
//! restores it. Id sequences live outside the snapshot and, like Postgres
//! sequences, never roll back.
//!
//! The store enforces the same constraints as the SQL schema (unique keys,
//! foreign keys, check constraints) so workflows fail the same way against
//! both backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use ledgerline_core::{
    Account, AccountId, Entity, Entry, EntryId, NewAccount, NewEntry, NewSession, NewTransfer,
    NewUser, NewVerifyEmail, Page, Session, SessionId, Transfer, TransferId, User, UserUpdate,
    VerifyEmail, VerifyEmailId,
};

use super::error::{StoreError, StoreResult};
use super::r#trait::{Queries, Store, TxHandle};

/// What a handle did to an account row, in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAccess {
    /// `get_account_for_update`.
    Locked,
    /// `add_account_balance`.
    BalanceUpdated,
}

/// One entry of the row access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRecord {
    /// Serial number of the handle that issued the statement.
    pub handle: u64,
    pub account_id: AccountId,
    pub access: RowAccess,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    users: HashMap<String, User>,
    accounts: HashMap<AccountId, Account>,
    entries: HashMap<EntryId, Entry>,
    transfers: HashMap<TransferId, Transfer>,
    verify_emails: HashMap<VerifyEmailId, VerifyEmail>,
    sessions: HashMap<SessionId, Session>,
}

#[derive(Debug, Default)]
struct Sequences {
    account: AtomicI64,
    entry: AtomicI64,
    transfer: AtomicI64,
    verify_email: AtomicI64,
}

fn next(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::SeqCst) + 1
}

#[derive(Debug, Default)]
struct Faults {
    commit: AtomicBool,
    rollback: AtomicBool,
}

#[derive(Debug, Default)]
struct Shared {
    tables: Arc<Mutex<Tables>>,
    sequences: Sequences,
    faults: Faults,
    handles: AtomicU64,
    access_log: StdMutex<Vec<AccessRecord>>,
}

/// In-memory [`Store`] backend.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail (the transaction is discarded).
    pub fn fail_next_commit(&self) {
        self.shared.faults.commit.store(true, Ordering::SeqCst);
    }

    /// Make the next rollback report a failure (the transaction is still discarded).
    pub fn fail_next_rollback(&self) {
        self.shared.faults.rollback.store(true, Ordering::SeqCst);
    }

    /// Account row accesses in the order they were issued.
    pub fn access_log(&self) -> Vec<AccessRecord> {
        self.shared
            .access_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn open(&self, transactional: bool) -> InMemoryHandle {
        let tables = self.shared.tables.clone().lock_owned().await;
        let snapshot = transactional.then(|| Tables::clone(&tables));
        InMemoryHandle {
            tables,
            snapshot,
            serial: self.shared.handles.fetch_add(1, Ordering::SeqCst) + 1,
            shared: self.shared.clone(),
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Conn = InMemoryHandle;
    type Tx = InMemoryHandle;

    async fn acquire(&self) -> StoreResult<InMemoryHandle> {
        Ok(self.open(false).await)
    }

    async fn begin(&self) -> StoreResult<InMemoryHandle> {
        Ok(self.open(true).await)
    }
}

/// Connection or transaction over an [`InMemoryStore`].
#[derive(Debug)]
pub struct InMemoryHandle {
    tables: OwnedMutexGuard<Tables>,
    /// `Some` while a transaction is open.
    snapshot: Option<Tables>,
    serial: u64,
    shared: Arc<Shared>,
}

impl InMemoryHandle {
    fn record(&self, account_id: AccountId, access: RowAccess) {
        self.shared
            .access_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(AccessRecord {
                handle: self.serial,
                account_id,
                access,
            });
    }

    fn restore(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.tables = snapshot;
        }
    }
}

impl Drop for InMemoryHandle {
    fn drop(&mut self) {
        self.restore();
    }
}

#[async_trait]
impl TxHandle for InMemoryHandle {
    async fn commit(mut self) -> StoreResult<()> {
        if self.shared.faults.commit.swap(false, Ordering::SeqCst) {
            self.restore();
            return Err(StoreError::database("commit", "injected commit failure"));
        }
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(mut self) -> StoreResult<()> {
        self.restore();
        if self.shared.faults.rollback.swap(false, Ordering::SeqCst) {
            return Err(StoreError::database("rollback", "injected rollback failure"));
        }
        Ok(())
    }
}

fn fetch<E: Entity + Clone>(
    table: &HashMap<E::Id, E>,
    id: E::Id,
    entity: &'static str,
) -> StoreResult<E> {
    table.get(&id).cloned().ok_or(StoreError::not_found(entity))
}

fn insert<E: Entity + Clone>(table: &mut HashMap<E::Id, E>, row: E) -> E {
    table.insert(row.id(), row.clone());
    row
}

fn paginate<T, K: Ord>(mut rows: Vec<T>, page: Page, key: impl Fn(&T) -> K) -> Vec<T> {
    rows.sort_by_key(key);
    rows.into_iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect()
}

fn ensure_account(tables: &Tables, id: AccountId, constraint: &str) -> StoreResult<()> {
    if tables.accounts.contains_key(&id) {
        Ok(())
    } else {
        Err(StoreError::ForeignKeyViolation(constraint.to_string()))
    }
}

fn ensure_user(tables: &Tables, username: &str, constraint: &str) -> StoreResult<()> {
    if tables.users.contains_key(username) {
        Ok(())
    } else {
        Err(StoreError::ForeignKeyViolation(constraint.to_string()))
    }
}

#[async_trait]
impl Queries for InMemoryHandle {
    async fn create_account(&mut self, params: NewAccount) -> StoreResult<Account> {
        ensure_user(&self.tables, &params.owner, "accounts_owner_fkey")?;
        let duplicate = self
            .tables
            .accounts
            .values()
            .any(|a| a.owner == params.owner && a.currency == params.currency);
        if duplicate {
            return Err(StoreError::UniqueViolation("owner_currency_key".into()));
        }
        let account = Account {
            id: AccountId::new(next(&self.shared.sequences.account)),
            owner: params.owner,
            balance: 0,
            currency: params.currency,
            created_at: Utc::now(),
        };
        Ok(insert(&mut self.tables.accounts, account))
    }

    async fn get_account(&mut self, id: AccountId) -> StoreResult<Account> {
        fetch(&self.tables.accounts, id, "account")
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> StoreResult<Account> {
        let account = fetch(&self.tables.accounts, id, "account")?;
        self.record(id, RowAccess::Locked);
        Ok(account)
    }

    async fn list_accounts(&mut self, owner: &str, page: Page) -> StoreResult<Vec<Account>> {
        let rows = self
            .tables
            .accounts
            .values()
            .filter(|a| a.owner == owner)
            .cloned()
            .collect();
        Ok(paginate(rows, page, |a: &Account| a.id))
    }

    async fn add_account_balance(&mut self, id: AccountId, amount: i64) -> StoreResult<Account> {
        self.record(id, RowAccess::BalanceUpdated);
        let account = self
            .tables
            .accounts
            .get_mut(&id)
            .ok_or(StoreError::not_found("account"))?;
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or_else(|| StoreError::database("add_account_balance", "bigint out of range"))?;
        Ok(account.clone())
    }

    async fn delete_account(&mut self, id: AccountId) -> StoreResult<()> {
        if !self.tables.accounts.contains_key(&id) {
            return Err(StoreError::not_found("account"));
        }
        if self.tables.entries.values().any(|e| e.account_id == id) {
            return Err(StoreError::ForeignKeyViolation("entries_account_id_fkey".into()));
        }
        let referenced = self
            .tables
            .transfers
            .values()
            .any(|t| t.from_account_id == id || t.to_account_id == id);
        if referenced {
            return Err(StoreError::ForeignKeyViolation("transfers_account_id_fkey".into()));
        }
        self.tables.accounts.remove(&id);
        Ok(())
    }

    async fn create_entry(&mut self, params: NewEntry) -> StoreResult<Entry> {
        if params.amount == 0 {
            return Err(StoreError::CheckViolation("entries_amount_check".into()));
        }
        ensure_account(&self.tables, params.account_id, "entries_account_id_fkey")?;
        let entry = Entry {
            id: EntryId::new(next(&self.shared.sequences.entry)),
            account_id: params.account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        Ok(insert(&mut self.tables.entries, entry))
    }

    async fn get_entry(&mut self, id: EntryId) -> StoreResult<Entry> {
        fetch(&self.tables.entries, id, "entry")
    }

    async fn list_entries(&mut self, account_id: AccountId, page: Page) -> StoreResult<Vec<Entry>> {
        let rows = self
            .tables
            .entries
            .values()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect();
        Ok(paginate(rows, page, |e: &Entry| e.id))
    }

    async fn create_transfer(&mut self, params: NewTransfer) -> StoreResult<Transfer> {
        if params.amount <= 0 {
            return Err(StoreError::CheckViolation("transfers_amount_check".into()));
        }
        if params.from_account_id == params.to_account_id {
            return Err(StoreError::CheckViolation("transfers_check".into()));
        }
        ensure_account(&self.tables, params.from_account_id, "transfers_from_account_id_fkey")?;
        ensure_account(&self.tables, params.to_account_id, "transfers_to_account_id_fkey")?;
        let transfer = Transfer {
            id: TransferId::new(next(&self.shared.sequences.transfer)),
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        Ok(insert(&mut self.tables.transfers, transfer))
    }

    async fn get_transfer(&mut self, id: TransferId) -> StoreResult<Transfer> {
        fetch(&self.tables.transfers, id, "transfer")
    }

    async fn list_transfers(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> StoreResult<Vec<Transfer>> {
        let rows = self
            .tables
            .transfers
            .values()
            .filter(|t| t.from_account_id == account_id || t.to_account_id == account_id)
            .cloned()
            .collect();
        Ok(paginate(rows, page, |t: &Transfer| t.id))
    }

    async fn create_user(&mut self, params: NewUser) -> StoreResult<User> {
        if self.tables.users.contains_key(&params.username) {
            return Err(StoreError::UniqueViolation("users_pkey".into()));
        }
        if self.tables.users.values().any(|u| u.email == params.email) {
            return Err(StoreError::UniqueViolation("users_email_key".into()));
        }
        let now = Utc::now();
        let user = User {
            username: params.username,
            hashed_password: params.hashed_password,
            full_name: params.full_name,
            email: params.email,
            is_email_verified: false,
            password_changed_at: now,
            created_at: now,
        };
        self.tables.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> StoreResult<User> {
        self.tables
            .users
            .get(username)
            .cloned()
            .ok_or(StoreError::not_found("user"))
    }

    async fn update_user(&mut self, username: &str, update: UserUpdate) -> StoreResult<User> {
        if let Some(email) = &update.email {
            let taken = self
                .tables
                .users
                .values()
                .any(|u| u.username != username && &u.email == email);
            if taken {
                return Err(StoreError::UniqueViolation("users_email_key".into()));
            }
        }
        let user = self
            .tables
            .users
            .get_mut(username)
            .ok_or(StoreError::not_found("user"))?;
        if let Some(hashed_password) = update.hashed_password {
            user.hashed_password = hashed_password;
            user.password_changed_at = Utc::now();
        }
        if let Some(full_name) = update.full_name {
            user.full_name = full_name;
        }
        if let Some(email) = update.email {
            user.email = email;
        }
        if let Some(verified) = update.is_email_verified {
            user.is_email_verified = verified;
        }
        Ok(user.clone())
    }

    async fn create_verify_email(&mut self, params: NewVerifyEmail) -> StoreResult<VerifyEmail> {
        ensure_user(&self.tables, &params.username, "verify_emails_username_fkey")?;
        let verify_email = VerifyEmail {
            id: VerifyEmailId::new(next(&self.shared.sequences.verify_email)),
            username: params.username,
            email: params.email,
            secret_code: params.secret_code,
            is_used: false,
            created_at: Utc::now(),
            expires_at: params.expires_at,
        };
        Ok(insert(&mut self.tables.verify_emails, verify_email))
    }

    async fn get_verify_email(&mut self, id: VerifyEmailId) -> StoreResult<VerifyEmail> {
        fetch(&self.tables.verify_emails, id, "verify email")
    }

    async fn get_verify_email_for_update(
        &mut self,
        id: VerifyEmailId,
    ) -> StoreResult<VerifyEmail> {
        fetch(&self.tables.verify_emails, id, "verify email")
    }

    async fn latest_active_verify_email(
        &mut self,
        username: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<VerifyEmail>> {
        Ok(self
            .tables
            .verify_emails
            .values()
            .filter(|v| v.username == username && v.is_active(now))
            .max_by_key(|v| v.id)
            .cloned())
    }

    async fn mark_verify_email_used(&mut self, id: VerifyEmailId) -> StoreResult<VerifyEmail> {
        let verify_email = self
            .tables
            .verify_emails
            .get_mut(&id)
            .ok_or(StoreError::not_found("verify email"))?;
        verify_email.is_used = true;
        Ok(verify_email.clone())
    }

    async fn create_session(&mut self, params: NewSession) -> StoreResult<Session> {
        ensure_user(&self.tables, &params.username, "sessions_username_fkey")?;
        if self.tables.sessions.contains_key(&params.id) {
            return Err(StoreError::UniqueViolation("sessions_pkey".into()));
        }
        let session = Session {
            id: params.id,
            username: params.username,
            refresh_token: params.refresh_token,
            user_agent: params.user_agent,
            client_ip: params.client_ip,
            is_blocked: params.is_blocked,
            expires_at: params.expires_at,
            created_at: Utc::now(),
        };
        Ok(insert(&mut self.tables.sessions, session))
    }

    async fn get_session(&mut self, id: SessionId) -> StoreResult<Session> {
        fetch(&self.tables.sessions, id, "session")
    }
}

#[cfg(test)]
mod tests {
    use ledgerline_core::Currency;

    use super::*;

    fn alice() -> NewUser {
        NewUser {
            username: "alice".into(),
            hashed_password: "hash".into(),
            full_name: "Alice Doe".into(),
            email: "alice@example.com".into(),
        }
    }

    #[tokio::test]
    async fn enforces_unique_and_foreign_keys() {
        let store = InMemoryStore::new();
        let mut conn = store.acquire().await.unwrap();

        let orphan = conn
            .create_account(NewAccount {
                owner: "nobody".into(),
                currency: Currency::Usd,
            })
            .await
            .unwrap_err();
        assert!(matches!(orphan, StoreError::ForeignKeyViolation(_)));

        conn.create_user(alice()).await.unwrap();
        assert!(conn.create_user(alice()).await.unwrap_err().is_unique_violation());

        let usd = NewAccount {
            owner: "alice".into(),
            currency: Currency::Usd,
        };
        conn.create_account(usd.clone()).await.unwrap();
        assert!(conn.create_account(usd).await.unwrap_err().is_unique_violation());
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = InMemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.create_user(alice()).await.unwrap();
        }
        let mut conn = store.acquire().await.unwrap();
        assert!(conn.get_user("alice").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn sequences_survive_rollback() {
        let store = InMemoryStore::new();
        store.acquire().await.unwrap().create_user(alice()).await.unwrap();

        let usd = NewAccount {
            owner: "alice".into(),
            currency: Currency::Usd,
        };
        let mut tx = store.begin().await.unwrap();
        let first = tx.create_account(usd.clone()).await.unwrap();
        tx.rollback().await.unwrap();

        let mut conn = store.acquire().await.unwrap();
        let second = conn.create_account(usd).await.unwrap();
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn zero_entries_violate_the_check_constraint() {
        let store = InMemoryStore::new();
        let mut conn = store.acquire().await.unwrap();
        conn.create_user(alice()).await.unwrap();
        let account = conn
            .create_account(NewAccount {
                owner: "alice".into(),
                currency: Currency::Eur,
            })
            .await
            .unwrap();

        let err = conn
            .create_entry(NewEntry {
                account_id: account.id,
                amount: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CheckViolation(_)));
    }
}
