//! Money movement between accounts.
//!
//! ## Transfer Flow
//!
//! ```text
//! TransferTxParams
//!   ↓
//! 1. Validate (from != to, amount > 0), no transaction opened yet
//!   ↓
//! 2. BEGIN; lock both account rows, lower id first
//!   ↓
//! 3. Policy checks under the locks (currency, overdraft)
//!   ↓
//! 4. INSERT transfer, debit entry (-amount), credit entry (+amount)
//!   ↓
//! 5. Balance updates, lower id first regardless of direction
//!   ↓
//! COMMIT
//! ```
//!
//! Every transaction that touches two accounts takes its row locks in the
//! same global order, so two opposite transfers between the same pair wait
//! on each other instead of deadlocking.

use chrono::Utc;
use tracing::{debug, instrument};

use ledgerline_core::{
    Account, AccountId, Currency, DomainError, Entry, NewAccount, NewEntry, NewTransfer, Page,
    Transfer, validation,
};

use crate::store::{Coordinator, Queries, Store, StoreError, StoreResult};

/// Checks evaluated while both account rows are locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPolicy {
    /// Reject transfers between accounts in different currencies (`Conflict`).
    pub require_same_currency: bool,
    /// Let the source balance go negative.
    pub allow_overdraft: bool,
}

impl TransferPolicy {
    pub const fn strict() -> Self {
        Self {
            require_same_currency: true,
            allow_overdraft: false,
        }
    }

    /// No checks; callers validate currency and funds themselves.
    pub const fn permissive() -> Self {
        Self {
            require_same_currency: false,
            allow_overdraft: true,
        }
    }

    fn check(&self, from: &Account, to: &Account, amount: i64) -> Result<(), DomainError> {
        if self.require_same_currency && from.currency != to.currency {
            return Err(DomainError::conflict(format!(
                "account {} currency mismatch: {} vs {}",
                to.id, from.currency, to.currency
            )));
        }
        if !self.allow_overdraft && from.balance < amount {
            return Err(DomainError::validation(
                "amount",
                format!("insufficient funds in account {}", from.id),
            ));
        }
        Ok(())
    }
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self::strict()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTxParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    /// Minor currency units, strictly positive.
    pub amount: i64,
}

/// Rows written by one committed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_entry: Entry,
    pub to_entry: Entry,
    pub from_account: Account,
    pub to_account: Account,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAccountParams {
    pub owner: String,
    pub currency: Currency,
    pub opening_balance: i64,
}

/// Ledger operations, each one a single atomic unit of work.
#[derive(Debug, Clone)]
pub struct TransferEngine<S> {
    coordinator: Coordinator<S>,
    policy: TransferPolicy,
}

impl<S: Store> TransferEngine<S> {
    pub fn new(coordinator: Coordinator<S>) -> Self {
        Self {
            coordinator,
            policy: TransferPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: TransferPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> TransferPolicy {
        self.policy
    }

    /// Move `amount` from one account to another.
    #[instrument(
        skip(self),
        fields(from = %params.from_account_id, to = %params.to_account_id, amount = params.amount),
        err
    )]
    pub async fn transfer(&self, params: TransferTxParams) -> StoreResult<TransferTxResult> {
        if params.from_account_id == params.to_account_id {
            return Err(DomainError::validation(
                "to_account_id",
                "must differ from from_account_id",
            )
            .into());
        }
        validation::validate_amount(params.amount)?;

        let policy = self.policy;
        self.coordinator
            .run_atomic(move |tx| Box::pin(async move { transfer_tx(tx, policy, params).await }))
            .await
    }

    /// Create an account, optionally funded by an opening entry.
    #[instrument(skip(self), fields(owner = %params.owner, currency = %params.currency), err)]
    pub async fn open_account(&self, params: CreateAccountParams) -> StoreResult<Account> {
        validation::validate_username(&params.owner)?;
        if params.opening_balance < 0 {
            return Err(
                DomainError::validation("opening_balance", "must not be negative").into(),
            );
        }

        self.coordinator
            .run_atomic(move |tx| {
                Box::pin(async move {
                    let account = tx
                        .create_account(NewAccount {
                            owner: params.owner,
                            currency: params.currency,
                        })
                        .await?;
                    if params.opening_balance == 0 {
                        return Ok(account);
                    }
                    tx.create_entry(NewEntry {
                        account_id: account.id,
                        amount: params.opening_balance,
                    })
                    .await?;
                    tx.add_account_balance(account.id, params.opening_balance)
                        .await
                })
            })
            .await
    }

    /// Delete an account that has no ledger history.
    pub async fn close_account(&self, id: AccountId) -> StoreResult<()> {
        self.coordinator
            .run_atomic(move |tx| {
                Box::pin(async move {
                    tx.get_account_for_update(id).await?;
                    match tx.delete_account(id).await {
                        Err(StoreError::ForeignKeyViolation(_)) => Err(DomainError::conflict(
                            format!("account {id} has ledger history"),
                        )
                        .into()),
                        other => other,
                    }
                })
            })
            .await
    }

    pub async fn account(&self, id: AccountId) -> StoreResult<Account> {
        self.coordinator.store().acquire().await?.get_account(id).await
    }

    pub async fn accounts(&self, owner: &str, page: Page) -> StoreResult<Vec<Account>> {
        self.coordinator
            .store()
            .acquire()
            .await?
            .list_accounts(owner, page)
            .await
    }

    pub async fn entries(&self, account_id: AccountId, page: Page) -> StoreResult<Vec<Entry>> {
        self.coordinator
            .store()
            .acquire()
            .await?
            .list_entries(account_id, page)
            .await
    }

    pub async fn transfers(&self, account_id: AccountId, page: Page) -> StoreResult<Vec<Transfer>> {
        self.coordinator
            .store()
            .acquire()
            .await?
            .list_transfers(account_id, page)
            .await
    }
}

async fn transfer_tx<Q: Queries + ?Sized>(
    tx: &mut Q,
    policy: TransferPolicy,
    params: TransferTxParams,
) -> StoreResult<TransferTxResult> {
    let TransferTxParams {
        from_account_id,
        to_account_id,
        amount,
    } = params;

    let (low, high) = ordered(from_account_id, to_account_id);
    let low_account = tx.get_account_for_update(low).await?;
    let high_account = tx.get_account_for_update(high).await?;
    let (from, to) = if low == from_account_id {
        (&low_account, &high_account)
    } else {
        (&high_account, &low_account)
    };
    policy.check(from, to, amount)?;

    let transfer = tx
        .create_transfer(NewTransfer {
            from_account_id,
            to_account_id,
            amount,
        })
        .await?;
    let from_entry = tx
        .create_entry(NewEntry {
            account_id: from_account_id,
            amount: -amount,
        })
        .await?;
    let to_entry = tx
        .create_entry(NewEntry {
            account_id: to_account_id,
            amount,
        })
        .await?;

    let delta = |id: AccountId| if id == from_account_id { -amount } else { amount };
    let low_account = tx.add_account_balance(low, delta(low)).await?;
    let high_account = tx.add_account_balance(high, delta(high)).await?;
    let (from_account, to_account) = if low == from_account_id {
        (low_account, high_account)
    } else {
        (high_account, low_account)
    };

    debug!(
        transfer_id = %transfer.id,
        from_balance = from_account.balance,
        to_balance = to_account.balance,
        at = %Utc::now(),
        "transfer applied"
    );

    Ok(TransferTxResult {
        transfer,
        from_entry,
        to_entry,
        from_account,
        to_account,
    })
}

fn ordered(a: AccountId, b: AccountId) -> (AccountId, AccountId) {
    if a < b { (a, b) } else { (b, a) }
}
