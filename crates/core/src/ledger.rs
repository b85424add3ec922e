//! Ledger rows: accounts, entries and transfers.
//!
//! ## Invariants
//!
//! - `Account::balance` always equals the sum of the account's entry amounts
//!   as observed outside an in-flight transaction.
//! - `Entry::amount` is never zero; entries are append-only.
//! - Every transfer has exactly two entries: `-amount` on the source account
//!   and `+amount` on the destination account, with `amount > 0`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::currency::Currency;
use crate::entity::Entity;
use crate::id::{AccountId, EntryId, TransferId};

/// A balance-holding account, denominated in one currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Username of the owning user.
    pub owner: String,
    /// Minor currency units.
    pub balance: i64,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

/// One signed balance delta on one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub account_id: AccountId,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Record of one atomic money movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Insert parameters for an account. New accounts always start at zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub owner: String,
    pub currency: Currency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewEntry {
    pub account_id: AccountId,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewTransfer {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

/// Limit/offset pagination for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub const MAX_LIMIT: i64 = 100;

    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            offset: offset.max(0),
        }
    }

    /// One-based page number and size, as exposed by list endpoints.
    pub fn numbered(page_id: i64, page_size: i64) -> Self {
        let size = page_size.clamp(1, Self::MAX_LIMIT);
        Self::new(size, (page_id.max(1) - 1) * size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(10, 0)
    }
}

impl Entity for Account {
    type Id = AccountId;

    fn id(&self) -> AccountId {
        self.id
    }
}

impl Entity for Entry {
    type Id = EntryId;

    fn id(&self) -> EntryId {
        self.id
    }
}

impl Entity for Transfer {
    type Id = TransferId;

    fn id(&self) -> TransferId {
        self.id
    }
}
