//! `ledgerline-core`: domain foundation for the ledger.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! accounts, entries, transfers, users, verification codes, sessions, the
//! error taxonomy and input validation.

pub mod currency;
pub mod entity;
pub mod error;
pub mod id;
pub mod ledger;
pub mod user;
pub mod validation;

pub use currency::Currency;
pub use entity::Entity;
pub use error::{DomainError, DomainResult, ErrorKind};
pub use id::{AccountId, EntryId, SessionId, TransferId, VerifyEmailId};
pub use ledger::{Account, Entry, NewAccount, NewEntry, NewTransfer, Page, Transfer};
pub use user::{NewSession, NewUser, NewVerifyEmail, Session, User, UserUpdate, VerifyEmail};
