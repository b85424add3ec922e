//! Infrastructure layer: stores, transactions, workflows, task queue, mail.
//!
//! ## Layout
//!
//! - `store`: the `Queries` surface, Postgres and in-memory backends, and the
//!   transaction `Coordinator`
//! - `ledger`: money movement (`TransferEngine`)
//! - `users`: registration, email verification and sessions
//! - `jobs`: background tasks (broker, distributor, processor)
//! - `mail`: outbound email
//! - `config`, `db`: process wiring

pub mod config;
pub mod db;
pub mod jobs;
pub mod ledger;
pub mod mail;
pub mod store;
pub mod users;

pub use config::{AppConfig, ConfigError};
