//! Ledger persistence.
//!
//! - [`Queries`]: CRUD primitives shared by connections and transactions
//! - [`Store`]: backend entry point (`PgStore`, `InMemoryStore`)
//! - [`Coordinator`]: runs a unit of work in exactly one transaction

pub mod coordinator;
pub mod error;
pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use coordinator::Coordinator;
pub use error::{StoreError, StoreResult};
pub use in_memory::{AccessRecord, InMemoryHandle, InMemoryStore, RowAccess};
pub use postgres::{PgQueries, PgStore};
pub use r#trait::{Queries, Store, TxHandle};
