//! Ledger workflows built on [`Coordinator::run_atomic`](crate::store::Coordinator::run_atomic).

pub mod transfer;

pub use transfer::{
    CreateAccountParams, TransferEngine, TransferPolicy, TransferTxParams, TransferTxResult,
};
