//! `ledgerline-auth`: token, password and session primitives.
//!
//! This crate is intentionally decoupled from HTTP and storage: the ledger
//! consumes tokens only through [`TokenMaker`], and session rows are loaded
//! by the caller and checked here.

pub mod authorize;
pub mod jwt;
pub mod maker;
pub mod password;
pub mod payload;
pub mod roles;
pub mod session;

pub use authorize::{AuthError, authorize};
pub use jwt::JwtMaker;
pub use maker::TokenMaker;
pub use password::{PasswordError, check_password, hash_password};
pub use payload::{Payload, TokenError};
pub use roles::Role;
pub use session::validate_session_renewal;
