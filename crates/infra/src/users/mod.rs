//! User registration, email verification and sessions.

pub mod session;
pub mod workflow;

pub use session::{LoginParams, LoginResult, RenewResult, SessionService};
pub use workflow::{
    CreateUserParams, UserWorkflow, VerifyEmailTxParams, VerifyEmailTxResult, random_secret_code,
};
