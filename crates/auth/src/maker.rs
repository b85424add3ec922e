use chrono::Duration;

use crate::{Payload, Role, TokenError};

/// Issues and verifies bearer tokens.
///
/// Implementations must be cheap to share across request handlers.
pub trait TokenMaker: Send + Sync {
    /// Create a token for `username` valid for `duration`.
    fn create_token(
        &self,
        username: &str,
        role: &Role,
        duration: Duration,
    ) -> Result<(String, Payload), TokenError>;

    /// Verify signature and validity window, returning the embedded payload.
    fn verify_token(&self, token: &str) -> Result<Payload, TokenError>;
}
