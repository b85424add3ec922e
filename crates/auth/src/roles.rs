use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Role carried in access tokens.
///
/// Roles are opaque strings on the wire; the two built-in roles are exposed
/// as constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    /// Regular customer: may only act on accounts they own.
    pub const DEPOSITOR: Role = Role(Cow::Borrowed("depositor"));

    /// Staff member: may act on any user's data.
    pub const BANKER: Role = Role(Cow::Borrowed("banker"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::DEPOSITOR
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
