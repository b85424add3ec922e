use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Currency an account is denominated in. Immutable once the account exists.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Vnd,
}

impl Currency {
    pub const SUPPORTED: [Currency; 3] = [Currency::Usd, Currency::Eur, Currency::Vnd];

    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Vnd => "VND",
        }
    }
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::SUPPORTED
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                DomainError::validation("currency", format!("unsupported currency {s:?}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_codes_only() {
        assert_eq!("USD".parse::<Currency>().unwrap(), Currency::Usd);
        assert_eq!("VND".parse::<Currency>().unwrap(), Currency::Vnd);
        assert!("usd".parse::<Currency>().is_err());
        assert!("GBP".parse::<Currency>().is_err());
    }

    #[test]
    fn serializes_as_iso_code() {
        assert_eq!(serde_json::to_string(&Currency::Eur).unwrap(), "\"EUR\"");
    }
}
