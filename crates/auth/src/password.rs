//! Argon2 password hashing.

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use thiserror::Error;

use ledgerline_core::DomainError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PasswordError {
    #[error("incorrect password")]
    Mismatch,

    #[error("failed to hash password: {0}")]
    Hash(String),

    #[error("malformed password hash: {0}")]
    MalformedHash(String),
}

impl From<PasswordError> for DomainError {
    fn from(err: PasswordError) -> Self {
        match err {
            PasswordError::Mismatch => DomainError::unauthorized(err.to_string()),
            _ => DomainError::internal(err.to_string()),
        }
    }
}

/// Hash `password` with a fresh random salt (PHC string format).
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| PasswordError::Hash(e.to_string()))
}

/// Check `password` against a hash produced by [`hash_password`].
pub fn check_password(password: &str, hashed_password: &str) -> Result<(), PasswordError> {
    let parsed = PasswordHash::new(hashed_password)
        .map_err(|e| PasswordError::MalformedHash(e.to_string()))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| PasswordError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_check() {
        let hash = hash_password("secret123").unwrap();
        assert_ne!(hash, "secret123");
        assert_eq!(check_password("secret123", &hash), Ok(()));
        assert_eq!(check_password("wrong-one", &hash), Err(PasswordError::Mismatch));
    }

    #[test]
    fn salts_differ() {
        let a = hash_password("secret123").unwrap();
        let b = hash_password("secret123").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_hash_is_reported() {
        assert!(matches!(
            check_password("secret123", "plaintext"),
            Err(PasswordError::MalformedHash(_))
        ));
    }
}
