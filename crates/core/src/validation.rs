//! Request field validation.
//!
//! Every check returns `DomainError::Validation` naming the offending field,
//! which maps to `ErrorKind::Invalid` at the boundary.

use crate::error::{DomainError, DomainResult};
use crate::id::VerifyEmailId;

pub const MIN_USERNAME_LENGTH: usize = 3;
pub const MAX_USERNAME_LENGTH: usize = 25;
pub const MIN_PASSWORD_LENGTH: usize = 6;
pub const MAX_PASSWORD_LENGTH: usize = 50;
pub const MIN_EMAIL_LENGTH: usize = 3;
pub const MAX_EMAIL_LENGTH: usize = 200;
pub const MIN_FULL_NAME_LENGTH: usize = 3;
pub const MAX_FULL_NAME_LENGTH: usize = 100;
pub const SECRET_CODE_LENGTH: usize = 32;

fn validate_length(field: &str, value: &str, min: usize, max: usize) -> DomainResult<()> {
    let n = value.chars().count();
    if n < min || n > max {
        return Err(DomainError::validation(
            field,
            format!("length must be between {min} and {max}"),
        ));
    }
    Ok(())
}

pub fn validate_username(username: &str) -> DomainResult<()> {
    validate_length("username", username, MIN_USERNAME_LENGTH, MAX_USERNAME_LENGTH)?;
    let ok = username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !ok {
        return Err(DomainError::validation(
            "username",
            "can only contain lowercase letters, digits and underscores",
        ));
    }
    Ok(())
}

pub fn validate_full_name(full_name: &str) -> DomainResult<()> {
    validate_length("full_name", full_name, MIN_FULL_NAME_LENGTH, MAX_FULL_NAME_LENGTH)?;
    if !full_name.chars().all(|c| c.is_ascii_alphabetic() || c.is_whitespace()) {
        return Err(DomainError::validation(
            "full_name",
            "can only contain letters and spaces",
        ));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> DomainResult<()> {
    validate_length("password", password, MIN_PASSWORD_LENGTH, MAX_PASSWORD_LENGTH)
}

/// Accepts a bare `local@domain` address with a dotted domain.
pub fn validate_email(email: &str) -> DomainResult<()> {
    validate_length("email", email, MIN_EMAIL_LENGTH, MAX_EMAIL_LENGTH)?;

    let invalid = || DomainError::validation("email", "invalid email address");
    if email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return Err(invalid());
    }
    Ok(())
}

pub fn validate_email_id(id: VerifyEmailId) -> DomainResult<()> {
    if id.get() < 1 {
        return Err(DomainError::validation("email_id", "must be a positive integer"));
    }
    Ok(())
}

pub fn validate_secret_code(code: &str) -> DomainResult<()> {
    validate_length("secret_code", code, SECRET_CODE_LENGTH, SECRET_CODE_LENGTH)?;
    if !code.chars().all(|c| c.is_ascii_lowercase()) {
        return Err(DomainError::validation("secret_code", "must be lowercase letters"));
    }
    Ok(())
}

pub fn validate_amount(amount: i64) -> DomainResult<()> {
    if amount <= 0 {
        return Err(DomainError::validation("amount", "must be greater than zero"));
    }
    Ok(())
}
