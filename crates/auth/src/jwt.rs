//! HS256 JSON Web Token maker.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Payload, Role, TokenError, TokenMaker};

const MIN_SECRET_KEY_SIZE: usize = 32;

/// Registered + private claims as they appear on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    jti: Uuid,
    sub: String,
    role: Role,
    iat: i64,
    exp: i64,
}

impl From<&Payload> for Claims {
    fn from(p: &Payload) -> Self {
        Self {
            jti: p.id,
            sub: p.username.clone(),
            role: p.role.clone(),
            iat: p.issued_at.timestamp(),
            exp: p.expired_at.timestamp(),
        }
    }
}

impl TryFrom<Claims> for Payload {
    type Error = TokenError;

    fn try_from(c: Claims) -> Result<Self, Self::Error> {
        let issued_at = DateTime::<Utc>::from_timestamp(c.iat, 0).ok_or(TokenError::Invalid)?;
        let expired_at = DateTime::<Utc>::from_timestamp(c.exp, 0).ok_or(TokenError::Invalid)?;
        Ok(Payload {
            id: c.jti,
            username: c.sub,
            role: c.role,
            issued_at,
            expired_at,
        })
    }
}

/// Symmetric-key JWT implementation of [`TokenMaker`].
#[derive(Clone)]
pub struct JwtMaker {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl core::fmt::Debug for JwtMaker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JwtMaker").finish_non_exhaustive()
    }
}

impl JwtMaker {
    pub fn new(secret_key: &str) -> Result<Self, TokenError> {
        if secret_key.len() < MIN_SECRET_KEY_SIZE {
            return Err(TokenError::KeyTooShort {
                min: MIN_SECRET_KEY_SIZE,
            });
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret_key.as_bytes()),
            decoding: DecodingKey::from_secret(secret_key.as_bytes()),
        })
    }

    fn validation() -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        validation
    }
}

impl TokenMaker for JwtMaker {
    fn create_token(
        &self,
        username: &str,
        role: &Role,
        duration: Duration,
    ) -> Result<(String, Payload), TokenError> {
        let payload = Payload::new(username, role.clone(), duration);
        let token = encode(
            &Header::new(Algorithm::HS256),
            &Claims::from(&payload),
            &self.encoding,
        )
        .map_err(|e| TokenError::Signing(e.to_string()))?;
        Ok((token, payload))
    }

    fn verify_token(&self, token: &str) -> Result<Payload, TokenError> {
        let data = decode::<Claims>(token, &self.decoding, &Self::validation()).map_err(|e| {
            match e.kind() {
                JwtErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            }
        })?;
        let payload = Payload::try_from(data.claims)?;
        payload.validate(Utc::now())?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdefghijklmnopqrstuv";

    #[test]
    fn rejects_short_keys() {
        assert!(matches!(
            JwtMaker::new("short"),
            Err(TokenError::KeyTooShort { min: 32 })
        ));
    }

    #[test]
    fn round_trip_preserves_payload() {
        let maker = JwtMaker::new(SECRET).unwrap();
        let (token, issued) = maker
            .create_token("alice", &Role::DEPOSITOR, Duration::minutes(1))
            .unwrap();
        let verified = maker.verify_token(&token).unwrap();
        assert_eq!(issued, verified);
    }

    #[test]
    fn expired_token_is_rejected() {
        let maker = JwtMaker::new(SECRET).unwrap();
        let (token, _) = maker
            .create_token("alice", &Role::DEPOSITOR, Duration::minutes(-1))
            .unwrap();
        assert_eq!(maker.verify_token(&token), Err(TokenError::Expired));
    }

    #[test]
    fn token_from_another_key_is_invalid() {
        let other = JwtMaker::new("vutsrqponmlkjihgfedcba9876543210").unwrap();
        let (token, _) = other
            .create_token("alice", &Role::BANKER, Duration::minutes(1))
            .unwrap();
        let maker = JwtMaker::new(SECRET).unwrap();
        assert_eq!(maker.verify_token(&token), Err(TokenError::Invalid));
    }

    #[test]
    fn garbage_is_invalid() {
        let maker = JwtMaker::new(SECRET).unwrap();
        assert_eq!(maker.verify_token("not.a.token"), Err(TokenError::Invalid));
    }
}
