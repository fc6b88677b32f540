//! Bearer tokens: JWTs signed with the process secret, carrying
//! `{userId, exp}`. Verifiable without state lookup.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SecurityError;

/// Default bearer credential lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// The claims carried by a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub exp: u64,
}

/// Issues and verifies bearer tokens with a symmetric process secret.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str) -> Self {
        Self::with_ttl(secret, DEFAULT_TOKEN_TTL)
    }

    pub fn with_ttl(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Issue a token binding `user_id` with the configured expiry.
    pub fn issue(&self, user_id: &str) -> Result<String, SecurityError> {
        let claims = Claims {
            user_id: user_id.to_string(),
            exp: Self::now() + self.ttl.as_secs(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| SecurityError::InvalidToken(e.to_string()))
    }

    /// Verify a token's signature and expiry and return its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, SecurityError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => SecurityError::TokenExpired,
                _ => SecurityError::InvalidToken(e.to_string()),
            }
        })?;
        debug!(user_id = %data.claims.user_id, "bearer token verified");
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_verify_to_their_principal() {
        let issuer = TokenIssuer::new("secret");
        let token = issuer.issue("user-1").unwrap();
        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.user_id, "user-1");
        assert!(claims.exp > TokenIssuer::now());
    }

    #[test]
    fn foreign_signatures_are_rejected() {
        let issuer = TokenIssuer::new("secret");
        let other = TokenIssuer::new("different-secret");
        let token = other.issue("user-1").unwrap();
        assert!(matches!(
            issuer.verify(&token),
            Err(SecurityError::InvalidToken(_))
        ));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        // jsonwebtoken applies a default 60s leeway; reach well past it.
        let issuer = TokenIssuer::new("secret");
        let claims = Claims {
            user_id: "user-1".into(),
            exp: TokenIssuer::now().saturating_sub(120),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(matches!(
            issuer.verify(&token),
            Err(SecurityError::TokenExpired)
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        let issuer = TokenIssuer::new("secret");
        assert!(issuer.verify("not.a.jwt").is_err());
        assert!(issuer.verify("").is_err());
    }
}
