//! Bearer-token verification.
//!
//! Tokens are JWTs from a trusted issuer. Verification checks signature,
//! issuer, audience and expiry, and optionally binds the token subject to the
//! principal id the caller claims in the request body.

pub mod jwks;
pub mod jwt;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::AuthClaim;

pub use jwt::JwtVerifier;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no auth token provided")]
    MissingToken,

    #[error("found something in the Authorization header, but it's not a bearer token")]
    NotBearer,

    #[error("Token error: {0}")]
    TokenError(String),

    #[error("token subject does not match the requested principal")]
    SubjectMismatch,

    #[error("Signing key error: {0}")]
    KeyError(String),
}

/// Verifies bearer tokens.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify `token`; when `expected_subject` is given the token must speak
    /// for that principal.
    async fn verify(
        &self,
        token: &str,
        expected_subject: Option<&str>,
    ) -> Result<AuthClaim, AuthError>;
}

/// Extract the token from an `Authorization` header value.
pub fn bearer_token(header: &str) -> Result<&str, AuthError> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::NotBearer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_strips_scheme() {
        assert_eq!(bearer_token("Bearer abc.def").unwrap(), "abc.def");
    }

    #[test]
    fn bearer_token_rejects_other_schemes() {
        assert!(matches!(
            bearer_token("Basic dXNlcjpwYXNz"),
            Err(AuthError::NotBearer)
        ));
        assert!(matches!(bearer_token("Bearer "), Err(AuthError::NotBearer)));
        assert!(matches!(bearer_token("abc.def"), Err(AuthError::NotBearer)));
    }
}
