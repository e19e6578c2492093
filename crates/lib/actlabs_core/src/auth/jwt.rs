//! JWT verification against a trusted issuer and audience.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use reqwest::Client;
use tracing::debug;

use super::jwks::JwksCache;
use super::{AuthError, TokenVerifier};
use crate::models::AuthClaim;

/// Where signing keys come from.
enum KeySource {
    /// Issuer-published RSA keys (Entra ID and friends).
    Jwks(JwksCache),
    /// Shared HMAC secret, for local development and tests.
    Shared(DecodingKey),
}

/// Verifies issuer-signed JWTs.
pub struct JwtVerifier {
    issuer: String,
    audience: String,
    keys: KeySource,
}

impl JwtVerifier {
    /// Verifier that trusts the keys the issuer publishes.
    pub fn with_jwks(client: Client, issuer: &str, audience: &str) -> Self {
        Self {
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            keys: KeySource::Jwks(JwksCache::new(client, issuer)),
        }
    }

    /// Verifier for HS256 tokens signed with `secret`.
    pub fn with_shared_secret(secret: &[u8], issuer: &str, audience: &str) -> Self {
        Self {
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            keys: KeySource::Shared(DecodingKey::from_secret(secret)),
        }
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(
        &self,
        token: &str,
        expected_subject: Option<&str>,
    ) -> Result<AuthClaim, AuthError> {
        let header =
            decode_header(token).map_err(|e| AuthError::TokenError(format!("jwt header: {e}")))?;

        let (key, algorithm) = match &self.keys {
            KeySource::Shared(key) => (key.clone(), Algorithm::HS256),
            KeySource::Jwks(cache) => {
                if !matches!(
                    header.alg,
                    Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512
                ) {
                    return Err(AuthError::TokenError(format!(
                        "unsupported algorithm {:?}",
                        header.alg
                    )));
                }
                let kid = header
                    .kid
                    .as_deref()
                    .ok_or_else(|| AuthError::TokenError("jwt header has no kid".into()))?;
                (cache.key(kid).await?, header.alg)
            }
        };

        let claims = decode::<AuthClaim>(token, &key, &self.validation(algorithm))
            .map_err(|e| AuthError::TokenError(format!("jwt decode: {e}")))?
            .claims;

        if let Some(expected) = expected_subject
            && claims.subject() != expected
        {
            debug!(subject = claims.subject(), expected, "token subject mismatch");
            return Err(AuthError::SubjectMismatch);
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    use super::*;

    const SECRET: &[u8] = b"test-secret";
    const ISS: &str = "https://login.example.com/tenant/v2.0";
    const AUD: &str = "api://actlabs";

    fn token(claims: serde_json::Value, secret: &[u8]) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    fn claims(oid: &str, exp_offset_secs: i64) -> serde_json::Value {
        json!({
            "iss": ISS,
            "aud": AUD,
            "sub": "pairwise",
            "oid": oid,
            "exp": (Utc::now() + Duration::seconds(exp_offset_secs)).timestamp(),
        })
    }

    fn verifier() -> JwtVerifier {
        JwtVerifier::with_shared_secret(SECRET, ISS, AUD)
    }

    #[tokio::test]
    async fn accepts_valid_token_for_expected_subject() {
        let claim = verifier()
            .verify(&token(claims("uid1", 600), SECRET), Some("uid1"))
            .await
            .unwrap();
        assert_eq!(claim.subject(), "uid1");
    }

    #[tokio::test]
    async fn accepts_valid_token_without_subject_binding() {
        assert!(
            verifier()
                .verify(&token(claims("uid1", 600), SECRET), None)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn rejects_subject_mismatch() {
        let err = verifier()
            .verify(&token(claims("uid1", 600), SECRET), Some("someone-else"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::SubjectMismatch));
    }

    #[tokio::test]
    async fn rejects_expired_token() {
        let err = verifier()
            .verify(&token(claims("uid1", -3600), SECRET), Some("uid1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenError(_)));
    }

    #[tokio::test]
    async fn rejects_wrong_signature() {
        let err = verifier()
            .verify(&token(claims("uid1", 600), b"other-secret"), Some("uid1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenError(_)));
    }

    #[tokio::test]
    async fn rejects_wrong_audience_and_issuer() {
        let mut c = claims("uid1", 600);
        c["aud"] = json!("api://someone-else");
        assert!(verifier().verify(&token(c, SECRET), None).await.is_err());

        let mut c = claims("uid1", 600);
        c["iss"] = json!("https://evil.example.com");
        assert!(verifier().verify(&token(c, SECRET), None).await.is_err());
    }

    #[tokio::test]
    async fn rejects_garbage() {
        assert!(verifier().verify("not-a-jwt", None).await.is_err());
    }
}
