//! Signing keys published by the token issuer.
//!
//! Keys are discovered through `{issuer}/.well-known/openid-configuration`,
//! cached by `kid`, and refetched when an unknown `kid` shows up or the cache
//! is older than [`JWKS_TTL`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::JwkSet;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::AuthError;

/// Cached keys are refreshed after 24 hours.
const JWKS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Minimum spacing between refetches triggered by unknown key ids.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct OpenIdConfiguration {
    jwks_uri: String,
}

struct CachedKeys {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

/// Issuer key cache.
pub struct JwksCache {
    client: Client,
    issuer: String,
    cache: RwLock<Option<CachedKeys>>,
}

impl JwksCache {
    pub fn new(client: Client, issuer: impl Into<String>) -> Self {
        Self {
            client,
            issuer: issuer.into(),
            cache: RwLock::new(None),
        }
    }

    /// Decoding key for `kid`, fetching the key set when needed.
    pub async fn key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < JWKS_TTL
                && let Some(key) = cached.keys.get(kid)
            {
                return Ok(key.clone());
            }
        }

        let mut cache = self.cache.write().await;
        // Another request may have refreshed while we waited for the lock.
        if let Some(cached) = cache.as_ref()
            && cached.fetched_at.elapsed() < MIN_REFRESH_INTERVAL
        {
            return cached
                .keys
                .get(kid)
                .cloned()
                .ok_or_else(|| AuthError::KeyError(format!("unknown signing key '{kid}'")));
        }

        let keys = self.fetch().await?;
        let key = keys.get(kid).cloned();
        *cache = Some(CachedKeys {
            keys,
            fetched_at: Instant::now(),
        });
        key.ok_or_else(|| AuthError::KeyError(format!("unknown signing key '{kid}'")))
    }

    async fn fetch(&self) -> Result<HashMap<String, DecodingKey>, AuthError> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            self.issuer.trim_end_matches('/')
        );
        debug!(url = %discovery_url, "fetching openid configuration");
        let discovery: OpenIdConfiguration = self
            .client
            .get(&discovery_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AuthError::KeyError(format!("openid configuration: {e}")))?
            .json()
            .await
            .map_err(|e| AuthError::KeyError(format!("openid configuration: {e}")))?;

        let set: JwkSet = self
            .client
            .get(&discovery.jwks_uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AuthError::KeyError(format!("jwks: {e}")))?
            .json()
            .await
            .map_err(|e| AuthError::KeyError(format!("jwks: {e}")))?;

        let mut keys = HashMap::with_capacity(set.keys.len());
        for jwk in &set.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(e) => debug!(kid, error = %e, "skipping unusable jwk"),
            }
        }
        info!(issuer = %self.issuer, keys = keys.len(), "loaded issuer signing keys");
        Ok(keys)
    }
}
