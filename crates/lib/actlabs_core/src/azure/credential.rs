//! Access tokens for Azure APIs.
//!
//! One credential is built at startup and shared by every client as an
//! `Arc<dyn TokenCredential>`. Tokens are cached per scope until five minutes
//! before they expire.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use super::{AzureError, error_from_response};

/// Tokens this close to expiry are refreshed.
const EXPIRY_MARGIN_SECS: i64 = 5 * 60;

/// Instance metadata endpoint for VM / container-instance identities.
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// A bearer token and its expiry.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_MARGIN_SECS) > Utc::now()
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of bearer tokens for a scope such as
/// `https://management.azure.com/.default`.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn token(&self, scope: &str) -> Result<AccessToken, AzureError>;
}

/// `resource` form of a `.default` scope, as the managed identity endpoints
/// expect it.
fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

#[derive(Default)]
struct TokenCache {
    tokens: DashMap<String, AccessToken>,
}

impl TokenCache {
    fn fresh(&self, scope: &str) -> Option<AccessToken> {
        self.tokens
            .get(scope)
            .filter(|t| t.is_fresh())
            .map(|t| t.clone())
    }

    fn store(&self, scope: &str, token: AccessToken) -> AccessToken {
        self.tokens.insert(scope.to_string(), token.clone());
        token
    }
}

// ---------------------------------------------------------------------------
// Managed identity
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ManagedIdentityToken {
    access_token: String,
    /// Unix seconds, sent as a string by both endpoints.
    expires_on: String,
}

/// Token from the host's managed identity endpoint.
///
/// Uses `IDENTITY_ENDPOINT` / `IDENTITY_HEADER` when the hosting platform
/// provides them (App Service, Container Apps), IMDS otherwise.
pub struct ManagedIdentityCredential {
    http: Client,
    client_id: Option<String>,
    identity_endpoint: Option<(String, String)>,
    cache: TokenCache,
}

impl ManagedIdentityCredential {
    /// `client_id` selects a user-assigned identity; `None` means the
    /// system-assigned one.
    pub fn new(http: Client, client_id: Option<String>) -> Self {
        let identity_endpoint = match (
            std::env::var("IDENTITY_ENDPOINT"),
            std::env::var("IDENTITY_HEADER"),
        ) {
            (Ok(endpoint), Ok(header)) if !endpoint.is_empty() => Some((endpoint, header)),
            _ => None,
        };
        Self {
            http,
            client_id: client_id.filter(|c| !c.is_empty()),
            identity_endpoint,
            cache: TokenCache::default(),
        }
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn token(&self, scope: &str) -> Result<AccessToken, AzureError> {
        if let Some(token) = self.cache.fresh(scope) {
            return Ok(token);
        }

        let resource = scope_to_resource(scope);
        let mut query = vec![("resource", resource)];
        if let Some(client_id) = self.client_id.as_deref() {
            query.push(("client_id", client_id));
        }

        let request = match &self.identity_endpoint {
            Some((endpoint, header)) => {
                query.push(("api-version", "2019-08-01"));
                self.http
                    .get(endpoint)
                    .header("X-IDENTITY-HEADER", header)
                    .query(&query)
            }
            None => {
                query.push(("api-version", "2018-02-01"));
                self.http
                    .get(IMDS_ENDPOINT)
                    .header("Metadata", "true")
                    .query(&query)
            }
        };

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let err = error_from_response(resp).await;
            return Err(AzureError::Credential(format!(
                "managed identity token: {err}"
            )));
        }
        let body: ManagedIdentityToken = resp
            .json()
            .await
            .map_err(|e| AzureError::Credential(format!("managed identity token: {e}")))?;
        let expires_on = body
            .expires_on
            .parse::<i64>()
            .map_err(|e| AzureError::Credential(format!("expires_on: {e}")))?;
        let expires_at = DateTime::from_timestamp(expires_on, 0)
            .ok_or_else(|| AzureError::Credential("expires_on out of range".into()))?;

        debug!(scope, %expires_at, "acquired managed identity token");
        Ok(self.cache.store(
            scope,
            AccessToken {
                token: body.access_token,
                expires_at,
            },
        ))
    }
}

// ---------------------------------------------------------------------------
// Client secret (service principal)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ClientCredentialsToken {
    access_token: String,
    expires_in: i64,
}

/// Token from the Entra ID client-credentials flow.
pub struct ClientSecretCredential {
    http: Client,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    cache: TokenCache,
}

impl ClientSecretCredential {
    pub fn new(http: Client, tenant_id: &str, client_id: &str, client_secret: &str) -> Self {
        info!(tenant_id, client_id, "using client secret credential");
        Self {
            http,
            authority: "https://login.microsoftonline.com".into(),
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            cache: TokenCache::default(),
        }
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    async fn token(&self, scope: &str) -> Result<AccessToken, AzureError> {
        if let Some(token) = self.cache.fresh(scope) {
            return Ok(token);
        }

        let url = format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id);
        let resp = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            let err = error_from_response(resp).await;
            return Err(AzureError::Credential(format!("client credentials: {err}")));
        }
        let body: ClientCredentialsToken = resp
            .json()
            .await
            .map_err(|e| AzureError::Credential(format!("client credentials: {e}")))?;

        debug!(scope, expires_in = body.expires_in, "acquired client credentials token");
        Ok(self.cache.store(
            scope,
            AccessToken {
                token: body.access_token,
                expires_at: Utc::now() + Duration::seconds(body.expires_in),
            },
        ))
    }
}
