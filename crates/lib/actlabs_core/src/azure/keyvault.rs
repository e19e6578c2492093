//! Secrets from Azure Key Vault.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::cloud::{ProviderError, SecretStore};

use super::{AzureError, TokenCredential, error_from_response};

const VAULT_SCOPE: &str = "https://vault.azure.net/.default";
const API_VERSION: &str = "7.4";

#[derive(Deserialize)]
struct SecretBundle {
    value: String,
}

/// Reads the current version of named secrets from one vault.
pub struct KeyVaultSecretStore {
    http: Client,
    credential: Arc<dyn TokenCredential>,
    vault_url: String,
}

impl KeyVaultSecretStore {
    pub fn new(http: Client, credential: Arc<dyn TokenCredential>, vault_name: &str) -> Self {
        Self::with_vault_url(
            http,
            credential,
            &format!("https://{vault_name}.vault.azure.net"),
        )
    }

    pub fn with_vault_url(http: Client, credential: Arc<dyn TokenCredential>, vault_url: &str) -> Self {
        Self {
            http,
            credential,
            vault_url: vault_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch(&self, name: &str) -> Result<String, AzureError> {
        let token = self.credential.token(VAULT_SCOPE).await?;
        let resp = self
            .http
            .get(format!("{}/secrets/{name}", self.vault_url))
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(token.token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let bundle: SecretBundle = resp
            .json()
            .await
            .map_err(|e| AzureError::Decode(e.to_string()))?;
        Ok(bundle.value)
    }
}

#[async_trait]
impl SecretStore for KeyVaultSecretStore {
    async fn secret(&self, name: &str) -> Result<String, ProviderError> {
        debug!(name, vault = %self.vault_url, "reading secret");
        Ok(self.fetch(name).await?)
    }
}
