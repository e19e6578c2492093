//! Server records in Azure Table Storage.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::cloud::{ActivityStore, ProviderError};
use crate::models::ServerRecord;

use super::{AzureError, TokenCredential, error_from_response};

const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";
const STORAGE_VERSION: &str = "2019-02-02";
const ACCEPT_NO_METADATA: &str = "application/json;odata=nometadata";

/// Stored entity: the record plus its table keys.
#[derive(Debug, Serialize, Deserialize)]
struct ServerEntity {
    #[serde(rename = "PartitionKey")]
    partition_key: String,
    #[serde(rename = "RowKey")]
    row_key: String,
    #[serde(flatten)]
    server: ServerRecord,
}

/// Quote a key for an entity address; single quotes are doubled.
fn quote_key(key: &str) -> String {
    key.replace('\'', "''")
}

/// Table of server records, one row per principal name.
pub struct TableActivityStore {
    http: Client,
    credential: Arc<dyn TokenCredential>,
    endpoint: Url,
    table: String,
}

impl TableActivityStore {
    pub fn new(
        http: Client,
        credential: Arc<dyn TokenCredential>,
        storage_account: &str,
        table: &str,
    ) -> Result<Self, AzureError> {
        let endpoint = format!("https://{storage_account}.table.core.windows.net");
        Self::with_endpoint(http, credential, &endpoint, table)
    }

    /// Store against an explicit table service endpoint.
    pub fn with_endpoint(
        http: Client,
        credential: Arc<dyn TokenCredential>,
        endpoint: &str,
        table: &str,
    ) -> Result<Self, AzureError> {
        let endpoint = Url::parse(endpoint).map_err(|e| AzureError::InvalidUrl(e.to_string()))?;
        if endpoint.cannot_be_a_base() {
            return Err(AzureError::InvalidUrl(endpoint.to_string()));
        }
        Ok(Self {
            http,
            credential,
            endpoint,
            table: table.to_string(),
        })
    }

    fn entity_url(&self, partition: &str, row_key: &str) -> Result<Url, AzureError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| AzureError::InvalidUrl(self.endpoint.to_string()))?
            .pop_if_empty()
            .push(&format!(
                "{}(PartitionKey='{}',RowKey='{}')",
                self.table,
                quote_key(partition),
                quote_key(row_key)
            ));
        Ok(url)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: Url,
    ) -> Result<reqwest::RequestBuilder, AzureError> {
        let token = self.credential.token(STORAGE_SCOPE).await?;
        Ok(self
            .http
            .request(method, url)
            .bearer_auth(token.token)
            .header("x-ms-version", STORAGE_VERSION)
            .header("x-ms-date", Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string())
            .header("DataServiceVersion", "3.0;NetFx")
            .header(reqwest::header::ACCEPT, ACCEPT_NO_METADATA))
    }

    async fn fetch(&self, partition: &str, row_key: &str) -> Result<ServerRecord, AzureError> {
        let url = self.entity_url(partition, row_key)?;
        let resp = self.request(reqwest::Method::GET, url).await?.send().await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let entity: ServerEntity = resp
            .json()
            .await
            .map_err(|e| AzureError::Decode(e.to_string()))?;
        Ok(entity.server)
    }

    async fn replace(&self, partition: &str, server: &ServerRecord) -> Result<(), AzureError> {
        let entity = ServerEntity {
            partition_key: partition.to_string(),
            row_key: server.user_principal_name.clone(),
            server: server.clone(),
        };
        let url = self.entity_url(partition, &entity.row_key)?;
        let resp = self
            .request(reqwest::Method::PUT, url)
            .await?
            .json(&entity)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for TableActivityStore {
    async fn get(&self, partition: &str, row_key: &str) -> Result<ServerRecord, ProviderError> {
        debug!(partition, row_key, "reading server record");
        Ok(self.fetch(partition, row_key).await?)
    }

    async fn upsert(&self, partition: &str, server: &ServerRecord) -> Result<(), ProviderError> {
        debug!(partition, row_key = %server.user_principal_name, "upserting server record");
        Ok(self.replace(partition, server).await?)
    }
}
