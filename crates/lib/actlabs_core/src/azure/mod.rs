//! Azure REST implementations of the cloud collaborators.
//!
//! Every client takes the same injected [`TokenCredential`] at construction.
//! Resource Manager calls go through [`ArmClient`], which also follows
//! long-running operations until the provider reports a terminal state.

pub mod container_group;
pub mod credential;
pub mod identity;
pub mod keyvault;
pub mod ownership;
pub mod table;


use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cloud::ProviderError;

pub use container_group::ArmWorkloadDeployer;
pub use credential::{
    AccessToken, ClientSecretCredential, ManagedIdentityCredential, TokenCredential,
};
pub use identity::ArmIdentityProvisioner;
pub use keyvault::KeyVaultSecretStore;
pub use ownership::ArmOwnershipChecker;
pub use table::TableActivityStore;

/// Public Resource Manager endpoint.
pub const ARM_ENDPOINT: &str = "https://management.azure.com";

/// Token scope for Resource Manager.
pub const ARM_SCOPE: &str = "https://management.azure.com/.default";

/// Default wait between long-running-operation polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on a provider-requested `Retry-After`.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Azure client errors.
#[derive(Debug, Error)]
pub enum AzureError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Azure returned {status}: {code}: {message}")]
    Status {
        status: StatusCode,
        code: String,
        message: String,
    },

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<AzureError> for ProviderError {
    fn from(e: AzureError) -> Self {
        match e {
            AzureError::NotFound(m) => ProviderError::NotFound(m),
            AzureError::Cancelled => ProviderError::Cancelled,
            other => ProviderError::Request(other.to_string()),
        }
    }
}

/// Turn a non-success response into an [`AzureError`] carrying the
/// provider's `error.code` / `error.message`.
pub(crate) async fn error_from_response(resp: Response) -> AzureError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let (code, message) = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            let err = v.get("error")?;
            let code = err.get("code").and_then(Value::as_str).unwrap_or_default();
            let message = match err.get("message") {
                Some(Value::String(s)) => s.clone(),
                // Table storage nests the message one level deeper.
                Some(m) => m
                    .get("value")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                None => String::new(),
            };
            Some((code.to_string(), message))
        })
        .unwrap_or_else(|| (status.as_str().to_string(), body));

    if status == StatusCode::NOT_FOUND {
        AzureError::NotFound(if message.is_empty() { code } else { message })
    } else {
        AzureError::Status {
            status,
            code,
            message,
        }
    }
}

/// Resource Manager client bound to one credential.
#[derive(Clone)]
pub struct ArmClient {
    http: Client,
    credential: Arc<dyn TokenCredential>,
    endpoint: String,
    poll_interval: Duration,
}

impl ArmClient {
    pub fn new(http: Client, credential: Arc<dyn TokenCredential>) -> Self {
        Self {
            http,
            credential,
            endpoint: ARM_ENDPOINT.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Point the client at another Resource Manager endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Change the fallback spacing of long-running-operation polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub(crate) fn url(&self, path: &str, api_version: &str) -> String {
        format!("{}{path}?api-version={api_version}", self.endpoint)
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, AzureError> {
        let token = self.credential.token(ARM_SCOPE).await?;
        Ok(builder.bearer_auth(token.token))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, AzureError> {
        let resp = self.authorized(builder).await?.send().await?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(error_from_response(resp).await)
        }
    }

    /// GET a resource.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        api_version: &str,
    ) -> Result<T, AzureError> {
        self.get_url(&self.url(path, api_version)).await
    }

    /// GET an absolute URL, such as a `nextLink`.
    pub async fn get_url<T: DeserializeOwned>(&self, url: &str) -> Result<T, AzureError> {
        let resp = self.send(self.http.get(url)).await?;
        resp.json()
            .await
            .map_err(|e| AzureError::Decode(e.to_string()))
    }

    /// GET with extra query parameters.
    pub async fn get_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        api_version: &str,
        query: &[(&str, &str)],
    ) -> Result<T, AzureError> {
        let builder = self
            .http
            .get(format!("{}{path}", self.endpoint))
            .query(&[("api-version", api_version)])
            .query(query);
        let resp = self.send(builder).await?;
        resp.json()
            .await
            .map_err(|e| AzureError::Decode(e.to_string()))
    }

    /// PUT a resource without waiting for provisioning to finish.
    pub async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        api_version: &str,
        body: &B,
    ) -> Result<T, AzureError> {
        let resp = self
            .send(self.http.put(self.url(path, api_version)).json(body))
            .await?;
        resp.json()
            .await
            .map_err(|e| AzureError::Decode(e.to_string()))
    }

    /// PUT a resource, follow the long-running operation, and return the
    /// resource as it stands afterwards.
    pub async fn put_and_wait<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        api_version: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<T, AzureError> {
        let resp = self
            .send(self.http.put(self.url(path, api_version)).json(body))
            .await?;
        if operation_url(resp.headers()).is_some() {
            self.wait_for_operation(resp.headers().clone(), cancel)
                .await?;
            return self.get(path, api_version).await;
        }
        resp.json()
            .await
            .map_err(|e| AzureError::Decode(e.to_string()))
    }

    /// DELETE a resource and follow the long-running operation.
    pub async fn delete_and_wait(
        &self,
        path: &str,
        api_version: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AzureError> {
        let resp = self
            .send(self.http.delete(self.url(path, api_version)))
            .await?;
        match resp.status() {
            StatusCode::NO_CONTENT => Err(AzureError::NotFound(format!("{path} does not exist"))),
            StatusCode::ACCEPTED => self.wait_for_operation(resp.headers().clone(), cancel).await,
            _ => Ok(()),
        }
    }

    /// Poll the operation named by `headers` until it finishes.
    async fn wait_for_operation(
        &self,
        headers: HeaderMap,
        cancel: &CancellationToken,
    ) -> Result<(), AzureError> {
        let Some((kind, url)) = operation_url(&headers) else {
            return Ok(());
        };
        let mut delay = retry_after(&headers).unwrap_or(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AzureError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            let resp = self.send(self.http.get(&url)).await?;
            let status = resp.status();
            delay = retry_after(resp.headers()).unwrap_or(self.poll_interval);

            match kind {
                OperationKind::AsyncOperation => {
                    let body: Value = resp
                        .json()
                        .await
                        .map_err(|e| AzureError::Decode(e.to_string()))?;
                    let state = body.get("status").and_then(Value::as_str).unwrap_or("");
                    debug!(operation = %url, state, "long-running operation status");
                    match state {
                        "Succeeded" => return Ok(()),
                        "Failed" | "Canceled" => {
                            let message = body
                                .pointer("/error/message")
                                .and_then(Value::as_str)
                                .unwrap_or(state)
                                .to_string();
                            warn!(operation = %url, %message, "long-running operation failed");
                            return Err(AzureError::OperationFailed(message));
                        }
                        _ => {}
                    }
                }
                OperationKind::Location => {
                    debug!(operation = %url, %status, "long-running operation status");
                    if status != StatusCode::ACCEPTED {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationKind {
    AsyncOperation,
    Location,
}

/// Where to poll a long-running operation, preferring `Azure-AsyncOperation`.
fn operation_url(headers: &HeaderMap) -> Option<(OperationKind, String)> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    header("azure-asyncoperation")
        .map(|u| (OperationKind::AsyncOperation, u))
        .or_else(|| header(LOCATION.as_str()).map(|u| (OperationKind::Location, u)))
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_POLL_INTERVAL))
}
