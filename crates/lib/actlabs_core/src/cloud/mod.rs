//! Cloud collaborators consumed by the lifecycle orchestrator.
//!
//! Each trait is a narrow contract over a remote service. The Azure REST
//! implementations live in [`crate::azure`]; tests substitute fakes.

pub mod descriptor;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::ServerRecord;

pub use descriptor::{WorkloadDescriptor, WorkloadSettings};

/// Errors reported by cloud collaborators.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Request(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// A named resource inside a subscription and resource group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub subscription_id: String,
    pub resource_group: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(server: &ServerRecord, name: impl Into<String>) -> Self {
        Self {
            subscription_id: server.subscription_id.clone(),
            resource_group: server.resource_group.clone(),
            name: name.into(),
        }
    }
}

/// A user-assigned managed identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedIdentity {
    pub resource_id: String,
    pub client_id: String,
    pub principal_id: String,
}

/// What the provider reports about a deployed workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadState {
    /// Public FQDN.
    pub endpoint: String,
    /// Raw provisioning state.
    pub provisioning_state: String,
}

/// Secret values resolved for one deployment, keyed by binding name.
#[derive(Clone, Default)]
pub struct SecretValues(HashMap<String, String>);

impl SecretValues {
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

impl std::fmt::Debug for SecretValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// Confirms the caller holds the required role over a subscription.
#[async_trait]
pub trait OwnershipChecker: Send + Sync {
    async fn is_owner(
        &self,
        principal_id: &str,
        subscription_id: &str,
    ) -> Result<bool, ProviderError>;
}

/// Get-or-create for per-user managed identities.
#[async_trait]
pub trait IdentityProvisioner: Send + Sync {
    async fn get(&self, identity: &ResourceRef) -> Result<ManagedIdentity, ProviderError>;

    async fn create_or_update(
        &self,
        identity: &ResourceRef,
        location: &str,
    ) -> Result<ManagedIdentity, ProviderError>;
}

/// Declarative deployment of per-user workloads.
#[async_trait]
pub trait WorkloadDeployer: Send + Sync {
    /// Create or update the workload and wait for the provider to finish.
    async fn deploy(
        &self,
        descriptor: &WorkloadDescriptor,
        secrets: &SecretValues,
        cancel: &CancellationToken,
    ) -> Result<WorkloadState, ProviderError>;

    async fn get(&self, workload: &ResourceRef) -> Result<WorkloadState, ProviderError>;

    /// Delete the workload and wait. A missing workload is `NotFound`.
    async fn delete(
        &self,
        workload: &ResourceRef,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    /// Delete the shared environment. A missing environment is `NotFound`.
    async fn delete_environment(
        &self,
        environment: &ResourceRef,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;
}

/// Durable store of the last known server record per user.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn get(&self, partition: &str, row_key: &str) -> Result<ServerRecord, ProviderError>;

    async fn upsert(&self, partition: &str, server: &ServerRecord) -> Result<(), ProviderError>;
}

/// Source of secret values referenced by workload descriptors.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn secret(&self, name: &str) -> Result<String, ProviderError>;
}

/// Resolve every secret binding of `descriptor`.
pub async fn resolve_secrets(
    store: &dyn SecretStore,
    descriptor: &WorkloadDescriptor,
) -> Result<SecretValues, ProviderError> {
    let mut values = SecretValues::default();
    for binding in descriptor.secret_bindings() {
        if values.get(&binding.name).is_none() {
            let value = store.secret(&binding.name).await?;
            values.insert(binding.name.clone(), value);
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_values_debug_hides_values() {
        let mut values = SecretValues::default();
        values.insert("protected-lab-secret", "hunter2");
        let printed = format!("{values:?}");
        assert!(printed.contains("protected-lab-secret"));
        assert!(!printed.contains("hunter2"));
    }
}
