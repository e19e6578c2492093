//! User-assigned managed identities.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::cloud::{IdentityProvisioner, ManagedIdentity, ProviderError, ResourceRef};

use super::ArmClient;

const API_VERSION: &str = "2023-01-31";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityProperties {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    principal_id: String,
}

#[derive(Debug, Deserialize)]
struct IdentityResource {
    id: String,
    properties: IdentityProperties,
}

impl From<IdentityResource> for ManagedIdentity {
    fn from(r: IdentityResource) -> Self {
        Self {
            resource_id: r.id,
            client_id: r.properties.client_id,
            principal_id: r.properties.principal_id,
        }
    }
}

fn identity_path(identity: &ResourceRef) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ManagedIdentity/userAssignedIdentities/{}",
        identity.subscription_id, identity.resource_group, identity.name
    )
}

/// Managed identities through Resource Manager.
pub struct ArmIdentityProvisioner {
    arm: ArmClient,
}

impl ArmIdentityProvisioner {
    pub fn new(arm: ArmClient) -> Self {
        Self { arm }
    }
}

#[async_trait]
impl IdentityProvisioner for ArmIdentityProvisioner {
    async fn get(&self, identity: &ResourceRef) -> Result<ManagedIdentity, ProviderError> {
        let resource: IdentityResource = self.arm.get(&identity_path(identity), API_VERSION).await?;
        Ok(resource.into())
    }

    async fn create_or_update(
        &self,
        identity: &ResourceRef,
        location: &str,
    ) -> Result<ManagedIdentity, ProviderError> {
        info!(identity = %identity.name, location, "creating managed identity");
        let resource: IdentityResource = self
            .arm
            .put(
                &identity_path(identity),
                API_VERSION,
                &json!({ "location": location }),
            )
            .await?;
        Ok(resource.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_resource_group_scoped() {
        let r = ResourceRef {
            subscription_id: "sub1".into(),
            resource_group: "repro-project".into(),
            name: "a-msi".into(),
        };
        assert_eq!(
            identity_path(&r),
            "/subscriptions/sub1/resourceGroups/repro-project/providers/Microsoft.ManagedIdentity/userAssignedIdentities/a-msi"
        );
    }

    #[test]
    fn resource_maps_to_identity() {
        let resource: IdentityResource = serde_json::from_value(json!({
            "id": "/subscriptions/sub1/x/a-msi",
            "name": "a-msi",
            "properties": { "clientId": "c1", "principalId": "p1", "tenantId": "t" }
        }))
        .unwrap();
        let identity = ManagedIdentity::from(resource);
        assert_eq!(identity.resource_id, "/subscriptions/sub1/x/a-msi");
        assert_eq!(identity.client_id, "c1");
        assert_eq!(identity.principal_id, "p1");
    }
}
