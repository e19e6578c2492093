//! Role-assignment lookup for the ownership check.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::cloud::{OwnershipChecker, ProviderError};

use super::{ArmClient, AzureError};

const API_VERSION: &str = "2022-04-01";

/// Built-in Owner role.
pub const OWNER_ROLE_DEFINITION: &str = "8e3af657-a8ff-443c-a75c-2fe8c4bcb635";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RoleAssignmentProperties {
    #[serde(default)]
    pub principal_id: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub role_definition_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RoleAssignment {
    pub properties: RoleAssignmentProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoleAssignmentPage {
    #[serde(default)]
    value: Vec<RoleAssignment>,
    next_link: Option<String>,
}

/// Full role-definition id of `guid` as seen from `subscription_id`.
pub fn role_definition_id(subscription_id: &str, guid: &str) -> String {
    format!("/subscriptions/{subscription_id}/providers/Microsoft.Authorization/roleDefinitions/{guid}")
}

/// Whether any assignment grants `role_definition` to `principal_id`
/// directly on the subscription. All three fields must match exactly.
pub(crate) fn holds_required_role(
    assignments: &[RoleAssignment],
    principal_id: &str,
    subscription_id: &str,
    role_definition: &str,
) -> bool {
    let scope = format!("/subscriptions/{subscription_id}");
    assignments.iter().any(|a| {
        a.properties.principal_id == principal_id
            && a.properties.scope == scope
            && a.properties.role_definition_id == role_definition
    })
}

/// Checks role assignments of a principal through Resource Manager.
pub struct ArmOwnershipChecker {
    arm: ArmClient,
    role_definition_guid: String,
}

impl ArmOwnershipChecker {
    pub fn new(arm: ArmClient, role_definition_guid: impl Into<String>) -> Self {
        Self {
            arm,
            role_definition_guid: role_definition_guid.into(),
        }
    }

    async fn check(&self, principal_id: &str, subscription_id: &str) -> Result<bool, AzureError> {
        let role = role_definition_id(subscription_id, &self.role_definition_guid);
        let filter = format!("assignedTo('{principal_id}')");

        let mut page: RoleAssignmentPage = self
            .arm
            .get_with_query(
                &format!("/subscriptions/{subscription_id}/providers/Microsoft.Authorization/roleAssignments"),
                API_VERSION,
                &[("$filter", filter.as_str())],
            )
            .await?;
        loop {
            debug!(
                principal_id,
                assignments = page.value.len(),
                "role assignment page"
            );
            if holds_required_role(&page.value, principal_id, subscription_id, &role) {
                return Ok(true);
            }
            match page.next_link.take() {
                Some(next) if !next.is_empty() => page = self.arm.get_url(&next).await?,
                _ => return Ok(false),
            }
        }
    }
}

#[async_trait]
impl OwnershipChecker for ArmOwnershipChecker {
    async fn is_owner(
        &self,
        principal_id: &str,
        subscription_id: &str,
    ) -> Result<bool, ProviderError> {
        info!(principal_id, subscription_id, "checking subscription ownership");
        Ok(self.check(principal_id, subscription_id).await?)
    }
}
