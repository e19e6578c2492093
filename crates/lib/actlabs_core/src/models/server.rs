//! The per-user server record and the names derived from it.

use serde::{Deserialize, Serialize};

/// Lifecycle status reported for a user's server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ServerStatus {
    #[default]
    Unknown,
    Provisioning,
    Running,
    Failed,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Unknown => "unknown",
            ServerStatus::Provisioning => "provisioning",
            ServerStatus::Running => "running",
            ServerStatus::Failed => "failed",
        }
    }

    /// Map a container-group provisioning state onto a status.
    pub fn from_provisioning_state(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "succeeded" | "running" => ServerStatus::Running,
            "pending" | "creating" | "updating" | "repairing" | "accepted" => {
                ServerStatus::Provisioning
            }
            "failed" | "canceled" | "unhealthy" => ServerStatus::Failed,
            _ => ServerStatus::Unknown,
        }
    }
}

impl From<String> for ServerStatus {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "provisioning" => ServerStatus::Provisioning,
            "running" => ServerStatus::Running,
            "failed" => ServerStatus::Failed,
            _ => ServerStatus::Unknown,
        }
    }
}

impl From<ServerStatus> for String {
    fn from(s: ServerStatus) -> Self {
        s.as_str().to_string()
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user's sandbox server. Built per request from the caller's body and
/// filled in as the lifecycle progresses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerRecord {
    pub endpoint: String,
    pub status: ServerStatus,
    /// Raw provisioning state reported by the provider.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provisioning_state: String,
    pub region: String,
    pub user_principal_id: String,
    pub user_principal_name: String,
    pub user_alias: String,
    pub managed_identity_resource_id: String,
    pub managed_identity_client_id: String,
    pub managed_identity_principal_id: String,
    pub subscription_id: String,
    pub resource_group: String,
    pub server_env_id: String,
    pub log_level: String,
    pub last_activity_time: String,
    pub delete_server_env: bool,
}

/// Fallbacks applied to blank fields before any provider call.
#[derive(Debug, Clone)]
pub struct ServerDefaults {
    pub region: String,
    pub resource_group: String,
    pub log_level: String,
}

impl Default for ServerDefaults {
    fn default() -> Self {
        Self {
            region: "East US".into(),
            resource_group: "repro-project".into(),
            log_level: "0".into(),
        }
    }
}

impl ServerRecord {
    /// True when the identity fields every lifecycle operation needs are set.
    pub fn has_required_identity(&self) -> bool {
        !self.user_principal_name.is_empty()
            && !self.user_principal_id.is_empty()
            && !self.subscription_id.is_empty()
    }

    /// Fill blank alias, log level, region and resource group.
    pub fn apply_defaults(&mut self, defaults: &ServerDefaults) {
        if self.user_alias.is_empty() {
            self.user_alias = user_alias(&self.user_principal_name).to_string();
        }
        if self.log_level.is_empty() {
            self.log_level = defaults.log_level.clone();
        }
        if self.region.is_empty() {
            self.region = defaults.region.clone();
        }
        if self.resource_group.is_empty() {
            self.resource_group = defaults.resource_group.clone();
        }
    }

    /// Names of the provider resources owned by this record's alias.
    pub fn resource_names(&self) -> ResourceNames {
        ResourceNames::for_alias(&self.user_alias)
    }
}

/// Local part of a principal name (`alice@contoso.com` → `alice`).
pub fn user_alias(user_principal_name: &str) -> &str {
    user_principal_name
        .split('@')
        .next()
        .unwrap_or(user_principal_name)
}

/// Deterministic resource names keyed by the user alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    /// Container group.
    pub workload: String,
    /// User-assigned managed identity.
    pub identity: String,
    /// Shared environment torn down on request.
    pub environment: String,
    /// Public DNS label of the container group.
    pub dns_label: String,
}

impl ResourceNames {
    pub fn for_alias(alias: &str) -> Self {
        Self {
            workload: format!("{alias}-aci"),
            identity: format!("{alias}-msi"),
            environment: format!("{alias}-env"),
            dns_label: format!("{alias}-actlabs-aci"),
        }
    }
}

/// Region slug used in public FQDNs (`East US` → `eastus`).
pub fn region_slug(region: &str) -> String {
    region
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase()
}
