//! Container groups (Azure Container Instances).
//!
//! The provider-neutral [`WorkloadDescriptor`] is rendered into a container
//! group body here. Secret bindings become `secureValue` entries so they never
//! appear in the group's readable configuration.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cloud::descriptor::{ContainerSpec, EnvValue, RestartPolicy};
use crate::cloud::{
    ProviderError, ResourceRef, SecretValues, WorkloadDeployer, WorkloadDescriptor, WorkloadState,
};

use super::ArmClient;

const CONTAINER_GROUP_API_VERSION: &str = "2023-05-01";
const MANAGED_ENVIRONMENT_API_VERSION: &str = "2023-05-01";

fn container_group_path(r: &ResourceRef) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerInstance/containerGroups/{}",
        r.subscription_id, r.resource_group, r.name
    )
}

fn managed_environment_path(r: &ResourceRef) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.App/managedEnvironments/{}",
        r.subscription_id, r.resource_group, r.name
    )
}

fn restart_policy(policy: RestartPolicy) -> &'static str {
    match policy {
        RestartPolicy::Always => "Always",
        RestartPolicy::OnFailure => "OnFailure",
        RestartPolicy::Never => "Never",
    }
}

fn render_container(spec: &ContainerSpec, secrets: &SecretValues) -> Result<Value, ProviderError> {
    let mut env = Vec::with_capacity(spec.env.len());
    for var in &spec.env {
        env.push(match &var.value {
            EnvValue::Plain(v) => json!({ "name": var.name, "value": v }),
            EnvValue::Secret(binding) => {
                let value = secrets.get(&binding.name).ok_or_else(|| {
                    ProviderError::Request(format!("secret {} was not resolved", binding.name))
                })?;
                json!({ "name": var.name, "secureValue": value })
            }
        });
    }

    let mut properties = json!({
        "image": spec.image,
        "environmentVariables": env,
        "volumeMounts": spec
            .volume_mounts
            .iter()
            .map(|m| json!({ "name": m.volume, "mountPath": m.mount_path }))
            .collect::<Vec<_>>(),
    });
    if !spec.command.is_empty() {
        properties["command"] = json!(spec.command);
    }
    if !spec.ports.is_empty() {
        properties["ports"] = spec
            .ports
            .iter()
            .map(|p| json!({ "port": p, "protocol": "TCP" }))
            .collect();
    }
    if let Some(resources) = spec.resources {
        properties["resources"] = json!({
            "requests": { "cpu": resources.cpu, "memoryInGB": resources.memory_gb }
        });
    }
    if let Some(probe) = &spec.readiness_probe {
        properties["readinessProbe"] = json!({
            "httpGet": { "path": probe.path, "port": probe.port, "scheme": "http" },
            "initialDelaySeconds": probe.initial_delay_seconds,
            "periodSeconds": probe.period_seconds,
            "timeoutSeconds": probe.timeout_seconds,
            "successThreshold": probe.success_threshold,
            "failureThreshold": probe.failure_threshold,
        });
    }

    Ok(json!({ "name": spec.name, "properties": properties }))
}

/// Container group body for `descriptor` with `secrets` filled in.
pub(crate) fn render(
    descriptor: &WorkloadDescriptor,
    secrets: &SecretValues,
) -> Result<Value, ProviderError> {
    let init_containers = descriptor
        .init_containers
        .iter()
        .map(|c| render_container(c, secrets))
        .collect::<Result<Vec<_>, _>>()?;
    let containers = descriptor
        .containers
        .iter()
        .map(|c| render_container(c, secrets))
        .collect::<Result<Vec<_>, _>>()?;

    let mut user_assigned = serde_json::Map::new();
    user_assigned.insert(descriptor.identity_resource_id.clone(), json!({}));

    Ok(json!({
        "location": descriptor.location,
        "identity": {
            "type": "UserAssigned",
            "userAssignedIdentities": user_assigned,
        },
        "properties": {
            "osType": "Linux",
            "restartPolicy": restart_policy(descriptor.restart_policy),
            "initContainers": init_containers,
            "containers": containers,
            "ipAddress": {
                "type": "Public",
                "dnsNameLabel": descriptor.network.dns_label,
                "ports": descriptor
                    .network
                    .ports
                    .iter()
                    .map(|p| json!({ "port": p, "protocol": "TCP" }))
                    .collect::<Vec<_>>(),
            },
            "volumes": descriptor
                .volumes
                .iter()
                .map(|v| json!({ "name": v, "emptyDir": {} }))
                .collect::<Vec<_>>(),
        },
    }))
}

#[derive(Debug, Default, Deserialize)]
struct IpAddress {
    #[serde(default)]
    fqdn: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerGroupProperties {
    #[serde(default)]
    provisioning_state: String,
    #[serde(default)]
    ip_address: Option<IpAddress>,
}

#[derive(Debug, Deserialize)]
struct ContainerGroup {
    #[serde(default)]
    properties: ContainerGroupProperties,
}

impl From<ContainerGroup> for WorkloadState {
    fn from(group: ContainerGroup) -> Self {
        Self {
            endpoint: group
                .properties
                .ip_address
                .map(|ip| ip.fqdn)
                .unwrap_or_default(),
            provisioning_state: group.properties.provisioning_state,
        }
    }
}

/// Container groups through Resource Manager.
pub struct ArmWorkloadDeployer {
    arm: ArmClient,
}

impl ArmWorkloadDeployer {
    pub fn new(arm: ArmClient) -> Self {
        Self { arm }
    }
}

#[async_trait]
impl WorkloadDeployer for ArmWorkloadDeployer {
    async fn deploy(
        &self,
        descriptor: &WorkloadDescriptor,
        secrets: &SecretValues,
        cancel: &CancellationToken,
    ) -> Result<WorkloadState, ProviderError> {
        let body = render(descriptor, secrets)?;
        info!(
            workload = %descriptor.target.name,
            location = %descriptor.location,
            "deploying container group"
        );
        let group: ContainerGroup = self
            .arm
            .put_and_wait(
                &container_group_path(&descriptor.target),
                CONTAINER_GROUP_API_VERSION,
                &body,
                cancel,
            )
            .await?;
        Ok(group.into())
    }

    async fn get(&self, workload: &ResourceRef) -> Result<WorkloadState, ProviderError> {
        let group: ContainerGroup = self
            .arm
            .get(&container_group_path(workload), CONTAINER_GROUP_API_VERSION)
            .await?;
        Ok(group.into())
    }

    async fn delete(
        &self,
        workload: &ResourceRef,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        info!(workload = %workload.name, "deleting container group");
        self.arm
            .delete_and_wait(
                &container_group_path(workload),
                CONTAINER_GROUP_API_VERSION,
                cancel,
            )
            .await?;
        Ok(())
    }

    async fn delete_environment(
        &self,
        environment: &ResourceRef,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        info!(environment = %environment.name, "deleting managed environment");
        self.arm
            .delete_and_wait(
                &managed_environment_path(environment),
                MANAGED_ENVIRONMENT_API_VERSION,
                cancel,
            )
            .await?;
        Ok(())
    }
}
