//! Lifecycle of a user's sandbox server.
//!
//! Every operation except [`LifecycleOrchestrator::update_activity`] first
//! validates the record, confirms the caller owns the target subscription and
//! fills defaults. Only then are provider resources touched, all named after
//! the user alias so repeated calls converge on the same resources.

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloud::descriptor::{self, WorkloadSettings};
use crate::cloud::{
    ActivityStore, IdentityProvisioner, OwnershipChecker, ProviderError, ResourceRef, SecretStore,
    WorkloadDeployer, resolve_secrets,
};
use crate::models::server::ServerDefaults;
use crate::models::{ServerRecord, ServerStatus};
use crate::readiness::{Readiness, ReadinessPoller};

/// Partition holding every server record.
pub const ACTIVITY_PARTITION: &str = "actlabs";

/// Lifecycle errors. Their messages are returned to callers verbatim.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("missing required information")]
    Validation,

    #[error("insufficient permissions")]
    Unauthorized,

    #[error("{0}")]
    Provider(ProviderError),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<ProviderError> for LifecycleError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Cancelled => LifecycleError::Cancelled,
            other => LifecycleError::Provider(other),
        }
    }
}

/// Steps of a deploy, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPhase {
    Validating,
    Authorizing,
    ProvisioningIdentity,
    Deploying,
    Polling,
    Running,
    Failed,
}

impl fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeployPhase::Validating => "validating",
            DeployPhase::Authorizing => "authorizing",
            DeployPhase::ProvisioningIdentity => "provisioning_identity",
            DeployPhase::Deploying => "deploying",
            DeployPhase::Polling => "polling",
            DeployPhase::Running => "running",
            DeployPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Remote services the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub ownership: Arc<dyn OwnershipChecker>,
    pub identities: Arc<dyn IdentityProvisioner>,
    pub workloads: Arc<dyn WorkloadDeployer>,
    pub activity: Arc<dyn ActivityStore>,
    pub secrets: Arc<dyn SecretStore>,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    pub defaults: ServerDefaults,
    pub workload: WorkloadSettings,
}

pub struct LifecycleOrchestrator {
    collaborators: Collaborators,
    readiness: ReadinessPoller,
    settings: OrchestratorSettings,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl LifecycleOrchestrator {
    pub fn new(
        collaborators: Collaborators,
        readiness: ReadinessPoller,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            collaborators,
            readiness,
            settings,
        }
    }

    /// Validate, check ownership and fill defaults.
    async fn admit(&self, server: &mut ServerRecord) -> Result<(), LifecycleError> {
        if !server.has_required_identity() {
            warn!(
                user_principal_name = %server.user_principal_name,
                "server record is missing required information"
            );
            return Err(LifecycleError::Validation);
        }

        let owner = self
            .collaborators
            .ownership
            .is_owner(&server.user_principal_id, &server.subscription_id)
            .await?;
        if !owner {
            warn!(
                user_principal_name = %server.user_principal_name,
                subscription_id = %server.subscription_id,
                "caller does not own the subscription"
            );
            return Err(LifecycleError::Unauthorized);
        }

        server.apply_defaults(&self.settings.defaults);
        Ok(())
    }

    /// Create or update the user's server and wait for it to come up.
    ///
    /// A server that never answers its readiness probe is returned with
    /// `status = failed`; that is not an error.
    pub async fn deploy(
        &self,
        mut server: ServerRecord,
        cancel: &CancellationToken,
    ) -> Result<ServerRecord, LifecycleError> {
        let phase = |p: DeployPhase, server: &ServerRecord| {
            debug!(alias = %server.user_alias, phase = %p, "deploy phase");
        };

        phase(DeployPhase::Validating, &server);
        phase(DeployPhase::Authorizing, &server);
        self.admit(&mut server).await?;
        info!(alias = %server.user_alias, region = %server.region, "deploying server");

        // Bindings do not depend on the identity; resolve them before creating anything.
        let secrets = resolve_secrets(
            self.collaborators.secrets.as_ref(),
            &descriptor::build(&server, &self.settings.workload),
        )
        .await?;

        phase(DeployPhase::ProvisioningIdentity, &server);
        let names = server.resource_names();
        let identity_ref = ResourceRef::new(&server, &names.identity);
        match self.collaborators.identities.get(&identity_ref).await {
            Ok(existing) => debug!(identity = %existing.resource_id, "managed identity exists"),
            Err(e) => info!(identity = %identity_ref.name, error = %e, "managed identity not found"),
        }
        let identity = self
            .collaborators
            .identities
            .create_or_update(&identity_ref, &server.region)
            .await?;
        server.managed_identity_resource_id = identity.resource_id;
        server.managed_identity_client_id = identity.client_id;
        server.managed_identity_principal_id = identity.principal_id;
        if cancel.is_cancelled() {
            return Err(LifecycleError::Cancelled);
        }

        phase(DeployPhase::Deploying, &server);
        let desired = descriptor::build(&server, &self.settings.workload);
        let state = self
            .collaborators
            .workloads
            .deploy(&desired, &secrets, cancel)
            .await?;
        server.endpoint = state.endpoint;
        server.provisioning_state = state.provisioning_state;
        server.status = ServerStatus::Provisioning;

        phase(DeployPhase::Polling, &server);
        let url = format!(
            "https://{}{}",
            server.endpoint, self.settings.workload.readiness_path
        );
        match self.readiness.wait_until_ready(&url, cancel).await {
            Readiness::Ready { .. } => {
                phase(DeployPhase::Running, &server);
                server.status = ServerStatus::Running;
                server.last_activity_time = now_rfc3339();
                if let Err(e) = self
                    .collaborators
                    .activity
                    .upsert(ACTIVITY_PARTITION, &server)
                    .await
                {
                    warn!(alias = %server.user_alias, error = %e, "failed to persist server record");
                }
            }
            Readiness::TimedOut { attempts } => {
                phase(DeployPhase::Failed, &server);
                warn!(alias = %server.user_alias, attempts, "server did not come up in time");
                server.status = ServerStatus::Failed;
            }
            Readiness::Cancelled => return Err(LifecycleError::Cancelled),
        }

        Ok(server)
    }

    /// Delete the user's server. A server that is already gone counts as
    /// deleted.
    pub async fn destroy(
        &self,
        mut server: ServerRecord,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError> {
        self.admit(&mut server).await?;
        let names = server.resource_names();
        info!(alias = %server.user_alias, "destroying server");

        let workload = ResourceRef::new(&server, &names.workload);
        match self.collaborators.workloads.delete(&workload, cancel).await {
            Ok(()) => {}
            Err(ProviderError::NotFound(_)) => {
                debug!(workload = %workload.name, "server already deleted")
            }
            Err(e) => return Err(e.into()),
        }

        if server.delete_server_env {
            let environment = ResourceRef::new(&server, &names.environment);
            match self
                .collaborators
                .workloads
                .delete_environment(&environment, cancel)
                .await
            {
                Ok(()) => {}
                Err(ProviderError::NotFound(_)) => {
                    debug!(environment = %environment.name, "environment already deleted")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Current provider view of the user's server.
    pub async fn get(&self, mut server: ServerRecord) -> Result<ServerRecord, LifecycleError> {
        self.admit(&mut server).await?;
        let names = server.resource_names();
        let state = self
            .collaborators
            .workloads
            .get(&ResourceRef::new(&server, &names.workload))
            .await?;
        server.status = ServerStatus::from_provisioning_state(&state.provisioning_state);
        server.endpoint = state.endpoint;
        server.provisioning_state = state.provisioning_state;
        Ok(server)
    }

    /// Stamp the stored record of `user_principal_name` with the current time.
    pub async fn update_activity(&self, user_principal_name: &str) -> Result<(), LifecycleError> {
        if user_principal_name.is_empty() {
            return Err(LifecycleError::Validation);
        }
        let mut server = self
            .collaborators
            .activity
            .get(ACTIVITY_PARTITION, user_principal_name)
            .await?;
        server.last_activity_time = now_rfc3339();
        self.collaborators
            .activity
            .upsert(ACTIVITY_PARTITION, &server)
            .await?;
        debug!(user_principal_name, "activity recorded");
        Ok(())
    }
}
