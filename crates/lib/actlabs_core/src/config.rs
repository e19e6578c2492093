//! Service configuration read from the environment.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::azure::ownership::OWNER_ROLE_DEFINITION;
use crate::cloud::WorkloadSettings;
use crate::models::server::ServerDefaults;
use crate::orchestrator::OrchestratorSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),

    #[error("invalid {name}={value}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Where secret bindings are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecretStoreKind {
    /// Process environment (`protected-lab-secret` → `PROTECTED_LAB_SECRET`).
    #[default]
    Env,
    /// Azure Key Vault named by `KEY_VAULT_NAME`.
    KeyVault,
}

impl FromStr for SecretStoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "env" => Ok(SecretStoreKind::Env),
            "keyvault" | "key-vault" => Ok(SecretStoreKind::KeyVault),
            other => Err(format!("unknown secret store {other:?}")),
        }
    }
}

/// How the service authenticates to Azure.
#[derive(Clone)]
pub enum AzureAuth {
    /// Managed identity, optionally a user-assigned one by client id.
    ManagedIdentity { client_id: Option<String> },
    /// Service principal with a client secret.
    ClientSecret {
        client_id: String,
        client_secret: String,
    },
}

impl std::fmt::Debug for AzureAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AzureAuth::ManagedIdentity { client_id } => f
                .debug_struct("ManagedIdentity")
                .field("client_id", client_id)
                .finish(),
            AzureAuth::ClientSecret { client_id, .. } => f
                .debug_struct("ClientSecret")
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .finish(),
        }
    }
}

/// Everything the control plane needs besides its HTTP surface.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub auth_token_aud: String,
    pub auth_token_iss: String,
    pub tenant_id: String,
    pub azure_auth: AzureAuth,
    pub storage_account: String,
    pub server_table_name: String,
    /// How long a deploy waits for the server to answer its probe.
    pub server_up_wait: Duration,
    /// Role definition guid required on the target subscription.
    pub required_role_definition: String,
    pub secret_store: SecretStoreKind,
    pub key_vault_name: Option<String>,
    pub defaults: ServerDefaults,
    pub workload: WorkloadSettings,
}

/// Typed reads over a variable lookup.
struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::Missing(name))
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            }),
        }
    }
}

impl ServiceConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `lookup`. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars { lookup };
        let defaults = WorkloadSettings::default();
        let server_defaults = ServerDefaults::default();

        let auth_token_aud = vars.required("AUTH_TOKEN_AUD")?;
        let auth_token_iss = vars.required("AUTH_TOKEN_ISS")?;
        let root_dir = vars.required("ACTLABS_ROOT_DIR")?;
        let auth_url = vars.required("ACTLABS_AUTH_URL")?;
        let tenant_id = vars.required("TENANT_ID")?;
        let storage_account = vars.required("ACTLABS_STORAGE_ACCOUNT")?;
        let server_table_name = vars.required("ACTLABS_SERVER_TABLE_NAME")?;

        let use_msi = vars.parsed("USE_MSI", false)?;
        let azure_auth = if use_msi {
            AzureAuth::ManagedIdentity {
                client_id: vars.optional("SERVER_MANAGER_CLIENT_ID"),
            }
        } else {
            AzureAuth::ClientSecret {
                client_id: vars.required("AZURE_CLIENT_ID")?,
                client_secret: vars.required("AZURE_CLIENT_SECRET")?,
            }
        };

        let secret_store = vars.parsed("SECRET_STORE", SecretStoreKind::Env)?;
        let key_vault_name = vars.optional("KEY_VAULT_NAME");
        if secret_store == SecretStoreKind::KeyVault && key_vault_name.is_none() {
            return Err(ConfigError::Missing("KEY_VAULT_NAME"));
        }

        let workload = WorkloadSettings {
            init_image: vars.string("INIT_IMAGE", &defaults.init_image),
            proxy_image: vars.string("PROXY_IMAGE", &defaults.proxy_image),
            app_image: vars.string("ACTLABS_IMAGE", &defaults.app_image),
            http_port: vars.parsed("HTTP_PORT", defaults.http_port)?,
            https_port: vars.parsed("HTTPS_PORT", defaults.https_port)?,
            app_port: vars.parsed("ACTLABS_PORT", defaults.app_port)?,
            app_cpu: vars.parsed("ACTLABS_CPU", defaults.app_cpu)?,
            app_memory_gb: vars.parsed("ACTLABS_MEMORY", defaults.app_memory_gb)?,
            proxy_cpu: vars.parsed("CADDY_CPU", defaults.proxy_cpu)?,
            proxy_memory_gb: vars.parsed("CADDY_MEMORY", defaults.proxy_memory_gb)?,
            readiness_path: vars.string("READINESS_PROBE_PATH", &defaults.readiness_path),
            probe_initial_delay_seconds: vars.parsed(
                "ACTLABS_READINESS_PROBE_INITIAL_DELAY_SECONDS",
                defaults.probe_initial_delay_seconds,
            )?,
            probe_period_seconds: vars.parsed(
                "ACTLABS_READINESS_PROBE_PERIOD_SECONDS",
                defaults.probe_period_seconds,
            )?,
            probe_timeout_seconds: vars.parsed(
                "ACTLABS_READINESS_PROBE_TIMEOUT_SECONDS",
                defaults.probe_timeout_seconds,
            )?,
            probe_success_threshold: vars.parsed(
                "ACTLABS_READINESS_PROBE_SUCCESS_THRESHOLD",
                defaults.probe_success_threshold,
            )?,
            probe_failure_threshold: vars.parsed(
                "ACTLABS_READINESS_PROBE_FAILURE_THRESHOLD",
                defaults.probe_failure_threshold,
            )?,
            use_msi,
            auth_url,
            root_dir,
            tenant_id: tenant_id.clone(),
            auth_token_iss: auth_token_iss.clone(),
            auth_token_aud: auth_token_aud.clone(),
        };

        Ok(Self {
            auth_token_aud,
            auth_token_iss,
            tenant_id,
            azure_auth,
            storage_account,
            server_table_name,
            server_up_wait: Duration::from_secs(
                vars.parsed("ACTLABS_SERVER_UP_WAIT_TIME_SECONDS", 180u64)?,
            ),
            required_role_definition: vars
                .string("REQUIRED_ROLE_DEFINITION_ID", OWNER_ROLE_DEFINITION),
            secret_store,
            key_vault_name,
            defaults: ServerDefaults {
                region: vars.string("DEFAULT_REGION", &server_defaults.region),
                resource_group: vars
                    .string("DEFAULT_RESOURCE_GROUP", &server_defaults.resource_group),
                log_level: server_defaults.log_level,
            },
            workload,
        })
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            defaults: self.defaults.clone(),
            workload: self.workload.clone(),
        }
    }

    /// Log the effective configuration. Secrets never appear.
    pub fn log_summary(&self) {
        info!(
            auth_token_iss = %self.auth_token_iss,
            auth_token_aud = %self.auth_token_aud,
            tenant_id = %self.tenant_id,
            azure_auth = ?self.azure_auth,
            storage_account = %self.storage_account,
            server_table_name = %self.server_table_name,
            server_up_wait_secs = self.server_up_wait.as_secs(),
            required_role_definition = %self.required_role_definition,
            secret_store = ?self.secret_store,
            key_vault_name = ?self.key_vault_name,
            "service configuration"
        );
        info!(
            region = %self.defaults.region,
            resource_group = %self.defaults.resource_group,
            app_image = %self.workload.app_image,
            proxy_image = %self.workload.proxy_image,
            init_image = %self.workload.init_image,
            app_port = self.workload.app_port,
            readiness_path = %self.workload.readiness_path,
            "workload configuration"
        );
    }
}
