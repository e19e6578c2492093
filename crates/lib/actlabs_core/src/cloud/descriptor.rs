//! Desired state of a user's workload.
//!
//! The descriptor is provider-neutral: an init step that writes the reverse
//! proxy configuration, the proxy itself, and the application container, all
//! behind a public IP whose DNS label is derived from the user alias. Secret
//! environment values are bindings resolved at deploy time, never literals.

use crate::models::ServerRecord;
use crate::models::server::region_slug;

use super::ResourceRef;

/// Name of the shared scratch volume.
pub const SCRATCH_VOLUME: &str = "emptydir";

/// Secret binding holding the lab protection secret.
pub const PROTECTED_LAB_SECRET: &str = "protected-lab-secret";

/// Reference to a secret held by a [`super::SecretStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,
}

/// Environment variable value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    Plain(String),
    Secret(SecretRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: EnvValue,
}

impl EnvVar {
    fn plain(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: EnvValue::Plain(value.into()),
        }
    }

    fn secret(name: &str, binding: &str) -> Self {
        Self {
            name: name.to_string(),
            value: EnvValue::Secret(SecretRef {
                name: binding.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceRequests {
    pub cpu: f64,
    pub memory_gb: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub volume: String,
    pub mount_path: String,
}

/// HTTP readiness probe run by the provider against a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProbe {
    pub path: String,
    pub port: u16,
    pub initial_delay_seconds: u32,
    pub period_seconds: u32,
    pub timeout_seconds: u32,
    pub success_threshold: u32,
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub ports: Vec<u16>,
    pub resources: Option<ResourceRequests>,
    pub env: Vec<EnvVar>,
    pub volume_mounts: Vec<VolumeMount>,
    pub readiness_probe: Option<HttpProbe>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    OnFailure,
    Never,
}

/// Public networking of the workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicNetwork {
    pub dns_label: String,
    pub ports: Vec<u16>,
}

/// Full desired state submitted to the [`super::WorkloadDeployer`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadDescriptor {
    pub target: ResourceRef,
    pub location: String,
    /// Resource id of the managed identity bound to the workload.
    pub identity_resource_id: String,
    pub init_containers: Vec<ContainerSpec>,
    pub containers: Vec<ContainerSpec>,
    pub restart_policy: RestartPolicy,
    pub network: PublicNetwork,
    /// Scratch volumes shared between containers.
    pub volumes: Vec<String>,
}

impl WorkloadDescriptor {
    /// Every secret binding referenced by any container.
    pub fn secret_bindings(&self) -> impl Iterator<Item = &SecretRef> {
        self.init_containers
            .iter()
            .chain(self.containers.iter())
            .flat_map(|c| c.env.iter())
            .filter_map(|e| match &e.value {
                EnvValue::Secret(s) => Some(s),
                EnvValue::Plain(_) => None,
            })
    }

    /// Container by name.
    pub fn container(&self, name: &str) -> Option<&ContainerSpec> {
        self.containers.iter().find(|c| c.name == name)
    }
}

/// Deployment-wide settings for workloads.
#[derive(Debug, Clone)]
pub struct WorkloadSettings {
    pub init_image: String,
    pub proxy_image: String,
    pub app_image: String,
    pub http_port: u16,
    pub https_port: u16,
    pub app_port: u16,
    pub app_cpu: f64,
    pub app_memory_gb: f64,
    pub proxy_cpu: f64,
    pub proxy_memory_gb: f64,
    pub readiness_path: String,
    pub probe_initial_delay_seconds: u32,
    pub probe_period_seconds: u32,
    pub probe_timeout_seconds: u32,
    pub probe_success_threshold: u32,
    pub probe_failure_threshold: u32,
    pub use_msi: bool,
    pub auth_url: String,
    pub root_dir: String,
    pub tenant_id: String,
    pub auth_token_iss: String,
    pub auth_token_aud: String,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            init_image: "busybox".into(),
            proxy_image: "ashishvermapu/caddy:latest".into(),
            app_image: "ashishvermapu/repro:alpha".into(),
            http_port: 80,
            https_port: 443,
            app_port: 8881,
            app_cpu: 0.5,
            app_memory_gb: 0.5,
            proxy_cpu: 0.5,
            proxy_memory_gb: 0.5,
            readiness_path: "/status".into(),
            probe_initial_delay_seconds: 10,
            probe_period_seconds: 10,
            probe_timeout_seconds: 5,
            probe_success_threshold: 1,
            probe_failure_threshold: 20,
            use_msi: false,
            auth_url: String::new(),
            root_dir: String::new(),
            tenant_id: String::new(),
            auth_token_iss: String::new(),
            auth_token_aud: String::new(),
        }
    }
}

/// Public FQDN the provider assigns to `dns_label` in `region`.
pub fn public_fqdn(dns_label: &str, region: &str) -> String {
    format!("{dns_label}.{}.azurecontainer.io", region_slug(region))
}

/// Build the desired state for `server`. The record must already carry its
/// defaults and the provisioned identity.
pub fn build(server: &ServerRecord, settings: &WorkloadSettings) -> WorkloadDescriptor {
    let names = server.resource_names();
    let fqdn = public_fqdn(&names.dns_label, &server.region);

    let scratch = |mount_path: &str| VolumeMount {
        volume: SCRATCH_VOLUME.to_string(),
        mount_path: mount_path.to_string(),
    };

    let caddyfile = format!(
        "echo -e \"{fqdn} {{\\n\\treverse_proxy http://localhost:{}\\n}}\" > /etc/caddy/Caddyfile",
        settings.app_port
    );

    let init = ContainerSpec {
        name: "init".into(),
        image: settings.init_image.clone(),
        command: vec!["/bin/sh".into(), "-c".into(), caddyfile],
        ports: Vec::new(),
        resources: None,
        env: vec![EnvVar::plain("USER_ALIAS", &server.user_alias)],
        volume_mounts: vec![scratch("/etc/caddy")],
        readiness_probe: None,
    };

    let proxy = ContainerSpec {
        name: "caddy".into(),
        image: settings.proxy_image.clone(),
        command: Vec::new(),
        ports: vec![settings.http_port, settings.https_port],
        resources: Some(ResourceRequests {
            cpu: settings.proxy_cpu,
            memory_gb: settings.proxy_memory_gb,
        }),
        env: Vec::new(),
        volume_mounts: vec![scratch("/etc/caddy")],
        readiness_probe: None,
    };

    let use_msi = settings.use_msi.to_string();
    let app = ContainerSpec {
        name: "actlabs".into(),
        image: settings.app_image.clone(),
        command: Vec::new(),
        ports: vec![settings.app_port],
        resources: Some(ResourceRequests {
            cpu: settings.app_cpu,
            memory_gb: settings.app_memory_gb,
        }),
        env: vec![
            EnvVar::plain("ARM_USE_MSI", &use_msi),
            EnvVar::plain("USE_MSI", &use_msi),
            EnvVar::secret("PROTECTED_LAB_SECRET", PROTECTED_LAB_SECRET),
            EnvVar::plain("ACTLABS_AUTH_URL", &settings.auth_url),
            EnvVar::plain("PORT", settings.app_port.to_string()),
            EnvVar::plain("ROOT_DIR", &settings.root_dir),
            EnvVar::plain("AZURE_CLIENT_ID", &server.managed_identity_client_id),
            EnvVar::plain("ARM_SUBSCRIPTION_ID", &server.subscription_id),
            EnvVar::plain("AZURE_SUBSCRIPTION_ID", &server.subscription_id),
            EnvVar::plain("ARM_TENANT_ID", &settings.tenant_id),
            EnvVar::plain("ARM_USER_PRINCIPAL_NAME", &server.user_principal_name),
            EnvVar::plain("LOG_LEVEL", &server.log_level),
            EnvVar::plain("AUTH_TOKEN_ISS", &settings.auth_token_iss),
            EnvVar::plain("AUTH_TOKEN_AUD", &settings.auth_token_aud),
        ],
        volume_mounts: vec![scratch("/mnt/emptydir")],
        readiness_probe: Some(HttpProbe {
            path: settings.readiness_path.clone(),
            port: settings.app_port,
            initial_delay_seconds: settings.probe_initial_delay_seconds,
            period_seconds: settings.probe_period_seconds,
            timeout_seconds: settings.probe_timeout_seconds,
            success_threshold: settings.probe_success_threshold,
            failure_threshold: settings.probe_failure_threshold,
        }),
    };

    WorkloadDescriptor {
        target: ResourceRef::new(server, names.workload),
        location: server.region.clone(),
        identity_resource_id: server.managed_identity_resource_id.clone(),
        init_containers: vec![init],
        containers: vec![proxy, app],
        restart_policy: RestartPolicy::Always,
        network: PublicNetwork {
            dns_label: names.dns_label,
            ports: vec![settings.http_port, settings.https_port],
        },
        volumes: vec![SCRATCH_VOLUME.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::server::ServerDefaults;

    fn server() -> ServerRecord {
        let mut server = ServerRecord {
            user_principal_name: "a@b.com".into(),
            user_principal_id: "uid1".into(),
            subscription_id: "sub1".into(),
            managed_identity_resource_id: "/subscriptions/sub1/msi/a-msi".into(),
            managed_identity_client_id: "client-1".into(),
            ..Default::default()
        };
        server.apply_defaults(&ServerDefaults::default());
        server
    }

    fn env<'a>(descriptor: &'a WorkloadDescriptor, name: &str) -> &'a EnvValue {
        &descriptor
            .container("actlabs")
            .unwrap()
            .env
            .iter()
            .find(|e| e.name == name)
            .unwrap_or_else(|| panic!("missing env {name}"))
            .value
    }

    #[test]
    fn names_derive_from_alias() {
        let d = build(&server(), &WorkloadSettings::default());
        assert_eq!(d.target.name, "a-aci");
        assert_eq!(d.target.resource_group, "repro-project");
        assert_eq!(d.target.subscription_id, "sub1");
        assert_eq!(d.network.dns_label, "a-actlabs-aci");
        assert_eq!(d.identity_resource_id, "/subscriptions/sub1/msi/a-msi");
        assert_eq!(d.restart_policy, RestartPolicy::Always);
    }

    #[test]
    fn init_step_writes_proxy_config_for_public_fqdn() {
        let d = build(&server(), &WorkloadSettings::default());
        let init = &d.init_containers[0];
        assert!(init.command[2].contains("a-actlabs-aci.eastus.azurecontainer.io"));
        assert!(init.command[2].contains("reverse_proxy http://localhost:8881"));
        assert_eq!(init.volume_mounts[0].mount_path, "/etc/caddy");
    }

    #[test]
    fn proxy_exposes_http_and_https() {
        let d = build(&server(), &WorkloadSettings::default());
        assert_eq!(d.container("caddy").unwrap().ports, vec![80, 443]);
        assert_eq!(d.network.ports, vec![80, 443]);
    }

    #[test]
    fn app_carries_probe_and_bootstrap_env() {
        let d = build(&server(), &WorkloadSettings::default());
        let app = d.container("actlabs").unwrap();
        let probe = app.readiness_probe.as_ref().unwrap();
        assert_eq!(probe.path, "/status");
        assert_eq!(probe.port, 8881);
        assert_eq!(
            env(&d, "AZURE_CLIENT_ID"),
            &EnvValue::Plain("client-1".into())
        );
        assert_eq!(
            env(&d, "ARM_USER_PRINCIPAL_NAME"),
            &EnvValue::Plain("a@b.com".into())
        );
        assert_eq!(env(&d, "LOG_LEVEL"), &EnvValue::Plain("0".into()));
    }

    #[test]
    fn lab_secret_is_a_binding_not_a_literal() {
        let d = build(&server(), &WorkloadSettings::default());
        assert_eq!(
            env(&d, "PROTECTED_LAB_SECRET"),
            &EnvValue::Secret(SecretRef {
                name: PROTECTED_LAB_SECRET.into()
            })
        );
        let bindings: Vec<_> = d.secret_bindings().map(|s| s.name.as_str()).collect();
        assert_eq!(bindings, vec![PROTECTED_LAB_SECRET]);
    }

    #[test]
    fn same_alias_builds_same_target() {
        let settings = WorkloadSettings::default();
        let first = build(&server(), &settings);
        let mut other = server();
        other.log_level = "4".into();
        let second = build(&other, &settings);
        assert_eq!(first.target, second.target);
        assert_eq!(first.network.dns_label, second.network.dns_label);
    }
}
