use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::cloud::descriptor::{PROTECTED_LAB_SECRET, public_fqdn};
use crate::cloud::{ManagedIdentity, SecretValues, WorkloadDescriptor, WorkloadState};
use crate::readiness::{PROBE_INTERVAL, ReadinessProbe};
use crate::secrets::StaticSecretStore;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

struct FakeOwnership {
    owner: bool,
    fail: bool,
    calls: AtomicU32,
}

#[async_trait]
impl OwnershipChecker for FakeOwnership {
    async fn is_owner(&self, principal_id: &str, subscription_id: &str) -> Result<bool, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::Request("authorization API unavailable".into()));
        }
        Ok(self.owner && principal_id == "uid1" && subscription_id == "sub1")
    }
}

#[derive(Default)]
struct FakeIdentities {
    get_fails: bool,
    get_calls: AtomicU32,
    created: Mutex<Vec<(ResourceRef, String)>>,
}

#[async_trait]
impl IdentityProvisioner for FakeIdentities {
    async fn get(&self, identity: &ResourceRef) -> Result<ManagedIdentity, ProviderError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.get_fails {
            Err(ProviderError::Request("throttled".into()))
        } else {
            Err(ProviderError::NotFound(identity.name.clone()))
        }
    }

    async fn create_or_update(
        &self,
        identity: &ResourceRef,
        location: &str,
    ) -> Result<ManagedIdentity, ProviderError> {
        self.created
            .lock()
            .unwrap()
            .push((identity.clone(), location.to_string()));
        Ok(ManagedIdentity {
            resource_id: format!("/subscriptions/{}/msi/{}", identity.subscription_id, identity.name),
            client_id: "client-1".into(),
            principal_id: "principal-1".into(),
        })
    }
}

#[derive(Clone, Copy, Default)]
enum DeleteOutcome {
    #[default]
    Deleted,
    NotFound,
    Fails,
}

impl DeleteOutcome {
    fn result(self, name: &str) -> Result<(), ProviderError> {
        match self {
            DeleteOutcome::Deleted => Ok(()),
            DeleteOutcome::NotFound => Err(ProviderError::NotFound(name.into())),
            DeleteOutcome::Fails => Err(ProviderError::Request("conflict".into())),
        }
    }
}

#[derive(Default)]
struct FakeWorkloads {
    deployed: Mutex<Vec<WorkloadDescriptor>>,
    secrets_seen: Mutex<Vec<Option<String>>>,
    deleted: Mutex<Vec<ResourceRef>>,
    environments_deleted: Mutex<Vec<ResourceRef>>,
    delete_outcome: DeleteOutcome,
    provisioning_state: Option<String>,
}

#[async_trait]
impl WorkloadDeployer for FakeWorkloads {
    async fn deploy(
        &self,
        descriptor: &WorkloadDescriptor,
        secrets: &SecretValues,
        _cancel: &CancellationToken,
    ) -> Result<WorkloadState, ProviderError> {
        self.deployed.lock().unwrap().push(descriptor.clone());
        self.secrets_seen
            .lock()
            .unwrap()
            .push(secrets.get(PROTECTED_LAB_SECRET).map(str::to_string));
        Ok(WorkloadState {
            endpoint: public_fqdn(&descriptor.network.dns_label, &descriptor.location),
            provisioning_state: "Succeeded".into(),
        })
    }

    async fn get(&self, workload: &ResourceRef) -> Result<WorkloadState, ProviderError> {
        match &self.provisioning_state {
            Some(state) => Ok(WorkloadState {
                endpoint: format!("{}.eastus.azurecontainer.io", workload.name),
                provisioning_state: state.clone(),
            }),
            None => Err(ProviderError::NotFound(workload.name.clone())),
        }
    }

    async fn delete(
        &self,
        workload: &ResourceRef,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        self.deleted.lock().unwrap().push(workload.clone());
        self.delete_outcome.result(&workload.name)
    }

    async fn delete_environment(
        &self,
        environment: &ResourceRef,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        self.environments_deleted
            .lock()
            .unwrap()
            .push(environment.clone());
        self.delete_outcome.result(&environment.name)
    }
}

#[derive(Default)]
struct FakeActivity {
    records: Mutex<HashMap<(String, String), ServerRecord>>,
    fail_upsert: bool,
    upserts: AtomicU32,
}

#[async_trait]
impl ActivityStore for FakeActivity {
    async fn get(&self, partition: &str, row_key: &str) -> Result<ServerRecord, ProviderError> {
        self.records
            .lock()
            .unwrap()
            .get(&(partition.to_string(), row_key.to_string()))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(row_key.into()))
    }

    async fn upsert(&self, partition: &str, server: &ServerRecord) -> Result<(), ProviderError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if self.fail_upsert {
            return Err(ProviderError::Request("table unavailable".into()));
        }
        self.records.lock().unwrap().insert(
            (partition.to_string(), server.user_principal_name.clone()),
            server.clone(),
        );
        Ok(())
    }
}

/// Answers 200 from attempt `ready_on` (0 = never).
struct FakeProbe {
    ready_on: u32,
    calls: AtomicU32,
    urls: Mutex<Vec<String>>,
}

#[async_trait]
impl ReadinessProbe for FakeProbe {
    async fn probe(&self, url: &str) -> Result<(), String> {
        self.urls.lock().unwrap().push(url.to_string());
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.ready_on != 0 && n >= self.ready_on {
            Ok(())
        } else {
            Err("502 Bad Gateway".into())
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    ownership: Arc<FakeOwnership>,
    identities: Arc<FakeIdentities>,
    workloads: Arc<FakeWorkloads>,
    activity: Arc<FakeActivity>,
    probe: Arc<FakeProbe>,
    orchestrator: Arc<LifecycleOrchestrator>,
}

struct Setup {
    owner: bool,
    ownership_fails: bool,
    identities: FakeIdentities,
    workloads: FakeWorkloads,
    activity: FakeActivity,
    secrets: StaticSecretStore,
    ready_on: u32,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            owner: true,
            ownership_fails: false,
            identities: FakeIdentities::default(),
            workloads: FakeWorkloads::default(),
            activity: FakeActivity::default(),
            secrets: StaticSecretStore::default().with(PROTECTED_LAB_SECRET, "s3cret"),
            ready_on: 1,
        }
    }
}

fn harness(setup: Setup) -> Harness {
    let ownership = Arc::new(FakeOwnership {
        owner: setup.owner,
        fail: setup.ownership_fails,
        calls: AtomicU32::new(0),
    });
    let identities = Arc::new(setup.identities);
    let workloads = Arc::new(setup.workloads);
    let activity = Arc::new(setup.activity);
    let probe = Arc::new(FakeProbe {
        ready_on: setup.ready_on,
        calls: AtomicU32::new(0),
        urls: Mutex::new(Vec::new()),
    });

    let orchestrator = LifecycleOrchestrator::new(
        Collaborators {
            ownership: ownership.clone(),
            identities: identities.clone(),
            workloads: workloads.clone(),
            activity: activity.clone(),
            secrets: Arc::new(setup.secrets),
        },
        ReadinessPoller::with_wait_budget(probe.clone(), Duration::from_secs(180)),
        OrchestratorSettings::default(),
    );

    Harness {
        ownership,
        identities,
        workloads,
        activity,
        probe,
        orchestrator: Arc::new(orchestrator),
    }
}

/// Asserts `timestamp` is RFC 3339 and no more than a second old.
fn assert_fresh(timestamp: &str) {
    let parsed = chrono::DateTime::parse_from_rfc3339(timestamp).unwrap();
    assert!((chrono::Utc::now() - parsed.with_timezone(&chrono::Utc)).num_seconds().abs() <= 1);
}

fn request() -> ServerRecord {
    ServerRecord {
        user_principal_name: "a@b.com".into(),
        user_principal_id: "uid1".into(),
        subscription_id: "sub1".into(),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Deploy
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn deploy_brings_server_up_and_persists_it() {
    let h = harness(Setup::default());

    let server = h
        .orchestrator
        .deploy(request(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(server.user_alias, "a");
    assert_eq!(server.region, "East US");
    assert_eq!(server.resource_group, "repro-project");
    assert_eq!(server.log_level, "0");
    assert_eq!(server.endpoint, "a-actlabs-aci.eastus.azurecontainer.io");
    assert_eq!(server.status, ServerStatus::Running);
    assert_eq!(server.managed_identity_client_id, "client-1");
    assert_eq!(server.managed_identity_principal_id, "principal-1");
    assert_eq!(server.managed_identity_resource_id, "/subscriptions/sub1/msi/a-msi");
    assert_fresh(&server.last_activity_time);

    let stored = h
        .activity
        .get(ACTIVITY_PARTITION, "a@b.com")
        .await
        .unwrap();
    assert_eq!(stored, server);

    assert_eq!(
        *h.probe.urls.lock().unwrap(),
        vec!["https://a-actlabs-aci.eastus.azurecontainer.io/status".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn deploy_targets_alias_named_resources() {
    let h = harness(Setup::default());

    for _ in 0..2 {
        h.orchestrator
            .deploy(request(), &CancellationToken::new())
            .await
            .unwrap();
    }

    let created = h.identities.created.lock().unwrap();
    assert_eq!(created.len(), 2);
    assert!(created.iter().all(|(r, loc)| r.name == "a-msi" && loc == "East US"));
    let deployed = h.workloads.deployed.lock().unwrap();
    assert_eq!(deployed.len(), 2);
    assert!(deployed.iter().all(|d| d.target.name == "a-aci"));
    assert_eq!(deployed[0].target, deployed[1].target);
    assert_eq!(
        deployed[0].identity_resource_id,
        "/subscriptions/sub1/msi/a-msi"
    );
}

#[tokio::test(start_paused = true)]
async fn deploy_resolves_secret_bindings() {
    let h = harness(Setup::default());

    h.orchestrator
        .deploy(request(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        *h.workloads.secrets_seen.lock().unwrap(),
        vec![Some("s3cret".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn missing_secret_fails_before_anything_is_created() {
    let h = harness(Setup {
        secrets: StaticSecretStore::default(),
        ..Default::default()
    });

    let err = h
        .orchestrator
        .deploy(request(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, LifecycleError::Provider(_)));
    assert!(h.identities.created.lock().unwrap().is_empty());
    assert!(h.workloads.deployed.lock().unwrap().is_empty());
    assert_eq!(h.probe.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn server_that_never_answers_is_failed_not_an_error() {
    let h = harness(Setup {
        ready_on: 0,
        ..Default::default()
    });
    let started = tokio::time::Instant::now();

    let server = h
        .orchestrator
        .deploy(request(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(server.status, ServerStatus::Failed);
    assert_eq!(server.endpoint, "a-actlabs-aci.eastus.azurecontainer.io");
    assert_eq!(server.managed_identity_client_id, "client-1");
    assert_eq!(h.probe.calls.load(Ordering::SeqCst), 36);
    assert!(started.elapsed() <= Duration::from_secs(180));
    assert_eq!(h.activity.upserts.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn persistence_failure_does_not_fail_deploy() {
    let h = harness(Setup {
        activity: FakeActivity {
            fail_upsert: true,
            ..Default::default()
        },
        ..Default::default()
    });

    let server = h
        .orchestrator
        .deploy(request(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(server.status, ServerStatus::Running);
    assert_eq!(h.activity.upserts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn identity_lookup_error_still_creates_identity() {
    let h = harness(Setup {
        identities: FakeIdentities {
            get_fails: true,
            ..Default::default()
        },
        ..Default::default()
    });

    h.orchestrator
        .deploy(request(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.identities.get_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.identities.created.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn non_owner_is_rejected_before_any_provisioning() {
    let h = harness(Setup {
        owner: false,
        ..Default::default()
    });

    let err = h
        .orchestrator
        .deploy(request(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, LifecycleError::Unauthorized));
    assert_eq!(err.to_string(), "insufficient permissions");
    assert_eq!(h.identities.get_calls.load(Ordering::SeqCst), 0);
    assert!(h.identities.created.lock().unwrap().is_empty());
    assert!(h.workloads.deployed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn incomplete_record_is_rejected_before_ownership_check() {
    let h = harness(Setup::default());

    for missing in ["userPrincipalName", "userPrincipalId", "subscriptionId"] {
        let mut server = request();
        match missing {
            "userPrincipalName" => server.user_principal_name.clear(),
            "userPrincipalId" => server.user_principal_id.clear(),
            _ => server.subscription_id.clear(),
        }
        let err = h
            .orchestrator
            .deploy(server, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "missing required information", "{missing}");
    }
    assert_eq!(h.ownership.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn ownership_check_errors_propagate() {
    let h = harness(Setup {
        ownership_fails: true,
        ..Default::default()
    });

    let err = h
        .orchestrator
        .deploy(request(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, LifecycleError::Provider(_)));
    assert!(h.identities.created.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_readiness_polling() {
    let h = harness(Setup {
        ready_on: 0,
        ..Default::default()
    });
    let cancel = CancellationToken::new();

    let handle = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        let cancel = cancel.clone();
        async move { orchestrator.deploy(request(), &cancel).await }
    });
    tokio::time::sleep(PROBE_INTERVAL * 3 + Duration::from_secs(1)).await;
    cancel.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, LifecycleError::Cancelled));
    assert_eq!(h.probe.calls.load(Ordering::SeqCst), 4);
    assert_eq!(h.activity.upserts.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Destroy / Get / UpdateActivity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn destroy_deletes_alias_workload() {
    let h = harness(Setup::default());

    h.orchestrator
        .destroy(request(), &CancellationToken::new())
        .await
        .unwrap();

    let deleted = h.workloads.deleted.lock().unwrap();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].name, "a-aci");
    assert_eq!(deleted[0].resource_group, "repro-project");
    assert!(h.workloads.environments_deleted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn destroy_of_missing_server_succeeds() {
    let h = harness(Setup {
        workloads: FakeWorkloads {
            delete_outcome: DeleteOutcome::NotFound,
            ..Default::default()
        },
        ..Default::default()
    });

    let mut server = request();
    server.delete_server_env = true;
    h.orchestrator
        .destroy(server, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.workloads.environments_deleted.lock().unwrap()[0].name, "a-env");
}

#[tokio::test]
async fn destroy_propagates_other_errors() {
    let h = harness(Setup {
        workloads: FakeWorkloads {
            delete_outcome: DeleteOutcome::Fails,
            ..Default::default()
        },
        ..Default::default()
    });

    let err = h
        .orchestrator
        .destroy(request(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "conflict");
    assert_eq!(h.workloads.deleted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn destroy_requires_ownership() {
    let h = harness(Setup {
        owner: false,
        ..Default::default()
    });

    let err = h
        .orchestrator
        .destroy(request(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Unauthorized));
    assert!(h.workloads.deleted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn get_maps_provisioning_state() {
    let h = harness(Setup {
        workloads: FakeWorkloads {
            provisioning_state: Some("Pending".into()),
            ..Default::default()
        },
        ..Default::default()
    });

    let server = h.orchestrator.get(request()).await.unwrap();
    assert_eq!(server.status, ServerStatus::Provisioning);
    assert_eq!(server.provisioning_state, "Pending");
    assert_eq!(server.endpoint, "a-aci.eastus.azurecontainer.io");
}

#[tokio::test]
async fn get_of_missing_server_is_an_error() {
    let h = harness(Setup::default());

    let err = h.orchestrator.get(request()).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Provider(ProviderError::NotFound(_))));
}

#[tokio::test]
async fn update_activity_refreshes_stored_record() {
    let h = harness(Setup::default());
    let mut stored = request();
    stored.last_activity_time = "2020-01-01T00:00:00Z".into();
    stored.endpoint = "a-actlabs-aci.eastus.azurecontainer.io".into();
    h.activity.upsert(ACTIVITY_PARTITION, &stored).await.unwrap();

    h.orchestrator.update_activity("a@b.com").await.unwrap();

    let refreshed = h
        .activity
        .get(ACTIVITY_PARTITION, "a@b.com")
        .await
        .unwrap();
    assert_fresh(&refreshed.last_activity_time);
    assert_eq!(refreshed.endpoint, stored.endpoint);
    assert_eq!(h.ownership.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn update_activity_for_unknown_user_fails() {
    let h = harness(Setup::default());

    let err = h
        .orchestrator
        .update_activity("nobody@b.com")
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Provider(ProviderError::NotFound(_))));
}
