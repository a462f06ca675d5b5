//! Installs releases into an in-memory cluster and upgrades them repeatedly with the same
//! manifests, which must never change anything.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use indoc::indoc;
use serde_json::json;
use stackable_release::{
    Manifest, ReleaseOptions, ReleaseReconciler, ReleaseReport, ResourceId,
    apply::Outcome,
    cluster::{
        ClientError,
        memory::{ClusterCall, MemoryCluster},
    },
    reconciler,
    store::{self, ReleaseStatus, ReleaseStore, Revision, memory::MemoryReleaseStore},
};

const ROLE_WITHOUT_RULES: &str = indoc! {"
    kind: Role
    apiVersion: rbac.authorization.k8s.io/v1
    metadata:
      name: dapr-role
    rules: null
"};

const CONFIGURATION_CRD: &str = indoc! {r#"

    ---
    apiVersion: apiextensions.k8s.io/v1
    kind: CustomResourceDefinition
    metadata:
      annotations:
        controller-gen.kubebuilder.io/version: v0.9.2
      creationTimestamp: null
      name: configurations.dapr.io
      labels:
        app.kubernetes.io/part-of: "dapr"
    spec:
      group: dapr.io
      names:
        kind: Configuration
        listKind: ConfigurationList
        plural: configurations
        singular: configuration
      scope: Namespaced
      versions:
      - name: v1alpha1
        schema:
          openAPIV3Schema:
            description: Configuration describes an Dapr configuration setting.
            properties:
              apiVersion:
                type: string
              kind:
                type: string
              metadata:
                type: object
              spec:
                description: ConfigurationSpec is the spec for an configuration.
                properties:
                  mtls:
                    properties:
                      enabled:
                        type: boolean
                    required:
                    - enabled
                    type: object
                type: object
            type: object
        served: true
        storage: true
"#};

const CONFIGURATION: &str = indoc! {"
    apiVersion: dapr.io/v1alpha1
    kind: Configuration
    metadata:
      name: dapr-config-test
    spec:
      mtls:
        enabled: false
"};

const MUTATING_WEBHOOK: &str = indoc! {r#"
    apiVersion: admissionregistration.k8s.io/v1
    kind: MutatingWebhookConfiguration
    metadata:
      name: dapr-sidecar-injector
      labels:
        app: dapr-sidecar-injector
    webhooks:
    - name: dapr-sidecar-injector.sidecar-injector.dapr.io
      rules:
      - apiGroups:
        - ""
        apiVersions:
        - v1
        operations:
        - CREATE
        resources:
        - pods
        scope: "*"
      reinvocationPolicy: IfNeeded
      clientConfig:
        service:
          namespace: default
          name: dapr-sidecar-injector
          path: "/mutate"
        caBundle: 'Zm9vCg=='
      failurePolicy: 'Ignore'
      sideEffects: None
      admissionReviewVersions: ["v1", "v1beta1"]
"#};

const SETTINGS: &str = indoc! {"
    apiVersion: v1
    kind: ConfigMap
    metadata:
      name: settings
    data:
      mode: standalone
"};

struct Harness {
    cluster: Arc<MemoryCluster>,
    store: Arc<MemoryReleaseStore>,
    reconciler: ReleaseReconciler<MemoryCluster, MemoryReleaseStore>,
}

impl Harness {
    /// Waits for readiness with a 300 s timeout, like a `helm install --wait`.
    fn new() -> Self {
        Self::with_options(ReleaseOptions {
            wait: true,
            timeout: Duration::from_secs(300),
            ..ReleaseOptions::default()
        })
    }

    fn with_options(options: ReleaseOptions) -> Self {
        let cluster = Arc::new(MemoryCluster::new());
        let store = Arc::new(MemoryReleaseStore::new());
        let reconciler = ReleaseReconciler::new(cluster.clone(), store.clone(), options);
        Self {
            cluster,
            store,
            reconciler,
        }
    }

    async fn install(&self, yaml: &str) -> ReleaseReport {
        self.reconciler
            .install("dapr", manifests(yaml))
            .await
            .expect("release installs")
    }

    /// Upgrades and returns the report together with the requests the upgrade sent.
    async fn upgrade(&self, yaml: &str) -> (ReleaseReport, Vec<ClusterCall>) {
        self.cluster.clear_calls().await;
        let report = self
            .reconciler
            .upgrade("dapr", manifests(yaml))
            .await
            .expect("release upgrades");
        (report, self.cluster.mutations().await)
    }

    async fn statuses(&self) -> Vec<ReleaseStatus> {
        self.store
            .history("dapr")
            .await
            .expect("history is readable")
            .into_iter()
            .map(|revision| revision.status)
            .collect()
    }
}

fn manifests(yaml: &str) -> Vec<Manifest> {
    Manifest::from_yaml_stream(yaml).expect("test YAML contains valid manifests")
}

fn manifest(yaml: &str) -> Manifest {
    let mut manifests = manifests(yaml);
    assert_eq!(manifests.len(), 1, "expected a single manifest");
    manifests.remove(0)
}

/// The id of the manifest once it is placed in the default namespace.
fn scoped_id(yaml: &str) -> ResourceId {
    manifest(yaml).with_namespace(Some("default")).id().clone()
}

fn join(documents: &[&str]) -> String {
    documents.join("---\n")
}

async fn assert_idempotent(harness: &Harness, yaml: &str, upgrades: u32) {
    let before = harness.cluster.len().await;
    let latest = harness
        .store
        .latest("dapr")
        .await
        .expect("latest revision is readable")
        .map_or(0, |revision| revision.number);

    for upgrade in 1..=upgrades {
        let (report, mutations) = harness.upgrade(yaml).await;

        assert_eq!(report.revision, latest + upgrade);
        assert!(
            report.is_unchanged(),
            "upgrade {upgrade} changed {:?}",
            report.mutations().collect::<Vec<_>>()
        );
        assert!(
            mutations.is_empty(),
            "upgrade {upgrade} sent mutating requests: {mutations:?}"
        );
        assert!(
            report
                .results
                .iter()
                .all(|result| result.outcome == Outcome::Unchanged)
        );
    }
    assert_eq!(harness.cluster.len().await, before);
}

#[tokio::test]
async fn role_with_null_rules() {
    let harness = Harness::new();

    let installed = harness.install(ROLE_WITHOUT_RULES).await;
    assert_eq!(installed.revision, 1);
    assert_eq!(installed.results[0].outcome, Outcome::Created);

    assert_idempotent(&harness, ROLE_WITHOUT_RULES, 2).await;
    assert_eq!(harness.statuses().await, [
        ReleaseStatus::Superseded,
        ReleaseStatus::Superseded,
        ReleaseStatus::Deployed,
    ]);
}

#[tokio::test]
async fn custom_resource_definition_with_instance() {
    let harness = Harness::new();
    let release = join(&[CONFIGURATION, CONFIGURATION_CRD]);

    let installed = harness.install(&release).await;

    let applied = installed
        .results
        .iter()
        .map(|result| result.id.kind.as_str())
        .collect::<Vec<_>>();
    assert_eq!(applied, ["CustomResourceDefinition", "Configuration"]);
    assert_eq!(
        installed.results[1].id.namespace.as_deref(),
        Some("default")
    );

    assert_idempotent(&harness, &release, 2).await;
}

#[tokio::test]
async fn mutating_webhook_configuration() {
    let harness = Harness::new();

    let installed = harness.install(MUTATING_WEBHOOK).await;
    assert_eq!(installed.results[0].id.namespace, None);

    assert_idempotent(&harness, MUTATING_WEBHOOK, 2).await;
}

#[tokio::test]
async fn clearing_a_collection_is_a_single_patch() {
    let harness = Harness::new();
    let with_rules = indoc! {"
        kind: Role
        apiVersion: rbac.authorization.k8s.io/v1
        metadata:
          name: dapr-role
        rules:
        - apiGroups: ['']
          resources: [pods]
          verbs: [get, list]
    "};
    let without_rules = indoc! {"
        kind: Role
        apiVersion: rbac.authorization.k8s.io/v1
        metadata:
          name: dapr-role
        rules: []
    "};
    harness.install(with_rules).await;

    let (report, mutations) = harness.upgrade(without_rules).await;

    let id = scoped_id(with_rules);
    assert_eq!(mutations, [ClusterCall::Patch(
        id.clone(),
        json!({"rules": []})
    )]);
    assert_eq!(report.results[0].outcome, Outcome::Patched);
    let live = harness.cluster.object(&id).await.expect("role exists");
    assert_eq!(live["rules"], json!([]));

    assert_idempotent(&harness, without_rules, 2).await;
}

#[tokio::test]
async fn resources_deleted_out_of_band_are_recreated() {
    let harness = Harness::new();
    let release = join(&[SETTINGS, ROLE_WITHOUT_RULES]);
    harness.install(&release).await;
    let settings = scoped_id(SETTINGS);
    let role = scoped_id(ROLE_WITHOUT_RULES);
    harness.cluster.remove_out_of_band(&settings).await;
    harness.cluster.remove_out_of_band(&role).await;

    let changed_settings = SETTINGS.replace("standalone", "kubernetes");
    let (report, mutations) = harness
        .upgrade(&join(&[&changed_settings, ROLE_WITHOUT_RULES]))
        .await;

    // Both resources are in one stage, so their requests may interleave
    assert_eq!(mutations.len(), 3);
    for call in [
        ClusterCall::Patch(settings.clone(), json!({"data": {"mode": "kubernetes"}})),
        ClusterCall::Create(settings.clone()),
        ClusterCall::Create(role.clone()),
    ] {
        assert!(mutations.contains(&call), "{call:?} was not sent");
    }
    assert!(
        report
            .results
            .iter()
            .all(|result| result.outcome == Outcome::Recreated)
    );
    let live = harness
        .cluster
        .object(&settings)
        .await
        .expect("config map exists again");
    assert_eq!(live["data"]["mode"], "kubernetes");
}

#[tokio::test]
async fn dropped_resources_are_deleted_instances_first() {
    let harness = Harness::new();
    harness
        .install(&join(&[SETTINGS, CONFIGURATION_CRD, CONFIGURATION]))
        .await;

    let (report, mutations) = harness.upgrade(SETTINGS).await;

    let deleted = mutations
        .iter()
        .map(|call| call.id().kind.as_str())
        .collect::<Vec<_>>();
    assert_eq!(deleted, ["Configuration", "CustomResourceDefinition"]);
    assert!(
        mutations
            .iter()
            .all(|call| matches!(call, ClusterCall::Delete(_)))
    );
    assert_eq!(report.mutations().count(), 2);
    assert_eq!(harness.cluster.len().await, 1);

    assert_idempotent(&harness, SETTINGS, 1).await;
}

#[tokio::test]
async fn deleting_absent_resources_succeeds() {
    let harness = Harness::new();
    harness.install(&join(&[SETTINGS, ROLE_WITHOUT_RULES])).await;
    let role = scoped_id(ROLE_WITHOUT_RULES);
    harness.cluster.remove_out_of_band(&role).await;

    let (report, _) = harness.upgrade(SETTINGS).await;

    let outcome = report
        .results
        .iter()
        .find(|result| result.id == role)
        .map(|result| result.outcome);
    assert_eq!(outcome, Some(Outcome::AlreadyAbsent));
    assert!(report.is_unchanged());
}

#[tokio::test]
async fn failed_installs_can_be_retried() {
    let harness = Harness::new();
    let release = join(&[SETTINGS, ROLE_WITHOUT_RULES]);
    let role = scoped_id(ROLE_WITHOUT_RULES);
    harness
        .cluster
        .inject_fault(role.clone(), ClientError::Rejected {
            id: role.clone(),
            code: 403,
            message: "roles.rbac.authorization.k8s.io is forbidden".to_owned(),
        })
        .await;

    let failed = harness
        .reconciler
        .install("dapr", manifests(&release))
        .await;
    assert!(failed.is_err());
    let history = harness.store.history("dapr").await.expect("readable");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ReleaseStatus::Failed);
    assert!(history[0].description.is_some());
    assert_eq!(harness.cluster.len().await, 1, "no rollback happens");

    let (report, mutations) = harness.upgrade(&release).await;
    assert_eq!(report.revision, 2);
    assert_eq!(mutations, [ClusterCall::Create(role)]);
    assert_eq!(harness.statuses().await, [
        ReleaseStatus::Failed,
        ReleaseStatus::Deployed,
    ]);

    assert_idempotent(&harness, &release, 1).await;
}

#[tokio::test]
async fn failed_deletions_are_kept_for_the_next_upgrade() {
    let harness = Harness::new();
    harness.install(&join(&[SETTINGS, ROLE_WITHOUT_RULES])).await;
    let role = scoped_id(ROLE_WITHOUT_RULES);
    harness
        .cluster
        .inject_fault(role.clone(), ClientError::Rejected {
            id: role.clone(),
            code: 403,
            message: "forbidden".to_owned(),
        })
        .await;

    let failed = harness.reconciler.upgrade("dapr", manifests(SETTINGS)).await;
    assert!(failed.is_err());
    assert!(harness.cluster.object(&role).await.is_some());

    let (_, mutations) = harness.upgrade(SETTINGS).await;
    assert_eq!(mutations, [ClusterCall::Delete(role.clone())]);
    assert!(harness.cluster.object(&role).await.is_none());
}

#[tokio::test]
async fn failed_patches_are_sent_again_on_retry() {
    let mode = |mode: &str| SETTINGS.replace("standalone", mode);
    let harness = Harness::new();
    harness.install(&mode("a")).await;
    let settings = scoped_id(SETTINGS);
    harness
        .cluster
        .inject_fault(settings.clone(), ClientError::Rejected {
            id: settings.clone(),
            code: 422,
            message: "data.mode: Invalid value".to_owned(),
        })
        .await;

    let failed = harness.reconciler.upgrade("dapr", manifests(&mode("b"))).await;
    assert!(failed.is_err());
    let failed_revision = harness
        .store
        .latest("dapr")
        .await
        .expect("latest revision is readable")
        .expect("failed revision is recorded");
    assert_eq!(failed_revision.status, ReleaseStatus::Failed);
    assert_eq!(failed_revision.resources[0].get("/data/mode"), Some(&json!("a")));

    let (report, mutations) = harness.upgrade(&mode("b")).await;
    assert_eq!(report.results[0].outcome, Outcome::Patched);
    assert_eq!(mutations, [ClusterCall::Patch(
        settings.clone(),
        json!({"data": {"mode": "b"}})
    )]);
    let live = harness.cluster.object(&settings).await.expect("config map exists");
    assert_eq!(live["data"]["mode"], json!("b"));

    assert_idempotent(&harness, &mode("b"), 1).await;
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let harness = Harness::new();
    let settings = scoped_id(SETTINGS);
    for _ in 0..2 {
        harness
            .cluster
            .inject_fault(settings.clone(), ClientError::Transient {
                id: settings.clone(),
                message: "connection reset by peer".to_owned(),
            })
            .await;
    }

    let installed = harness.install(SETTINGS).await;

    assert_eq!(installed.results[0].outcome, Outcome::Created);
}

#[tokio::test(start_paused = true)]
async fn readiness_timeouts_fail_the_revision() {
    let harness = Harness::with_options(ReleaseOptions {
        wait: true,
        timeout: Duration::from_secs(30),
        ..ReleaseOptions::default()
    });
    let claim = indoc! {"
        apiVersion: v1
        kind: PersistentVolumeClaim
        metadata:
          name: data
        spec:
          accessModes: [ReadWriteOnce]
          resources:
            requests:
              storage: 1Gi
    "};

    let result = harness.reconciler.install("dapr", manifests(claim)).await;

    let error = result.expect_err("claim never gets bound");
    assert!(error.to_string().contains("did not become ready"));
    assert_eq!(harness.statuses().await, [ReleaseStatus::Failed]);
    assert_eq!(harness.cluster.len().await, 1, "applied resources stay");
}

#[tokio::test(start_paused = true)]
async fn concurrent_operations_on_one_release_are_busy() {
    let waiting = Harness::with_options(ReleaseOptions {
        wait: true,
        timeout: Duration::from_secs(30),
        ..ReleaseOptions::default()
    });
    let claim = indoc! {"
        apiVersion: v1
        kind: PersistentVolumeClaim
        metadata:
          name: data
    "};

    let (install, upgrade) = tokio::join!(
        waiting.reconciler.install("dapr", manifests(claim)),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            waiting.reconciler.upgrade("dapr", manifests(claim)).await
        }
    );

    assert!(matches!(
        upgrade,
        Err(reconciler::Error::Busy { .. })
    ));
    assert!(install.is_err());
    assert_eq!(waiting.statuses().await, [ReleaseStatus::Failed]);
}

#[tokio::test]
async fn pending_releases_are_busy() {
    let harness = Harness::new();
    harness.install(SETTINGS).await;
    let mut pending = harness
        .store
        .latest("dapr")
        .await
        .expect("readable")
        .expect("release exists");
    pending.number = 2;
    pending.status = ReleaseStatus::PendingUpgrade;
    harness
        .store
        .append("dapr", pending, Some(1))
        .await
        .expect("pending revision is stored");

    let result = harness.reconciler.upgrade("dapr", manifests(SETTINGS)).await;

    assert!(matches!(
        result,
        Err(reconciler::Error::Busy { .. })
    ));
}

/// Lets another writer append a revision right after the latest one was read.
#[derive(Default)]
struct RacingStore {
    inner: MemoryReleaseStore,
    race: AtomicBool,
}

#[async_trait]
impl ReleaseStore for RacingStore {
    async fn latest(&self, name: &str) -> Result<Option<Revision>, store::Error> {
        let latest = self.inner.latest(name).await?;
        if let Some(latest) = &latest
            && self.race.swap(false, Ordering::SeqCst)
        {
            let mut rival = latest.clone();
            rival.number += 1;
            self.inner.append(name, rival, Some(latest.number)).await?;
        }
        Ok(latest)
    }

    async fn history(&self, name: &str) -> Result<Vec<Revision>, store::Error> {
        self.inner.history(name).await
    }

    async fn append(
        &self,
        name: &str,
        revision: Revision,
        expected_prior: Option<u32>,
    ) -> Result<(), store::Error> {
        self.inner.append(name, revision, expected_prior).await
    }
}

#[tokio::test]
async fn lost_updates_are_rejected() {
    let store = Arc::new(RacingStore::default());
    let racing = ReleaseReconciler::new(
        Arc::new(MemoryCluster::new()),
        store.clone(),
        ReleaseOptions::default(),
    );
    racing
        .install("dapr", manifests(SETTINGS))
        .await
        .expect("release installs");
    store.race.store(true, Ordering::SeqCst);

    let result = racing.upgrade("dapr", manifests(SETTINGS)).await;

    assert!(matches!(
        result,
        Err(reconciler::Error::RecordRevision {
            source: store::Error::RevisionConflict {
                expected: Some(1),
                actual: Some(2),
                ..
            },
            revision: 2,
            ..
        })
    ));
    let numbers = store
        .history("dapr")
        .await
        .expect("readable")
        .into_iter()
        .map(|revision| revision.number)
        .collect::<Vec<_>>();
    assert_eq!(numbers, [1, 2]);
}
