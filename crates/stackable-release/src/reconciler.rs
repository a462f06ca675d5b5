//! Drives installs and upgrades of releases.
//!
//! A [`ReleaseReconciler`] loads the latest revision of a release, diffs its resources against
//! the desired manifests, applies the resulting operations stage by stage, optionally waits for
//! readiness and finally records the outcome as a new revision. Upgrading with unchanged
//! manifests performs no mutation.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use clap::Args;
use futures::{StreamExt as _, stream};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, info, instrument, warn};

use crate::{
    apply::{self, AppliedResource, Applier},
    cluster::ClusterClient,
    diff::{self, Operation},
    manifest::{Manifest, ResourceId, ScopeTable},
    order,
    retry::RetryConfig,
    store::{self, ReleaseStatus, ReleaseStore, Revision},
    wait::{self, ReadinessWaiter},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("another install or upgrade of release {name:?} is in progress"))]
    Busy { name: String },

    #[snafu(display("release {name:?} already exists at revision {revision}"))]
    ReleaseExists { name: String, revision: u32 },

    #[snafu(display("release {name:?} does not exist"))]
    ReleaseNotFound { name: String },

    #[snafu(display("{id} is part of the release more than once"))]
    DuplicateResource { id: ResourceId },

    #[snafu(display("failed to order the resources of the release"))]
    OrderResources { source: order::Error },

    #[snafu(display("failed to compute the operation for a resource"))]
    Diff { source: diff::Error },

    #[snafu(display("failed to apply {id}"))]
    ApplyResource { source: apply::Error, id: ResourceId },

    #[snafu(display("the resources of the release did not become ready"))]
    AwaitReadiness { source: wait::Error },

    #[snafu(display("failed to read release {name:?}"))]
    ReadRelease { source: store::Error, name: String },

    #[snafu(display("failed to record revision {revision} of release {name:?}"))]
    RecordRevision {
        source: store::Error,
        name: String,
        revision: u32,
    },
}

/// Options for installing and upgrading releases.
///
/// Can be used as CLI arguments, every option can also be set through its environment variable.
#[derive(Args, Clone, Debug, Eq, PartialEq)]
#[command(next_help_heading = "Release Options")]
pub struct ReleaseOptions {
    /// Wait until all resources of the release are ready before marking it as deployed.
    #[arg(long, env = "RELEASE_WAIT")]
    pub wait: bool,

    /// How long to wait for the resources to become ready, e.g. `300s` or `5m`.
    #[arg(
        long,
        env = "RELEASE_TIMEOUT",
        default_value = "5m",
        value_parser = humantime::parse_duration
    )]
    pub timeout: Duration,

    /// The maximum number of requests sent to the cluster concurrently.
    #[arg(long, env = "RELEASE_MAX_CONCURRENCY", default_value_t = 8)]
    pub max_concurrency: usize,

    #[arg(
        long,
        env = "RELEASE_POLL_INTERVAL",
        default_value = "2s",
        value_parser = humantime::parse_duration
    )]
    pub poll_interval: Duration,

    /// How often a request failing with a transient error is attempted in total.
    #[arg(long, env = "RELEASE_RETRY_ATTEMPTS", default_value_t = 5)]
    pub retry_attempts: u32,

    #[arg(
        long,
        env = "RELEASE_RETRY_INITIAL_DELAY",
        default_value = "200ms",
        value_parser = humantime::parse_duration
    )]
    pub retry_initial_delay: Duration,

    #[arg(
        long,
        env = "RELEASE_RETRY_MAX_DELAY",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub retry_max_delay: Duration,

    /// The namespace of namespaced resources which don't specify one.
    #[arg(long, env = "RELEASE_DEFAULT_NAMESPACE", default_value = "default")]
    pub default_namespace: String,
}

impl Default for ReleaseOptions {
    fn default() -> Self {
        Self {
            wait: false,
            timeout: Duration::from_secs(300),
            max_concurrency: 8,
            poll_interval: Duration::from_secs(2),
            retry_attempts: 5,
            retry_initial_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(10),
            default_namespace: "default".to_owned(),
        }
    }
}

impl ReleaseOptions {
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_attempts,
            initial_delay: self.retry_initial_delay,
            max_delay: self.retry_max_delay,
            ..RetryConfig::default()
        }
    }
}

/// The names of the releases which are currently being installed or upgraded.
///
/// Clones share their state. Reconcilers sharing one [`ReleaseLocks`] never work on the same
/// release at the same time.
#[derive(Clone, Debug, Default)]
pub struct ReleaseLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl ReleaseLocks {
    /// Locks `name`, or returns [`None`] right away if it is locked already.
    pub fn try_acquire(&self, name: &str) -> Option<ReleaseLease> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.insert(name.to_owned()).then(|| ReleaseLease {
            locks: self.clone(),
            name: name.to_owned(),
        })
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }
}

/// Releases its lock when dropped.
#[derive(Debug)]
pub struct ReleaseLease {
    locks: ReleaseLocks,
    name: String,
}

impl Drop for ReleaseLease {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

/// The result of a successful install or upgrade.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseReport {
    pub name: String,
    pub revision: u32,
    pub status: ReleaseStatus,

    /// One entry per resource, in the order they were applied.
    pub results: Vec<AppliedResource>,
}

impl ReleaseReport {
    /// The results of all operations which changed the cluster.
    pub fn mutations(&self) -> impl Iterator<Item = &AppliedResource> {
        self.results
            .iter()
            .filter(|result| result.outcome.is_mutation())
    }

    pub fn is_unchanged(&self) -> bool {
        self.mutations().next().is_none()
    }
}

/// The operations of one release operation. Operations within a stage are independent of each
/// other, stages are executed one after another.
#[derive(Debug, Default)]
struct Plan {
    stages: Vec<Vec<Operation>>,
}

impl Plan {
    fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.stages.iter().flatten()
    }
}

pub struct ReleaseReconciler<C: ?Sized, S: ?Sized> {
    client: Arc<C>,
    store: Arc<S>,
    locks: ReleaseLocks,
    options: ReleaseOptions,
}

impl<C, S> ReleaseReconciler<C, S>
where
    C: ClusterClient + ?Sized,
    S: ReleaseStore + ?Sized,
{
    pub fn new(client: Arc<C>, store: Arc<S>, options: ReleaseOptions) -> Self {
        Self {
            client,
            store,
            locks: ReleaseLocks::default(),
            options,
        }
    }

    /// Uses `locks` instead of locks private to this reconciler.
    pub fn with_locks(mut self, locks: ReleaseLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn options(&self) -> &ReleaseOptions {
        &self.options
    }

    /// Installs a new release and records it as revision 1.
    ///
    /// If applying fails, revision 1 is recorded as failed and the cluster is left as it is.
    #[instrument(skip(self, manifests), fields(release.name = name, resources = manifests.len()))]
    pub async fn install(
        &self,
        name: &str,
        manifests: Vec<Manifest>,
    ) -> Result<ReleaseReport, Error> {
        let _lease = self.locks.try_acquire(name).context(BusySnafu { name })?;

        let latest = self
            .store
            .latest(name)
            .await
            .context(ReadReleaseSnafu { name })?;
        if let Some(latest) = latest {
            return ReleaseExistsSnafu {
                name,
                revision: latest.number,
            }
            .fail();
        }

        let desired = self.prepare(manifests)?;
        self.reconcile(name, None, desired).await
    }

    /// Upgrades an existing release to `manifests` and records the outcome as the next revision.
    ///
    /// The latest revision is used as the previous state whether it is deployed or failed, so a
    /// failed upgrade can simply be retried.
    #[instrument(skip(self, manifests), fields(release.name = name, resources = manifests.len()))]
    pub async fn upgrade(
        &self,
        name: &str,
        manifests: Vec<Manifest>,
    ) -> Result<ReleaseReport, Error> {
        let _lease = self.locks.try_acquire(name).context(BusySnafu { name })?;

        let previous = self
            .store
            .latest(name)
            .await
            .context(ReadReleaseSnafu { name })?
            .context(ReleaseNotFoundSnafu { name })?;
        ensure!(!previous.status.is_pending(), BusySnafu { name });

        let desired = self.prepare(manifests)?;
        self.reconcile(name, Some(previous), desired).await
    }

    /// Returns all revisions of a release, oldest first.
    pub async fn history(&self, name: &str) -> Result<Vec<Revision>, Error> {
        self.store
            .history(name)
            .await
            .context(ReadReleaseSnafu { name })
    }

    /// Assigns namespaces and rejects manifests which occur more than once.
    fn prepare(&self, manifests: Vec<Manifest>) -> Result<Vec<Manifest>, Error> {
        let mut scopes = ScopeTable::default();
        for definition in order::definitions(&manifests).context(OrderResourcesSnafu)? {
            if definition.cluster_scoped {
                scopes.insert_cluster_scoped(definition.group, definition.kind);
            }
        }

        let manifests = manifests
            .into_iter()
            .map(|manifest| manifest.scoped(&scopes, &self.options.default_namespace))
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        for manifest in &manifests {
            ensure!(seen.insert(manifest.id()), DuplicateResourceSnafu {
                id: manifest.id().clone()
            });
        }
        Ok(manifests)
    }

    async fn reconcile(
        &self,
        name: &str,
        previous: Option<Revision>,
        desired: Vec<Manifest>,
    ) -> Result<ReleaseReport, Error> {
        let expected_prior = previous.as_ref().map(|previous| previous.number);
        let number = expected_prior.map_or(1, |number| number + 1);
        let previous = previous
            .map(|previous| previous.resources)
            .unwrap_or_default()
            .into_iter()
            .map(|manifest| (manifest.id().clone(), manifest))
            .collect::<IndexMap<_, _>>();

        // Nothing is recorded for releases which can't even be planned
        let plan = Self::plan(&previous, &desired)?;
        let changes = plan.operations().filter(|operation| !operation.is_noop()).count();
        info!(revision = number, changes, "reconciling release");

        let mut results = Vec::new();
        let outcome = self.execute(&plan, &desired, &mut results).await;

        let observed = results
            .iter()
            .filter_map(|result| result.observed.clone())
            .collect();
        let mut revision = Revision {
            name: name.to_owned(),
            number,
            status: ReleaseStatus::Deployed,
            resources: desired,
            observed,
            timestamp: jiff::Timestamp::now(),
            description: None,
        };

        match outcome {
            Ok(()) => {
                self.store
                    .append(name, revision, expected_prior)
                    .await
                    .context(RecordRevisionSnafu {
                        name,
                        revision: number,
                    })?;
                info!(revision = number, "release deployed");
                Ok(ReleaseReport {
                    name: name.to_owned(),
                    revision: number,
                    status: ReleaseStatus::Deployed,
                    results,
                })
            }
            Err(error) => {
                // Resources whose operation did not succeed keep their previous manifest, so
                // that the next upgrade computes the same operation again. New resources keep
                // the desired one, a missing object is re-created from it.
                let applied = results
                    .iter()
                    .map(|result| &result.id)
                    .collect::<HashSet<_>>();
                revision.resources = std::mem::take(&mut revision.resources)
                    .into_iter()
                    .map(|manifest| match previous.get(manifest.id()) {
                        Some(previous) if !applied.contains(manifest.id()) => previous.clone(),
                        _ => manifest,
                    })
                    .collect();

                // Keep track of resources whose deletion did not happen, so that the next
                // upgrade still removes them.
                let deleted = results
                    .iter()
                    .filter(|result| result.observed.is_none())
                    .map(|result| &result.id)
                    .collect::<HashSet<_>>();
                let leftovers = previous
                    .values()
                    .filter(|manifest| {
                        !deleted.contains(manifest.id())
                            && !revision
                                .resources
                                .iter()
                                .any(|desired| desired.id() == manifest.id())
                    })
                    .cloned()
                    .collect::<Vec<_>>();
                revision.resources.extend(leftovers);
                revision.status = ReleaseStatus::Failed;
                revision.description = Some(error.to_string());

                warn!(revision = number, %error, "release failed");
                if let Err(store_error) = self.store.append(name, revision, expected_prior).await {
                    warn!(
                        revision = number,
                        error = %store_error,
                        "failed to record the failed revision"
                    );
                }
                Err(error)
            }
        }
    }

    /// Computes all operations up front, so that invalid input is rejected before the cluster
    /// is touched.
    fn plan(
        previous: &IndexMap<ResourceId, Manifest>,
        desired: &[Manifest],
    ) -> Result<Plan, Error> {
        let mut plan = Plan::default();

        for stage in order::stages(desired.to_vec()).context(OrderResourcesSnafu)? {
            let operations = stage
                .iter()
                .map(|manifest| diff::diff(previous.get(manifest.id()), Some(manifest)))
                .collect::<Result<Vec<_>, _>>()
                .context(DiffSnafu)?;
            plan.stages.push(operations);
        }

        let desired_ids = desired.iter().map(Manifest::id).collect::<HashSet<_>>();
        let orphans = previous
            .values()
            .filter(|manifest| !desired_ids.contains(manifest.id()))
            .cloned()
            .collect::<Vec<_>>();

        // Instances go before their definitions, which deletes them in reverse order
        for stage in order::stages(orphans)
            .context(OrderResourcesSnafu)?
            .into_iter()
            .rev()
        {
            let operations = stage
                .iter()
                .rev()
                .map(|manifest| diff::diff(Some(manifest), None))
                .collect::<Result<Vec<_>, _>>()
                .context(DiffSnafu)?;
            plan.stages.push(operations);
        }

        Ok(plan)
    }

    async fn execute(
        &self,
        plan: &Plan,
        desired: &[Manifest],
        results: &mut Vec<AppliedResource>,
    ) -> Result<(), Error> {
        let applier = Applier::new(self.client.clone(), self.options.retry());

        for (index, stage) in plan.stages.iter().enumerate() {
            debug!(stage = index, operations = stage.len(), "applying stage");
            let applied = stream::iter(stage.iter().map(|operation| applier.apply(operation)))
                .buffered(self.options.max_concurrency.max(1))
                .collect::<Vec<_>>()
                .await;

            // Let the whole stage finish, but don't start the next one after a failure
            let mut failure = None;
            for (operation, result) in stage.iter().zip(applied) {
                match result {
                    Ok(applied) => results.push(applied),
                    Err(source) => {
                        failure.get_or_insert(Error::ApplyResource {
                            source,
                            id: operation.id().clone(),
                        });
                    }
                }
            }
            if let Some(error) = failure {
                return Err(error);
            }
        }

        if self.options.wait {
            let ids = desired
                .iter()
                .map(|manifest| manifest.id().clone())
                .collect::<Vec<_>>();
            ReadinessWaiter::new(self.client.clone(), self.options.poll_interval)
                .wait(&ids, self.options.timeout)
                .await
                .context(AwaitReadinessSnafu)?;
        }
        Ok(())
    }
}
