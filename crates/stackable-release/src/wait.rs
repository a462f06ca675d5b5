//! Waits for applied resources to become ready.
//!
//! Readiness is decided per kind by [`readiness`]. The waiter polls all pending resources until
//! every one of them is ready or the timeout elapses. Nothing is rolled back on timeout.

use std::{sync::Arc, time::Duration};

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use serde::de::DeserializeOwned;
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, instrument, warn};

use crate::{
    cluster::{ClientError, ClusterClient},
    manifest::{Manifest, ResourceId},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "timed out after {timeout:?} waiting for {} to become ready",
        display_ids(pending)
    ))]
    Timeout {
        timeout: Duration,
        pending: Vec<ResourceId>,
    },

    #[snafu(display("failed to read {id} while waiting for it to become ready"))]
    ReadResource { source: ClientError, id: ResourceId },
}

fn display_ids(ids: &[ResourceId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Readiness {
    Ready,

    /// Not ready yet, with a human readable reason.
    NotReady(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

pub struct ReadinessWaiter<C: ?Sized> {
    client: Arc<C>,
    poll_interval: Duration,
}

impl<C: ClusterClient + ?Sized> ReadinessWaiter<C> {
    pub fn new(client: Arc<C>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// Polls until all of `ids` are ready.
    ///
    /// On timeout the returned [`Error::Timeout`] names the resources which never became ready.
    /// Dropping the returned future stops polling right away.
    #[instrument(skip(self, ids), fields(resources = ids.len()))]
    pub async fn wait(&self, ids: &[ResourceId], timeout: Duration) -> Result<(), Error> {
        let mut pending = ids.to_vec();
        let polled = tokio::time::timeout(timeout, self.poll(&mut pending)).await;
        match polled {
            Ok(result) => result,
            Err(_elapsed) => {
                warn!(pending = %display_ids(&pending), "resources did not become ready in time");
                TimeoutSnafu { timeout, pending }.fail()
            }
        }
    }

    /// Removes every id from `pending` as soon as it is confirmed to be ready.
    async fn poll(&self, pending: &mut Vec<ResourceId>) -> Result<(), Error> {
        loop {
            let mut index = 0;
            while index < pending.len() {
                let id = &pending[index];
                let read = self.client.get(id).await;
                match read {
                    Ok(live) => match readiness(&live) {
                        Readiness::Ready => {
                            debug!(resource.id = %id, "resource is ready");
                            pending.remove(index);
                            continue;
                        }
                        Readiness::NotReady(reason) => {
                            debug!(resource.id = %id, %reason, "resource is not ready yet");
                        }
                    },
                    Err(ClientError::NotFound { .. } | ClientError::UnknownKind { .. }) => {
                        debug!(resource.id = %id, "resource does not exist yet");
                    }
                    Err(error) if error.is_transient() => {
                        warn!(resource.id = %id, %error, "transient failure while polling");
                    }
                    Err(source) => {
                        return Err(source).context(ReadResourceSnafu { id: id.clone() });
                    }
                }
                index += 1;
            }

            if pending.is_empty() {
                info!("all resources are ready");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Decides whether a live object is ready, based on its kind.
///
/// Kinds without a notion of readiness are ready as long as they are not being deleted.
pub fn readiness(live: &Manifest) -> Readiness {
    if live.get("/metadata/deletionTimestamp").is_some_and(|ts| !ts.is_null()) {
        return Readiness::NotReady("marked for deletion".to_owned());
    }

    match (live.group(), live.kind()) {
        ("apiextensions.k8s.io", "CustomResourceDefinition") => {
            if has_condition(live, "Established") {
                Readiness::Ready
            } else {
                Readiness::NotReady("definition is not established".to_owned())
            }
        }
        ("apps", "Deployment") => typed(live, deployment_readiness),
        ("apps", "StatefulSet") => typed(live, statefulset_readiness),
        ("apps", "DaemonSet") => typed(live, daemonset_readiness),
        ("", "PersistentVolumeClaim") => {
            match live.get("/status/phase").and_then(Value::as_str) {
                Some("Bound") => Readiness::Ready,
                phase => Readiness::NotReady(format!(
                    "claim is in phase {}",
                    phase.unwrap_or("unknown")
                )),
            }
        }
        ("batch", "Job") => {
            let succeeded = live
                .get("/status/succeeded")
                .and_then(Value::as_i64)
                .unwrap_or_default();
            if succeeded >= 1 || has_condition(live, "Complete") {
                Readiness::Ready
            } else {
                Readiness::NotReady("job has not completed".to_owned())
            }
        }
        _ => Readiness::Ready,
    }
}

fn has_condition(live: &Manifest, condition_type: &str) -> bool {
    live.get("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|condition| {
                condition.get("type").and_then(Value::as_str) == Some(condition_type)
                    && condition.get("status").and_then(Value::as_str) == Some("True")
            })
        })
}

fn typed<K: DeserializeOwned>(live: &Manifest, check: fn(&K) -> Readiness) -> Readiness {
    match serde_json::from_value::<K>(live.document().clone()) {
        Ok(object) => check(&object),
        Err(error) => Readiness::NotReady(format!("object cannot be interpreted: {error}")),
    }
}

fn unobserved_generation(
    generation: Option<i64>,
    observed_generation: Option<i64>,
) -> Option<Readiness> {
    (generation != observed_generation).then(|| {
        Readiness::NotReady(format!(
            "generation {generation:?} not yet observed by the controller, \
             last seen was {observed_generation:?}"
        ))
    })
}

fn deployment_readiness(deployment: &Deployment) -> Readiness {
    let status = deployment.status.clone().unwrap_or_default();
    if let Some(not_ready) =
        unobserved_generation(deployment.metadata.generation, status.observed_generation)
    {
        return not_ready;
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or_default();
    let available = status.available_replicas.unwrap_or_default();
    if updated != desired {
        Readiness::NotReady(format!("only {updated} out of {desired} replicas are updated"))
    } else if available < desired {
        Readiness::NotReady(format!("only {available} out of {desired} replicas are available"))
    } else {
        Readiness::Ready
    }
}

fn statefulset_readiness(statefulset: &StatefulSet) -> Readiness {
    let status = statefulset.status.clone().unwrap_or_default();
    if let Some(not_ready) =
        unobserved_generation(statefulset.metadata.generation, status.observed_generation)
    {
        return not_ready;
    }

    let total = status.replicas;
    let updated = status.updated_replicas.unwrap_or_default();
    if total == updated {
        Readiness::Ready
    } else {
        Readiness::NotReady(format!("only {updated} out of {total} replicas are updated"))
    }
}

fn daemonset_readiness(daemonset: &DaemonSet) -> Readiness {
    let status = daemonset.status.clone().unwrap_or_default();
    if let Some(not_ready) =
        unobserved_generation(daemonset.metadata.generation, status.observed_generation)
    {
        return not_ready;
    }

    if status.number_ready == status.desired_number_scheduled {
        Readiness::Ready
    } else {
        Readiness::NotReady(format!(
            "only {} out of {} pods are ready",
            status.number_ready, status.desired_number_scheduled
        ))
    }
}
