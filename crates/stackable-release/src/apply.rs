//! Executes a single [`Operation`] against a [`ClusterClient`].
//!
//! The applier is where the cluster's view and the release's view meet, so it interprets the
//! outcomes which are not failures in the context of a release: an object which already exists
//! with the desired state is adopted, a patch against a vanished object becomes a create and a
//! delete of an absent object is a success.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use strum::{Display, IntoStaticStr};
use tracing::{debug, info, instrument, warn};

use crate::{
    cluster::{ClientError, ClusterClient},
    diff::{self, Operation},
    manifest::{Manifest, ResourceId},
    retry::{RetryConfig, retry_transient},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{id} already exists with a state diverging from the desired one"))]
    Conflict { id: ResourceId },

    #[snafu(display("the cluster rejected the request for {id}"))]
    Rejected { source: ClientError, id: ResourceId },

    #[snafu(display("gave up on {id} after {attempts} attempts"))]
    RetriesExhausted {
        source: ClientError,
        id: ResourceId,
        attempts: u32,
    },
}

/// What the applier ended up doing for one resource.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, IntoStaticStr, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Outcome {
    Created,

    /// The object existed already and matched the desired state.
    Adopted,

    Patched,

    /// The object was expected to exist but was gone, so it was created again.
    Recreated,

    Deleted,
    AlreadyAbsent,
    Unchanged,
}

impl Outcome {
    /// Returns `true` if the cluster was changed.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Self::Created | Self::Patched | Self::Recreated | Self::Deleted
        )
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedResource {
    pub id: ResourceId,
    pub outcome: Outcome,

    /// The object as last reported by the cluster, [`None`] after deletions.
    pub observed: Option<Manifest>,
}

pub struct Applier<C: ?Sized> {
    client: Arc<C>,
    retry: RetryConfig,
}

impl<C: ClusterClient + ?Sized> Applier<C> {
    pub fn new(client: Arc<C>, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    #[instrument(skip_all, fields(resource.id = %operation.id(), operation = operation.verb()))]
    pub async fn apply(&self, operation: &Operation) -> Result<AppliedResource, Error> {
        let id = operation.id().clone();
        let (outcome, observed) = match operation {
            Operation::Create { manifest } => self.create(manifest).await?,
            Operation::Patch { manifest, patch } => {
                match self.call("patch", || self.client.patch(manifest, patch)).await {
                    Ok(observed) => (Outcome::Patched, Some(observed)),
                    Err(error) if error.is_not_found() => {
                        info!("object vanished since the previous revision, creating it again");
                        self.recreate(manifest).await?
                    }
                    Err(error) => return Err(self.failure(&id, error)),
                }
            }
            Operation::Delete { .. } => {
                match self.call("delete", || self.client.delete(&id)).await {
                    Ok(()) => (Outcome::Deleted, None),
                    Err(ClientError::NotFound { .. } | ClientError::UnknownKind { .. }) => {
                        debug!("object is already absent");
                        (Outcome::AlreadyAbsent, None)
                    }
                    Err(error) => return Err(self.failure(&id, error)),
                }
            }
            Operation::NoOp { manifest } => {
                match self.call("get", || self.client.get(&id)).await {
                    Ok(observed) => (Outcome::Unchanged, Some(observed)),
                    Err(error) if error.is_not_found() => {
                        info!("unchanged object is missing from the cluster, creating it again");
                        self.recreate(manifest).await?
                    }
                    Err(error) => return Err(self.failure(&id, error)),
                }
            }
        };

        debug!(%outcome, "applied operation");
        Ok(AppliedResource {
            id,
            outcome,
            observed,
        })
    }

    async fn create(&self, manifest: &Manifest) -> Result<(Outcome, Option<Manifest>), Error> {
        let id = manifest.id();
        match self.call("create", || self.client.create(manifest)).await {
            Ok(observed) => Ok((Outcome::Created, Some(observed))),
            Err(ClientError::AlreadyExists { .. }) => {
                let live = self
                    .call("get", || self.client.get(id))
                    .await
                    .map_err(|error| self.failure(id, error))?;
                if diff::is_satisfied_by(manifest, &live) {
                    debug!("adopting existing object");
                    Ok((Outcome::Adopted, Some(live)))
                } else {
                    warn!("existing object diverges from the desired state");
                    ConflictSnafu { id: id.clone() }.fail()
                }
            }
            Err(error) => Err(self.failure(id, error)),
        }
    }

    async fn recreate(&self, manifest: &Manifest) -> Result<(Outcome, Option<Manifest>), Error> {
        let (outcome, observed) = self.create(manifest).await?;
        let outcome = match outcome {
            Outcome::Created => Outcome::Recreated,
            other => other,
        };
        Ok((outcome, observed))
    }

    async fn call<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        retry_transient(&self.retry, operation_name, operation).await
    }

    fn failure(&self, id: &ResourceId, error: ClientError) -> Error {
        if error.is_transient() {
            Error::RetriesExhausted {
                source: error,
                id: id.clone(),
                attempts: self.retry.attempts(),
            }
        } else {
            Error::Rejected {
                source: error,
                id: id.clone(),
            }
        }
    }
}
