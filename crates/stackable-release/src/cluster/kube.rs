use ::kube::{
    Api, Client,
    api::{DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams, PostParams},
    discovery::{Discovery, Scope},
};
use async_trait::async_trait;
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::{
    cluster::{ClientError, ClusterClient},
    manifest::{Manifest, ResourceId},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to discover the resources served by the cluster"))]
    Discover { source: ::kube::Error },
}

/// A [`ClusterClient`] backed by a Kubernetes API server.
///
/// Objects are handled as [`DynamicObject`]s. Their API resource is resolved through API
/// discovery, which is refreshed once whenever a kind is unknown. This is needed for custom
/// resources whose definition has been created earlier in the same release operation.
pub struct KubeClusterClient {
    client: Client,
    discovery: RwLock<Discovery>,
    post_params: PostParams,
    patch_params: PatchParams,
    delete_params: DeleteParams,
}

impl KubeClusterClient {
    pub async fn new(client: Client, field_manager: &str) -> Result<Self, Error> {
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .context(DiscoverSnafu)?;

        Ok(Self {
            client,
            discovery: RwLock::new(discovery),
            post_params: PostParams {
                field_manager: Some(field_manager.to_owned()),
                ..PostParams::default()
            },
            patch_params: PatchParams {
                field_manager: Some(field_manager.to_owned()),
                ..PatchParams::default()
            },
            delete_params: DeleteParams::default(),
        })
    }

    /// Returns the [`Api`] serving `id`, refreshing the discovery cache once if needed.
    ///
    /// Writes must go to the version the object is written for, reads may use the preferred one.
    async fn api(
        &self,
        id: &ResourceId,
        gvk: Option<&GroupVersionKind>,
    ) -> Result<Api<DynamicObject>, ClientError> {
        if let Some(api) = self.resolve(id, gvk).await {
            return Ok(api);
        }

        debug!(resource.id = %id, "kind not served yet, refreshing discovery");
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|error| classify(id, error))?;
        *self.discovery.write().await = discovery;

        self.resolve(id, gvk)
            .await
            .ok_or_else(|| ClientError::UnknownKind { id: id.clone() })
    }

    async fn resolve(
        &self,
        id: &ResourceId,
        gvk: Option<&GroupVersionKind>,
    ) -> Option<Api<DynamicObject>> {
        let discovery = self.discovery.read().await;
        let (resource, capabilities) = match gvk {
            Some(gvk) => discovery.resolve_gvk(gvk)?,
            None => discovery.get(&id.group)?.recommended_kind(&id.kind)?,
        };

        Some(match (&capabilities.scope, &id.namespace) {
            (Scope::Namespaced, Some(namespace)) => {
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        })
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    #[instrument(skip(self), fields(resource.id = %id))]
    async fn get(&self, id: &ResourceId) -> Result<Manifest, ClientError> {
        let object = self
            .api(id, None)
            .await?
            .get(&id.name)
            .await
            .map_err(|error| classify(id, error))?;
        to_manifest(id, object)
    }

    #[instrument(skip_all, fields(resource.id = %manifest.id()))]
    async fn create(&self, manifest: &Manifest) -> Result<Manifest, ClientError> {
        let id = manifest.id();
        let object: DynamicObject =
            serde_json::from_value(manifest.document().clone()).map_err(|error| {
                ClientError::Conversion {
                    id: id.clone(),
                    message: error.to_string(),
                }
            })?;
        let created = self
            .api(id, Some(&group_version_kind(manifest)))
            .await?
            .create(&self.post_params, &object)
            .await
            .map_err(|error| classify(id, error))?;
        to_manifest(id, created)
    }

    #[instrument(skip_all, fields(resource.id = %manifest.id()))]
    async fn patch(&self, manifest: &Manifest, patch: &Value) -> Result<Manifest, ClientError> {
        let id = manifest.id();
        let patched = self
            .api(id, Some(&group_version_kind(manifest)))
            .await?
            .patch(&id.name, &self.patch_params, &Patch::Merge(patch))
            .await
            .map_err(|error| classify(id, error))?;
        to_manifest(id, patched)
    }

    #[instrument(skip(self), fields(resource.id = %id))]
    async fn delete(&self, id: &ResourceId) -> Result<(), ClientError> {
        self.api(id, None)
            .await?
            .delete(&id.name, &self.delete_params)
            .await
            .map_err(|error| classify(id, error))?;
        Ok(())
    }
}

fn group_version_kind(manifest: &Manifest) -> GroupVersionKind {
    GroupVersionKind::gvk(manifest.group(), manifest.version(), manifest.kind())
}

fn to_manifest(id: &ResourceId, object: DynamicObject) -> Result<Manifest, ClientError> {
    serde_json::to_value(object)
        .map_err(|error| error.to_string())
        .and_then(|document| Manifest::try_from(document).map_err(|error| error.to_string()))
        .map_err(|message| ClientError::Conversion {
            id: id.clone(),
            message,
        })
}

/// Maps errors reported by the API server onto the [`ClientError`] taxonomy.
///
/// Errors which never reached the API server (connection resets, timeouts, TLS hiccups) are
/// considered transient.
fn classify(id: &ResourceId, error: ::kube::Error) -> ClientError {
    let id = id.clone();
    match error {
        ::kube::Error::Api(status) => match status.code {
            404 => ClientError::NotFound { id },
            409 if status.reason == "AlreadyExists" => ClientError::AlreadyExists { id },
            429 | 500..=599 => ClientError::Transient {
                id,
                message: status.message.clone(),
            },
            code => ClientError::Rejected {
                id,
                code,
                message: status.message.clone(),
            },
        },
        other => ClientError::Transient {
            id,
            message: other.to_string(),
        },
    }
}
