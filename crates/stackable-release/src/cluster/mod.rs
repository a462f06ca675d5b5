//! The capability of reading and mutating objects in a cluster.
//!
//! The engine never talks to the Kubernetes API directly but through a [`ClusterClient`]. The
//! [`kube`] module contains the implementation backed by a real API server, [`memory`] an
//! in-memory cluster with API-server-like semantics which is used for tests and dry runs.

use async_trait::async_trait;
use serde_json::Value;
use snafu::Snafu;

use crate::manifest::{Manifest, ResourceId};

pub mod kube;
pub mod memory;

/// Errors returned by a [`ClusterClient`].
///
/// The variants distinguish between outcomes the engine can interpret (an object being absent or
/// already present), failures which may go away when retried, and permanent rejections.
#[derive(Clone, Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClientError {
    #[snafu(display("{id} does not exist"))]
    NotFound { id: ResourceId },

    #[snafu(display("{id} already exists"))]
    AlreadyExists { id: ResourceId },

    #[snafu(display("the cluster does not serve the kind of {id}"))]
    UnknownKind { id: ResourceId },

    #[snafu(display("transient failure while accessing {id}: {message}"))]
    Transient { id: ResourceId, message: String },

    #[snafu(display("request for {id} was rejected with status {code}: {message}"))]
    Rejected {
        id: ResourceId,
        code: u16,
        message: String,
    },

    #[snafu(display("failed to convert {id}: {message}"))]
    Conversion { id: ResourceId, message: String },
}

impl ClientError {
    /// Returns `true` for network-class and server-side (5xx, 429) failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Access to the objects of a cluster, addressed by [`ResourceId`].
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Retrieves the live object.
    async fn get(&self, id: &ResourceId) -> Result<Manifest, ClientError>;

    /// Creates the object and returns it as stored by the cluster.
    async fn create(&self, manifest: &Manifest) -> Result<Manifest, ClientError>;

    /// Applies an RFC 7386 JSON merge patch to the existing object of `manifest`.
    ///
    /// The patch is sent to the API version `manifest` is written for.
    async fn patch(&self, manifest: &Manifest, patch: &Value) -> Result<Manifest, ClientError>;

    async fn delete(&self, id: &ResourceId) -> Result<(), ClientError>;
}
