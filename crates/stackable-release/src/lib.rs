//! Idempotent install and upgrade of releases, i.e. sets of rendered Kubernetes manifests.
//!
//! The [`reconciler::ReleaseReconciler`] is the entry point. It talks to the cluster through a
//! [`cluster::ClusterClient`] and keeps the release history in a [`store::ReleaseStore`]. Both
//! come with an in-memory implementation, the cluster additionally with one backed by [`kube`].
//!
//! Re-applying the manifests a release is already at is guaranteed to be a no-op, including
//! custom resource definitions installed together with their instances and fields explicitly set
//! to `null` or empty collections.

pub mod apply;
pub mod cluster;
pub mod diff;
pub mod logging;
pub mod manifest;
pub mod order;
pub mod reconciler;
pub mod retry;
pub mod store;
pub mod wait;

pub use crate::{
    manifest::{Manifest, ResourceId},
    reconciler::{ReleaseOptions, ReleaseReconciler, ReleaseReport},
};
