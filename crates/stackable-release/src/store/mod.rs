//! The history of releases, as a sequence of immutable revisions per release name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use strum::{Display, EnumString};

use crate::manifest::Manifest;

pub mod memory;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display(
        "release {name:?} moved on concurrently: \
         expected latest revision {expected:?}, found {actual:?}"
    ))]
    RevisionConflict {
        name: String,
        expected: Option<u32>,
        actual: Option<u32>,
    },

    #[snafu(display("revision {number} of release {name:?} does not follow revision {latest:?}"))]
    NonSequentialRevision {
        name: String,
        number: u32,
        latest: Option<u32>,
    },

    #[snafu(display("revision of release {found:?} cannot be stored as part of release {name:?}"))]
    NameMismatch { name: String, found: String },
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ReleaseStatus {
    PendingInstall,
    PendingUpgrade,
    Deployed,
    Failed,
    Superseded,
}

impl ReleaseStatus {
    /// Returns `true` while an install or upgrade is in flight.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::PendingInstall | Self::PendingUpgrade)
    }
}

/// One revision of a release.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub name: String,

    /// Starts at 1 and increases by one with every install or upgrade.
    pub number: u32,
    pub status: ReleaseStatus,

    /// The desired manifests of this revision, which the next upgrade is diffed against.
    pub resources: Vec<Manifest>,

    /// The objects as reported by the cluster after they were applied.
    #[serde(default)]
    pub observed: Vec<Manifest>,

    pub timestamp: jiff::Timestamp,

    /// Why the revision failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Persists release revisions.
///
/// Implementations must reject an [`append`](ReleaseStore::append) whose expected prior revision
/// is not the latest one anymore, so that concurrent writers cannot overwrite each other.
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Returns the revision with the highest number, regardless of its status.
    async fn latest(&self, name: &str) -> Result<Option<Revision>, Error>;

    /// Returns all revisions in ascending order.
    async fn history(&self, name: &str) -> Result<Vec<Revision>, Error>;

    /// Stores `revision` if the latest stored revision of `name` is still `expected_prior`
    /// ([`None`] meaning that the release must not exist yet).
    async fn append(
        &self,
        name: &str,
        revision: Revision,
        expected_prior: Option<u32>,
    ) -> Result<(), Error>;
}
