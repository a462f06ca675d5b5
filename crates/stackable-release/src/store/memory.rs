use std::collections::HashMap;

use async_trait::async_trait;
use snafu::ensure;
use tokio::sync::RwLock;
use tracing::debug;

use crate::store::{
    NameMismatchSnafu, NonSequentialRevisionSnafu, ReleaseStatus, ReleaseStore,
    RevisionConflictSnafu, Revision,
};

/// A [`ReleaseStore`] which keeps all revisions in memory, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryReleaseStore {
    releases: RwLock<HashMap<String, Vec<Revision>>>,
}

impl MemoryReleaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReleaseStore for MemoryReleaseStore {
    async fn latest(&self, name: &str) -> Result<Option<Revision>, super::Error> {
        Ok(self
            .releases
            .read()
            .await
            .get(name)
            .and_then(|revisions| revisions.last())
            .cloned())
    }

    async fn history(&self, name: &str) -> Result<Vec<Revision>, super::Error> {
        Ok(self
            .releases
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(
        &self,
        name: &str,
        revision: Revision,
        expected_prior: Option<u32>,
    ) -> Result<(), super::Error> {
        ensure!(revision.name == name, NameMismatchSnafu {
            name,
            found: revision.name.clone(),
        });

        let mut releases = self.releases.write().await;
        let revisions = releases.entry(name.to_owned()).or_default();
        let latest = revisions.last().map(|revision| revision.number);
        ensure!(latest == expected_prior, RevisionConflictSnafu {
            name,
            expected: expected_prior,
            actual: latest,
        });
        ensure!(
            revision.number == latest.unwrap_or_default() + 1,
            NonSequentialRevisionSnafu {
                name,
                number: revision.number,
                latest,
            }
        );

        if revision.status == ReleaseStatus::Deployed {
            for earlier in revisions
                .iter_mut()
                .filter(|earlier| earlier.status == ReleaseStatus::Deployed)
            {
                earlier.status = ReleaseStatus::Superseded;
            }
        }

        debug!(
            release.name = name,
            revision = revision.number,
            status = %revision.status,
            "stored revision"
        );
        revisions.push(revision);
        Ok(())
    }
}
