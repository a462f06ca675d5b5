//! Orders a batch of manifests so that every custom resource definition is applied before the
//! instances of the kind it defines.
//!
//! Apart from that one dependency, the input order is kept. The result is a list of stages: the
//! manifests of one stage don't depend on each other and may be applied concurrently.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use snafu::{ResultExt, Snafu, ensure};
use tracing::debug;

use crate::manifest::{Manifest, ResourceId};

const CRD_GROUP: &str = "apiextensions.k8s.io";
const CRD_KIND: &str = "CustomResourceDefinition";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse the custom resource definition {id}"))]
    ParseDefinition {
        source: serde_json::Error,
        id: ResourceId,
    },

    #[snafu(display("the custom resource definition {id} lacks its group, kind or plural name"))]
    IncompleteDefinition { id: ResourceId },

    #[snafu(display("the definitions of {resources} depend on each other"))]
    DefinitionCycle { resources: String },
}

/// The kind introduced by a custom resource definition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SchemaDefinition {
    /// The definition itself.
    pub id: ResourceId,
    pub group: String,
    pub kind: String,

    /// Lower-cased kind, plural, singular and short names, any of which may refer to the kind.
    pub aliases: Vec<String>,
    pub cluster_scoped: bool,
}

impl SchemaDefinition {
    pub fn is_definition(manifest: &Manifest) -> bool {
        manifest.group() == CRD_GROUP && manifest.kind() == CRD_KIND
    }

    /// Returns [`None`] if `manifest` is not a custom resource definition.
    pub fn from_manifest(manifest: &Manifest) -> Result<Option<Self>, Error> {
        if !Self::is_definition(manifest) {
            return Ok(None);
        }

        let crd: CustomResourceDefinition = serde_json::from_value(manifest.document().clone())
            .context(ParseDefinitionSnafu {
                id: manifest.id().clone(),
            })?;
        let names = crd.spec.names;
        ensure!(
            !crd.spec.group.is_empty() && !names.kind.is_empty() && !names.plural.is_empty(),
            IncompleteDefinitionSnafu {
                id: manifest.id().clone()
            }
        );

        let mut aliases = vec![names.kind.to_lowercase(), names.plural.to_lowercase()];
        aliases.extend(names.singular.map(|singular| singular.to_lowercase()));
        aliases.extend(
            names
                .short_names
                .into_iter()
                .flatten()
                .map(|short_name| short_name.to_lowercase()),
        );
        aliases.sort();
        aliases.dedup();

        Ok(Some(Self {
            id: manifest.id().clone(),
            group: crd.spec.group,
            kind: names.kind,
            aliases,
            cluster_scoped: crd.spec.scope == "Cluster",
        }))
    }

    /// Checks whether `manifest` is an instance of the defined kind.
    pub fn defines(&self, manifest: &Manifest) -> bool {
        manifest.group() == self.group && self.aliases.contains(&manifest.kind().to_lowercase())
    }
}

/// Collects the definitions contained in `manifests`.
pub fn definitions(manifests: &[Manifest]) -> Result<Vec<SchemaDefinition>, Error> {
    let mut definitions = Vec::new();
    for manifest in manifests {
        definitions.extend(SchemaDefinition::from_manifest(manifest)?);
    }
    Ok(definitions)
}

/// Splits `manifests` into stages, so that every manifest comes in a later stage than the
/// definition of its kind. Within a stage, the input order is kept.
pub fn stages(manifests: Vec<Manifest>) -> Result<Vec<Vec<Manifest>>, Error> {
    let definitions = definitions(&manifests)?;

    // dependencies[i] holds the indices of the definitions manifest i is an instance of
    let dependencies = manifests
        .iter()
        .map(|manifest| {
            definitions
                .iter()
                .filter(|definition| definition.defines(manifest))
                .filter_map(|definition| {
                    manifests
                        .iter()
                        .position(|candidate| candidate.id() == &definition.id)
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let mut stage_of: Vec<Option<usize>> = vec![None; manifests.len()];
    let mut stage_count = 0;
    while stage_of.iter().any(Option::is_none) {
        let ready = (0..manifests.len())
            .filter(|&index| stage_of[index].is_none())
            .filter(|&index| {
                dependencies[index].iter().all(|&dependency| {
                    stage_of[dependency].is_some_and(|stage| stage < stage_count)
                })
            })
            .collect::<Vec<_>>();

        if ready.is_empty() {
            let resources = manifests
                .iter()
                .zip(&stage_of)
                .filter(|(_, stage)| stage.is_none())
                .map(|(manifest, _)| manifest.id().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return DefinitionCycleSnafu { resources }.fail();
        }

        for index in ready {
            stage_of[index] = Some(stage_count);
        }
        stage_count += 1;
    }

    let mut stages = vec![Vec::new(); stage_count];
    for (manifest, stage) in manifests.into_iter().zip(stage_of) {
        if let Some(stage) = stage {
            stages[stage].push(manifest);
        }
    }
    debug!(stages = stages.len(), "ordered manifests");
    Ok(stages)
}

/// Returns `manifests` in an order in which they can be applied one after another.
pub fn order(manifests: Vec<Manifest>) -> Result<Vec<Manifest>, Error> {
    Ok(stages(manifests)?.into_iter().flatten().collect())
}
