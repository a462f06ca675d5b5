//! Computes the [`Operation`] which moves a resource from its previous to its desired state.
//!
//! Both sides are compared without their server-managed fields (see
//! [`Manifest::comparable`]). Differences are expressed as RFC 7386 JSON merge patches: objects
//! are diffed recursively, arrays and scalars are replaced as a whole and keys missing from the
//! desired state are set to `null`.

use serde_json::{Map, Value};
use snafu::{Snafu, ensure};
use strum::IntoStaticStr;

use crate::manifest::{Manifest, ResourceId};

/// Top-level fields which identify a resource rather than describe it.
const IDENTITY_FIELDS: &[&str] = &["apiVersion", "kind"];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("neither a previous nor a desired manifest was given"))]
    NothingToCompare,

    #[snafu(display("cannot diff {previous} against {desired}"))]
    IdentityMismatch {
        previous: ResourceId,
        desired: ResourceId,
    },
}

/// A single step towards the desired state of one resource.
#[derive(Clone, Debug, Eq, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum Operation {
    Create {
        manifest: Manifest,
    },

    /// Carries the desired manifest as well, so that the patch can be turned into a create if the
    /// object has vanished in the meantime.
    Patch {
        manifest: Manifest,
        patch: Value,
    },

    Delete {
        id: ResourceId,
    },

    NoOp {
        manifest: Manifest,
    },
}

impl Operation {
    pub fn id(&self) -> &ResourceId {
        match self {
            Self::Create { manifest } | Self::Patch { manifest, .. } | Self::NoOp { manifest } => {
                manifest.id()
            }
            Self::Delete { id } => id,
        }
    }

    /// The desired manifest, which is absent for deletions.
    pub fn manifest(&self) -> Option<&Manifest> {
        match self {
            Self::Create { manifest } | Self::Patch { manifest, .. } | Self::NoOp { manifest } => {
                Some(manifest)
            }
            Self::Delete { .. } => None,
        }
    }

    pub fn verb(&self) -> &'static str {
        self.into()
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp { .. })
    }
}

/// Compares `previous` against `desired`.
///
/// Returns [`Error::NothingToCompare`] if both are absent, which is a bug in the caller.
pub fn diff(previous: Option<&Manifest>, desired: Option<&Manifest>) -> Result<Operation, Error> {
    match (previous, desired) {
        (None, None) => NothingToCompareSnafu.fail(),
        (None, Some(desired)) => Ok(Operation::Create {
            manifest: desired.clone(),
        }),
        (Some(previous), None) => Ok(Operation::Delete {
            id: previous.id().clone(),
        }),
        (Some(previous), Some(desired)) => {
            ensure!(previous.id() == desired.id(), IdentityMismatchSnafu {
                previous: previous.id().clone(),
                desired: desired.id().clone(),
            });

            let mut patch = merge_patch(&previous.comparable(), &desired.comparable());
            if let Some(Value::Object(fields)) = &mut patch {
                for field in IDENTITY_FIELDS {
                    fields.remove(*field);
                }
            }

            Ok(match patch {
                Some(Value::Object(fields)) if fields.is_empty() => Operation::NoOp {
                    manifest: desired.clone(),
                },
                None => Operation::NoOp {
                    manifest: desired.clone(),
                },
                Some(patch) => Operation::Patch {
                    manifest: desired.clone(),
                    patch,
                },
            })
        }
    }
}

/// Returns the merge patch transforming `previous` into `desired`, or [`None`] if they are equal.
///
/// An explicit `null` or empty collection in `desired` is sent as is, so that a field which is
/// cleared in the template is cleared in the cluster too.
pub fn merge_patch(previous: &Value, desired: &Value) -> Option<Value> {
    if previous == desired {
        return None;
    }

    let (Value::Object(previous), Value::Object(desired)) = (previous, desired) else {
        return Some(desired.clone());
    };

    let mut patch = Map::new();
    for key in previous.keys() {
        if !desired.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    for (key, value) in desired {
        match previous.get(key) {
            Some(previous) => {
                if let Some(field_patch) = merge_patch(previous, value) {
                    patch.insert(key.clone(), field_patch);
                }
            }
            None => {
                patch.insert(key.clone(), value.clone());
            }
        }
    }
    Some(Value::Object(patch))
}

/// Checks whether a live object already has the state `desired` asks for.
///
/// Only fields present in `desired` are looked at. The API server drops `null` fields and most
/// empty collections on write, so those match an absent live field.
pub fn is_satisfied_by(desired: &Manifest, live: &Manifest) -> bool {
    desired.id() == live.id() && contains(&desired.comparable(), Some(&live.comparable()))
}

fn contains(desired: &Value, live: Option<&Value>) -> bool {
    match (desired, live) {
        (Value::Object(desired), Some(Value::Object(live))) => desired
            .iter()
            .all(|(key, value)| contains(value, live.get(key))),
        (Value::Object(desired), None | Some(Value::Null)) => {
            desired.values().all(|value| contains(value, None))
        }
        (Value::Array(desired), Some(Value::Array(live))) => {
            desired.len() == live.len()
                && desired
                    .iter()
                    .zip(live)
                    .all(|(desired, live)| contains(desired, Some(live)))
        }
        (Value::Array(desired), None | Some(Value::Null)) => desired.is_empty(),
        (Value::Null, None | Some(Value::Null)) => true,
        (desired, Some(live)) => desired == live,
        (_, None) => false,
    }
}
