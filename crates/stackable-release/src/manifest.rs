//! Generic representation of rendered Kubernetes manifests.
//!
//! Manifests are kept as untyped JSON documents instead of per-kind structs, because a release can
//! contain kinds the engine has no compiled type for (custom resources in particular). A
//! [`Manifest`] is always validated on construction: it carries an `apiVersion`, a `kind` and a
//! `metadata.name`, from which its [`ResourceId`] is derived.

use std::{
    collections::HashSet,
    fmt::{self, Display, Formatter},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu, ensure};

/// Metadata fields which are owned by the API server and never part of a desired state.
const SERVER_MANAGED_METADATA: &[&str] = &[
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "managedFields",
    "selfLink",
];

/// Built-in kinds which are not namespaced, keyed by `(group, kind)`.
const CLUSTER_SCOPED_KINDS: &[(&str, &str)] = &[
    ("", "Namespace"),
    ("", "Node"),
    ("", "PersistentVolume"),
    ("admissionregistration.k8s.io", "MutatingWebhookConfiguration"),
    ("admissionregistration.k8s.io", "ValidatingWebhookConfiguration"),
    ("apiextensions.k8s.io", "CustomResourceDefinition"),
    ("apiregistration.k8s.io", "APIService"),
    ("networking.k8s.io", "IngressClass"),
    ("node.k8s.io", "RuntimeClass"),
    ("rbac.authorization.k8s.io", "ClusterRole"),
    ("rbac.authorization.k8s.io", "ClusterRoleBinding"),
    ("scheduling.k8s.io", "PriorityClass"),
    ("storage.k8s.io", "CSIDriver"),
    ("storage.k8s.io", "StorageClass"),
];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("manifest must be a mapping, found {found}"))]
    NotAnObject { found: &'static str },

    #[snafu(display("manifest is missing the required field {field:?}"))]
    MissingField { field: &'static str },

    #[snafu(display("manifest field {field:?} must be a non-empty string"))]
    InvalidField { field: &'static str },

    #[snafu(display("apiVersion {api_version:?} is not of the form [<group>/]<version>"))]
    InvalidApiVersion { api_version: String },

    #[snafu(display("failed to parse YAML document #{index}"))]
    ParseYaml {
        source: serde_yaml::Error,
        index: usize,
    },
}

/// Uniquely identifies an object within a release.
///
/// The namespace is [`None`] for cluster-scoped kinds, such as cluster roles, webhook
/// configurations or custom resource definitions.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct ResourceId {
    pub group: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.map(ToOwned::to_owned),
            name: name.into(),
        }
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if !self.group.is_empty() {
            write!(f, ".{}", self.group)?;
        }
        write!(f, "/{}", self.name)?;
        if let Some(namespace) = &self.namespace {
            write!(f, ".{namespace}")?;
        }
        Ok(())
    }
}

/// A single rendered object, represented as a generic document.
///
/// Fields explicitly set to `null` or to an empty collection are preserved as such. They are
/// semantically different from an absent field and are never dropped by this type.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Manifest {
    id: ResourceId,
    api_version: String,
    document: Value,
}

impl Manifest {
    /// Parses a multi-document YAML stream, as emitted by the template renderer.
    ///
    /// Empty documents (for example a leading `---`) are skipped.
    pub fn from_yaml_stream(input: &str) -> Result<Vec<Self>, Error> {
        let mut manifests = Vec::new();
        for (index, document) in serde_yaml::Deserializer::from_str(input).enumerate() {
            let value = Value::deserialize(document).context(ParseYamlSnafu { index })?;
            if value.is_null() {
                continue;
            }
            manifests.push(Self::try_from(value)?);
        }
        Ok(manifests)
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    /// The version part of `apiVersion`, e.g. `v1` for both `v1` and `apps/v1`.
    pub fn version(&self) -> &str {
        self.api_version
            .rsplit_once('/')
            .map_or(self.api_version.as_str(), |(_, version)| version)
    }

    pub fn group(&self) -> &str {
        &self.id.group
    }

    pub fn kind(&self) -> &str {
        &self.id.kind
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.id.namespace.as_deref()
    }

    /// The complete document, including `apiVersion`, `kind` and `metadata`.
    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn into_document(self) -> Value {
        self.document
    }

    /// Looks up a value by JSON pointer, e.g. `/spec/names/kind`.
    pub fn get(&self, pointer: &str) -> Option<&Value> {
        self.document.pointer(pointer)
    }

    /// Returns the document without any server-managed fields.
    ///
    /// This is the view used whenever two manifests are compared: the `status` subtree and
    /// metadata such as `uid` or `resourceVersion` never count as a difference.
    pub fn comparable(&self) -> Value {
        strip_server_managed(&self.document)
    }

    /// Places the manifest in `namespace`, or makes it cluster-scoped if [`None`] is given.
    pub fn with_namespace(mut self, namespace: Option<&str>) -> Self {
        if let Some(metadata) = self
            .document
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
        {
            match namespace {
                Some(namespace) => {
                    metadata.insert("namespace".to_owned(), Value::from(namespace));
                }
                None => {
                    metadata.remove("namespace");
                }
            }
        }
        self.id.namespace = namespace.map(ToOwned::to_owned);
        self
    }

    /// Sets the namespace according to the scope of the manifest's kind.
    ///
    /// Namespaced manifests without a namespace are moved into `default_namespace`, cluster-scoped
    /// ones lose any namespace the template may have set.
    pub fn scoped(self, scopes: &ScopeTable, default_namespace: &str) -> Self {
        if scopes.is_cluster_scoped(self.group(), self.kind()) {
            self.with_namespace(None)
        } else if self.namespace().is_none() {
            self.with_namespace(Some(default_namespace))
        } else {
            self
        }
    }
}

impl TryFrom<Value> for Manifest {
    type Error = Error;

    fn try_from(document: Value) -> Result<Self, Self::Error> {
        let object = match &document {
            Value::Object(object) => object,
            other => return NotAnObjectSnafu { found: json_type(other) }.fail(),
        };

        let api_version = required_string(object.get("apiVersion"), "apiVersion")?;
        let kind = required_string(object.get("kind"), "kind")?;
        let metadata = object
            .get("metadata")
            .context(MissingFieldSnafu { field: "metadata" })?;
        let name = required_string(metadata.get("name"), "metadata.name")?;
        let namespace = match metadata.get("namespace") {
            None | Some(Value::Null) => None,
            Some(Value::String(namespace)) if namespace.is_empty() => None,
            Some(Value::String(namespace)) => Some(namespace.as_str()),
            Some(_) => {
                return InvalidFieldSnafu {
                    field: "metadata.namespace",
                }
                .fail();
            }
        };

        let group = api_group(api_version).context(InvalidApiVersionSnafu { api_version })?;

        Ok(Self {
            id: ResourceId::new(group, kind, namespace, name),
            api_version: api_version.to_owned(),
            document,
        })
    }
}

impl From<Manifest> for Value {
    fn from(manifest: Manifest) -> Self {
        manifest.document
    }
}

/// Knows which `(group, kind)` pairs are cluster-scoped.
///
/// Starts out with the well-known built-in kinds. Kinds introduced by custom resource definitions
/// with `scope: Cluster` are added with [`ScopeTable::insert_cluster_scoped`].
#[derive(Clone, Debug)]
pub struct ScopeTable {
    cluster_scoped: HashSet<(String, String)>,
}

impl Default for ScopeTable {
    fn default() -> Self {
        Self {
            cluster_scoped: CLUSTER_SCOPED_KINDS
                .iter()
                .map(|(group, kind)| ((*group).to_owned(), (*kind).to_owned()))
                .collect(),
        }
    }
}

impl ScopeTable {
    pub fn insert_cluster_scoped(&mut self, group: impl Into<String>, kind: impl Into<String>) {
        self.cluster_scoped.insert((group.into(), kind.into()));
    }

    pub fn is_cluster_scoped(&self, group: &str, kind: &str) -> bool {
        self.cluster_scoped
            .contains(&(group.to_owned(), kind.to_owned()))
    }
}

/// Removes the `status` subtree and all server-managed metadata from a document.
pub fn strip_server_managed(document: &Value) -> Value {
    let mut document = document.clone();
    if let Some(object) = document.as_object_mut() {
        object.remove("status");
        if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in SERVER_MANAGED_METADATA {
                metadata.remove(*field);
            }
        }
    }
    document
}

fn required_string<'a>(value: Option<&'a Value>, field: &'static str) -> Result<&'a str, Error> {
    match value {
        None | Some(Value::Null) => MissingFieldSnafu { field }.fail(),
        Some(Value::String(value)) => {
            ensure!(!value.is_empty(), InvalidFieldSnafu { field });
            Ok(value.as_str())
        }
        Some(_) => InvalidFieldSnafu { field }.fail(),
    }
}

/// Extracts the group from an `apiVersion`, which is the empty string for the core group (`v1`).
fn api_group(api_version: &str) -> Option<&str> {
    let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
    let valid = !version.is_empty()
        && !version.contains('/')
        && (group.is_empty() == !api_version.contains('/'));
    valid.then_some(group)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}
