//! An in-memory [`ClusterClient`] which mimics the behaviour of a Kubernetes API server closely
//! enough to exercise the release engine without a real cluster.
//!
//! It assigns server-managed metadata, prunes `null` fields on write, applies merge patches,
//! registers custom resource definitions (instances of unregistered custom kinds are rejected) and
//! reports them as established right away. Every request is recorded in a journal, and faults can
//! be injected per object.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;

use crate::{
    cluster::{ClientError, ClusterClient},
    manifest::{Manifest, ResourceId},
};

/// API groups served without a custom resource definition.
const BUILT_IN_GROUPS: &[&str] = &[
    "",
    "admissionregistration.k8s.io",
    "apiextensions.k8s.io",
    "apiregistration.k8s.io",
    "apps",
    "autoscaling",
    "batch",
    "certificates.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
    "networking.k8s.io",
    "node.k8s.io",
    "policy",
    "rbac.authorization.k8s.io",
    "scheduling.k8s.io",
    "storage.k8s.io",
];

/// A request received by a [`MemoryCluster`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClusterCall {
    Get(ResourceId),
    Create(ResourceId),
    Patch(ResourceId, Value),
    Delete(ResourceId),
}

impl ClusterCall {
    pub fn id(&self) -> &ResourceId {
        match self {
            Self::Get(id) | Self::Create(id) | Self::Patch(id, _) | Self::Delete(id) => id,
        }
    }

    /// Returns `true` for every request which may change the cluster.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Get(_))
    }
}

#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceId, Value>,
    /// Custom kinds keyed by `(group, kind)`, pointing at the definition which registered them.
    custom_kinds: BTreeMap<(String, String), ResourceId>,
    journal: Vec<ClusterCall>,
    faults: HashMap<ResourceId, VecDeque<ClientError>>,
    last_uid: u64,
    last_resource_version: u64,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all requests received so far, in order.
    pub async fn calls(&self) -> Vec<ClusterCall> {
        self.state.lock().await.journal.clone()
    }

    /// Returns all requests received so far which may have changed the cluster.
    pub async fn mutations(&self) -> Vec<ClusterCall> {
        self.state
            .lock()
            .await
            .journal
            .iter()
            .filter(|call| call.is_mutation())
            .cloned()
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.journal.clear();
    }

    /// Returns the stored object, including all server-managed fields.
    pub async fn object(&self, id: &ResourceId) -> Option<Value> {
        self.state.lock().await.objects.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.objects.is_empty()
    }

    /// Lets the next request for `id` fail with `error`. Faults queue up in injection order.
    pub async fn inject_fault(&self, id: ResourceId, error: ClientError) {
        self.state
            .lock()
            .await
            .faults
            .entry(id)
            .or_default()
            .push_back(error);
    }

    /// Deletes an object behind the back of the engine, without recording a request.
    pub async fn remove_out_of_band(&self, id: &ResourceId) -> Option<Value> {
        let mut state = self.state.lock().await;
        let removed = state.objects.remove(id);
        state.unregister(id);
        removed
    }

    /// Replaces the `status` subtree of an object, as a controller would.
    pub async fn set_status(&self, id: &ResourceId, status: Value) -> bool {
        let mut state = self.state.lock().await;
        let resource_version = state.next_resource_version();
        match state.objects.get_mut(id).and_then(Value::as_object_mut) {
            Some(object) => {
                object.insert("status".to_owned(), status);
                set_metadata(object, [("resourceVersion", resource_version.into())]);
                true
            }
            None => false,
        }
    }

    /// Marks an object as being deleted, as the API server does while finalizers are pending.
    pub async fn mark_for_deletion(&self, id: &ResourceId) -> bool {
        let mut state = self.state.lock().await;
        match state.objects.get_mut(id).and_then(Value::as_object_mut) {
            Some(object) => {
                set_metadata(object, [(
                    "deletionTimestamp",
                    jiff::Timestamp::now().to_string().into(),
                )]);
                true
            }
            None => false,
        }
    }
}

impl State {
    fn begin(&mut self, call: ClusterCall) -> Result<(), ClientError> {
        let id = call.id().clone();
        self.journal.push(call);

        if let Some(error) = self.faults.get_mut(&id).and_then(VecDeque::pop_front) {
            return Err(error);
        }

        let served = BUILT_IN_GROUPS.contains(&id.group.as_str())
            || self
                .custom_kinds
                .contains_key(&(id.group.clone(), id.kind.clone()));
        if served {
            Ok(())
        } else {
            Err(ClientError::UnknownKind { id })
        }
    }

    fn next_resource_version(&mut self) -> String {
        self.last_resource_version += 1;
        self.last_resource_version.to_string()
    }

    fn stored(&self, id: &ResourceId) -> Result<Manifest, ClientError> {
        let object = self
            .objects
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound { id: id.clone() })?;
        Manifest::try_from(object).map_err(|error| ClientError::Conversion {
            id: id.clone(),
            message: error.to_string(),
        })
    }

    /// Registers (or re-registers) the kind defined by a stored custom resource definition.
    fn register(&mut self, id: &ResourceId) {
        self.forget_kinds(id);
        let Some(object) = self.objects.get_mut(id) else {
            return;
        };
        if id.group != "apiextensions.k8s.io" || id.kind != "CustomResourceDefinition" {
            return;
        }

        let group = object.pointer("/spec/group").and_then(Value::as_str);
        let kind = object.pointer("/spec/names/kind").and_then(Value::as_str);
        if let (Some(group), Some(kind)) = (group, kind) {
            let key = (group.to_owned(), kind.to_owned());
            let names = object.pointer("/spec/names").cloned().unwrap_or(Value::Null);
            if let Some(object) = object.as_object_mut() {
                object.insert(
                    "status".to_owned(),
                    json!({
                        "acceptedNames": names,
                        "conditions": [
                            {"type": "NamesAccepted", "status": "True"},
                            {"type": "Established", "status": "True"},
                        ],
                    }),
                );
            }
            self.custom_kinds.insert(key, id.clone());
        }
    }

    /// Drops the kinds registered by `id`, returning them.
    fn forget_kinds(&mut self, id: &ResourceId) -> Vec<(String, String)> {
        let kinds = self
            .custom_kinds
            .iter()
            .filter(|(_, definition)| *definition == id)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in &kinds {
            self.custom_kinds.remove(key);
        }
        kinds
    }

    /// Drops the kinds registered by `id` together with all their instances.
    fn unregister(&mut self, id: &ResourceId) {
        for (group, kind) in self.forget_kinds(id) {
            self.objects
                .retain(|instance, _| instance.group != group || instance.kind != kind);
        }
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get(&self, id: &ResourceId) -> Result<Manifest, ClientError> {
        let mut state = self.state.lock().await;
        state.begin(ClusterCall::Get(id.clone()))?;
        state.stored(id)
    }

    async fn create(&self, manifest: &Manifest) -> Result<Manifest, ClientError> {
        let id = manifest.id();
        let mut state = self.state.lock().await;
        state.begin(ClusterCall::Create(id.clone()))?;
        if state.objects.contains_key(id) {
            return Err(ClientError::AlreadyExists { id: id.clone() });
        }

        let mut object = prune_nulls(manifest.document());
        state.last_uid += 1;
        let uid = format!("00000000-0000-0000-0000-{:012}", state.last_uid);
        let resource_version = state.next_resource_version();
        if let Some(object) = object.as_object_mut() {
            object.remove("status");
            if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
                metadata.remove("deletionTimestamp");
                metadata.remove("deletionGracePeriodSeconds");
            }
            set_metadata(object, [
                ("uid", uid.into()),
                ("resourceVersion", resource_version.into()),
                ("generation", 1.into()),
                (
                    "creationTimestamp",
                    jiff::Timestamp::now().to_string().into(),
                ),
            ]);
        }

        state.objects.insert(id.clone(), object);
        state.register(id);
        state.stored(id)
    }

    async fn patch(&self, manifest: &Manifest, patch: &Value) -> Result<Manifest, ClientError> {
        let id = manifest.id();
        let mut state = self.state.lock().await;
        state.begin(ClusterCall::Patch(id.clone(), patch.clone()))?;
        let resource_version = state.next_resource_version();
        let object = state
            .objects
            .get_mut(id)
            .ok_or_else(|| ClientError::NotFound { id: id.clone() })?;

        let before = spec_of(object);
        json_patch::merge(object, patch);
        let changed = before != spec_of(object);
        let generation = object
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        if let Some(object) = object.as_object_mut() {
            set_metadata(object, [("resourceVersion", resource_version.into())]);
            if changed {
                set_metadata(object, [("generation", (generation + 1).into())]);
            }
        }

        state.register(id);
        state.stored(id)
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        state.begin(ClusterCall::Delete(id.clone()))?;
        state
            .objects
            .remove(id)
            .ok_or_else(|| ClientError::NotFound { id: id.clone() })?;
        state.unregister(id);
        Ok(())
    }
}

/// Applies `document` as a merge patch onto an empty object, which drops all `null` fields the
/// way the API server does when decoding into its typed representation.
fn prune_nulls(document: &Value) -> Value {
    let mut pruned = Value::Object(Map::new());
    json_patch::merge(&mut pruned, document);
    pruned
}

/// Everything except `metadata` and `status`, which is what bumps the generation.
fn spec_of(object: &Value) -> Value {
    let mut spec = object.clone();
    if let Some(spec) = spec.as_object_mut() {
        spec.remove("metadata");
        spec.remove("status");
    }
    spec
}

fn set_metadata<const N: usize>(object: &mut Map<String, Value>, fields: [(&str, Value); N]) {
    if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        for (field, value) in fields {
            metadata.insert(field.to_owned(), value);
        }
    }
}
