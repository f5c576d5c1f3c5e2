//! In-process store backend
//!
//! Mirrors the API server semantics the controllers depend on: a global
//! resource version used for compare-and-swap, generation bumps on spec
//! changes, status writes that cannot touch spec, finalizer-gated deletion
//! and owner-reference cascading deletes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{ApiResource, DynamicObject};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::{type_meta, Selector, StoreBackend, WatchEvent};
use crate::error::{Error, Result};

const EVENT_BUFFER: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct ObjectId {
    kind: String,
    namespace: String,
    name: String,
}

impl ObjectId {
    fn new(resource: &ApiResource, namespace: &str, name: &str) -> Self {
        Self {
            kind: kind_key(resource),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn display(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

fn kind_key(resource: &ApiResource) -> String {
    format!("{}/{}", resource.api_version, resource.kind)
}

#[derive(Clone, Debug)]
struct StoreEvent {
    kind: String,
    namespace: String,
    deleted: bool,
    object: DynamicObject,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectId, DynamicObject>,
    resources: HashMap<String, ApiResource>,
    resource_version: u64,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<StoreEvent>,
}

/// Store backend held entirely in memory
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
            }),
        }
    }

    /// Latest resource version handed out; advances on every write
    pub fn resource_version(&self) -> u64 {
        self.lock().resource_version
    }

    /// Number of objects of every kind currently stored
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, kind: &str, namespace: Option<&str>) -> Vec<DynamicObject> {
        let state = self.lock();
        state
            .objects
            .iter()
            .filter(|(id, _)| id.kind == kind && namespace.map_or(true, |ns| id.namespace == ns))
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    fn emit(&self, id: &ObjectId, object: &DynamicObject, deleted: bool) {
        // No receivers is not an error
        let _ = self.inner.events.send(StoreEvent {
            kind: id.kind.clone(),
            namespace: id.namespace.clone(),
            deleted,
            object: object.clone(),
        });
    }

    fn next_version(state: &mut State) -> String {
        state.resource_version += 1;
        state.resource_version.to_string()
    }

    /// Write `candidate` over the stored object at `id`, applying the
    /// generation, no-op and finalization rules shared by replace and patch
    fn commit(
        &self,
        state: &mut State,
        id: &ObjectId,
        existing: &DynamicObject,
        mut candidate: DynamicObject,
    ) -> Result<DynamicObject> {
        candidate.metadata.uid = existing.metadata.uid.clone();
        candidate.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
        candidate.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
        candidate.metadata.namespace = existing.metadata.namespace.clone();
        candidate.metadata.name = existing.metadata.name.clone();
        candidate.metadata.resource_version = existing.metadata.resource_version.clone();
        candidate.metadata.generation = existing.metadata.generation;
        candidate.types = existing.types.clone();
        set_status(&mut candidate, status_of(existing));

        if spec_of(&candidate) != spec_of(existing) {
            candidate.metadata.generation = Some(existing.metadata.generation.unwrap_or(1) + 1);
        }

        if same_object(&candidate, existing) {
            return Ok(existing.clone());
        }

        let finalizers_drained = candidate
            .metadata
            .finalizers
            .as_ref()
            .map_or(true, Vec::is_empty);
        if candidate.metadata.deletion_timestamp.is_some() && finalizers_drained {
            // Removal emits the drained object, not the stored one
            candidate.metadata.resource_version = Some(Self::next_version(state));
            state.objects.insert(id.clone(), candidate.clone());
            self.remove_locked(state, id);
            return Ok(candidate);
        }

        candidate.metadata.resource_version = Some(Self::next_version(state));
        state.objects.insert(id.clone(), candidate.clone());
        self.emit(id, &candidate, false);
        Ok(candidate)
    }

    fn remove_locked(&self, state: &mut State, id: &ObjectId) {
        let Some(removed) = state.objects.remove(id) else {
            return;
        };
        debug!(kind = %id.kind, key = %id.display(), "Removed object from memory store");
        self.emit(id, &removed, true);

        let Some(uid) = removed.metadata.uid.clone() else {
            return;
        };
        let dependents: Vec<ObjectId> = state
            .objects
            .iter()
            .filter(|(_, obj)| {
                obj.metadata
                    .owner_references
                    .as_ref()
                    .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
            })
            .map(|(id, _)| id.clone())
            .collect();
        for dependent in dependents {
            self.delete_locked(state, &dependent);
        }
    }

    fn delete_locked(&self, state: &mut State, id: &ObjectId) {
        let Some(existing) = state.objects.get(id).cloned() else {
            return;
        };
        let has_finalizers = existing
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if !has_finalizers {
            self.remove_locked(state, id);
            return;
        }
        if existing.metadata.deletion_timestamp.is_some() {
            return;
        }
        let mut marked = existing;
        marked.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        marked.metadata.resource_version = Some(Self::next_version(state));
        state.objects.insert(id.clone(), marked.clone());
        self.emit(id, &marked, false);
    }

    fn check_version(
        resource: &ApiResource,
        id: &ObjectId,
        expected: Option<&str>,
        existing: &DynamicObject,
    ) -> Result<()> {
        match expected {
            Some(v) if Some(v) != existing.metadata.resource_version.as_deref() => {
                Err(Error::Conflict {
                    kind: resource.kind.clone(),
                    key: id.display(),
                    message: format!(
                        "resource version {v} does not match current {}",
                        existing.metadata.resource_version.as_deref().unwrap_or("")
                    ),
                })
            }
            _ => Ok(()),
        }
    }

    fn not_found(resource: &ApiResource, namespace: &str, name: &str) -> Error {
        Error::NotFound {
            kind: resource.kind.clone(),
            key: format!("{namespace}/{name}"),
        }
    }
}

fn status_of(obj: &DynamicObject) -> Option<Value> {
    obj.data.get("status").cloned()
}

fn spec_of(obj: &DynamicObject) -> Option<&Value> {
    obj.data.get("spec")
}

fn set_status(obj: &mut DynamicObject, status: Option<Value>) {
    if !obj.data.is_object() {
        obj.data = Value::Object(Default::default());
    }
    if let Some(map) = obj.data.as_object_mut() {
        match status {
            Some(status) => {
                map.insert("status".to_string(), status);
            }
            None => {
                map.remove("status");
            }
        }
    }
}

fn same_object(a: &DynamicObject, b: &DynamicObject) -> bool {
    a.metadata == b.metadata && a.data == b.data
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            if let Value::Object(target_map) = target {
                for (key, value) in patch_map {
                    if value.is_null() {
                        target_map.remove(key);
                    } else {
                        merge_patch(
                            target_map.entry(key.clone()).or_insert(Value::Null),
                            value,
                        );
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn generated_name(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{prefix}{suffix}")
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let state = self.lock();
        Ok(state
            .objects
            .get(&ObjectId::new(resource, namespace, name))
            .cloned())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>> {
        Ok(self
            .snapshot(&kind_key(resource), namespace)
            .into_iter()
            .filter(|obj| selector.matches(obj.metadata.labels.as_ref()))
            .collect())
    }

    async fn create(&self, resource: &ApiResource, mut object: DynamicObject) -> Result<DynamicObject> {
        let namespace = object.metadata.namespace.clone().ok_or_else(|| {
            Error::ValidationError(format!("{} must have a namespace", resource.kind))
        })?;
        let name = match (&object.metadata.name, &object.metadata.generate_name) {
            (Some(name), _) if !name.is_empty() => name.clone(),
            (_, Some(prefix)) => generated_name(prefix),
            _ => {
                return Err(Error::ValidationError(format!(
                    "{} must have a name",
                    resource.kind
                )))
            }
        };

        let mut state = self.lock();
        let id = ObjectId::new(resource, &namespace, &name);
        if state.objects.contains_key(&id) {
            return Err(Error::AlreadyExists {
                kind: resource.kind.clone(),
                key: id.display(),
            });
        }
        state
            .resources
            .entry(id.kind.clone())
            .or_insert_with(|| resource.clone());

        object.types = Some(type_meta(resource));
        object.metadata.name = Some(name);
        object.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        object.metadata.generation = Some(1);
        object.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        object.metadata.deletion_timestamp = None;
        object.metadata.resource_version = Some(Self::next_version(&mut state));
        set_status(&mut object, None);

        state.objects.insert(id.clone(), object.clone());
        self.emit(&id, &object, false);
        Ok(object)
    }

    async fn replace(&self, resource: &ApiResource, object: DynamicObject) -> Result<DynamicObject> {
        let namespace = object.metadata.namespace.clone().unwrap_or_default();
        let name = object.metadata.name.clone().unwrap_or_default();
        let id = ObjectId::new(resource, &namespace, &name);

        let mut state = self.lock();
        let existing = state
            .objects
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::not_found(resource, &namespace, &name))?;
        Self::check_version(
            resource,
            &id,
            object.metadata.resource_version.as_deref(),
            &existing,
        )?;
        self.commit(&mut state, &id, &existing, object)
    }

    async fn replace_status(
        &self,
        resource: &ApiResource,
        object: DynamicObject,
    ) -> Result<DynamicObject> {
        let namespace = object.metadata.namespace.clone().unwrap_or_default();
        let name = object.metadata.name.clone().unwrap_or_default();
        let id = ObjectId::new(resource, &namespace, &name);

        let mut state = self.lock();
        let existing = state
            .objects
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::not_found(resource, &namespace, &name))?;
        Self::check_version(
            resource,
            &id,
            object.metadata.resource_version.as_deref(),
            &existing,
        )?;

        let mut updated = existing.clone();
        set_status(&mut updated, status_of(&object));
        if same_object(&updated, &existing) {
            return Ok(existing);
        }
        updated.metadata.resource_version = Some(Self::next_version(&mut state));
        state.objects.insert(id.clone(), updated.clone());
        self.emit(&id, &updated, false);
        Ok(updated)
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let id = ObjectId::new(resource, namespace, name);
        let mut state = self.lock();
        let existing = state
            .objects
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::not_found(resource, namespace, name))?;
        let expected = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str);
        Self::check_version(resource, &id, expected, &existing)?;

        let mut patch = patch.clone();
        if let Some(map) = patch.as_object_mut() {
            map.remove("status");
        }
        let mut merged = serde_json::to_value(&existing)?;
        merge_patch(&mut merged, &patch);
        let candidate: DynamicObject = serde_json::from_value(merged)?;
        self.commit(&mut state, &id, &existing, candidate)
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        let id = ObjectId::new(resource, namespace, name);
        let mut state = self.lock();
        if !state.objects.contains_key(&id) {
            return Err(Self::not_found(resource, namespace, name));
        }
        self.delete_locked(&mut state, &id);
        Ok(())
    }

    fn watch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<WatchEvent>> {
        // Subscribe before listing so nothing written in between is lost
        let receiver = self.inner.events.subscribe();
        let kind = kind_key(resource);
        let namespace = namespace.map(str::to_string);
        let initial = self.snapshot(&kind, namespace.as_deref());
        let store = self.clone();

        stream::unfold(
            (receiver, Some(initial)),
            move |(mut receiver, initial)| {
                let store = store.clone();
                let kind = kind.clone();
                let namespace = namespace.clone();
                async move {
                    if let Some(objects) = initial {
                        return Some((Ok(WatchEvent::Restarted(objects)), (receiver, None)));
                    }
                    loop {
                        match receiver.recv().await {
                            Ok(event) => {
                                let in_scope = event.kind == kind
                                    && namespace.as_ref().map_or(true, |ns| *ns == event.namespace);
                                if !in_scope {
                                    continue;
                                }
                                let item = if event.deleted {
                                    WatchEvent::Deleted(event.object)
                                } else {
                                    WatchEvent::Applied(event.object)
                                };
                                return Some((Ok(item), (receiver, None)));
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                debug!(skipped, "Memory store watcher lagged, relisting");
                                let objects = store.snapshot(&kind, namespace.as_deref());
                                return Some((Ok(WatchEvent::Restarted(objects)), (receiver, None)));
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        }
                    }
                }
            },
        )
        .boxed()
    }
}
