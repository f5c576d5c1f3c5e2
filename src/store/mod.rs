//! Declarative resource store
//!
//! Controllers read and write lattice resources through [`Store`], a typed
//! facade over an object-safe [`StoreBackend`]. Two backends exist: the
//! Kubernetes API server ([`KubeStore`]) and an in-process store with the
//! same optimistic-concurrency, finalizer and cascading-delete semantics
//! ([`MemoryStore`]).

mod kubernetes;
mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::core::{ApiResource, DynamicObject, TypeMeta};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

pub use kubernetes::KubeStore;
pub use memory::MemoryStore;

/// Anything the store can hold
pub trait LatticeResource:
    Resource<DynamicType = ()> + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> LatticeResource for K where
    K: Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// `namespace/name` identity of a namespaced object
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_object<K: Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self::new(
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }

    /// Parse the `namespace/name` form
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(Error::ValidationError(format!(
                "invalid object key {raw:?}, expected namespace/name"
            ))),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Equality-based label selector
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.0
            .iter()
            .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `k1=v1,k2=v2` as accepted by the Kubernetes list API
    pub fn to_query(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// One notification from a store watch
#[derive(Clone, Debug)]
pub enum WatchEvent {
    /// The object was created or changed
    Applied(DynamicObject),
    /// The object was removed from the store
    Deleted(DynamicObject),
    /// Full listing; replaces everything previously observed
    Restarted(Vec<DynamicObject>),
}

/// Object-safe CRUD + watch over untyped objects
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(&self, resource: &ApiResource, object: DynamicObject) -> Result<DynamicObject>;

    /// Replace metadata and spec; fails with a conflict if the object's
    /// resource version is stale
    async fn replace(&self, resource: &ApiResource, object: DynamicObject)
        -> Result<DynamicObject>;

    /// Replace the status subresource only
    async fn replace_status(
        &self,
        resource: &ApiResource,
        object: DynamicObject,
    ) -> Result<DynamicObject>;

    /// JSON merge patch of metadata and spec. A `metadata.resourceVersion`
    /// in the patch is a precondition.
    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject>;

    /// Request deletion; removal waits until the finalizer list is empty
    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()>;

    fn watch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<WatchEvent>>;
}

/// Shared handle to a store backend
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StoreBackend>,
}

impl Store {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    pub fn api<K: LatticeResource>(&self) -> TypedStore<K> {
        TypedStore {
            backend: self.backend.clone(),
            resource: ApiResource::erase::<K>(&()),
            _kind: PhantomData,
        }
    }
}

/// Typed view of one resource kind
pub struct TypedStore<K> {
    backend: Arc<dyn StoreBackend>,
    resource: ApiResource,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for TypedStore<K> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            resource: self.resource.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: LatticeResource> TypedStore<K> {
    pub fn kind(&self) -> &str {
        &self.resource.kind
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        match self.backend.get(&self.resource, namespace, name).await? {
            Some(obj) => Ok(Some(decode(&self.resource, obj)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<K>> {
        self.backend
            .list(&self.resource, namespace, selector)
            .await?
            .into_iter()
            .map(|obj| decode(&self.resource, obj))
            .collect()
    }

    pub async fn create(&self, obj: &K) -> Result<K> {
        let created = self
            .backend
            .create(&self.resource, encode(&self.resource, obj)?)
            .await?;
        decode(&self.resource, created)
    }

    pub async fn replace(&self, obj: &K) -> Result<K> {
        let replaced = self
            .backend
            .replace(&self.resource, encode(&self.resource, obj)?)
            .await?;
        decode(&self.resource, replaced)
    }

    pub async fn replace_status(&self, obj: &K) -> Result<K> {
        let replaced = self
            .backend
            .replace_status(&self.resource, encode(&self.resource, obj)?)
            .await?;
        decode(&self.resource, replaced)
    }

    pub async fn patch(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<K> {
        let patched = self
            .backend
            .patch(&self.resource, namespace, name, patch)
            .await?;
        decode(&self.resource, patched)
    }

    pub async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.backend.delete(&self.resource, namespace, name).await
    }

    /// Delete, treating an already-missing object as success
    pub async fn delete_if_exists(&self, namespace: &str, name: &str) -> Result<()> {
        match self.delete(namespace, name).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Typed watch. Objects that fail to decode are reported as errors and
    /// skipped by consumers.
    pub fn watch(&self, namespace: Option<&str>) -> BoxStream<'static, Result<TypedWatchEvent<K>>> {
        let resource = self.resource.clone();
        self.backend
            .watch(&self.resource, namespace)
            .map(move |event| {
                Ok(match event? {
                    WatchEvent::Applied(obj) => TypedWatchEvent::Applied(decode(&resource, obj)?),
                    WatchEvent::Deleted(obj) => TypedWatchEvent::Deleted(decode(&resource, obj)?),
                    WatchEvent::Restarted(objs) => TypedWatchEvent::Restarted(
                        objs.into_iter()
                            .filter_map(|obj| match decode(&resource, obj) {
                                Ok(k) => Some(k),
                                Err(e) => {
                                    tracing::error!(kind = %resource.kind, error = %e, "Skipping undecodable object in listing");
                                    None
                                }
                            })
                            .collect(),
                    ),
                })
            })
            .boxed()
    }
}

#[derive(Clone, Debug)]
pub enum TypedWatchEvent<K> {
    Applied(K),
    Deleted(K),
    Restarted(Vec<K>),
}

fn encode<K: Serialize>(resource: &ApiResource, obj: &K) -> Result<DynamicObject> {
    let mut dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
    if dynamic.types.is_none() {
        dynamic.types = Some(type_meta(resource));
    }
    Ok(dynamic)
}

fn decode<K: DeserializeOwned>(resource: &ApiResource, mut obj: DynamicObject) -> Result<K> {
    if obj.types.is_none() {
        obj.types = Some(type_meta(resource));
    }
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub(crate) fn type_meta(resource: &ApiResource) -> TypeMeta {
    TypeMeta {
        api_version: resource.api_version.clone(),
        kind: resource.kind.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_parse() {
        let key = ObjectKey::parse("ns/name").unwrap();
        assert_eq!(key, ObjectKey::new("ns", "name"));
        assert_eq!(key.to_string(), "ns/name");
        assert!(ObjectKey::parse("name").is_err());
        assert!(ObjectKey::parse("/name").is_err());
        assert!(ObjectKey::parse("a/b/c").is_err());
    }

    #[test]
    fn test_selector_matches() {
        let selector = Selector::everything().label("a", "1").label("b", "2");
        let mut labels = BTreeMap::new();
        labels.insert("a".to_string(), "1".to_string());
        assert!(!selector.matches(Some(&labels)));
        labels.insert("b".to_string(), "2".to_string());
        assert!(selector.matches(Some(&labels)));
        assert!(!selector.matches(None));
        assert!(Selector::everything().matches(None));
        assert_eq!(selector.to_query(), "a=1,b=2");
    }
}
