//! Informers: list+watch driven caches with event fan-out
//!
//! One [`Informer`] exists per resource kind. It keeps a read-only
//! [`Cache`] of every object of that kind, tells registered
//! [`EventHandler`]s about adds, updates and deletes, and signals when the
//! initial listing has been absorbed.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use kube::ResourceExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::WorkQueue;
use crate::error::Result;
use crate::store::{LatticeResource, ObjectKey, Selector, Store, TypedStore, TypedWatchEvent};

/// Interval between synthetic update notifications for every cached object
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(12 * 60 * 60);

const REWATCH_DELAY: Duration = Duration::from_secs(1);

/// Read-only view of the objects an informer has observed
pub struct Cache<K> {
    items: Arc<RwLock<BTreeMap<ObjectKey, Arc<K>>>>,
}

impl<K> Clone for Cache<K> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<K> Default for Cache<K> {
    fn default() -> Self {
        Self {
            items: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl<K: LatticeResource> Cache<K> {
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn get_named(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.get(&ObjectKey::new(namespace, name))
    }

    /// Objects in `namespace`, or in every namespace when `None`
    pub fn list(&self, namespace: Option<&str>) -> Vec<Arc<K>> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(key, _)| namespace.map_or(true, |ns| key.namespace == ns))
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    pub fn list_matching(&self, namespace: Option<&str>, selector: &Selector) -> Vec<Arc<K>> {
        self.list(namespace)
            .into_iter()
            .filter(|obj| selector.matches(Some(obj.labels())))
            .collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, key: ObjectKey, obj: Arc<K>) -> Option<Arc<K>> {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, obj)
    }

    fn remove(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }
}

/// Payload of a delete notification
#[derive(Clone, Debug)]
pub enum DeletedObject<K> {
    /// The watch reported the deletion with the object's final state
    Object(Arc<K>),
    /// The object disappeared between two listings; only its last observed
    /// state is known
    FinalStateUnknown { key: ObjectKey, last_known: Arc<K> },
}

impl<K: LatticeResource> DeletedObject<K> {
    pub fn key(&self) -> ObjectKey {
        match self {
            DeletedObject::Object(obj) => ObjectKey::from_object(obj.as_ref()),
            DeletedObject::FinalStateUnknown { key, .. } => key.clone(),
        }
    }

    pub fn object(&self) -> &Arc<K> {
        match self {
            DeletedObject::Object(obj) => obj,
            DeletedObject::FinalStateUnknown { last_known, .. } => last_known,
        }
    }
}

/// Receives change notifications from an informer
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &Arc<K>);
    fn on_update(&self, old: &Arc<K>, new: &Arc<K>);
    fn on_delete(&self, obj: &DeletedObject<K>);
}

type KeyMapper<K> = Arc<dyn Fn(&K) -> Vec<ObjectKey> + Send + Sync>;

/// Enqueues the keys an event maps to.
///
/// Updates whose resource version did not change (resync ticks) are ignored.
pub struct EnqueueHandler<K> {
    queue: WorkQueue<ObjectKey>,
    map: KeyMapper<K>,
}

impl<K: LatticeResource> EnqueueHandler<K> {
    /// Enqueue the changed object's own key
    pub fn for_object(queue: WorkQueue<ObjectKey>) -> Self {
        Self {
            queue,
            map: Arc::new(|obj: &K| vec![ObjectKey::from_object(obj)]),
        }
    }

    /// Enqueue whatever keys `map` derives from the changed object
    pub fn mapped<F>(queue: WorkQueue<ObjectKey>, map: F) -> Self
    where
        F: Fn(&K) -> Vec<ObjectKey> + Send + Sync + 'static,
    {
        Self {
            queue,
            map: Arc::new(map),
        }
    }

    fn enqueue(&self, obj: &K) {
        for key in (self.map)(obj) {
            self.queue.add(key);
        }
    }
}

impl<K: LatticeResource> EventHandler<K> for EnqueueHandler<K> {
    fn on_add(&self, obj: &Arc<K>) {
        self.enqueue(obj);
    }

    fn on_update(&self, old: &Arc<K>, new: &Arc<K>) {
        if old.resource_version() == new.resource_version() {
            return;
        }
        self.enqueue(old);
        self.enqueue(new);
    }

    fn on_delete(&self, obj: &DeletedObject<K>) {
        self.enqueue(obj.object());
    }
}

/// Keys of the owners of `obj`, which live in its namespace
pub fn owner_keys<K: LatticeResource>(obj: &K) -> Vec<ObjectKey> {
    let namespace = obj.namespace().unwrap_or_default();
    obj.owner_references()
        .iter()
        .map(|owner| ObjectKey::new(namespace.clone(), owner.name.clone()))
        .collect()
}

/// Keeps the cache of one resource kind in step with the store
pub struct Informer<K> {
    store: TypedStore<K>,
    namespace: Option<String>,
    cache: Cache<K>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<K>>>>,
    synced: watch::Sender<bool>,
    resync_period: Duration,
}

impl<K: LatticeResource> Informer<K> {
    pub fn new(store: TypedStore<K>, namespace: Option<String>, resync_period: Duration) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            store,
            namespace,
            cache: Cache::default(),
            handlers: RwLock::new(Vec::new()),
            synced,
            resync_period,
        }
    }

    pub fn kind(&self) -> &str {
        self.store.kind()
    }

    pub fn cache(&self) -> Cache<K> {
        self.cache.clone()
    }

    /// Register a handler. Objects already cached are replayed as adds.
    pub fn add_handler(&self, handler: Arc<dyn EventHandler<K>>) {
        for obj in self.cache.list(None) {
            handler.on_add(&obj);
        }
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub async fn wait_for_sync(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|synced| *synced).await;
    }

    fn handlers(&self) -> Vec<Arc<dyn EventHandler<K>>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply(&self, obj: K) {
        let key = ObjectKey::from_object(&obj);
        let obj = Arc::new(obj);
        let old = self.cache.insert(key, obj.clone());
        for handler in self.handlers() {
            match &old {
                Some(old) => handler.on_update(old, &obj),
                None => handler.on_add(&obj),
            }
        }
    }

    fn delete(&self, obj: K) {
        let key = ObjectKey::from_object(&obj);
        self.cache.remove(&key);
        let deleted = DeletedObject::Object(Arc::new(obj));
        for handler in self.handlers() {
            handler.on_delete(&deleted);
        }
    }

    /// Reconcile the cache against a complete listing
    fn replace(&self, objects: Vec<K>) {
        let listed: BTreeMap<ObjectKey, K> = objects
            .into_iter()
            .map(|obj| (ObjectKey::from_object(&obj), obj))
            .collect();

        for key in self.cache.keys() {
            if listed.contains_key(&key) {
                continue;
            }
            if let Some(last_known) = self.cache.remove(&key) {
                debug!(kind = %self.kind(), %key, "Object vanished between listings");
                let deleted = DeletedObject::FinalStateUnknown { key, last_known };
                for handler in self.handlers() {
                    handler.on_delete(&deleted);
                }
            }
        }
        for obj in listed.into_values() {
            self.apply(obj);
        }
        self.synced.send_replace(true);
    }

    fn handle(&self, event: TypedWatchEvent<K>) {
        match event {
            TypedWatchEvent::Applied(obj) => self.apply(obj),
            TypedWatchEvent::Deleted(obj) => self.delete(obj),
            TypedWatchEvent::Restarted(objs) => self.replace(objs),
        }
    }

    /// Deliver a synthetic update for every cached object
    pub fn resync(&self) {
        let handlers = self.handlers();
        for obj in self.cache.list(None) {
            for handler in &handlers {
                handler.on_update(&obj, &obj);
            }
        }
    }

    /// List the store directly and fold the result into the cache
    pub async fn relist(&self) -> Result<()> {
        let objects = self
            .store
            .list(self.namespace.as_deref(), &Selector::everything())
            .await?;
        self.replace(objects);
        Ok(())
    }

    /// Watch until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) {
        info!(kind = %self.kind(), "Starting informer");
        let mut resync =
            tokio::time::interval_at(Instant::now() + self.resync_period, self.resync_period);

        'watch: loop {
            let mut events = self.store.watch(self.namespace.as_deref());
            loop {
                tokio::select! {
                    _ = token.cancelled() => break 'watch,
                    _ = resync.tick() => self.resync(),
                    event = events.next() => match event {
                        Some(Ok(event)) => self.handle(event),
                        Some(Err(e)) => warn!(kind = %self.kind(), error = %e, "Watch error"),
                        None => break,
                    },
                }
            }
            warn!(kind = %self.kind(), "Watch stream ended, restarting");
            tokio::select! {
                _ = token.cancelled() => break 'watch,
                _ = tokio::time::sleep(REWATCH_DELAY) => {}
            }
        }
        info!(kind = %self.kind(), "Informer stopped");
    }
}

/// Kind-erased informer handle used to start informers and wait for sync
pub trait SharedInformer: Send + Sync {
    fn kind(&self) -> &str;
    fn has_synced(&self) -> bool;
    fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()>;
    fn relist(self: Arc<Self>) -> futures::future::BoxFuture<'static, Result<()>>;
}

impl<K: LatticeResource> SharedInformer for Informer<K> {
    fn kind(&self) -> &str {
        Informer::kind(self)
    }

    fn has_synced(&self) -> bool {
        Informer::has_synced(self)
    }

    fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }

    fn relist(self: Arc<Self>) -> futures::future::BoxFuture<'static, Result<()>> {
        Box::pin(async move { Informer::relist(&self).await })
    }
}

/// Hands out one shared informer per resource kind
pub struct InformerFactory {
    store: Store,
    namespace: Option<String>,
    resync_period: Duration,
    informers: Mutex<HashMap<TypeId, (Arc<dyn Any + Send + Sync>, Arc<dyn SharedInformer>)>>,
}

impl InformerFactory {
    pub fn new(store: Store) -> Self {
        Self::with_resync(store, DEFAULT_RESYNC_PERIOD)
    }

    pub fn with_resync(store: Store, resync_period: Duration) -> Self {
        Self {
            store,
            namespace: None,
            resync_period,
            informers: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn informer<K: LatticeResource>(&self) -> Arc<Informer<K>> {
        let mut informers = self
            .informers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some((any, _)) = informers.get(&TypeId::of::<K>()) {
            if let Ok(existing) = any.clone().downcast::<Informer<K>>() {
                return existing;
            }
        }
        let informer = Arc::new(Informer::new(
            self.store.api::<K>(),
            self.namespace.clone(),
            self.resync_period,
        ));
        informers.insert(
            TypeId::of::<K>(),
            (
                informer.clone() as Arc<dyn Any + Send + Sync>,
                informer.clone() as Arc<dyn SharedInformer>,
            ),
        );
        informer
    }

    pub fn cache<K: LatticeResource>(&self) -> Cache<K> {
        self.informer::<K>().cache()
    }

    fn all(&self) -> Vec<Arc<dyn SharedInformer>> {
        self.informers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|(_, shared)| shared.clone())
            .collect()
    }

    /// Start every informer requested so far
    pub fn start(&self, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.all()
            .into_iter()
            .map(|informer| informer.spawn(token.child_token()))
            .collect()
    }

    pub fn has_synced(&self) -> bool {
        self.all().iter().all(|i| i.has_synced())
    }

    /// Relist every informer from the store, in no particular order
    pub async fn relist_all(&self) -> Result<()> {
        for informer in self.all() {
            informer.relist().await?;
        }
        Ok(())
    }
}
