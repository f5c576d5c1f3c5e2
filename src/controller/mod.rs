//! Lattice reconcilers
//!
//! One reconciler per resource kind. They share a [`Context`] holding the
//! store, the informer caches and the external collaborators, and never
//! talk to each other except through the store.

mod address;
#[cfg(test)]
mod address_test;
mod build;
#[cfg(test)]
mod build_test;
mod container_build;
mod deploy;
#[cfg(test)]
mod deploy_test;
mod finalizers;
mod job;
mod lifecycle;
#[cfg(feature = "metrics")]
pub mod metrics;
mod node_pool;
#[cfg(test)]
mod node_pool_test;
mod service;
pub mod status;
mod system;
mod teardown;
#[cfg(test)]
mod teardown_test;

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cloudprovider::CloudProvider;
use crate::config::EnabledControllers;
use crate::crd::meta::system_id_from_namespace;
use crate::crd::{ConfigContainerBuild, System};
use crate::definition::DefinitionResolver;
use crate::orchestrator::Orchestrator;
use crate::runtime::{
    Cache, Controller, EnqueueHandler, InformerFactory, Reconciler, SharedInformer, WorkQueue,
};
use crate::servicemesh::ServiceMesh;
use crate::store::{LatticeResource, ObjectKey, Store};

pub use address::{address_dns_name, node_port_service_name, AddressReconciler};
pub use build::BuildReconciler;
pub use container_build::ContainerBuildReconciler;
pub use deploy::DeployReconciler;
pub(crate) use deploy::service_spec;
pub use finalizers::{add_finalizer, remove_finalizer};
pub use job::JobReconciler;
pub use lifecycle::{LifecycleAction, LifecycleActions};
pub use node_pool::NodePoolReconciler;
pub use service::{dedicated_node_pool_name, service_name, ServiceReconciler};
pub use system::SystemReconciler;
pub use teardown::TeardownReconciler;

/// Requeue interval while an object is converging
pub const PROGRESS_REQUEUE: Duration = Duration::from_secs(5);
/// Requeue interval for drift checks of settled objects
pub const STABLE_REQUEUE: Duration = Duration::from_secs(60);
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Everything a reconciler may touch
pub struct Context {
    pub lattice_id: String,
    pub store: Store,
    pub informers: Arc<InformerFactory>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub cloud_provider: Arc<dyn CloudProvider>,
    pub service_mesh: Arc<dyn ServiceMesh>,
    pub resolver: Arc<dyn DefinitionResolver>,
    pub container_build: ConfigContainerBuild,
    /// How long a Teardown may wait for Services to disappear
    pub teardown_timeout: Duration,
}

impl Context {
    pub fn cache<K: LatticeResource>(&self) -> Cache<K> {
        self.informers.cache::<K>()
    }

    /// System ID of a namespace belonging to this lattice
    pub fn system_id<'a>(&self, namespace: &'a str) -> Option<&'a str> {
        system_id_from_namespace(&self.lattice_id, namespace)
    }

    pub fn owns_namespace(&self, namespace: &str) -> bool {
        self.system_id(namespace).is_some()
    }

    /// Key of the System that owns `namespace`
    pub fn system_key(&self, namespace: &str) -> Option<ObjectKey> {
        self.system_id(namespace)
            .map(|id| ObjectKey::new(namespace, id))
    }

    pub fn system(&self, namespace: &str) -> Option<Arc<System>> {
        self.system_key(namespace)
            .and_then(|key| self.cache::<System>().get(&key))
    }
}

/// Register `handler` on the shared informer for `K` and return the informer
pub(crate) fn watch<K: LatticeResource>(
    ctx: &Context,
    handler: EnqueueHandler<K>,
) -> Arc<dyn SharedInformer> {
    let informer = ctx.informers.informer::<K>();
    informer.add_handler(Arc::new(handler));
    informer
}

/// Maps an object to the System owning its namespace
pub(crate) fn system_of<K: LatticeResource>(
    lattice_id: &str,
) -> impl Fn(&K) -> Vec<ObjectKey> + Send + Sync + 'static {
    let lattice_id = lattice_id.to_string();
    move |obj: &K| {
        let namespace = obj.namespace().unwrap_or_default();
        system_id_from_namespace(&lattice_id, &namespace)
            .map(|id| ObjectKey::new(namespace.as_str(), id))
            .into_iter()
            .collect()
    }
}

/// Maps an object to every cached `P` in its namespace
pub(crate) fn all_in_namespace<K, P>(
    cache: Cache<P>,
) -> impl Fn(&K) -> Vec<ObjectKey> + Send + Sync + 'static
where
    K: LatticeResource,
    P: LatticeResource,
{
    move |obj: &K| {
        let namespace = obj.namespace().unwrap_or_default();
        cache
            .list(Some(&namespace))
            .iter()
            .map(|p| ObjectKey::from_object(p.as_ref()))
            .collect()
    }
}

type Register = fn(&Context, &WorkQueue<ObjectKey>) -> Vec<Arc<dyn SharedInformer>>;
type PrimaryKeys = fn(&Context) -> Vec<ObjectKey>;

/// A reconciler together with the informer wiring that feeds it
pub struct ControllerEntry {
    pub name: &'static str,
    pub reconciler: Arc<dyn Reconciler>,
    register: Register,
    primary_keys: PrimaryKeys,
}

impl ControllerEntry {
    fn new<R: Reconciler>(reconciler: R, register: Register, primary_keys: PrimaryKeys) -> Self {
        Self {
            name: reconciler.name(),
            reconciler: Arc::new(reconciler),
            register,
            primary_keys,
        }
    }

    /// Register the reconciler's event handlers, feeding `queue`
    pub fn wire(&self, ctx: &Context, queue: &WorkQueue<ObjectKey>) -> Vec<Arc<dyn SharedInformer>> {
        (self.register)(ctx, queue)
    }

    /// Keys of every cached object of the reconciler's own kind
    pub fn primary_keys(&self, ctx: &Context) -> Vec<ObjectKey> {
        (self.primary_keys)(ctx)
    }
}

fn keys_of<K: LatticeResource>(ctx: &Context) -> Vec<ObjectKey> {
    ctx.cache::<K>()
        .keys()
        .into_iter()
        .filter(|key| ctx.owns_namespace(&key.namespace))
        .collect()
}

/// The enabled reconcilers, in dependency order
pub fn controllers(ctx: &Arc<Context>, enabled: &EnabledControllers) -> Vec<ControllerEntry> {
    use crate::crd::{
        Address, Build, ContainerBuild, Deploy, Job, NodePool, Service, Teardown,
    };

    let all = vec![
        ControllerEntry::new(
            SystemReconciler::new(ctx.clone()),
            system::register,
            keys_of::<System>,
        ),
        ControllerEntry::new(
            BuildReconciler::new(ctx.clone()),
            build::register,
            keys_of::<Build>,
        ),
        ControllerEntry::new(
            ContainerBuildReconciler::new(ctx.clone()),
            container_build::register,
            keys_of::<ContainerBuild>,
        ),
        ControllerEntry::new(
            DeployReconciler::new(ctx.clone()),
            deploy::register,
            keys_of::<Deploy>,
        ),
        ControllerEntry::new(
            TeardownReconciler::new(ctx.clone()),
            teardown::register,
            keys_of::<Teardown>,
        ),
        ControllerEntry::new(
            ServiceReconciler::new(ctx.clone()),
            service::register,
            keys_of::<Service>,
        ),
        ControllerEntry::new(
            JobReconciler::new(ctx.clone()),
            job::register,
            keys_of::<Job>,
        ),
        ControllerEntry::new(
            NodePoolReconciler::new(ctx.clone()),
            node_pool::register,
            keys_of::<NodePool>,
        ),
        ControllerEntry::new(
            AddressReconciler::new(ctx.clone()),
            address::register,
            keys_of::<Address>,
        ),
    ];
    all.into_iter()
        .filter(|entry| enabled.is_enabled(entry.name))
        .collect()
}

/// Wire every enabled controller to its informers, start the informers and
/// run `workers` reconcile loops per controller until `token` fires
pub async fn run_controllers(
    ctx: Arc<Context>,
    enabled: &EnabledControllers,
    workers: usize,
    token: CancellationToken,
) {
    let mut runners = Vec::new();
    for entry in controllers(&ctx, enabled) {
        let queue = WorkQueue::new(entry.name);
        let mut controller = Controller::new(entry.reconciler.clone(), queue.clone());
        for informer in entry.wire(&ctx, &queue) {
            controller = controller.wait_for(informer);
        }
        runners.push(controller);
    }

    let informer_handles = ctx.informers.start(&token);
    info!(
        controllers = runners.len(),
        informers = informer_handles.len(),
        enabled = %enabled,
        "Starting controllers"
    );

    let mut set = JoinSet::new();
    for controller in runners {
        set.spawn(controller.run(workers, token.clone()));
    }
    while set.join_next().await.is_some() {}
    for handle in informer_handles {
        let _ = handle.await;
    }
    info!("All controllers stopped");
}
