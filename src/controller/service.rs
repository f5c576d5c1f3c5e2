//! Service reconciler
//!
//! Turns a lattice Service into an orchestrator workload scheduled on the
//! current epoch of its node pool, fronted by the service mesh and a
//! cluster-internal network service, and reachable through an Address of
//! the same name.
//!
//! Before a workload moves to a new node pool epoch the epoch is recorded
//! in the Service's node pool assignment annotation, and old epochs are
//! only pruned from it once the rollout is complete. The NodePool
//! reconciler never retires an epoch a Service is still assigned to.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::status::{patch_annotations, update_status};
use super::{add_finalizer, remove_finalizer, watch, Context, PROGRESS_REQUEUE, STABLE_REQUEUE};
use crate::crd::meta::{
    is_being_deleted, owner_reference, short_hash, ANNOTATION_KEY_NODE_POOL,
    ANNOTATION_KEY_SPEC_HASH, FIELD_MANAGER, LABEL_KEY_MANAGED_BY, LABEL_KEY_NODE_POOL_ID,
    LABEL_KEY_SERVICE_ID, SERVICE_FINALIZER,
};
use crate::crd::{
    Address, AddressSpec, FailureInfo, NodePool, NodePoolAssignments, NodePoolEpochState,
    NodePoolSpec, Service, ServiceState, ServiceStatus, TreePath,
};
use crate::error::{Error, Result};
use crate::orchestrator::{
    Container, ContainerPort, NetworkServiceKind, NetworkServicePort, NetworkServiceSpec,
    ObservedWorkload, Toleration, WorkloadSpec,
};
use crate::runtime::{owner_keys, Action, EnqueueHandler, Reconciler, SharedInformer, WorkQueue};
use crate::store::ObjectKey;

/// Name of the Service (and its workload and Address) for a tree path
pub fn service_name(path: &TreePath) -> String {
    format!("{}-{}", path.name(), short_hash(path.as_str()))
}

/// Name of the NodePool created for a Service with a dedicated pool
pub fn dedicated_node_pool_name(service: &str) -> String {
    format!("{service}-dedicated")
}

pub(crate) const MAIN_CONTAINER: &str = "main";

pub struct ServiceReconciler {
    ctx: Arc<Context>,
}

impl ServiceReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn write(&self, svc: &Service, status: ServiceStatus) -> Result<Service> {
        update_status(&self.ctx.store.api::<Service>(), svc, status).await
    }

    async fn fail(&self, svc: &Service, message: String) -> Result<Action> {
        warn!(
            "Service {}/{} failed: {}",
            svc.namespace().unwrap_or_default(),
            svc.name_any(),
            message
        );
        let status = ServiceStatus {
            observed_generation: svc.meta().generation,
            state: ServiceState::Failed,
            failure_info: Some(FailureInfo::renew(
                svc.status.as_ref().and_then(|s| s.failure_info.as_ref()),
                message,
            )),
            ..svc.status.clone().unwrap_or_default()
        };
        self.write(svc, status).await?;
        Ok(Action::await_change())
    }

    async fn pending(&self, svc: &Service, message: String) -> Result<Action> {
        debug!("Service {} is waiting: {}", svc.name_any(), message);
        let status = ServiceStatus {
            observed_generation: svc.meta().generation,
            state: ServiceState::Pending,
            message: Some(message),
            ..svc.status.clone().unwrap_or_default()
        };
        self.write(svc, status).await?;
        Ok(Action::requeue(PROGRESS_REQUEUE))
    }

    /// Create or update the pool a dedicated Service owns
    async fn ensure_dedicated_pool(&self, svc: &Service, spec: NodePoolSpec) -> Result<Option<Arc<NodePool>>> {
        let namespace = svc.namespace().unwrap_or_default();
        let name = dedicated_node_pool_name(&svc.name_any());
        let api = self.ctx.store.api::<NodePool>();
        match self.ctx.cache::<NodePool>().get_named(&namespace, &name) {
            None => {
                let mut pool = NodePool::new(&name, spec);
                pool.metadata.namespace = Some(namespace);
                pool.metadata.labels = Some(BTreeMap::from([
                    (LABEL_KEY_SERVICE_ID.to_string(), svc.name_any()),
                    (LABEL_KEY_MANAGED_BY.to_string(), FIELD_MANAGER.to_string()),
                ]));
                pool.metadata.owner_references = Some(vec![owner_reference(svc)]);
                match api.create(&pool).await {
                    Ok(_) => info!(node_pool = %name, "Created dedicated NodePool"),
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(e),
                }
                Ok(None)
            }
            Some(existing) if existing.spec != spec => {
                let mut updated = (*existing).clone();
                updated.spec = spec;
                api.replace(&updated).await?;
                Ok(Some(existing))
            }
            Some(existing) => Ok(Some(existing)),
        }
    }

    /// The pool the Service runs on and the newest epoch that is ready for
    /// workloads, or why there is none yet
    async fn node_pool(&self, svc: &Service) -> Result<std::result::Result<(Arc<NodePool>, i64), String>> {
        let namespace = svc.namespace().unwrap_or_default();
        let selection = &svc.spec.node_pool;
        let pool = match (&selection.shared, &selection.dedicated) {
            (Some(name), _) => match self.ctx.cache::<NodePool>().get_named(&namespace, name) {
                Some(pool) => pool,
                None => return Ok(Err(format!("node pool {name} does not exist"))),
            },
            (None, Some(dedicated)) => {
                let spec = NodePoolSpec {
                    instance_type: dedicated.instance_type.clone(),
                    num_instances: dedicated.num_instances,
                };
                match self.ensure_dedicated_pool(svc, spec).await? {
                    Some(pool) => pool,
                    None => return Ok(Err("dedicated node pool is being created".to_string())),
                }
            }
            (None, None) => return Err(Error::ValidationError("no node pool selected".to_string())),
        };
        if is_being_deleted(pool.meta()) {
            return Ok(Err(format!("node pool {} is being deleted", pool.name_any())));
        }
        let ready = pool.status.as_ref().and_then(|status| {
            status
                .epochs
                .iter()
                .rev()
                .find(|(_, e)| matches!(e.state, NodePoolEpochState::Stable | NodePoolEpochState::Scaling))
                .map(|(epoch, _)| *epoch)
        });
        match ready {
            Some(epoch) => Ok(Ok((pool, epoch))),
            None => Ok(Err(format!("node pool {} has no ready epoch", pool.name_any()))),
        }
    }

    fn workload_spec(&self, svc: &Service, pool: &NodePool, epoch: i64) -> Result<WorkloadSpec> {
        let name = svc.name_any();
        let selector = BTreeMap::from([(LABEL_KEY_SERVICE_ID.to_string(), name.clone())]);
        let mut labels = selector.clone();
        labels.insert(LABEL_KEY_MANAGED_BY.to_string(), FIELD_MANAGER.to_string());
        let epoch_id = pool.epoch_id(epoch);

        let mut spec = WorkloadSpec {
            name: name.clone(),
            namespace: svc.namespace().unwrap_or_default(),
            labels,
            annotations: BTreeMap::new(),
            selector,
            replicas: svc.spec.instances,
            containers: vec![Container {
                name: MAIN_CONTAINER.to_string(),
                image: svc.spec.image.clone(),
                command: svc.spec.command.clone(),
                args: vec![],
                env: svc.spec.env.clone(),
                ports: svc
                    .spec
                    .ports
                    .iter()
                    .map(|p| ContainerPort {
                        name: p.name.clone(),
                        port: p.port,
                        protocol: p.protocol,
                    })
                    .collect(),
                resources: svc.spec.resources.clone(),
                volume_mounts: vec![],
            }],
            node_selector: BTreeMap::from([(LABEL_KEY_NODE_POOL_ID.to_string(), epoch_id.clone())]),
            tolerations: vec![Toleration {
                key: LABEL_KEY_NODE_POOL_ID.to_string(),
                value: epoch_id,
            }],
            volumes: vec![],
            owner: Some(owner_reference(svc)),
        };
        self.ctx.service_mesh.transform_workload_spec(svc, &mut spec)?;
        self.ctx.cloud_provider.transform_workload_spec(&mut spec);

        let hash = spec.spec_hash()?;
        spec.annotations.insert(ANNOTATION_KEY_SPEC_HASH.to_string(), hash);
        Ok(spec)
    }

    async fn ensure_network_service(&self, svc: &Service) -> Result<()> {
        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_any();
        if svc.spec.ports.is_empty() {
            return self.ctx.orchestrator.delete_network_service(&namespace, &name).await;
        }
        let mesh_ports = self.ctx.service_mesh.service_mesh_ports(svc);
        let spec = NetworkServiceSpec {
            name: name.clone(),
            namespace,
            labels: BTreeMap::from([
                (LABEL_KEY_SERVICE_ID.to_string(), name.clone()),
                (LABEL_KEY_MANAGED_BY.to_string(), FIELD_MANAGER.to_string()),
            ]),
            selector: BTreeMap::from([(LABEL_KEY_SERVICE_ID.to_string(), name)]),
            kind: NetworkServiceKind::ClusterIp,
            ports: svc
                .spec
                .ports
                .iter()
                .map(|p| NetworkServicePort {
                    name: p.name.clone(),
                    port: p.port,
                    target_port: mesh_ports.get(&p.port).copied().unwrap_or(p.port),
                    protocol: p.protocol,
                })
                .collect(),
            owner: Some(owner_reference(svc)),
        };
        self.ctx.orchestrator.apply_network_service(&spec).await?;
        Ok(())
    }

    async fn ensure_address(&self, svc: &Service) -> Result<Option<Arc<Address>>> {
        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_any();
        if let Some(address) = self.ctx.cache::<Address>().get_named(&namespace, &name) {
            return Ok(Some(address));
        }
        let mut address = Address::new(&name, AddressSpec { service: name.clone() });
        address.metadata.namespace = Some(namespace);
        address.metadata.labels = Some(BTreeMap::from([
            (LABEL_KEY_SERVICE_ID.to_string(), name.clone()),
            (LABEL_KEY_MANAGED_BY.to_string(), FIELD_MANAGER.to_string()),
        ]));
        address.metadata.owner_references = Some(vec![owner_reference(svc)]);
        match self.ctx.store.api::<Address>().create(&address).await {
            Ok(_) => info!(address = %name, "Created Address"),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
        Ok(None)
    }

    /// Record `epoch` as assigned, and once the rollout onto it is complete,
    /// forget every other epoch
    async fn update_assignments(
        &self,
        svc: &Service,
        pool: &NodePool,
        epoch: i64,
        rolled_out: bool,
    ) -> Result<Service> {
        let namespace = pool.namespace().unwrap_or_default();
        let pool_name = pool.name_any();
        let mut assignments = NodePoolAssignments::from_annotations(svc.metadata.annotations.as_ref())?;
        if rolled_out {
            assignments = NodePoolAssignments::default();
        }
        assignments.add(&namespace, &pool_name, epoch);

        let value = assignments.to_annotation_value()?;
        let changes = BTreeMap::from([(ANNOTATION_KEY_NODE_POOL.to_string(), Some(value))]);
        patch_annotations(&self.ctx.store.api::<Service>(), svc, changes).await
    }

    async fn finalize(&self, svc: &Service) -> Result<Action> {
        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_any();

        let status = ServiceStatus {
            state: ServiceState::Deleting,
            ..svc.status.clone().unwrap_or_default()
        };
        let svc = self.write(svc, status).await?;

        if let Some(address) = self.ctx.cache::<Address>().get_named(&namespace, &name) {
            if !is_being_deleted(address.meta()) {
                self.ctx
                    .store
                    .api::<Address>()
                    .delete_if_exists(&namespace, &name)
                    .await?;
            }
            debug!("Waiting for Address {}/{} to be deleted", namespace, name);
            return Ok(Action::requeue(PROGRESS_REQUEUE));
        }

        self.ctx
            .orchestrator
            .delete_network_service(&namespace, &name)
            .await?;
        self.ctx.orchestrator.delete_workload(&namespace, &name).await?;
        if self.ctx.orchestrator.workload(&namespace, &name).await?.is_some() {
            debug!("Waiting for workload {}/{} to terminate", namespace, name);
            return Ok(Action::requeue(PROGRESS_REQUEUE));
        }

        remove_finalizer(&self.ctx.store.api::<Service>(), &svc, SERVICE_FINALIZER).await?;
        info!("Service {}/{} finalized", namespace, name);
        Ok(Action::await_change())
    }
}

/// Whether the orchestrator runs `desired_hash` on every instance
fn rollout_complete(observed: Option<&ObservedWorkload>, desired_hash: &str) -> bool {
    observed.is_some_and(|w| {
        w.annotations.get(ANNOTATION_KEY_SPEC_HASH).map(String::as_str) == Some(desired_hash)
            && w.status.current
            && w.status.stale() == 0
            && w.status.updated == w.status.desired
    })
}

pub(crate) fn service_state(observed: &ObservedWorkload, desired_hash: &str, instances: i32) -> ServiceState {
    let status = &observed.status;
    let hash_matches =
        observed.annotations.get(ANNOTATION_KEY_SPEC_HASH).map(String::as_str) == Some(desired_hash);
    if !hash_matches || !status.current || status.stale() > 0 {
        return ServiceState::Updating;
    }
    if status.available != instances || status.replicas != instances || status.terminating > 0 {
        return ServiceState::Scaling;
    }
    ServiceState::Stable
}

#[async_trait]
impl Reconciler for ServiceReconciler {
    fn name(&self) -> &'static str {
        "service"
    }

    #[instrument(skip(self), fields(service = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(cached) = self.ctx.cache::<Service>().get(key) else {
            return Ok(Action::await_change());
        };
        if is_being_deleted(cached.meta()) {
            return self.finalize(&cached).await;
        }

        let api = self.ctx.store.api::<Service>();
        let svc = add_finalizer(&api, &*cached, SERVICE_FINALIZER).await?;
        if let Err(e) = svc.spec.validate() {
            return self.fail(&svc, e.to_string()).await;
        }

        let (pool, epoch) = match self.node_pool(&svc).await? {
            Ok(found) => found,
            Err(message) => return self.pending(&svc, message).await,
        };

        let desired = self.workload_spec(&svc, &pool, epoch)?;
        let desired_hash = desired
            .annotations
            .get(ANNOTATION_KEY_SPEC_HASH)
            .cloned()
            .unwrap_or_default();
        let observed = self
            .ctx
            .orchestrator
            .workload(&key.namespace, &key.name)
            .await?;
        let rolled_out = rollout_complete(observed.as_ref(), &desired_hash);
        let svc = self.update_assignments(&svc, &pool, epoch, rolled_out).await?;

        let applied_hash = observed
            .as_ref()
            .and_then(|w| w.annotations.get(ANNOTATION_KEY_SPEC_HASH));
        if applied_hash != Some(&desired_hash) {
            info!(epoch, hash = %desired_hash, "Applying workload for Service {}", key);
            match self.ctx.orchestrator.apply_workload(&desired).await {
                Ok(()) => {}
                Err(Error::InvalidWorkload { message, .. }) => return self.fail(&svc, message).await,
                Err(e) => return Err(e),
            }
        }
        self.ensure_network_service(&svc).await?;
        let address = self.ensure_address(&svc).await?;

        let Some(observed) = self
            .ctx
            .orchestrator
            .workload(&key.namespace, &key.name)
            .await?
        else {
            return Ok(Action::requeue(PROGRESS_REQUEUE));
        };
        let state = service_state(&observed, &desired_hash, svc.spec.instances);
        let ports = address
            .and_then(|a| a.status.as_ref().map(|s| s.ports.clone()))
            .unwrap_or_default();
        let previous = svc.status.clone().unwrap_or_default();
        let status = ServiceStatus {
            observed_generation: svc.meta().generation,
            state,
            available_instances: observed.status.available,
            updated_instances: observed.status.updated,
            stale_instances: observed.status.stale(),
            terminating_instances: observed.status.terminating,
            ports,
            failure_info: None,
            message: None,
        };
        if previous.state != state {
            info!(from = ?previous.state, to = ?state, "Service {} changed state", key);
        }
        self.write(&svc, status).await?;

        Ok(match state {
            ServiceState::Stable => Action::requeue(STABLE_REQUEUE),
            _ => Action::requeue(PROGRESS_REQUEUE),
        })
    }
}

pub(crate) fn register(ctx: &Context, queue: &WorkQueue<ObjectKey>) -> Vec<Arc<dyn SharedInformer>> {
    let services = ctx.cache::<Service>();
    vec![
        watch::<Service>(ctx, EnqueueHandler::for_object(queue.clone())),
        watch::<NodePool>(
            ctx,
            EnqueueHandler::mapped(queue.clone(), move |pool: &NodePool| {
                let namespace = pool.namespace().unwrap_or_default();
                let name = pool.name_any();
                let mut keys = owner_keys(pool);
                keys.extend(
                    services
                        .list(Some(&namespace))
                        .iter()
                        .filter(|svc| svc.spec.node_pool.shared.as_deref() == Some(name.as_str()))
                        .map(|svc| ObjectKey::from_object(svc.as_ref())),
                );
                keys
            }),
        ),
        watch::<Address>(
            ctx,
            EnqueueHandler::mapped(queue.clone(), |address: &Address| owner_keys(address)),
        ),
    ]
}
