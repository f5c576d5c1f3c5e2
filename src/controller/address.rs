//! Address reconciler
//!
//! Every Service gets an internal DNS name. Services with public ports are
//! additionally exposed through a node port service and a cloud load
//! balancer forwarding to every node pool epoch the Service may run on.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::status::{alarm_orphaned_state, epoch_info, patch_annotations, update_status};
use super::{add_finalizer, all_in_namespace, remove_finalizer, watch, Context, PROGRESS_REQUEUE, STABLE_REQUEUE};
use crate::cloudprovider::{DnsRecord, DnsRecordType, LoadBalancerTarget};
use crate::crd::meta::{
    is_being_deleted, owner_reference, ADDRESS_FINALIZER, FIELD_MANAGER, LABEL_KEY_ADDRESS_ID,
    LABEL_KEY_MANAGED_BY, LABEL_KEY_SERVICE_ID,
};
use crate::crd::{
    Address, AddressState, AddressStatus, FailureInfo, NodePool, NodePoolAssignments, Service,
    TreePath,
};
use crate::error::Result;
use crate::orchestrator::{NetworkServiceKind, NetworkServicePort, NetworkServiceSpec};
use crate::runtime::{Action, EnqueueHandler, Reconciler, SharedInformer, WorkQueue};
use crate::store::ObjectKey;

/// DNS name recorded for an Address, so it can be destroyed after its
/// Service is gone
const ANNOTATION_KEY_DNS_NAME: &str = "address.lattice.mlab.com/dns-name";

/// Node port service fronting an Address's load balancer
pub fn node_port_service_name(address: &str) -> String {
    format!("load-balancer-address-{address}")
}

/// Lattice-internal DNS name of the Service at `path`
pub fn address_dns_name(path: &TreePath, system_id: &str, lattice_id: &str) -> String {
    format!("{}.{system_id}.{lattice_id}.lattice.local", path.to_domain())
}

pub struct AddressReconciler {
    ctx: Arc<Context>,
}

impl AddressReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn write(&self, address: &Address, status: AddressStatus) -> Result<Address> {
        update_status(&self.ctx.store.api::<Address>(), address, status).await
    }

    async fn fail(&self, address: &Address, message: String) -> Result<Address> {
        warn!(
            "Address {}/{} failed: {}",
            address.namespace().unwrap_or_default(),
            address.name_any(),
            message
        );
        let status = AddressStatus {
            observed_generation: address.meta().generation,
            state: AddressState::Failed,
            failure_info: Some(FailureInfo::renew(
                address.status.as_ref().and_then(|s| s.failure_info.as_ref()),
                message,
            )),
            ..address.status.clone().unwrap_or_default()
        };
        self.write(address, status).await
    }

    async fn ensure_dns(&self, address: Address, svc: &Service) -> Result<Address> {
        let namespace = address.namespace().unwrap_or_default();
        let system_id = self.ctx.system_id(&namespace).unwrap_or_default();
        let name = address_dns_name(&svc.spec.path, system_id, &self.ctx.lattice_id);

        let address = patch_annotations(
            &self.ctx.store.api::<Address>(),
            &address,
            BTreeMap::from([(ANNOTATION_KEY_DNS_NAME.to_string(), Some(name.clone()))]),
        )
        .await?;
        let record = DnsRecord {
            name,
            record_type: DnsRecordType::Cname,
            value: format!("{}.{namespace}.svc.cluster.local", svc.name_any()),
        };
        if let Err(e) = self.ctx.cloud_provider.ensure_dns_record(&record).await {
            self.fail(&address, format!("dns record: {e}")).await?;
            return Err(e);
        }
        Ok(address)
    }

    /// Tear down the load balancer and the node port service behind it
    async fn remove_load_balancer(&self, address: &Address) -> Result<()> {
        let namespace = address.namespace().unwrap_or_default();
        if let Err(e) = self
            .ctx
            .cloud_provider
            .destroy_service_address_load_balancer(address)
            .await
        {
            alarm_orphaned_state("Address", &address.name_any(), &e);
            return Err(e);
        }
        self.ctx
            .orchestrator
            .delete_network_service(&namespace, &node_port_service_name(&address.name_any()))
            .await
    }

    /// Every epoch's infrastructure facts for the pools `svc` is assigned to
    fn load_balancer_target(&self, svc: &Service, node_ports: &BTreeMap<i32, i32>) -> Result<LoadBalancerTarget> {
        let mut target = LoadBalancerTarget::default();
        for port in svc.spec.public_ports() {
            if let Some(node_port) = node_ports.get(&port.port) {
                target.ports.insert(port.port, *node_port);
                target.protocols.insert(port.port, port.protocol);
            }
        }
        let assignments = NodePoolAssignments::from_annotations(svc.metadata.annotations.as_ref())?;
        let pools = self.ctx.cache::<NodePool>();
        for (namespace, name, epoch) in assignments.iter() {
            let Some(pool) = pools.get_named(namespace, name) else {
                continue;
            };
            if let Some(info) = epoch_info(&pool, epoch)? {
                target.node_pools.push(info);
            }
        }
        Ok(target)
    }

    async fn expose(&self, address: Address, svc: &Service) -> Result<Action> {
        let namespace = address.namespace().unwrap_or_default();
        let Some(workload) = self
            .ctx
            .orchestrator
            .workload(&namespace, &svc.name_any())
            .await?
        else {
            let status = AddressStatus {
                observed_generation: address.meta().generation,
                state: AddressState::Updating,
                message: Some("waiting for the service's workload".to_string()),
                ..address.status.clone().unwrap_or_default()
            };
            self.write(&address, status).await?;
            return Ok(Action::requeue(PROGRESS_REQUEUE));
        };
        let mesh_ports = self
            .ctx
            .service_mesh
            .service_mesh_ports_from_annotations(&workload.annotations)?;

        let name = node_port_service_name(&address.name_any());
        let spec = NetworkServiceSpec {
            name,
            namespace,
            labels: BTreeMap::from([
                (LABEL_KEY_ADDRESS_ID.to_string(), address.name_any()),
                (LABEL_KEY_MANAGED_BY.to_string(), FIELD_MANAGER.to_string()),
            ]),
            selector: BTreeMap::from([(LABEL_KEY_SERVICE_ID.to_string(), svc.name_any())]),
            kind: NetworkServiceKind::NodePort,
            ports: svc
                .spec
                .public_ports()
                .map(|p| NetworkServicePort {
                    name: p.name.clone(),
                    port: p.port,
                    target_port: mesh_ports.get(&p.port).copied().unwrap_or(p.port),
                    protocol: p.protocol,
                })
                .collect(),
            owner: Some(owner_reference(&address)),
        };
        let node_ports = self.ctx.orchestrator.apply_network_service(&spec).await?;
        let target = self.load_balancer_target(svc, &node_ports.node_ports)?;

        let info = match self
            .ctx
            .cloud_provider
            .ensure_service_address_load_balancer(&address, &target)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                self.fail(&address, format!("load balancer: {e}")).await?;
                return Err(e);
            }
        };
        let changes = info
            .annotations
            .into_iter()
            .map(|(k, v)| (k, Some(v)))
            .collect();
        let address =
            patch_annotations(&self.ctx.store.api::<Address>(), &address, changes).await?;

        let status = AddressStatus {
            observed_generation: address.meta().generation,
            state: AddressState::Stable,
            ports: info.ports,
            failure_info: None,
            message: None,
        };
        self.write(&address, status).await?;
        Ok(Action::requeue(STABLE_REQUEUE))
    }

    async fn finalize(&self, address: &Address) -> Result<Action> {
        let namespace = address.namespace().unwrap_or_default();
        if let Err(e) = self.remove_load_balancer(address).await {
            let status = AddressStatus {
                message: Some(format!("failed to remove load balancer: {e}")),
                ..address.status.clone().unwrap_or_default()
            };
            self.write(address, status).await?;
            return Err(e);
        }
        if let Some(dns_name) = address.annotations().get(ANNOTATION_KEY_DNS_NAME) {
            if let Err(e) = self.ctx.cloud_provider.destroy_dns_record(dns_name).await {
                alarm_orphaned_state("Address", dns_name, &e);
                return Err(e);
            }
        }
        remove_finalizer(&self.ctx.store.api::<Address>(), address, ADDRESS_FINALIZER).await?;
        info!("Address {}/{} finalized", namespace, address.name_any());
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler for AddressReconciler {
    fn name(&self) -> &'static str {
        "address"
    }

    #[instrument(skip(self), fields(address = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(cached) = self.ctx.cache::<Address>().get(key) else {
            return Ok(Action::await_change());
        };
        if is_being_deleted(cached.meta()) {
            return self.finalize(&cached).await;
        }

        let address = add_finalizer(&self.ctx.store.api::<Address>(), &*cached, ADDRESS_FINALIZER).await?;
        let Some(svc) = self
            .ctx
            .cache::<Service>()
            .get_named(&key.namespace, &address.spec.service)
        else {
            debug!(service = %address.spec.service, "Waiting for Service");
            let status = AddressStatus {
                observed_generation: address.meta().generation,
                state: AddressState::Pending,
                ..address.status.clone().unwrap_or_default()
            };
            self.write(&address, status).await?;
            return Ok(Action::requeue(PROGRESS_REQUEUE));
        };

        let address = self.ensure_dns(address, &svc).await?;

        if svc.spec.has_public_ports() {
            return self.expose(address, &svc).await;
        }

        let exposed = address.status.as_ref().is_some_and(|s| !s.ports.is_empty())
            || self
                .ctx
                .orchestrator
                .network_service(&key.namespace, &node_port_service_name(&key.name))
                .await?
                .is_some();
        if exposed {
            info!("Service {} no longer has public ports, removing load balancer", svc.name_any());
            self.remove_load_balancer(&address).await?;
        }
        let status = AddressStatus {
            observed_generation: address.meta().generation,
            state: AddressState::Stable,
            ports: BTreeMap::new(),
            failure_info: None,
            message: None,
        };
        self.write(&address, status).await?;
        Ok(Action::requeue(STABLE_REQUEUE))
    }
}

pub(crate) fn register(ctx: &Context, queue: &WorkQueue<ObjectKey>) -> Vec<Arc<dyn SharedInformer>> {
    vec![
        watch::<Address>(ctx, EnqueueHandler::for_object(queue.clone())),
        watch::<Service>(
            ctx,
            EnqueueHandler::mapped(queue.clone(), |svc: &Service| {
                vec![ObjectKey::from_object(svc)]
            }),
        ),
        watch::<NodePool>(
            ctx,
            EnqueueHandler::mapped(
                queue.clone(),
                all_in_namespace::<NodePool, Address>(ctx.cache::<Address>()),
            ),
        ),
    ]
}
