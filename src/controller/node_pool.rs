//! NodePool reconciler
//!
//! Keeps one epoch per provisioned generation of a pool's infrastructure.
//! A spec change the cloud provider cannot apply in place allocates a new
//! epoch; older epochs are deprovisioned oldest first once no Service is
//! assigned to them any more.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::status::{
    alarm_orphaned_state, epoch_info, patch_annotations, update_status, with_epoch_info,
    without_epoch_info,
};
use super::{add_finalizer, remove_finalizer, watch, Context, PROGRESS_REQUEUE, STABLE_REQUEUE};
use crate::crd::meta::{is_being_deleted, NODE_POOL_FINALIZER};
use crate::crd::{
    NodePool, NodePoolAssignments, NodePoolEpochState, NodePoolEpochStatus, NodePoolState,
    NodePoolStatus, Service,
};
use crate::error::Result;
use crate::runtime::{Action, EnqueueHandler, Reconciler, SharedInformer, WorkQueue};
use crate::store::ObjectKey;

pub struct NodePoolReconciler {
    ctx: Arc<Context>,
}

impl NodePoolReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn write(&self, pool: &NodePool, status: &NodePoolStatus) -> Result<NodePool> {
        update_status(&self.ctx.store.api::<NodePool>(), pool, status.clone()).await
    }

    /// Epochs of `pool` some Service in its namespace is assigned to
    fn assigned_epochs(&self, pool: &NodePool) -> Result<BTreeSet<i64>> {
        let namespace = pool.namespace().unwrap_or_default();
        let name = pool.name_any();
        let mut epochs = BTreeSet::new();
        for svc in self.ctx.cache::<Service>().list(Some(&namespace)) {
            let assignments = NodePoolAssignments::from_annotations(svc.metadata.annotations.as_ref())?;
            epochs.extend(assignments.epochs(&namespace, &name).iter().copied());
        }
        Ok(epochs)
    }

    /// Deprovision one epoch and forget it. A failed destroy leaves the
    /// epoch in `deleting` so it is retried.
    async fn retire(&self, pool: NodePool, status: &mut NodePoolStatus, epoch: i64) -> Result<NodePool> {
        if let Some(entry) = status.epochs.get_mut(&epoch) {
            entry.state = NodePoolEpochState::Deleting;
        }
        let pool = self.write(&pool, status).await?;

        if let Err(e) = self
            .ctx
            .cloud_provider
            .deprovision_node_pool_epoch(&pool, epoch)
            .await
        {
            alarm_orphaned_state("NodePool", &pool.epoch_id(epoch), &e);
            status.message = Some(format!("failed to deprovision epoch {epoch}: {e}"));
            self.write(&pool, status).await?;
            return Err(e);
        }

        status.epochs.remove(&epoch);
        let pool = self.write(&pool, status).await?;
        let pool = patch_annotations(
            &self.ctx.store.api::<NodePool>(),
            &pool,
            without_epoch_info(&pool, epoch)?,
        )
        .await?;
        info!(node_pool = %pool.id(), epoch, "Retired node pool epoch");
        Ok(pool)
    }

    async fn finalize(&self, pool: &NodePool) -> Result<Action> {
        let mut status = pool.status.clone().unwrap_or_default();
        status.state = NodePoolState::Deleting;

        let assigned = self.assigned_epochs(pool)?;
        if !assigned.is_empty() {
            status.message = Some(format!("waiting for services to leave epochs {assigned:?}"));
            self.write(pool, &status).await?;
            debug!(node_pool = %pool.id(), "NodePool still in use");
            return Ok(Action::requeue(PROGRESS_REQUEUE));
        }

        let mut pool = pool.clone();
        let epochs: Vec<i64> = status.epochs.keys().copied().collect();
        for epoch in epochs {
            pool = self.retire(pool, &mut status, epoch).await?;
        }

        remove_finalizer(&self.ctx.store.api::<NodePool>(), &pool, NODE_POOL_FINALIZER).await?;
        info!("NodePool {} finalized", pool.id());
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler for NodePoolReconciler {
    fn name(&self) -> &'static str {
        "node-pool"
    }

    #[instrument(skip(self), fields(node_pool = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(cached) = self.ctx.cache::<NodePool>().get(key) else {
            return Ok(Action::await_change());
        };
        if is_being_deleted(cached.meta()) {
            return self.finalize(&cached).await;
        }

        let api = self.ctx.store.api::<NodePool>();
        let mut pool = add_finalizer(&api, &*cached, NODE_POOL_FINALIZER).await?;
        let mut status = pool.status.clone().unwrap_or_default();
        status.observed_generation = pool.meta().generation;

        if let Err(e) = pool.spec.validate() {
            warn!("Validation failed for NodePool {}: {}", key, e);
            status.state = NodePoolState::Failed;
            status.message = Some(e.to_string());
            self.write(&pool, &status).await?;
            return Ok(Action::await_change());
        }

        if self.ctx.cloud_provider.node_pool_needs_new_epoch(&pool) {
            let epoch = status.next_epoch();
            info!(epoch, instance_type = %pool.spec.instance_type, "Allocating epoch for NodePool {}", key);
            status.epochs.insert(
                epoch,
                NodePoolEpochStatus {
                    instance_type: pool.spec.instance_type.clone(),
                    num_instances: pool.spec.num_instances,
                    state: NodePoolEpochState::Pending,
                },
            );
            status.state = status.derived_state();
            pool = self.write(&pool, &status).await?;
        }
        let Some(current) = status.current_epoch() else {
            return Ok(Action::requeue(PROGRESS_REQUEUE));
        };

        if let Some(entry) = status.epochs.get_mut(&current) {
            if entry.num_instances != pool.spec.num_instances {
                info!(
                    epoch = current,
                    from = entry.num_instances,
                    to = pool.spec.num_instances,
                    "Scaling NodePool {}",
                    key
                );
                entry.num_instances = pool.spec.num_instances;
                entry.state = NodePoolEpochState::Scaling;
                status.state = status.derived_state();
                pool = self.write(&pool, &status).await?;
            }
        }

        let params = status.epochs[&current].clone();
        let existing = epoch_info(&pool, current)?;
        match self
            .ctx
            .cloud_provider
            .provision_node_pool_epoch(&pool, current, &params, existing.as_ref())
            .await
        {
            Ok(info) => {
                if !info.is_empty() {
                    pool = patch_annotations(&api, &pool, with_epoch_info(&pool, current, info)?).await?;
                }
                if let Some(entry) = status.epochs.get_mut(&current) {
                    entry.state = NodePoolEpochState::Stable;
                }
            }
            Err(e) => {
                warn!("Provisioning NodePool {} epoch {} failed: {}", key, current, e);
                status.state = NodePoolState::Failed;
                status.message = Some(format!("failed to provision epoch {current}: {e}"));
                self.write(&pool, &status).await?;
                return Err(e);
            }
        }

        let assigned = self.assigned_epochs(&pool)?;
        let old: Vec<i64> = status.epochs.keys().copied().filter(|e| *e < current).collect();
        let mut waiting = false;
        for epoch in old {
            if assigned.contains(&epoch) {
                debug!(epoch, "Epoch still has services assigned");
                waiting = true;
                break;
            }
            pool = self.retire(pool, &mut status, epoch).await?;
        }

        status.state = status.derived_state();
        status.message = None;
        self.write(&pool, &status).await?;

        Ok(if waiting || status.state != NodePoolState::Stable {
            Action::requeue(PROGRESS_REQUEUE)
        } else {
            Action::requeue(STABLE_REQUEUE)
        })
    }
}

pub(crate) fn register(ctx: &Context, queue: &WorkQueue<ObjectKey>) -> Vec<Arc<dyn SharedInformer>> {
    vec![
        watch::<NodePool>(ctx, EnqueueHandler::for_object(queue.clone())),
        watch::<Service>(
            ctx,
            EnqueueHandler::mapped(queue.clone(), |svc: &Service| {
                let namespace = svc.namespace().unwrap_or_default();
                let mut pools = BTreeSet::new();
                if let Ok(assignments) =
                    NodePoolAssignments::from_annotations(svc.metadata.annotations.as_ref())
                {
                    for (ns, pool, _) in assignments.iter() {
                        pools.insert(ObjectKey::new(ns, pool));
                    }
                }
                if let Some(shared) = &svc.spec.node_pool.shared {
                    pools.insert(ObjectKey::new(namespace, shared.as_str()));
                }
                pools.into_iter().collect()
            }),
        ),
    ]
}
