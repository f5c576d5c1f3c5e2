//! System reconciler
//!
//! Aggregates the System's Services and lifecycle actions into its status,
//! and on deletion drains everything the System owns before letting it go.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{info, instrument, warn};

use super::lifecycle::{LifecycleAction, LifecycleActions};
use super::status::update_status;
use super::{
    add_finalizer, remove_finalizer, system_of, watch, Context, PROGRESS_REQUEUE, STABLE_REQUEUE,
};
use crate::crd::meta::{is_being_deleted, SYSTEM_FINALIZER};
use crate::crd::{
    Deploy, Job, NodePool, Service, ServiceState, System, SystemServiceSummary, SystemState,
    SystemStatus, Teardown, TeardownState,
};
use crate::error::Result;
use crate::runtime::{Action, EnqueueHandler, Reconciler, SharedInformer, WorkQueue};
use crate::store::{LatticeResource, ObjectKey};

pub struct SystemReconciler {
    ctx: Arc<Context>,
}

impl SystemReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Delete every `K` in the namespace and report how many are left
    async fn drain<K: LatticeResource>(&self, namespace: &str) -> Result<usize> {
        let api = self.ctx.store.api::<K>();
        let remaining = self.ctx.cache::<K>().list(Some(namespace));
        for obj in &remaining {
            if !is_being_deleted(obj.meta()) {
                api.delete_if_exists(namespace, &obj.name_any()).await?;
            }
        }
        Ok(remaining.len())
    }

    /// Services and Jobs go first so their node pools are no longer in use
    /// when the pools are deleted
    async fn finalize(&self, system: &System) -> Result<Action> {
        let namespace = system.namespace().unwrap_or_default();
        let api = self.ctx.store.api::<System>();

        let mut status = system.status.clone().unwrap_or_default();
        status.state = SystemState::Deleting;
        let system = update_status(&api, system, status).await?;

        let workloads =
            self.drain::<Service>(&namespace).await? + self.drain::<Job>(&namespace).await?;
        if workloads > 0 {
            info!(system = %system.name_any(), remaining = workloads, "Waiting for workloads to be deleted");
            return Ok(Action::requeue(PROGRESS_REQUEUE));
        }
        let pools = self.drain::<NodePool>(&namespace).await?;
        if pools > 0 {
            info!(system = %system.name_any(), remaining = pools, "Waiting for node pools to be deleted");
            return Ok(Action::requeue(PROGRESS_REQUEUE));
        }

        remove_finalizer(&api, &system, SYSTEM_FINALIZER).await?;
        info!("System {}/{} finalized", namespace, system.name_any());
        Ok(Action::await_change())
    }
}

/// Overall state of a System, highest priority first
pub(crate) fn system_state(services: &[Arc<Service>], actions: &LifecycleActions) -> SystemState {
    let active = actions.active();
    if matches!(active, Some(LifecycleAction::Teardown(_))) {
        return SystemState::Deleting;
    }

    let state_of = |svc: &Service| svc.status.as_ref().map(|s| s.state).unwrap_or_default();
    if !services.is_empty() && services.iter().all(|s| state_of(s) == ServiceState::Failed) {
        return SystemState::Failed;
    }
    if services.iter().any(|s| state_of(s) == ServiceState::Failed) {
        return SystemState::Degraded;
    }
    let lagging = |svc: &Service| {
        svc.status.as_ref().and_then(|s| s.observed_generation) != svc.meta().generation
    };
    if services.iter().any(|s| {
        matches!(
            state_of(s),
            ServiceState::Updating | ServiceState::Pending | ServiceState::Deleting
        ) || lagging(s)
    }) {
        return SystemState::Updating;
    }
    if services.iter().any(|s| state_of(s) == ServiceState::Scaling) {
        return SystemState::Scaling;
    }
    if matches!(active, Some(LifecycleAction::Deploy(_))) {
        return SystemState::Updating;
    }
    if services.is_empty() {
        let torn_down = matches!(
            actions.latest(),
            Some(LifecycleAction::Teardown(t))
                if t.status.as_ref().is_some_and(|s| s.state == TeardownState::Succeeded)
        );
        if torn_down {
            return SystemState::Deleted;
        }
        if actions.latest_succeeded_deploy().is_none() {
            return SystemState::Pending;
        }
    }
    SystemState::Stable
}

fn summarize(services: &[Arc<Service>]) -> BTreeMap<String, SystemServiceSummary> {
    services
        .iter()
        .map(|svc| {
            let status = svc.status.clone().unwrap_or_default();
            (
                svc.spec.path.to_string(),
                SystemServiceSummary {
                    name: svc.name_any(),
                    state: status.state,
                    available_instances: status.available_instances,
                    updated_instances: status.updated_instances,
                    stale_instances: status.stale_instances,
                    terminating_instances: status.terminating_instances,
                    ports: status.ports,
                },
            )
        })
        .collect()
}

#[async_trait]
impl Reconciler for SystemReconciler {
    fn name(&self) -> &'static str {
        "system"
    }

    #[instrument(skip(self), fields(system = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(system) = self.ctx.cache::<System>().get(key) else {
            return Ok(Action::await_change());
        };
        if is_being_deleted(system.meta()) {
            return self.finalize(&system).await;
        }

        let api = self.ctx.store.api::<System>();
        let system = add_finalizer(&api, &*system, SYSTEM_FINALIZER).await?;
        let previous = system.status.clone().unwrap_or_default();

        if let Err(e) = system.spec.validate() {
            warn!("Validation failed for System {}: {}", key, e);
            let status = SystemStatus {
                observed_generation: system.meta().generation,
                state: SystemState::Failed,
                message: Some(e.to_string()),
                ..previous
            };
            update_status(&api, &system, status).await?;
            return Ok(Action::await_change());
        }

        let mut services = self.ctx.cache::<Service>().list(Some(&key.namespace));
        services.sort_by(|a, b| a.spec.path.cmp(&b.spec.path));
        let actions = LifecycleActions::load(&self.ctx, &key.namespace);

        let state = system_state(&services, &actions);
        let version = actions
            .latest_succeeded_deploy()
            .and_then(|d| d.status.as_ref())
            .and_then(|s| s.version.clone())
            .or(previous.version);

        let status = SystemStatus {
            observed_generation: system.meta().generation,
            state,
            version,
            services: summarize(&services),
            message: None,
        };
        if previous.state != state {
            info!(from = ?previous.state, to = ?state, "System {} changed state", key);
        }
        update_status(&api, &system, status).await?;

        Ok(match state {
            SystemState::Stable | SystemState::Deleted => Action::requeue(STABLE_REQUEUE),
            _ => Action::requeue(PROGRESS_REQUEUE),
        })
    }
}

pub(crate) fn register(ctx: &Context, queue: &WorkQueue<ObjectKey>) -> Vec<Arc<dyn SharedInformer>> {
    vec![
        watch::<System>(ctx, EnqueueHandler::for_object(queue.clone())),
        watch::<Service>(
            ctx,
            EnqueueHandler::mapped(queue.clone(), system_of::<Service>(&ctx.lattice_id)),
        ),
        watch::<Deploy>(
            ctx,
            EnqueueHandler::mapped(queue.clone(), system_of::<Deploy>(&ctx.lattice_id)),
        ),
        watch::<Teardown>(
            ctx,
            EnqueueHandler::mapped(queue.clone(), system_of::<Teardown>(&ctx.lattice_id)),
        ),
        watch::<NodePool>(
            ctx,
            EnqueueHandler::mapped(queue.clone(), system_of::<NodePool>(&ctx.lattice_id)),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        DeploySpec, DeployState, DeployStatus, NodePoolSelection, ServiceSpec, ServiceStatus,
        TeardownSpec, TeardownStatus, TreePath,
    };
    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn service(path: &str, state: ServiceState) -> Arc<Service> {
        let mut svc = Service::new(
            "svc",
            ServiceSpec {
                path: TreePath::parse(path).unwrap(),
                image: "img".to_string(),
                instances: 1,
                ports: vec![],
                resources: Default::default(),
                env: Default::default(),
                command: None,
                node_pool: NodePoolSelection {
                    shared: Some("pool".to_string()),
                    dedicated: None,
                },
            },
        );
        svc.metadata.generation = Some(1);
        svc.status = Some(ServiceStatus {
            observed_generation: Some(1),
            state,
            ..Default::default()
        });
        Arc::new(svc)
    }

    fn actions(deploys: Vec<(i64, DeployState)>, teardowns: Vec<(i64, TeardownState)>) -> LifecycleActions {
        let mut all = Vec::new();
        for (i, (secs, state)) in deploys.into_iter().enumerate() {
            let mut d = Deploy::new(
                &format!("d{i}"),
                DeploySpec {
                    build: None,
                    path: None,
                    version: Some("v1".to_string()),
                },
            );
            d.metadata.creation_timestamp = Some(Time(Utc.timestamp_opt(secs, 0).unwrap()));
            d.status = Some(DeployStatus {
                state,
                version: Some("v1".to_string()),
                ..Default::default()
            });
            all.push(LifecycleAction::Deploy(Arc::new(d)));
        }
        for (i, (secs, state)) in teardowns.into_iter().enumerate() {
            let mut t = Teardown::new(&format!("t{i}"), TeardownSpec {});
            t.metadata.creation_timestamp = Some(Time(Utc.timestamp_opt(secs, 0).unwrap()));
            t.status = Some(TeardownStatus {
                state,
                ..Default::default()
            });
            all.push(LifecycleAction::Teardown(Arc::new(t)));
        }
        LifecycleActions::from_actions(all)
    }

    #[test]
    fn test_never_deployed_is_pending() {
        assert_eq!(system_state(&[], &actions(vec![], vec![])), SystemState::Pending);
    }

    #[test]
    fn test_failure_states() {
        let none = actions(vec![(1, DeployState::Succeeded)], vec![]);
        let failed = vec![service("/a", ServiceState::Failed)];
        assert_eq!(system_state(&failed, &none), SystemState::Failed);

        let mixed = vec![
            service("/a", ServiceState::Failed),
            service("/b", ServiceState::Stable),
        ];
        assert_eq!(system_state(&mixed, &none), SystemState::Degraded);
    }

    #[test]
    fn test_progress_states() {
        let done = actions(vec![(1, DeployState::Succeeded)], vec![]);
        let scaling = vec![
            service("/a", ServiceState::Scaling),
            service("/b", ServiceState::Stable),
        ];
        assert_eq!(system_state(&scaling, &done), SystemState::Scaling);

        let in_flight = actions(
            vec![(1, DeployState::Succeeded), (2, DeployState::InProgress)],
            vec![],
        );
        let stable = vec![service("/a", ServiceState::Stable)];
        assert_eq!(system_state(&stable, &in_flight), SystemState::Updating);
        assert_eq!(system_state(&stable, &done), SystemState::Stable);
    }

    #[test]
    fn test_lagging_generation_is_updating() {
        let done = actions(vec![(1, DeployState::Succeeded)], vec![]);
        let mut svc = (*service("/a", ServiceState::Stable)).clone();
        svc.metadata.generation = Some(2);
        assert_eq!(system_state(&[Arc::new(svc)], &done), SystemState::Updating);
    }

    #[test]
    fn test_teardown_states() {
        let running = actions(
            vec![(1, DeployState::Succeeded)],
            vec![(2, TeardownState::InProgress)],
        );
        let stable = vec![service("/a", ServiceState::Stable)];
        assert_eq!(system_state(&stable, &running), SystemState::Deleting);

        let finished = actions(
            vec![(1, DeployState::Succeeded)],
            vec![(2, TeardownState::Succeeded)],
        );
        assert_eq!(system_state(&[], &finished), SystemState::Deleted);
    }
}
