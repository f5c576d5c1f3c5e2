//! Deploy reconciler
//!
//! A Deploy walks `pending -> accepted -> in-progress -> succeeded`:
//!
//! * pending: find or create the Build to roll out and wait for it
//! * accepted: make the System's NodePools and Services match the build's
//!   definition and delete Services the definition no longer names
//! * in-progress: wait until every Service has rolled out
//!
//! Only the newest unfinished lifecycle action of a System makes progress;
//! older ones fail as superseded.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::lifecycle::LifecycleActions;
use super::service::service_name;
use super::status::update_status;
use super::{all_in_namespace, watch, Context, PROGRESS_REQUEUE};
use crate::crd::meta::{
    is_being_deleted, is_owned_by, now_rfc3339, owner_reference, FIELD_MANAGER,
    LABEL_KEY_DEPLOY_ID, LABEL_KEY_MANAGED_BY, LABEL_KEY_SERVICE_PATH,
};
use crate::crd::{
    Build, BuildSpec, BuildState, Deploy, DeployState, DeployStatus, NodePool, NodePoolSpec,
    Service, ServiceSpec, ServiceState, System, Teardown, TreePath,
};
use crate::definition::{SystemDefinition, WorkloadDefinition};
use crate::error::Result;
use crate::runtime::{Action, EnqueueHandler, Reconciler, SharedInformer, WorkQueue};
use crate::store::ObjectKey;

pub struct DeployReconciler {
    ctx: Arc<Context>,
}

/// Outcome of a step that may end the deploy
enum Step<T> {
    Ready(T),
    Wait,
    Fail(String),
}

fn labels(deploy: &Deploy, path: Option<&TreePath>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (LABEL_KEY_DEPLOY_ID.to_string(), deploy.name_any()),
        (LABEL_KEY_MANAGED_BY.to_string(), FIELD_MANAGER.to_string()),
    ]);
    if let Some(path) = path {
        labels.insert(LABEL_KEY_SERVICE_PATH.to_string(), path.to_domain());
    }
    labels
}

/// Desired Service spec for a workload of the definition
pub(crate) fn service_spec(path: TreePath, workload: &WorkloadDefinition, image: String) -> ServiceSpec {
    ServiceSpec {
        path,
        image,
        instances: workload.instances,
        ports: workload.ports.clone(),
        resources: workload.resources.clone(),
        env: workload.env.clone(),
        command: workload.command.clone(),
        node_pool: workload.node_pool.clone().unwrap_or_default(),
    }
}

impl DeployReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn write(&self, deploy: &Deploy, status: DeployStatus) -> Result<Deploy> {
        update_status(&self.ctx.store.api::<Deploy>(), deploy, status).await
    }

    async fn fail(&self, deploy: &Deploy, mut status: DeployStatus, message: String) -> Result<Action> {
        warn!(
            "Deploy {}/{} failed: {}",
            deploy.namespace().unwrap_or_default(),
            deploy.name_any(),
            message
        );
        status.state = DeployState::Failed;
        status.message = Some(message);
        status.completion_timestamp = Some(now_rfc3339());
        self.write(deploy, status).await?;
        Ok(Action::await_change())
    }

    async fn create_build(&self, deploy: &Deploy, system: &System, spec: BuildSpec) -> Result<Build> {
        let namespace = deploy.namespace().unwrap_or_default();
        let mut build = Build::new(&deploy.name_any(), spec);
        build.metadata.namespace = Some(namespace.clone());
        build.metadata.labels = Some(labels(deploy, None));
        build.metadata.owner_references = Some(vec![owner_reference(system)]);

        let api = self.ctx.store.api::<Build>();
        match api.create(&build).await {
            Ok(created) => {
                info!(build = %created.name_any(), "Created Build for Deploy {}/{}", namespace, deploy.name_any());
                Ok(created)
            }
            Err(e) if e.is_already_exists() => Ok(api
                .get(&namespace, &deploy.name_any())
                .await?
                .unwrap_or(build)),
            Err(e) => Err(e),
        }
    }

    /// The Build this deploy rolls out, creating it when the deploy names a
    /// version or a path
    async fn build_for(&self, deploy: &Deploy, system: &System) -> Result<Step<Build>> {
        let namespace = deploy.namespace().unwrap_or_default();
        let builds = self.ctx.cache::<Build>();

        if let Some(name) = &deploy.spec.build {
            let build = match builds.get_named(&namespace, name) {
                Some(build) => (*build).clone(),
                // The cache may lag a Build created just before the Deploy
                None => match self.ctx.store.api::<Build>().get(&namespace, name).await? {
                    Some(build) => {
                        debug!(build = %name, "Build not cached yet, read from store");
                        build
                    }
                    None => return Ok(Step::Fail(format!("build {name} does not exist"))),
                },
            };
            if let Some(path) = &build.spec.path {
                return Ok(Step::Fail(format!(
                    "cannot deploy build {name}: it only builds {path}, not the whole system"
                )));
            }
            return Ok(Step::Ready(build));
        }
        if let Some(own) = builds.get_named(&namespace, &deploy.name_any()) {
            return Ok(Step::Ready((*own).clone()));
        }

        if let Some(version) = &deploy.spec.version {
            let reusable = builds.list(Some(&namespace)).into_iter().find(|b| {
                b.spec.version.as_ref() == Some(version)
                    && b.spec.path.is_none()
                    && b.status.as_ref().map_or(true, |s| s.state != BuildState::Failed)
            });
            if let Some(build) = reusable {
                info!(build = %build.name_any(), version = %version, "Reusing Build");
                return Ok(Step::Ready((*build).clone()));
            }
            let spec = BuildSpec {
                version: Some(version.clone()),
                path: None,
            };
            return Ok(Step::Ready(self.create_build(deploy, system, spec).await?));
        }

        if let Some(path) = &deploy.spec.path {
            let deployed = system.status.as_ref().and_then(|s| s.version.as_ref());
            if deployed.is_none() {
                return Ok(Step::Fail(format!(
                    "cannot deploy {path}: the system has no deployed version"
                )));
            }
            let spec = BuildSpec {
                version: None,
                path: Some(path.clone()),
            };
            return Ok(Step::Ready(self.create_build(deploy, system, spec).await?));
        }
        Ok(Step::Fail("deploy names no build, version or path".to_string()))
    }

    async fn pending(&self, deploy: &Deploy, system: &System, mut status: DeployStatus) -> Result<Action> {
        let build = match self.build_for(deploy, system).await? {
            Step::Ready(build) => build,
            Step::Wait => return Ok(Action::requeue(PROGRESS_REQUEUE)),
            Step::Fail(message) => return self.fail(deploy, status, message).await,
        };
        let build_status = build.status.clone().unwrap_or_default();
        status.build = Some(build.name_any());
        status.path = deploy.spec.path.clone().or(build.spec.path.clone());
        status.version = build_status
            .version
            .clone()
            .or_else(|| build.spec.version.clone());
        if status.start_timestamp.is_none() {
            status.start_timestamp = Some(now_rfc3339());
        }

        match build_status.state {
            BuildState::Succeeded => {
                info!(build = %build.name_any(), "Build succeeded, accepting Deploy {}", deploy.name_any());
                status.state = DeployState::Accepted;
                self.write(deploy, status).await?;
                Ok(Action::requeue(PROGRESS_REQUEUE))
            }
            BuildState::Failed => {
                let reason = build_status.message.unwrap_or_default();
                self.fail(deploy, status, format!("build {} failed: {reason}", build.name_any()))
                    .await
            }
            _ => {
                self.write(deploy, status).await?;
                Ok(Action::requeue(PROGRESS_REQUEUE))
            }
        }
    }

    /// The definition and per-path images of the deploy's succeeded build
    fn rollout(&self, deploy: &Deploy, status: &DeployStatus) -> Step<(SystemDefinition, BTreeMap<String, String>)> {
        let namespace = deploy.namespace().unwrap_or_default();
        let Some(name) = &status.build else {
            return Step::Fail("deploy has no build recorded".to_string());
        };
        let Some(build) = self.ctx.cache::<Build>().get_named(&namespace, name) else {
            return Step::Fail(format!("build {name} no longer exists"));
        };
        let Some(build_status) = build.status.clone() else {
            return Step::Wait;
        };
        let Some(definition) = build_status.definition else {
            return Step::Fail(format!("build {name} has no definition"));
        };
        let images = build_status
            .workloads
            .into_iter()
            .filter_map(|(path, w)| w.image.map(|image| (path, image)))
            .collect();
        Step::Ready((definition, images))
    }

    async fn ensure_node_pool(&self, system: &System, deploy: &Deploy, name: &str, spec: NodePoolSpec) -> Result<()> {
        let namespace = deploy.namespace().unwrap_or_default();
        let api = self.ctx.store.api::<NodePool>();
        match self.ctx.cache::<NodePool>().get_named(&namespace, name) {
            None => {
                let mut pool = NodePool::new(name, spec);
                pool.metadata.namespace = Some(namespace);
                pool.metadata.labels = Some(labels(deploy, None));
                pool.metadata.owner_references = Some(vec![owner_reference(system)]);
                match api.create(&pool).await {
                    Ok(_) => info!(node_pool = %name, "Created NodePool"),
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(e),
                }
            }
            Some(existing) if existing.spec != spec => {
                let mut updated = (*existing).clone();
                updated.spec = spec;
                api.replace(&updated).await?;
                info!(node_pool = %name, "Updated NodePool");
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Create or update the Service for `path`. Returns false while an old
    /// Service of the same name is still being deleted.
    async fn ensure_service(&self, system: &System, deploy: &Deploy, spec: ServiceSpec) -> Result<bool> {
        let namespace = deploy.namespace().unwrap_or_default();
        let name = service_name(&spec.path);
        let labels = labels(deploy, Some(&spec.path));
        let api = self.ctx.store.api::<Service>();

        match self.ctx.cache::<Service>().get_named(&namespace, &name) {
            None => {
                let mut service = Service::new(&name, spec);
                service.metadata.namespace = Some(namespace);
                service.metadata.labels = Some(labels);
                service.metadata.owner_references = Some(vec![owner_reference(system)]);
                match api.create(&service).await {
                    Ok(_) => info!(service = %name, path = %service.spec.path, "Created Service"),
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(e),
                }
                Ok(true)
            }
            Some(existing) if is_being_deleted(existing.meta()) => {
                debug!(service = %name, "Waiting for previous Service to be deleted");
                Ok(false)
            }
            Some(existing) => {
                let current_labels = existing.metadata.labels.clone().unwrap_or_default();
                let labels_changed = labels
                    .iter()
                    .any(|(k, v)| current_labels.get(k) != Some(v));
                if existing.spec != spec || labels_changed {
                    let mut updated = (*existing).clone();
                    updated.spec = spec;
                    updated.metadata.labels.get_or_insert_with(BTreeMap::new).extend(labels);
                    api.replace(&updated).await?;
                    info!(service = %name, "Updated Service");
                }
                Ok(true)
            }
        }
    }

    /// Services in scope of this deploy that its definition does not name
    fn obsolete_services(&self, deploy: &Deploy, desired: &BTreeSet<String>) -> Vec<Arc<Service>> {
        let namespace = deploy.namespace().unwrap_or_default();
        self.ctx
            .cache::<Service>()
            .list(Some(&namespace))
            .into_iter()
            .filter(|svc| !desired.contains(&svc.name_any()))
            .filter(|svc| {
                deploy
                    .spec
                    .path
                    .as_ref()
                    .map_or(true, |scope| scope.contains(&svc.spec.path))
            })
            .collect()
    }

    async fn accepted(&self, deploy: &Deploy, system: &System, mut status: DeployStatus) -> Result<Action> {
        let (definition, images) = match self.rollout(deploy, &status) {
            Step::Ready(rollout) => rollout,
            Step::Wait => return Ok(Action::requeue(PROGRESS_REQUEUE)),
            Step::Fail(message) => return self.fail(deploy, status, message).await,
        };
        let namespace = deploy.namespace().unwrap_or_default();

        for (name, pool) in &definition.node_pools {
            let spec = NodePoolSpec {
                instance_type: pool.instance_type.clone(),
                num_instances: pool.num_instances,
            };
            self.ensure_node_pool(system, deploy, name, spec).await?;
        }

        let mut desired = BTreeSet::new();
        let mut waiting = false;
        for (path, workload) in definition.services() {
            let Some(image) = images.get(path) else {
                return self
                    .fail(deploy, status, format!("build has no image for {path}"))
                    .await;
            };
            let path = TreePath::parse(path)?;
            desired.insert(service_name(&path));
            let spec = service_spec(path, workload, image.clone());
            waiting |= !self.ensure_service(system, deploy, spec).await?;
        }

        for svc in self.obsolete_services(deploy, &desired) {
            if !is_being_deleted(svc.meta()) {
                info!(service = %svc.name_any(), path = %svc.spec.path, "Deleting Service no longer in the definition");
                self.ctx
                    .store
                    .api::<Service>()
                    .delete_if_exists(&namespace, &svc.name_any())
                    .await?;
            }
        }

        if deploy.spec.path.is_none() {
            let system_uid = system.meta().uid.clone().unwrap_or_default();
            let pools = self.ctx.cache::<NodePool>().list(Some(&namespace));
            for pool in pools {
                let shared = is_owned_by(pool.meta(), &system_uid);
                if shared
                    && !definition.node_pools.contains_key(&pool.name_any())
                    && !is_being_deleted(pool.meta())
                {
                    info!(node_pool = %pool.name_any(), "Deleting NodePool no longer in the definition");
                    self.ctx
                        .store
                        .api::<NodePool>()
                        .delete_if_exists(&namespace, &pool.name_any())
                        .await?;
                }
            }
        }

        if waiting {
            return Ok(Action::requeue(PROGRESS_REQUEUE));
        }
        status.state = DeployState::InProgress;
        self.write(deploy, status).await?;
        info!("Deploy {}/{} is rolling out", namespace, deploy.name_any());
        Ok(Action::requeue(PROGRESS_REQUEUE))
    }

    async fn in_progress(&self, deploy: &Deploy, mut status: DeployStatus) -> Result<Action> {
        let (definition, _) = match self.rollout(deploy, &status) {
            Step::Ready(rollout) => rollout,
            Step::Wait => return Ok(Action::requeue(PROGRESS_REQUEUE)),
            Step::Fail(message) => return self.fail(deploy, status, message).await,
        };
        let namespace = deploy.namespace().unwrap_or_default();
        let services = self.ctx.cache::<Service>();

        let mut desired = BTreeSet::new();
        let mut rolled_out = true;
        for (path, _) in definition.services() {
            let name = service_name(&TreePath::parse(path)?);
            desired.insert(name.clone());
            let Some(svc) = services.get_named(&namespace, &name) else {
                rolled_out = false;
                continue;
            };
            let svc_status = svc.status.clone().unwrap_or_default();
            if svc_status.state == ServiceState::Failed {
                let reason = svc_status
                    .failure_info
                    .map(|f| f.message)
                    .unwrap_or_default();
                return self
                    .fail(deploy, status, format!("service {path} failed: {reason}"))
                    .await;
            }
            let current = svc_status.observed_generation == svc.meta().generation
                && svc_status.state == ServiceState::Stable
                && svc_status.available_instances == svc.spec.instances;
            rolled_out &= current;
        }
        rolled_out &= self.obsolete_services(deploy, &desired).is_empty();

        if !rolled_out {
            return Ok(Action::requeue(PROGRESS_REQUEUE));
        }
        status.state = DeployState::Succeeded;
        status.message = None;
        status.completion_timestamp = Some(now_rfc3339());
        self.write(deploy, status).await?;
        info!("Deploy {}/{} succeeded", namespace, deploy.name_any());
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler for DeployReconciler {
    fn name(&self) -> &'static str {
        "deploy"
    }

    #[instrument(skip(self), fields(deploy = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(cached) = self.ctx.cache::<Deploy>().get(key) else {
            return Ok(Action::await_change());
        };
        let deploy = (*cached).clone();
        let mut status = deploy.status.clone().unwrap_or_default();
        if status.state.is_terminal() {
            return Ok(Action::await_change());
        }
        status.observed_generation = deploy.meta().generation;

        if let Err(e) = deploy.spec.validate() {
            return self.fail(&deploy, status, e.to_string()).await;
        }
        let actions = LifecycleActions::load(&self.ctx, &key.namespace);
        if let Some(winner) = actions.superseded_by("Deploy", &key.name) {
            let message = format!("superseded by {winner}");
            return self.fail(&deploy, status, message).await;
        }
        let Some(system) = self.ctx.system(&key.namespace) else {
            return Ok(Action::requeue(PROGRESS_REQUEUE));
        };
        if is_being_deleted(system.meta()) {
            return self
                .fail(&deploy, status, "system is being deleted".to_string())
                .await;
        }

        match status.state {
            DeployState::Pending => self.pending(&deploy, &system, status).await,
            DeployState::Accepted => self.accepted(&deploy, &system, status).await,
            DeployState::InProgress => self.in_progress(&deploy, status).await,
            DeployState::Succeeded | DeployState::Failed => Ok(Action::await_change()),
        }
    }
}

pub(crate) fn register(ctx: &Context, queue: &WorkQueue<ObjectKey>) -> Vec<Arc<dyn SharedInformer>> {
    let deploys = ctx.cache::<Deploy>();
    vec![
        watch::<Deploy>(ctx, EnqueueHandler::for_object(queue.clone())),
        watch::<Teardown>(
            ctx,
            EnqueueHandler::mapped(queue.clone(), all_in_namespace::<Teardown, Deploy>(deploys.clone())),
        ),
        watch::<Build>(
            ctx,
            EnqueueHandler::mapped(queue.clone(), all_in_namespace::<Build, Deploy>(deploys.clone())),
        ),
        watch::<Service>(
            ctx,
            EnqueueHandler::mapped(queue.clone(), all_in_namespace::<Service, Deploy>(deploys.clone())),
        ),
        watch::<System>(
            ctx,
            EnqueueHandler::mapped(queue.clone(), all_in_namespace::<System, Deploy>(deploys)),
        ),
    ]
}
