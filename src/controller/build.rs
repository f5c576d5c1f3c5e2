//! Build reconciler
//!
//! Resolves the System definition at the requested version, starts one
//! ContainerBuild per workload and folds their progress into the Build's
//! status.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{info, instrument, warn};

use super::status::update_status;
use super::{all_in_namespace, watch, Context, PROGRESS_REQUEUE};
use crate::crd::meta::{
    now_rfc3339, owner_reference, short_hash, LABEL_KEY_BUILD_ID, LABEL_KEY_MANAGED_BY,
    LABEL_KEY_SERVICE_PATH, FIELD_MANAGER,
};
use crate::crd::{
    Build, BuildState, BuildStatus, BuildWorkloadStatus, ContainerBuild, ContainerBuildSpec,
    ContainerBuildState, System, TreePath,
};
use crate::definition::{SystemDefinition, WorkloadDefinition};
use crate::error::{Error, Result};
use crate::runtime::{owner_keys, Action, EnqueueHandler, Reconciler, SharedInformer, WorkQueue};
use crate::store::ObjectKey;

/// Name of the ContainerBuild producing the image for `path`
pub(crate) fn container_build_name(build: &str, path: &str) -> String {
    format!("{build}-{}", short_hash(path))
}

pub struct BuildReconciler {
    ctx: Arc<Context>,
}

impl BuildReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn fail(&self, build: &Build, mut status: BuildStatus, message: String) -> Result<Action> {
        warn!("Build {}/{} failed: {}", build.namespace().unwrap_or_default(), build.name_any(), message);
        status.state = BuildState::Failed;
        status.message = Some(message);
        status.completion_timestamp = Some(now_rfc3339());
        update_status(&self.ctx.store.api::<Build>(), build, status).await?;
        Ok(Action::await_change())
    }

    /// Definition version a build resolves at. A path build rebuilds part of
    /// whatever the System currently runs.
    fn version(build: &Build, system: &System) -> std::result::Result<String, String> {
        match (&build.spec.version, &build.spec.path) {
            (Some(version), _) => Ok(version.clone()),
            (None, Some(path)) => system
                .status
                .as_ref()
                .and_then(|s| s.version.clone())
                .ok_or_else(|| format!("system has no deployed version to build {path} at")),
            (None, None) => Err("build has neither version nor path".to_string()),
        }
    }

    async fn resolve(
        &self,
        build: &Build,
        system: &System,
    ) -> Result<std::result::Result<(String, SystemDefinition), String>> {
        let version = match Self::version(build, system) {
            Ok(version) => version,
            Err(message) => return Ok(Err(message)),
        };
        let definition = match self
            .ctx
            .resolver
            .resolve(&system.spec.definition_url, &version)
            .await
        {
            Ok(definition) => definition,
            Err(Error::DefinitionError(message)) | Err(Error::ValidationError(message)) => {
                return Ok(Err(message))
            }
            Err(e @ Error::YamlError(_)) => return Ok(Err(e.to_string())),
            Err(e) => return Err(e),
        };
        if let Err(e) = definition.validate() {
            return Ok(Err(format!("invalid definition at {version}: {e}")));
        }
        let definition = match &build.spec.path {
            Some(path) => {
                let subtree = definition.subtree(path);
                if subtree.workloads.is_empty() {
                    return Ok(Err(format!("definition has no workloads under {path}")));
                }
                subtree
            }
            None => definition,
        };
        Ok(Ok((version, definition)))
    }

    async fn ensure_container_build(
        &self,
        build: &Build,
        path: &str,
        workload: &WorkloadDefinition,
    ) -> Result<BuildWorkloadStatus> {
        let namespace = build.namespace().unwrap_or_default();
        let name = container_build_name(&build.name_any(), path);
        let existing = self.ctx.cache::<ContainerBuild>().get_named(&namespace, &name);

        let child = match existing {
            Some(child) => (*child).clone(),
            None => {
                let mut child = ContainerBuild::new(
                    &name,
                    ContainerBuildSpec {
                        source: workload.build.clone(),
                    },
                );
                child.metadata.namespace = Some(namespace.clone());
                let domain = TreePath::parse(path)?.to_domain();
                child.metadata.labels = Some(BTreeMap::from([
                    (LABEL_KEY_BUILD_ID.to_string(), build.name_any()),
                    (LABEL_KEY_SERVICE_PATH.to_string(), domain),
                    (LABEL_KEY_MANAGED_BY.to_string(), FIELD_MANAGER.to_string()),
                ]));
                child.metadata.owner_references = Some(vec![owner_reference(build)]);
                match self.ctx.store.api::<ContainerBuild>().create(&child).await {
                    Ok(created) => {
                        info!(container_build = %name, path, "Created ContainerBuild");
                        created
                    }
                    Err(e) if e.is_already_exists() => child,
                    Err(e) => return Err(e),
                }
            }
        };

        let status = child.status.unwrap_or_default();
        Ok(BuildWorkloadStatus {
            container_build: name,
            state: status.state,
            image: status.image,
        })
    }
}

/// Fold per-workload progress into the Build's state
pub(crate) fn aggregate(workloads: &BTreeMap<String, BuildWorkloadStatus>) -> (BuildState, Option<String>) {
    let failed: Vec<&str> = workloads
        .iter()
        .filter(|(_, w)| w.state == ContainerBuildState::Failed)
        .map(|(path, _)| path.as_str())
        .collect();
    if !failed.is_empty() {
        return (
            BuildState::Failed,
            Some(format!("container builds failed for {}", failed.join(", "))),
        );
    }
    if workloads
        .values()
        .all(|w| w.state == ContainerBuildState::Succeeded)
    {
        return (BuildState::Succeeded, None);
    }
    (BuildState::Running, None)
}

#[async_trait]
impl Reconciler for BuildReconciler {
    fn name(&self) -> &'static str {
        "build"
    }

    #[instrument(skip(self), fields(build = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(cached) = self.ctx.cache::<Build>().get(key) else {
            return Ok(Action::await_change());
        };
        let mut build = (*cached).clone();
        let mut status = build.status.clone().unwrap_or_default();
        if status.state.is_terminal() {
            return Ok(Action::await_change());
        }
        if let Err(e) = build.spec.validate() {
            return self.fail(&build, status, e.to_string()).await;
        }

        if status.definition.is_none() {
            let Some(system) = self.ctx.system(&key.namespace) else {
                return Ok(Action::requeue(PROGRESS_REQUEUE));
            };
            let (version, definition) = match self.resolve(&build, &system).await? {
                Ok(resolved) => resolved,
                Err(message) => return self.fail(&build, status, message).await,
            };
            info!(
                version = %version,
                workloads = definition.workloads.len(),
                "Resolved definition for Build {}",
                key
            );
            status.state = BuildState::Running;
            status.version = Some(version);
            status.definition = Some(definition);
            status.start_timestamp = Some(now_rfc3339());
            status.observed_generation = build.meta().generation;
            build = update_status(&self.ctx.store.api::<Build>(), &build, status.clone()).await?;
        }

        let definition = status.definition.clone().unwrap_or_default();
        let mut workloads = BTreeMap::new();
        for (path, workload) in &definition.workloads {
            let progress = self.ensure_container_build(&build, path, workload).await?;
            workloads.insert(path.clone(), progress);
        }

        let (state, message) = aggregate(&workloads);
        status.workloads = workloads;
        status.state = state;
        status.message = message;
        if state.is_terminal() {
            status.completion_timestamp = Some(now_rfc3339());
            info!(state = ?state, "Build {} finished", key);
        }
        update_status(&self.ctx.store.api::<Build>(), &build, status).await?;

        Ok(match state {
            BuildState::Running | BuildState::Pending => Action::requeue(PROGRESS_REQUEUE),
            _ => Action::await_change(),
        })
    }
}

pub(crate) fn register(ctx: &Context, queue: &WorkQueue<ObjectKey>) -> Vec<Arc<dyn SharedInformer>> {
    vec![
        watch::<Build>(ctx, EnqueueHandler::for_object(queue.clone())),
        watch::<ContainerBuild>(
            ctx,
            EnqueueHandler::mapped(queue.clone(), |cb: &ContainerBuild| owner_keys(cb)),
        ),
        watch::<System>(
            ctx,
            EnqueueHandler::mapped(
                queue.clone(),
                all_in_namespace::<System, Build>(ctx.cache::<Build>()),
            ),
        ),
    ]
}
