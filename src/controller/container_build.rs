//! ContainerBuild reconciler
//!
//! Prebuilt images succeed immediately. Git sources are built by a batch
//! job running the configured builder image, which pushes the result to
//! `{registry}/{repository}:{container build name}`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{info, instrument, warn};

use super::status::update_status;
use super::{watch, Context, PROGRESS_REQUEUE};
use crate::crd::meta::{
    now_rfc3339, owner_reference, FIELD_MANAGER, LABEL_KEY_CONTAINER_BUILD_ID,
    LABEL_KEY_MANAGED_BY,
};
use crate::crd::{ContainerBuild, ContainerBuildState, ContainerBuildStatus};
use crate::error::{Error, Result};
use crate::orchestrator::{BatchJobPhase, BatchJobSpec, Container};
use crate::runtime::{Action, EnqueueHandler, Reconciler, SharedInformer, WorkQueue};
use crate::store::ObjectKey;

/// Builder job retries before the build is failed
const BUILD_BACKOFF_LIMIT: i32 = 2;

pub struct ContainerBuildReconciler {
    ctx: Arc<Context>,
}

impl ContainerBuildReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn finish(
        &self,
        build: &ContainerBuild,
        mut status: ContainerBuildStatus,
        state: ContainerBuildState,
        message: Option<String>,
    ) -> Result<Action> {
        if state == ContainerBuildState::Failed {
            warn!(
                "ContainerBuild {}/{} failed: {}",
                build.namespace().unwrap_or_default(),
                build.name_any(),
                message.as_deref().unwrap_or("")
            );
        }
        status.state = state;
        status.message = message;
        status.completion_timestamp = Some(now_rfc3339());
        update_status(&self.ctx.store.api::<ContainerBuild>(), build, status).await?;
        Ok(Action::await_change())
    }

    /// The builder job for a git source and the image it will push
    fn builder_job(&self, build: &ContainerBuild) -> std::result::Result<(BatchJobSpec, String), String> {
        let config = &self.ctx.container_build;
        let Some(git) = &build.spec.source.git_repository else {
            return Err("container build has no git repository".to_string());
        };
        let builder_image = config
            .builder_image
            .clone()
            .ok_or("no container builder image is configured")?;
        let registry = config
            .docker_registry
            .as_deref()
            .ok_or("no docker registry is configured")?;
        let repository = config
            .repository
            .as_deref()
            .ok_or("no image repository is configured")?;
        let image = format!("{registry}/{repository}:{}", build.name_any());

        let mut env = BTreeMap::from([
            ("GIT_URL".to_string(), git.url.clone()),
            ("GIT_REF".to_string(), git.reference.clone()),
            ("IMAGE".to_string(), image.clone()),
        ]);
        if let Some(base) = &build.spec.source.base_image {
            env.insert("BASE_IMAGE".to_string(), base.clone());
        }
        if let Some(command) = &build.spec.source.build_command {
            env.insert("BUILD_COMMAND".to_string(), command.join(" "));
        }

        let job = BatchJobSpec {
            name: build.name_any(),
            namespace: build.namespace().unwrap_or_default(),
            labels: BTreeMap::from([
                (LABEL_KEY_CONTAINER_BUILD_ID.to_string(), build.name_any()),
                (LABEL_KEY_MANAGED_BY.to_string(), FIELD_MANAGER.to_string()),
            ]),
            container: Container {
                name: "builder".to_string(),
                image: builder_image,
                env,
                ..Default::default()
            },
            backoff_limit: Some(BUILD_BACKOFF_LIMIT),
            owner: Some(owner_reference(build)),
        };
        Ok((job, image))
    }
}

#[async_trait]
impl Reconciler for ContainerBuildReconciler {
    fn name(&self) -> &'static str {
        "container-build"
    }

    #[instrument(skip(self), fields(container_build = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(cached) = self.ctx.cache::<ContainerBuild>().get(key) else {
            return Ok(Action::await_change());
        };
        let build = (*cached).clone();
        let mut status = build.status.clone().unwrap_or_default();
        if status.state.is_terminal() {
            return Ok(Action::await_change());
        }
        status.observed_generation = build.meta().generation;
        if status.start_timestamp.is_none() {
            status.start_timestamp = Some(now_rfc3339());
        }

        if let Err(e) = build.spec.source.validate() {
            return self
                .finish(&build, status, ContainerBuildState::Failed, Some(e.to_string()))
                .await;
        }
        if let Some(image) = &build.spec.source.docker_image {
            info!(image = %image, "ContainerBuild {} uses a prebuilt image", key);
            status.image = Some(image.clone());
            return self
                .finish(&build, status, ContainerBuildState::Succeeded, None)
                .await;
        }

        let (job, image) = match self.builder_job(&build) {
            Ok(job) => job,
            Err(message) => {
                return self
                    .finish(&build, status, ContainerBuildState::Failed, Some(message))
                    .await
            }
        };
        match self.ctx.orchestrator.apply_batch_job(&job).await {
            Ok(()) => {}
            Err(Error::InvalidWorkload { message, .. }) => {
                return self
                    .finish(&build, status, ContainerBuildState::Failed, Some(message))
                    .await
            }
            Err(e) => return Err(e),
        }

        let observed = self
            .ctx
            .orchestrator
            .batch_job(&key.namespace, &key.name)
            .await?;
        match observed.map(|j| (j.phase, j.message)) {
            Some((BatchJobPhase::Succeeded, _)) => {
                status.image = Some(image);
                self.finish(&build, status, ContainerBuildState::Succeeded, None)
                    .await
            }
            Some((BatchJobPhase::Failed, message)) => {
                let message = message.unwrap_or_else(|| "builder job failed".to_string());
                self.finish(&build, status, ContainerBuildState::Failed, Some(message))
                    .await
            }
            _ => {
                status.state = ContainerBuildState::Running;
                update_status(&self.ctx.store.api::<ContainerBuild>(), &build, status).await?;
                Ok(Action::requeue(PROGRESS_REQUEUE))
            }
        }
    }
}

pub(crate) fn register(ctx: &Context, queue: &WorkQueue<ObjectKey>) -> Vec<Arc<dyn SharedInformer>> {
    vec![watch::<ContainerBuild>(
        ctx,
        EnqueueHandler::for_object(queue.clone()),
    )]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ConfigContainerBuild;
    use crate::definition::GitRepositorySource;
    use crate::testing::TestLattice;

    #[tokio::test]
    async fn test_git_source_runs_builder_job() {
        let lattice = TestLattice::local_with_builds(ConfigContainerBuild {
            builder_image: Some("builder:1".to_string()),
            docker_registry: Some("registry.local".to_string()),
            repository: Some("lattice".to_string()),
        });
        lattice.orchestrator.set_auto_complete_jobs(false);
        let namespace = lattice.namespace("s1");
        let mut cb = ContainerBuild::new(
            "cb1",
            crate::crd::ContainerBuildSpec {
                source: crate::definition::ContainerBuildSource {
                    git_repository: Some(GitRepositorySource {
                        url: "https://example.com/repo.git".to_string(),
                        reference: "abc123".to_string(),
                    }),
                    ..Default::default()
                },
            },
        );
        cb.metadata.namespace = Some(namespace.clone());
        lattice.store.api::<ContainerBuild>().create(&cb).await.unwrap();
        lattice.settle().await.unwrap();

        let running = lattice.get::<ContainerBuild>(&namespace, "cb1").await.unwrap();
        assert_eq!(running.status.unwrap().state, ContainerBuildState::Running);
        let job = lattice.orchestrator.batch_job_spec(&namespace, "cb1").unwrap();
        assert_eq!(job.container.image, "builder:1");
        assert_eq!(job.container.env["GIT_REF"], "abc123");

        lattice.orchestrator.finish_job(&namespace, "cb1", true);
        lattice.settle().await.unwrap();
        let done = lattice.get::<ContainerBuild>(&namespace, "cb1").await.unwrap();
        let status = done.status.unwrap();
        assert_eq!(status.state, ContainerBuildState::Succeeded);
        assert_eq!(status.image.as_deref(), Some("registry.local/lattice:cb1"));
    }

    #[tokio::test]
    async fn test_git_source_without_builder_fails() {
        let lattice = TestLattice::local();
        let namespace = lattice.namespace("s1");
        let mut cb = ContainerBuild::new(
            "cb1",
            crate::crd::ContainerBuildSpec {
                source: crate::definition::ContainerBuildSource {
                    git_repository: Some(GitRepositorySource {
                        url: "https://example.com/repo.git".to_string(),
                        reference: "abc123".to_string(),
                    }),
                    ..Default::default()
                },
            },
        );
        cb.metadata.namespace = Some(namespace.clone());
        lattice.store.api::<ContainerBuild>().create(&cb).await.unwrap();
        lattice.settle().await.unwrap();

        let failed = lattice.get::<ContainerBuild>(&namespace, "cb1").await.unwrap();
        let status = failed.status.unwrap();
        assert_eq!(status.state, ContainerBuildState::Failed);
        assert!(status.message.unwrap().contains("builder image"));
    }
}
