//! Job reconciler: runs a System's one-off jobs as orchestrator batch jobs

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{info, instrument, warn};

use super::service::MAIN_CONTAINER;
use super::status::update_status;
use super::{add_finalizer, remove_finalizer, watch, Context, PROGRESS_REQUEUE};
use crate::crd::meta::{
    is_being_deleted, now_rfc3339, owner_reference, FIELD_MANAGER, JOB_FINALIZER,
    LABEL_KEY_JOB_ID, LABEL_KEY_MANAGED_BY, LABEL_KEY_SERVICE_PATH,
};
use crate::crd::{Job, JobState, JobStatus};
use crate::error::{Error, Result};
use crate::orchestrator::{BatchJobPhase, BatchJobSpec, Container};
use crate::runtime::{Action, EnqueueHandler, Reconciler, SharedInformer, WorkQueue};
use crate::store::ObjectKey;

pub struct JobReconciler {
    ctx: Arc<Context>,
}

fn batch_job(job: &Job) -> BatchJobSpec {
    let mut labels = BTreeMap::from([
        (LABEL_KEY_JOB_ID.to_string(), job.name_any()),
        (LABEL_KEY_MANAGED_BY.to_string(), FIELD_MANAGER.to_string()),
    ]);
    if let Some(path) = &job.spec.path {
        labels.insert(LABEL_KEY_SERVICE_PATH.to_string(), path.to_domain());
    }
    BatchJobSpec {
        name: job.name_any(),
        namespace: job.namespace().unwrap_or_default(),
        labels,
        container: Container {
            name: MAIN_CONTAINER.to_string(),
            image: job.spec.image.clone(),
            command: (!job.spec.command.is_empty()).then(|| job.spec.command.clone()),
            env: job.spec.env.clone(),
            resources: job.spec.resources.clone(),
            ..Default::default()
        },
        backoff_limit: job.spec.backoff_limit,
        owner: Some(owner_reference(job)),
    }
}

impl JobReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn finish(&self, job: &Job, mut status: JobStatus, state: JobState, message: Option<String>) -> Result<Action> {
        if state == JobState::Failed {
            warn!("Job {}/{} failed: {}", job.namespace().unwrap_or_default(), job.name_any(), message.as_deref().unwrap_or(""));
        } else {
            info!("Job {}/{} succeeded", job.namespace().unwrap_or_default(), job.name_any());
        }
        status.state = state;
        status.message = message;
        status.completion_timestamp = Some(now_rfc3339());
        update_status(&self.ctx.store.api::<Job>(), job, status).await?;
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler for JobReconciler {
    fn name(&self) -> &'static str {
        "job"
    }

    #[instrument(skip(self), fields(job = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(cached) = self.ctx.cache::<Job>().get(key) else {
            return Ok(Action::await_change());
        };
        let api = self.ctx.store.api::<Job>();
        if is_being_deleted(cached.meta()) {
            self.ctx
                .orchestrator
                .delete_batch_job(&key.namespace, &key.name)
                .await?;
            remove_finalizer(&api, &*cached, JOB_FINALIZER).await?;
            return Ok(Action::await_change());
        }

        let job = add_finalizer(&api, &*cached, JOB_FINALIZER).await?;
        let mut status = job.status.clone().unwrap_or_default();
        if status.state.is_terminal() {
            return Ok(Action::await_change());
        }
        status.observed_generation = job.meta().generation;

        if let Err(e) = job.spec.validate() {
            return self
                .finish(&job, status, JobState::Failed, Some(e.to_string()))
                .await;
        }

        match self.ctx.orchestrator.apply_batch_job(&batch_job(&job)).await {
            Ok(()) => {}
            Err(Error::InvalidWorkload { message, .. }) => {
                return self.finish(&job, status, JobState::Failed, Some(message)).await
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
                self.finish(&job, status, JobState::Succeeded, None).await
            }
            Some((BatchJobPhase::Failed, message)) => {
                let message = message.unwrap_or_else(|| "job failed".to_string());
                self.finish(&job, status, JobState::Failed, Some(message)).await
            }
            Some((BatchJobPhase::Running, _)) => {
                status.state = JobState::Running;
                if status.start_timestamp.is_none() {
                    status.start_timestamp = Some(now_rfc3339());
                }
                update_status(&api, &job, status).await?;
                Ok(Action::requeue(PROGRESS_REQUEUE))
            }
            Some((BatchJobPhase::Pending, _)) | None => {
                status.state = JobState::Pending;
                update_status(&api, &job, status).await?;
                Ok(Action::requeue(PROGRESS_REQUEUE))
            }
        }
    }
}

pub(crate) fn register(ctx: &Context, queue: &WorkQueue<ObjectKey>) -> Vec<Arc<dyn SharedInformer>> {
    vec![watch::<Job>(ctx, EnqueueHandler::for_object(queue.clone()))]
}
