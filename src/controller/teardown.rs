//! Teardown reconciler: deletes every Service of a System and waits for
//! them to go

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::{Resource, ResourceExt};
use tracing::{info, instrument, warn};

use super::lifecycle::LifecycleActions;
use super::status::update_status;
use super::{all_in_namespace, watch, Context, PROGRESS_REQUEUE};
use crate::crd::meta::{is_being_deleted, now_rfc3339};
use crate::crd::{Deploy, Service, Teardown, TeardownState, TeardownStatus};
use crate::error::Result;
use crate::runtime::{Action, EnqueueHandler, Reconciler, SharedInformer, WorkQueue};
use crate::store::ObjectKey;

pub struct TeardownReconciler {
    ctx: Arc<Context>,
}

impl TeardownReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn finish(
        &self,
        teardown: &Teardown,
        mut status: TeardownStatus,
        state: TeardownState,
        message: Option<String>,
    ) -> Result<Action> {
        status.state = state;
        status.message = message;
        status.completion_timestamp = Some(now_rfc3339());
        update_status(&self.ctx.store.api::<Teardown>(), teardown, status).await?;
        Ok(Action::await_change())
    }
}

/// Time since `start`, zero when it cannot be parsed
pub(crate) fn elapsed_since(start: Option<&str>) -> Duration {
    start
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .and_then(|start| (Utc::now() - start.with_timezone(&Utc)).to_std().ok())
        .unwrap_or_default()
}

#[async_trait]
impl Reconciler for TeardownReconciler {
    fn name(&self) -> &'static str {
        "teardown"
    }

    #[instrument(skip(self), fields(teardown = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(cached) = self.ctx.cache::<Teardown>().get(key) else {
            return Ok(Action::await_change());
        };
        let mut teardown = (*cached).clone();
        let mut status = teardown.status.clone().unwrap_or_default();
        if status.state.is_terminal() {
            return Ok(Action::await_change());
        }
        status.observed_generation = teardown.meta().generation;

        let actions = LifecycleActions::load(&self.ctx, &key.namespace);
        if let Some(winner) = actions.superseded_by("Teardown", &key.name) {
            warn!("Teardown {} superseded by {}", key, winner);
            let message = format!("superseded by {winner}");
            return self
                .finish(&teardown, status, TeardownState::Failed, Some(message))
                .await;
        }

        if status.state == TeardownState::Pending {
            info!("Starting Teardown {}", key);
            status.state = TeardownState::InProgress;
            status.start_timestamp = Some(now_rfc3339());
            teardown = update_status(&self.ctx.store.api::<Teardown>(), &teardown, status.clone())
                .await?;
        }

        let api = self.ctx.store.api::<Service>();
        let remaining = self.ctx.cache::<Service>().list(Some(&key.namespace));
        for svc in &remaining {
            if !is_being_deleted(svc.meta()) {
                api.delete_if_exists(&key.namespace, &svc.name_any()).await?;
            }
        }

        if remaining.is_empty() {
            info!("Teardown {} succeeded", key);
            return self
                .finish(&teardown, status, TeardownState::Succeeded, None)
                .await;
        }

        if elapsed_since(status.start_timestamp.as_deref()) > self.ctx.teardown_timeout {
            let mut paths: Vec<String> = remaining.iter().map(|s| s.spec.path.to_string()).collect();
            paths.sort();
            let message = format!("timed out waiting for services to be deleted: {}", paths.join(", "));
            warn!("Teardown {} failed: {}", key, message);
            return self
                .finish(&teardown, status, TeardownState::Failed, Some(message))
                .await;
        }
        Ok(Action::requeue(PROGRESS_REQUEUE))
    }
}

pub(crate) fn register(ctx: &Context, queue: &WorkQueue<ObjectKey>) -> Vec<Arc<dyn SharedInformer>> {
    let teardowns = ctx.cache::<Teardown>();
    vec![
        watch::<Teardown>(ctx, EnqueueHandler::for_object(queue.clone())),
        watch::<Deploy>(
            ctx,
            EnqueueHandler::mapped(
                queue.clone(),
                all_in_namespace::<Deploy, Teardown>(teardowns.clone()),
            ),
        ),
        watch::<Service>(
            ctx,
            EnqueueHandler::mapped(queue.clone(), all_in_namespace::<Service, Teardown>(teardowns)),
        ),
    ]
}
