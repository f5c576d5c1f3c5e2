//! Worker pool that drains a work queue into a [`Reconciler`]

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::informer::SharedInformer;
use super::queue::WorkQueue;
use crate::error::Result;
use crate::store::ObjectKey;

/// What the runtime should do with a key after a successful reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `duration` even if nothing changes
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Wait for the next watch event
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// One controller's reconcile step
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Stable controller name used in logs and metrics
    fn name(&self) -> &'static str;

    /// Drive the object at `key` one step toward its desired state. Must be
    /// idempotent.
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action>;
}

/// Runs `workers` reconcile loops over one queue
pub struct Controller {
    reconciler: Arc<dyn Reconciler>,
    queue: WorkQueue<ObjectKey>,
    informers: Vec<Arc<dyn SharedInformer>>,
}

impl Controller {
    pub fn new(reconciler: Arc<dyn Reconciler>, queue: WorkQueue<ObjectKey>) -> Self {
        Self {
            reconciler,
            queue,
            informers: Vec::new(),
        }
    }

    /// Do not start workers before `informer` has synced
    pub fn wait_for(mut self, informer: Arc<dyn SharedInformer>) -> Self {
        self.informers.push(informer);
        self
    }

    pub fn name(&self) -> &'static str {
        self.reconciler.name()
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Block until every subscribed informer has synced. Returns false if
    /// `token` fired first.
    async fn wait_for_sync(&self, token: &CancellationToken) -> bool {
        loop {
            let pending: Vec<&str> = self
                .informers
                .iter()
                .filter(|i| !i.has_synced())
                .map(|i| i.kind())
                .collect();
            if pending.is_empty() {
                return true;
            }
            debug!(controller = self.name(), ?pending, "Waiting for caches to sync");
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }

    /// Run until `token` is cancelled
    pub async fn run(self, workers: usize, token: CancellationToken) {
        let name = self.name();
        if !self.wait_for_sync(&token).await {
            return;
        }
        info!(controller = name, workers, "Starting workers");

        let this = Arc::new(self);
        let mut set = JoinSet::new();
        for _ in 0..workers.max(1) {
            let this = this.clone();
            let token = token.clone();
            set.spawn(async move { this.worker(token).await });
        }

        token.cancelled().await;
        this.queue.shut_down();
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(controller = name, error = %e, "Worker task failed");
            }
        }
        info!(controller = name, "Controller stopped");
    }

    async fn worker(&self, token: CancellationToken) {
        loop {
            let key = tokio::select! {
                _ = token.cancelled() => return,
                key = self.queue.get() => match key {
                    Some(key) => key,
                    None => return,
                },
            };
            self.process(key, &token).await;
        }
    }

    /// Reconcile one key and settle its queue bookkeeping
    pub async fn process(&self, key: ObjectKey, token: &CancellationToken) {
        let name = self.name();
        let started = Instant::now();
        let outcome = tokio::select! {
            _ = token.cancelled() => {
                debug!(controller = name, %key, "Abandoning reconcile on shutdown");
                self.queue.done(&key);
                return;
            }
            outcome = AssertUnwindSafe(self.reconciler.reconcile(&key)).catch_unwind() => outcome,
        };

        #[cfg(feature = "metrics")]
        crate::controller::metrics::observe_reconcile(name, started.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok(action)) => {
                debug!(controller = name, %key, elapsed = ?started.elapsed(), "Reconciled");
                self.queue.forget(&key);
                if let Some(after) = action.requeue_after() {
                    self.queue.add_after(key.clone(), after);
                }
            }
            Ok(Err(e)) => {
                #[cfg(feature = "metrics")]
                crate::controller::metrics::record_reconcile_error(name, e.metric_label());
                let retries = self.queue.num_requeues(&key);
                if e.is_retriable() {
                    debug!(controller = name, %key, retries, error = %e, "Transient reconcile error");
                } else {
                    warn!(controller = name, %key, retries, error = %e, "Reconcile failed");
                }
                self.queue.add_rate_limited(key.clone());
            }
            Err(panic) => {
                #[cfg(feature = "metrics")]
                crate::controller::metrics::record_reconcile_error(name, "panic");
                error!(
                    controller = name,
                    %key,
                    panic = panic_message(panic.as_ref()),
                    "Reconcile panicked"
                );
                self.queue.add_rate_limited(key.clone());
            }
        }
        self.queue.done(&key);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
