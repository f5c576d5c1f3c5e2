//! In-process orchestrator with a controllable rollout

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{
    BatchJobPhase, BatchJobSpec, BatchJobStatus, NetworkServiceKind, NetworkServiceSpec,
    NetworkServiceStatus, ObservedWorkload, Orchestrator, WorkloadSpec, WorkloadStatus,
};
use crate::error::{Error, Result};

const FIRST_NODE_PORT: i32 = 30000;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    workloads: BTreeMap<Key, (WorkloadSpec, WorkloadStatus)>,
    services: BTreeMap<Key, (NetworkServiceSpec, NetworkServiceStatus)>,
    jobs: BTreeMap<Key, (BatchJobSpec, BatchJobStatus)>,
    rejected_images: BTreeSet<String>,
    next_node_port: i32,
}

struct Inner {
    state: Mutex<State>,
    auto_rollout: AtomicBool,
    auto_complete_jobs: AtomicBool,
    workload_applies: AtomicUsize,
    service_applies: AtomicUsize,
}

/// Orchestrator that keeps workloads in memory.
///
/// By default a rollout completes the moment a workload is applied and jobs
/// succeed the moment they start; both can be switched off to observe
/// intermediate states.
#[derive(Clone)]
pub struct MemoryOrchestrator {
    inner: Arc<Inner>,
}

impl Default for MemoryOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOrchestrator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    next_node_port: FIRST_NODE_PORT,
                    ..Default::default()
                }),
                auto_rollout: AtomicBool::new(true),
                auto_complete_jobs: AtomicBool::new(true),
                workload_applies: AtomicUsize::new(0),
                service_applies: AtomicUsize::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_auto_rollout(&self, enabled: bool) {
        self.inner.auto_rollout.store(enabled, Ordering::SeqCst);
    }

    pub fn set_auto_complete_jobs(&self, enabled: bool) {
        self.inner.auto_complete_jobs.store(enabled, Ordering::SeqCst);
    }

    /// Make every later apply of a workload running `image` fail as invalid
    pub fn reject_image(&self, image: &str) {
        self.lock().rejected_images.insert(image.to_string());
    }

    /// Finish the rollout of a workload applied with auto rollout disabled
    pub fn complete_rollout(&self, namespace: &str, name: &str) {
        if let Some((spec, status)) = self.lock().workloads.get_mut(&key(namespace, name)) {
            *status = rolled_out(spec.replicas);
        }
    }

    /// Finish a job started with auto completion disabled
    pub fn finish_job(&self, namespace: &str, name: &str, succeeded: bool) {
        if let Some((_, status)) = self.lock().jobs.get_mut(&key(namespace, name)) {
            *status = BatchJobStatus {
                phase: if succeeded {
                    BatchJobPhase::Succeeded
                } else {
                    BatchJobPhase::Failed
                },
                message: (!succeeded).then(|| "job exited with status 1".to_string()),
            };
        }
    }

    /// Number of applies that changed a workload
    pub fn workload_applies(&self) -> usize {
        self.inner.workload_applies.load(Ordering::SeqCst)
    }

    pub fn service_applies(&self) -> usize {
        self.inner.service_applies.load(Ordering::SeqCst)
    }

    pub fn workload_spec(&self, namespace: &str, name: &str) -> Option<WorkloadSpec> {
        self.lock()
            .workloads
            .get(&key(namespace, name))
            .map(|(spec, _)| spec.clone())
    }

    pub fn workload_names(&self, namespace: &str) -> Vec<String> {
        self.lock()
            .workloads
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn network_service_spec(&self, namespace: &str, name: &str) -> Option<NetworkServiceSpec> {
        self.lock()
            .services
            .get(&key(namespace, name))
            .map(|(spec, _)| spec.clone())
    }

    pub fn batch_job_spec(&self, namespace: &str, name: &str) -> Option<BatchJobSpec> {
        self.lock()
            .jobs
            .get(&key(namespace, name))
            .map(|(spec, _)| spec.clone())
    }
}

fn rolled_out(replicas: i32) -> WorkloadStatus {
    WorkloadStatus {
        desired: replicas,
        replicas,
        updated: replicas,
        available: replicas,
        terminating: 0,
        current: true,
    }
}

#[async_trait]
impl Orchestrator for MemoryOrchestrator {
    async fn apply_workload(&self, spec: &WorkloadSpec) -> Result<()> {
        let mut state = self.lock();
        if let Some(image) = spec
            .containers
            .iter()
            .map(|c| &c.image)
            .find(|image| state.rejected_images.contains(*image))
        {
            return Err(Error::InvalidWorkload {
                name: spec.name.clone(),
                message: format!("image {image} is not allowed"),
            });
        }

        let id = key(&spec.namespace, &spec.name);
        if state.workloads.get(&id).is_some_and(|(existing, _)| existing == spec) {
            return Ok(());
        }
        self.inner.workload_applies.fetch_add(1, Ordering::SeqCst);

        let status = if self.inner.auto_rollout.load(Ordering::SeqCst) {
            rolled_out(spec.replicas)
        } else {
            let previous = state
                .workloads
                .get(&id)
                .map(|(_, status)| status.available)
                .unwrap_or(0);
            WorkloadStatus {
                desired: spec.replicas,
                replicas: previous,
                updated: 0,
                available: previous,
                terminating: 0,
                current: true,
            }
        };
        state.workloads.insert(id, (spec.clone(), status));
        Ok(())
    }

    async fn workload(&self, namespace: &str, name: &str) -> Result<Option<ObservedWorkload>> {
        Ok(self
            .lock()
            .workloads
            .get(&key(namespace, name))
            .map(|(spec, status)| ObservedWorkload {
                annotations: spec.annotations.clone(),
                status: status.clone(),
            }))
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()> {
        self.lock().workloads.remove(&key(namespace, name));
        Ok(())
    }

    async fn apply_network_service(&self, spec: &NetworkServiceSpec) -> Result<NetworkServiceStatus> {
        let mut state = self.lock();
        let id = key(&spec.namespace, &spec.name);
        let previous = state.services.get(&id).cloned();
        if let Some((existing, status)) = &previous {
            if existing == spec {
                return Ok(status.clone());
            }
        }
        self.inner.service_applies.fetch_add(1, Ordering::SeqCst);

        let mut node_ports = BTreeMap::new();
        if spec.kind == NetworkServiceKind::NodePort {
            for port in &spec.ports {
                let allocated = previous
                    .as_ref()
                    .and_then(|(_, status)| status.node_ports.get(&port.port).copied());
                let node_port = match allocated {
                    Some(np) => np,
                    None => {
                        let np = state.next_node_port;
                        state.next_node_port += 1;
                        np
                    }
                };
                node_ports.insert(port.port, node_port);
            }
        }
        let status = NetworkServiceStatus { node_ports };
        state.services.insert(id, (spec.clone(), status.clone()));
        Ok(status)
    }

    async fn network_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkServiceStatus>> {
        Ok(self
            .lock()
            .services
            .get(&key(namespace, name))
            .map(|(_, status)| status.clone()))
    }

    async fn delete_network_service(&self, namespace: &str, name: &str) -> Result<()> {
        self.lock().services.remove(&key(namespace, name));
        Ok(())
    }

    async fn apply_batch_job(&self, spec: &BatchJobSpec) -> Result<()> {
        let mut state = self.lock();
        let id = key(&spec.namespace, &spec.name);
        if state.jobs.contains_key(&id) {
            return Ok(());
        }
        if state.rejected_images.contains(&spec.container.image) {
            return Err(Error::InvalidWorkload {
                name: spec.name.clone(),
                message: format!("image {} is not allowed", spec.container.image),
            });
        }
        let phase = if self.inner.auto_complete_jobs.load(Ordering::SeqCst) {
            BatchJobPhase::Succeeded
        } else {
            BatchJobPhase::Running
        };
        state.jobs.insert(
            id,
            (
                spec.clone(),
                BatchJobStatus {
                    phase,
                    message: None,
                },
            ),
        );
        Ok(())
    }

    async fn batch_job(&self, namespace: &str, name: &str) -> Result<Option<BatchJobStatus>> {
        Ok(self
            .lock()
            .jobs
            .get(&key(namespace, name))
            .map(|(_, status)| status.clone()))
    }

    async fn delete_batch_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.lock().jobs.remove(&key(namespace, name));
        Ok(())
    }
}
