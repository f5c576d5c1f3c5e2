//! Container orchestrator the Service, Job, ContainerBuild and Address
//! controllers write to
//!
//! Desired objects are described with plain structs; backends translate them
//! into Deployments, core Services and batch Jobs ([`KubeOrchestrator`]) or
//! keep them in memory ([`MemoryOrchestrator`]).

mod kubernetes;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::Serialize;

use crate::crd::meta::short_hash;
use crate::crd::{Protocol, ResourceRequests};
use crate::error::Result;

pub use kubernetes::KubeOrchestrator;
pub use memory::MemoryOrchestrator;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ContainerPort {
    pub name: String,
    pub port: i32,
    pub protocol: Protocol,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<ContainerPort>,
    pub resources: ResourceRequests,
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

/// Host directory exposed to the pod as a volume
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HostPathVolume {
    pub name: String,
    pub host_path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Toleration {
    pub key: String,
    pub value: String,
}

/// Desired long-running replicated workload
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WorkloadSpec {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Immutable pod selector
    pub selector: BTreeMap<String, String>,
    pub replicas: i32,
    pub containers: Vec<Container>,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub volumes: Vec<HostPathVolume>,
    #[serde(skip)]
    pub owner: Option<OwnerReference>,
}

impl WorkloadSpec {
    /// Hash of everything the orchestrator is asked to run
    pub fn spec_hash(&self) -> Result<String> {
        Ok(short_hash(&serde_json::to_string(self)?))
    }

    pub fn main_container(&self) -> Option<&Container> {
        self.containers.first()
    }
}

/// Observed rollout of a workload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub desired: i32,
    /// Pods that exist, old and new
    pub replicas: i32,
    /// Pods running the latest spec
    pub updated: i32,
    pub available: i32,
    pub terminating: i32,
    /// The orchestrator has observed the latest spec
    pub current: bool,
}

impl WorkloadStatus {
    pub fn stale(&self) -> i32 {
        (self.replicas - self.updated).max(0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObservedWorkload {
    pub annotations: BTreeMap<String, String>,
    pub status: WorkloadStatus,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NetworkServiceKind {
    /// Reachable inside the cluster only
    #[default]
    ClusterIp,
    /// Additionally exposed on a port of every node
    NodePort,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkServicePort {
    pub name: String,
    pub port: i32,
    pub target_port: i32,
    pub protocol: Protocol,
}

/// Desired orchestrator-level service fronting a workload's pods
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetworkServiceSpec {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub selector: BTreeMap<String, String>,
    pub kind: NetworkServiceKind,
    pub ports: Vec<NetworkServicePort>,
    pub owner: Option<OwnerReference>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkServiceStatus {
    /// Service port to allocated node port
    pub node_ports: BTreeMap<i32, i32>,
}

/// Desired run-to-completion job
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchJobSpec {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub container: Container,
    pub backoff_limit: Option<i32>,
    pub owner: Option<OwnerReference>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchJobPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchJobStatus {
    pub phase: BatchJobPhase,
    pub message: Option<String>,
}

/// Orchestrator operations the controllers need. Applying an object that
/// already matches is a no-op; deleting a missing object succeeds.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Create or update a workload. A spec the orchestrator refuses is
    /// reported as [`crate::Error::InvalidWorkload`].
    async fn apply_workload(&self, spec: &WorkloadSpec) -> Result<()>;

    async fn workload(&self, namespace: &str, name: &str) -> Result<Option<ObservedWorkload>>;

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()>;

    async fn apply_network_service(&self, spec: &NetworkServiceSpec) -> Result<NetworkServiceStatus>;

    async fn network_service(&self, namespace: &str, name: &str)
        -> Result<Option<NetworkServiceStatus>>;

    async fn delete_network_service(&self, namespace: &str, name: &str) -> Result<()>;

    /// Start a job unless one with the same name exists; jobs are immutable
    async fn apply_batch_job(&self, spec: &BatchJobSpec) -> Result<()>;

    async fn batch_job(&self, namespace: &str, name: &str) -> Result<Option<BatchJobStatus>>;

    async fn delete_batch_job(&self, namespace: &str, name: &str) -> Result<()>;
}
