//! Service and Job Custom Resource Definitions

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    impl_has_status, FailureInfo, NodePoolSelection, ResourceRequests, ServicePort, TreePath,
};
use crate::error::{Error, Result};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "Service",
    namespaced,
    status = "ServiceStatus",
    shortname = "lsvc",
    printcolumn = r#"{"name":"Path","type":"string","jsonPath":".spec.path"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Instances","type":"integer","jsonPath":".spec.instances"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableInstances"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub path: TreePath,
    pub image: String,
    pub instances: i32,

    #[serde(default)]
    pub ports: Vec<ServicePort>,

    #[serde(default)]
    pub resources: ResourceRequests,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    pub node_pool: NodePoolSelection,
}

impl ServiceSpec {
    pub fn validate(&self) -> Result<()> {
        if self.image.is_empty() {
            return Err(Error::ValidationError("image must not be empty".to_string()));
        }
        if self.instances < 0 {
            return Err(Error::ValidationError(
                "instances must not be negative".to_string(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for port in &self.ports {
            if !(1..=65535).contains(&port.port) {
                return Err(Error::ValidationError(format!(
                    "port {} is out of range",
                    port.port
                )));
            }
            if !seen.insert(port.port) {
                return Err(Error::ValidationError(format!(
                    "port {} is declared twice",
                    port.port
                )));
            }
        }
        self.node_pool.validate()
    }

    pub fn public_ports(&self) -> impl Iterator<Item = &ServicePort> {
        self.ports.iter().filter(|p| p.public)
    }

    pub fn has_public_ports(&self) -> bool {
        self.ports.iter().any(|p| p.public)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    #[default]
    Pending,
    Scaling,
    Updating,
    Stable,
    Deleting,
    Failed,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub state: ServiceState,

    #[serde(default)]
    pub available_instances: i32,

    #[serde(default)]
    pub updated_instances: i32,

    #[serde(default)]
    pub stale_instances: i32,

    #[serde(default)]
    pub terminating_instances: i32,

    /// Public port to externally reachable URL
    #[serde(default)]
    pub ports: BTreeMap<i32, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl_has_status!(Service, ServiceStatus);

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "Job",
    namespaced,
    status = "JobStatus",
    shortname = "ljob",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<TreePath>,

    pub image: String,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub resources: ResourceRequests,

    /// Retries before the job is considered failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
}

impl JobSpec {
    pub fn validate(&self) -> Result<()> {
        if self.image.is_empty() {
            return Err(Error::ValidationError("image must not be empty".to_string()));
        }
        if self.backoff_limit.is_some_and(|b| b < 0) {
            return Err(Error::ValidationError(
                "backoffLimit must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub state: JobState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl_has_status!(Job, JobStatus);
