//! System Custom Resource Definition
//!
//! A System is the root of one tenant's world. It lives in its own
//! namespace, named by its system ID, and owns every Service, NodePool and
//! lifecycle object in that namespace.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::service::ServiceState;
use super::types::impl_has_status;
use crate::error::{Error, Result};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "System",
    namespaced,
    status = "SystemStatus",
    shortname = "sys",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SystemSpec {
    /// Location of the System's definition, e.g. `git://github.com/org/system.git`
    pub definition_url: String,
}

impl SystemSpec {
    pub fn validate(&self) -> Result<()> {
        if self.definition_url.trim().is_empty() {
            return Err(Error::ValidationError(
                "definitionURL must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SystemState {
    #[default]
    Pending,
    Stable,
    Degraded,
    Scaling,
    Updating,
    Deleting,
    /// The last lifecycle action was a successful teardown
    Deleted,
    Failed,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub state: SystemState,

    /// Version of the most recent successful deploy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Summary of owned Services keyed by tree path
    #[serde(default)]
    pub services: BTreeMap<String, SystemServiceSummary>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemServiceSummary {
    pub name: String,
    pub state: ServiceState,
    pub available_instances: i32,
    pub updated_instances: i32,
    pub stale_instances: i32,
    pub terminating_instances: i32,
    #[serde(default)]
    pub ports: BTreeMap<i32, String>,
}

impl_has_status!(System, SystemStatus);
