//! Build and ContainerBuild Custom Resource Definitions
//!
//! A Build records that one version (or one subtree) of a System definition
//! has had an image built for each of its workloads. Each workload's image
//! is produced by a child ContainerBuild.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{impl_has_status, TreePath};
use crate::definition::{ContainerBuildSource, SystemDefinition};
use crate::error::{Error, Result};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "Build",
    namespaced,
    status = "BuildStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    /// Definition version (git ref) to build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Subtree to build at the System's current version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<TreePath>,
}

impl BuildSpec {
    pub fn validate(&self) -> Result<()> {
        match (&self.version, &self.path) {
            (Some(v), None) if !v.is_empty() => Ok(()),
            (None, Some(_)) => Ok(()),
            _ => Err(Error::ValidationError(
                "build must set exactly one of version or path".to_string(),
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl BuildState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildState::Succeeded | BuildState::Failed)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub state: BuildState,

    /// Version the definition was resolved at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Resolved definition, restricted to the built subtree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<SystemDefinition>,

    /// Per-workload container build progress keyed by tree path
    #[serde(default)]
    pub workloads: BTreeMap<String, BuildWorkloadStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildWorkloadStatus {
    pub container_build: String,
    pub state: ContainerBuildState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl_has_status!(Build, BuildStatus);

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "ContainerBuild",
    namespaced,
    status = "ContainerBuildStatus",
    shortname = "cb",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ContainerBuildSpec {
    pub source: ContainerBuildSource,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerBuildState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ContainerBuildState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ContainerBuildState::Succeeded | ContainerBuildState::Failed
        )
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerBuildStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub state: ContainerBuildState,

    /// Fully qualified image produced by the build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl_has_status!(ContainerBuild, ContainerBuildStatus);
