//! Deploy and Teardown Custom Resource Definitions
//!
//! Both are lifecycle actions against a System: a Deploy makes the live
//! topology equal to a Build, a Teardown removes every Service.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{impl_has_status, TreePath};
use crate::error::{Error, Result};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "Deploy",
    namespaced,
    status = "DeployStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Build","type":"string","jsonPath":".status.build"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeploySpec {
    /// Name of an existing Build to roll out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,

    /// Subtree to rebuild and roll out at the System's current version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<TreePath>,

    /// Definition version to build and roll out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl DeploySpec {
    pub fn validate(&self) -> Result<()> {
        let set = [
            self.build.is_some(),
            self.path.is_some(),
            self.version.is_some(),
        ]
        .iter()
        .filter(|s| **s)
        .count();
        if set != 1 {
            return Err(Error::ValidationError(
                "deploy must set exactly one of build, path or version".to_string(),
            ));
        }
        if self.build.as_deref() == Some("") || self.version.as_deref() == Some("") {
            return Err(Error::ValidationError(
                "deploy build and version must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DeployState {
    #[default]
    Pending,
    Accepted,
    InProgress,
    Succeeded,
    Failed,
}

impl DeployState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeployState::Succeeded | DeployState::Failed)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub state: DeployState,

    /// Build this deploy rolls out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<TreePath>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<String>,
}

impl_has_status!(Deploy, DeployStatus);

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "Teardown",
    namespaced,
    status = "TeardownStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TeardownSpec {}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TeardownState {
    #[default]
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl TeardownState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TeardownState::Succeeded | TeardownState::Failed)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TeardownStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub state: TeardownState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<String>,
}

impl_has_status!(Teardown, TeardownStatus);
