//! NodePool Custom Resource Definition
//!
//! A NodePool's status holds one entry per live epoch. An epoch snapshots
//! the instance type the pool was provisioned with; changing the instance
//! type allocates a new epoch and retires the old ones once it is stable.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::impl_has_status;
use crate::error::{Error, Result};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "NodePool",
    namespaced,
    status = "NodePoolStatus",
    shortname = "np",
    printcolumn = r#"{"name":"Instance Type","type":"string","jsonPath":".spec.instanceType"}"#,
    printcolumn = r#"{"name":"Instances","type":"integer","jsonPath":".spec.numInstances"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    pub instance_type: String,
    pub num_instances: i32,
}

impl NodePoolSpec {
    pub fn validate(&self) -> Result<()> {
        if self.instance_type.is_empty() {
            return Err(Error::ValidationError(
                "instanceType must not be empty".to_string(),
            ));
        }
        if self.num_instances < 0 {
            return Err(Error::ValidationError(
                "numInstances must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodePoolEpochState {
    #[default]
    Pending,
    Scaling,
    Stable,
    Deleting,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolEpochStatus {
    pub instance_type: String,
    pub num_instances: i32,
    pub state: NodePoolEpochState,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodePoolState {
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
pub struct NodePoolStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub state: NodePoolState,

    /// Live epochs; the largest key is the current epoch
    #[serde(default)]
    pub epochs: BTreeMap<i64, NodePoolEpochStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NodePoolStatus {
    pub fn current_epoch(&self) -> Option<i64> {
        self.epochs.keys().next_back().copied()
    }

    /// Key for a newly allocated epoch: one past the current epoch.
    ///
    /// Retired epochs are removed from the front of the map, so live keys
    /// stay contiguous but may start above 1. Keys are never reused, which
    /// keeps each epoch's infrastructure state key unique. The current
    /// epoch is never retired, so the map does not empty out once an epoch
    /// has been allocated.
    pub fn next_epoch(&self) -> i64 {
        self.current_epoch().map_or(1, |e| e + 1)
    }

    /// Aggregate state derived from the epoch entries
    pub fn derived_state(&self) -> NodePoolState {
        match self.current_epoch() {
            None => NodePoolState::Pending,
            Some(_) if self.epochs.len() > 1 => NodePoolState::Updating,
            Some(current) => match self.epochs[&current].state {
                NodePoolEpochState::Pending => NodePoolState::Pending,
                NodePoolEpochState::Scaling => NodePoolState::Scaling,
                NodePoolEpochState::Stable => NodePoolState::Stable,
                NodePoolEpochState::Deleting => NodePoolState::Deleting,
            },
        }
    }
}

impl NodePool {
    /// Lattice-wide identifier, `<namespace>.<name>`
    pub fn id(&self) -> String {
        format!(
            "{}.{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    /// Identifier of one epoch, used as the node label value and in
    /// infrastructure names
    pub fn epoch_id(&self, epoch: i64) -> String {
        format!("{}.{}", self.id(), epoch)
    }

    pub fn current_epoch(&self) -> Option<i64> {
        self.status.as_ref().and_then(NodePoolStatus::current_epoch)
    }

    pub fn epoch(&self, epoch: i64) -> Option<&NodePoolEpochStatus> {
        self.status.as_ref().and_then(|s| s.epochs.get(&epoch))
    }
}

impl_has_status!(NodePool, NodePoolStatus);
