//! Shared types used across the lattice CRDs

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Position of a workload inside a System's definition tree, e.g. `/api/frontend`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TreePath(String);

impl JsonSchema for TreePath {
    fn schema_name() -> String {
        "TreePath".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }

    fn is_referenceable() -> bool {
        false
    }
}

impl TreePath {
    pub fn root() -> Self {
        TreePath("/".to_string())
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if raw == "/" {
            return Ok(Self::root());
        }
        let Some(rest) = raw.strip_prefix('/') else {
            return Err(Error::ValidationError(format!(
                "tree path {raw:?} must start with '/'"
            )));
        };
        for segment in rest.split('/') {
            let valid = !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
            if !valid {
                return Err(Error::ValidationError(format!(
                    "tree path {raw:?} has invalid segment {segment:?}"
                )));
            }
        }
        Ok(TreePath(raw.to_string()))
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Last segment, empty for the root
    pub fn name(&self) -> &str {
        self.segments().last().unwrap_or("")
    }

    /// True when `other` is this path or lies underneath it
    pub fn contains(&self, other: &TreePath) -> bool {
        if self.is_root() || self == other {
            return true;
        }
        other
            .0
            .strip_prefix(self.0.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Reverse-ordered dotted form usable as a label value or host name,
    /// `/api/frontend` becomes `frontend.api`
    pub fn to_domain(&self) -> String {
        let mut segments: Vec<&str> = self.segments().collect();
        segments.reverse();
        segments.join(".")
    }

    pub fn from_domain(domain: &str) -> Result<Self> {
        if domain.is_empty() {
            return Ok(Self::root());
        }
        let mut segments: Vec<&str> = domain.split('.').collect();
        segments.reverse();
        Self::parse(&format!("/{}", segments.join("/")))
    }
}

impl TryFrom<String> for TreePath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        TreePath::parse(&value)
    }
}

impl From<TreePath> for String {
    fn from(path: TreePath) -> Self {
        path.0
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a resource entered the failed state
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    pub message: String,
    pub time: String,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            time: super::meta::now_rfc3339(),
        }
    }

    /// Like `new`, but keeps the time of `previous` if it reports the same
    /// failure
    pub fn renew(previous: Option<&FailureInfo>, message: impl Into<String>) -> Self {
        let message = message.into();
        match previous {
            Some(previous) if previous.message == message => previous.clone(),
            _ => Self::new(message),
        }
    }
}

/// Compute requests for a workload container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequests {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Http,
    Tcp,
}

/// A port exposed by a Service's component
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub name: String,
    pub port: i32,
    #[serde(default)]
    pub protocol: Protocol,
    /// Reachable from outside the lattice through a load balancer
    #[serde(default)]
    pub public: bool,
}

/// Which node pool a workload schedules on; exactly one field must be set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSelection {
    /// Name of a NodePool declared by the System definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<String>,
    /// A pool created for, and owned by, this workload alone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedicated: Option<DedicatedNodePool>,
}

impl NodePoolSelection {
    pub fn validate(&self) -> Result<()> {
        match (&self.shared, &self.dedicated) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(Error::ValidationError(
                "nodePool must set exactly one of shared or dedicated".to_string(),
            )),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DedicatedNodePool {
    pub instance_type: String,
    pub num_instances: i32,
}

/// Parsed form of the node pool assignment annotation:
/// namespace -> pool name -> epochs
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePoolAssignments(pub BTreeMap<String, BTreeMap<String, Vec<i64>>>);

impl NodePoolAssignments {
    pub fn from_annotations(annotations: Option<&BTreeMap<String, String>>) -> Result<Self> {
        match annotations.and_then(|a| a.get(super::meta::ANNOTATION_KEY_NODE_POOL)) {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(Self::default()),
        }
    }

    pub fn to_annotation_value(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    pub fn epochs(&self, namespace: &str, pool: &str) -> &[i64] {
        self.0
            .get(namespace)
            .and_then(|pools| pools.get(pool))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, namespace: &str, pool: &str, epoch: i64) -> bool {
        self.epochs(namespace, pool).contains(&epoch)
    }

    pub fn add(&mut self, namespace: &str, pool: &str, epoch: i64) {
        let epochs = self
            .0
            .entry(namespace.to_string())
            .or_default()
            .entry(pool.to_string())
            .or_default();
        if !epochs.contains(&epoch) {
            epochs.push(epoch);
            epochs.sort_unstable();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, i64)> {
        self.0.iter().flat_map(|(ns, pools)| {
            pools.iter().flat_map(move |(pool, epochs)| {
                epochs.iter().map(move |e| (ns.as_str(), pool.as_str(), *e))
            })
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|pools| pools.values().all(Vec::is_empty))
    }
}

/// Access to the status subresource of a lattice resource
pub trait HasStatus {
    type Status: Clone + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync;

    fn status(&self) -> Option<&Self::Status>;
    fn status_mut(&mut self) -> &mut Option<Self::Status>;
}

macro_rules! impl_has_status {
    ($kind:ty, $status:ty) => {
        impl $crate::crd::HasStatus for $kind {
            type Status = $status;

            fn status(&self) -> Option<&$status> {
                self.status.as_ref()
            }

            fn status_mut(&mut self) -> &mut Option<$status> {
                &mut self.status
            }
        }
    };
}

pub(crate) use impl_has_status;
